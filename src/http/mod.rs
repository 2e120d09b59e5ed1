//! HTTP listeners.
//!
//! The primary listener forwards every request to the upstream, over TLS when
//! a certificate source is active. The plaintext companion listener only
//! answers ACME HTTP-01 challenges or redirects to https; it is not started
//! when TLS is disabled. A failure of either listener is fatal.

pub mod redirect;
pub mod server;
pub mod supervisor;

pub use server::{bind, run, serve_acme, serve_companion, serve_plain, serve_tls, ServerError};
