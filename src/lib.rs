//! tlsfront - a TLS-terminating reverse proxy front-end.
//!
//! Accepts connections for one or more hostnames, terminates TLS with
//! certificates from ACME or static files, redirects plaintext traffic to
//! https, and forwards everything else to a single upstream.

pub mod config;
pub mod error;
pub mod http;
pub mod middleware;
pub mod proxy;
pub mod tls;

pub use config::{ConfigError, ProxyConfig, Settings, TlsMode};
pub use error::ProxyError;
pub use http::ServerError;
