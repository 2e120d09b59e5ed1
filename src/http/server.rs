//! Listener startup and orchestration.
//!
//! Supports three certificate sources:
//! - ACME: automatic certificates, HTTP-01 challenges on the companion listener
//! - Static: certificate files, https redirect on the companion listener
//! - Disabled: plain HTTP, no companion listener
//!
//! Both listeners are bound before either is served, then run as one
//! supervised group. The first listener to fail ends [`run`].

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum_server::tls_rustls::{self, RustlsConfig};
use rustls::ServerConfig;
use rustls_acme::axum::AxumAcceptor;

use crate::config::ProxyConfig;
use crate::proxy::{self, Upstream};
use crate::tls::source::CertificateSource;
use crate::tls::{TlsPolicy, MIN_PROTOCOL_VERSION};

use super::redirect;
use super::supervisor::TaskGroup;

/// Name of the primary (forwarding) listener in logs and errors
pub const PRIMARY: &str = "primary";

/// Name of the plaintext companion listener in logs and errors
pub const COMPANION: &str = "companion";

/// Server startup and runtime errors. All of them are fatal.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Failed to load certificate '{}': {reason}", .path.display())]
    Certificate { path: PathBuf, reason: String },

    #[error("ACME cache directory '{}' is not usable: {source}", .path.display())]
    CacheDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Failed to build upstream client: {0}")]
    UpstreamClient(#[from] reqwest::Error),

    #[error("{listener} listener failed: {source}")]
    Listener {
        listener: &'static str,
        source: std::io::Error,
    },

    #[error("{0} listener exited unexpectedly")]
    Exited(&'static str),

    #[error("{listener} listener task failed: {reason}")]
    Task {
        listener: &'static str,
        reason: String,
    },

    #[error("No listeners were started")]
    NoListeners,

    #[error("The {0} certificate source needs a companion listener address")]
    MissingCompanionAddress(&'static str),
}

/// Build the certificate source, bind both listeners, and serve until one fails.
///
/// Only returns on failure.
pub async fn run(config: ProxyConfig) -> Result<(), ServerError> {
    let policy = TlsPolicy::new();
    let source = CertificateSource::from_mode(&config.tls, &policy)?;
    let app = proxy::router(Upstream::new(config.upstream.clone())?);

    tracing::info!(
        source = source.name(),
        upstream = %config.upstream,
        hosts = ?config.hosts,
        "Certificate source ready"
    );

    let primary = bind(config.listen)?;
    let mut group = TaskGroup::new();

    match source {
        CertificateSource::Disabled => {
            tracing::warn!(
                addr = %config.listen,
                "TLS disabled - forwarding plain HTTP (not recommended for production)"
            );
            group.spawn(PRIMARY, serve_plain(primary, app));
        }
        CertificateSource::Static(tls) => {
            let (companion, companion_addr) = bind_companion(config.http_listen, config.tls.name())?;
            tracing::info!(
                addr = %config.listen,
                redirect = %companion_addr,
                min_version = ?MIN_PROTOCOL_VERSION,
                "Starting HTTPS server (static certificate)"
            );
            group.spawn(COMPANION, serve_companion(companion, redirect::redirect_router()));
            group.spawn(PRIMARY, serve_tls(primary, tls, app));
        }
        CertificateSource::Acme(acme) => {
            let (companion, companion_addr) = bind_companion(config.http_listen, config.tls.name())?;
            tracing::info!(
                addr = %config.listen,
                challenges = %companion_addr,
                min_version = ?MIN_PROTOCOL_VERSION,
                "Starting HTTPS server (ACME)"
            );
            group.spawn(COMPANION, serve_companion(companion, acme.companion));
            group.spawn(PRIMARY, serve_acme(primary, acme.acceptor, app));
        }
    }

    Err(group.wait().await)
}

/// Bind a listening socket, ready to hand to the async runtime.
///
/// The IPv6 wildcard falls back to the IPv4 wildcard on hosts without IPv6.
pub fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let bind_error = |source| ServerError::Bind { addr, source };
    let listener = match TcpListener::bind(addr) {
        Err(e) if is_ipv6_wildcard(addr) && e.kind() != io::ErrorKind::AddrInUse => {
            tracing::debug!(%addr, error = %e, "IPv6 unavailable, listening on IPv4 only");
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, addr.port()))
        }
        bound => bound,
    }
    .map_err(bind_error)?;
    listener.set_nonblocking(true).map_err(bind_error)?;
    Ok(listener)
}

fn is_ipv6_wildcard(addr: SocketAddr) -> bool {
    matches!(addr, SocketAddr::V6(v6) if v6.ip().is_unspecified())
}

fn bind_companion(
    addr: Option<SocketAddr>,
    source: &'static str,
) -> Result<(TcpListener, SocketAddr), ServerError> {
    let addr = addr.ok_or(ServerError::MissingCompanionAddress(source))?;
    Ok((bind(addr)?, addr))
}

/// Serve the forwarding router over plain HTTP.
pub async fn serve_plain(listener: TcpListener, app: Router) -> Result<(), ServerError> {
    log_listening(PRIMARY, &listener, "http");
    axum_server::from_tcp(listener)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|source| ServerError::Listener {
            listener: PRIMARY,
            source,
        })
}

/// Serve the forwarding router over TLS with a fixed server config.
pub async fn serve_tls(
    listener: TcpListener,
    tls: Arc<ServerConfig>,
    app: Router,
) -> Result<(), ServerError> {
    log_listening(PRIMARY, &listener, "https");
    tls_rustls::from_tcp_rustls(listener, RustlsConfig::from_config(tls))
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|source| ServerError::Listener {
            listener: PRIMARY,
            source,
        })
}

/// Serve the forwarding router over TLS with ACME-managed certificates.
pub async fn serve_acme(
    listener: TcpListener,
    acceptor: AxumAcceptor,
    app: Router,
) -> Result<(), ServerError> {
    log_listening(PRIMARY, &listener, "https");
    axum_server::from_tcp(listener)
        .acceptor(acceptor)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|source| ServerError::Listener {
            listener: PRIMARY,
            source,
        })
}

/// Serve the plaintext companion router.
pub async fn serve_companion(listener: TcpListener, app: Router) -> Result<(), ServerError> {
    log_listening(COMPANION, &listener, "http");
    axum_server::from_tcp(listener)
        .serve(app.into_make_service())
        .await
        .map_err(|source| ServerError::Listener {
            listener: COMPANION,
            source,
        })
}

fn log_listening(name: &'static str, listener: &TcpListener, scheme: &str) {
    match listener.local_addr() {
        Ok(addr) => tracing::info!(listener = name, %addr, scheme, "Listening"),
        Err(e) => tracing::warn!(listener = name, error = %e, "Listening on unknown address"),
    }
}
