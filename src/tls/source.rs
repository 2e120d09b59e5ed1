//! Certificate sources.
//!
//! Exactly one source is active per process:
//! - **ACME**: certificates issued on demand for allowlisted hosts, cached on disk
//! - **Static**: a key/certificate pair loaded once at startup
//! - **Disabled**: plaintext only

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use futures::StreamExt;
use rustls::ServerConfig;
use rustls_acme::axum::AxumAcceptor;
use rustls_acme::caches::DirCache;
use rustls_acme::{AcmeConfig, UseChallenge};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::{AcmeSettings, TlsMode};
use crate::http::redirect;
use crate::http::ServerError;

use super::allowlist::AllowlistResolver;
use super::TlsPolicy;

/// Name of the probe file used to check the ACME cache directory is writable
const CACHE_PROBE_FILE: &str = ".tlsfront-write-test";

/// The active certificate source, built once at startup.
pub enum CertificateSource {
    Acme(AcmeSource),
    Static(Arc<ServerConfig>),
    Disabled,
}

/// Handles produced by the ACME source.
pub struct AcmeSource {
    /// TLS acceptor for the primary listener
    pub acceptor: AxumAcceptor,
    /// Router for the plaintext companion listener (HTTP-01 challenges)
    pub companion: Router,
}

impl CertificateSource {
    /// Build the source selected by `mode`, applying `policy` to its TLS config.
    ///
    /// For ACME this also spawns the background task that drives issuance
    /// and renewal, so it must be called from within the Tokio runtime.
    pub fn from_mode(mode: &TlsMode, policy: &TlsPolicy) -> Result<Self, ServerError> {
        match mode {
            TlsMode::Disabled => Ok(Self::Disabled),
            TlsMode::Static {
                key_path,
                cert_path,
            } => {
                tracing::info!(
                    cert = %cert_path.display(),
                    key = %key_path.display(),
                    "Loading static TLS certificate"
                );
                Ok(Self::Static(load_static(key_path, cert_path, policy)?))
            }
            TlsMode::Acme(settings) => Ok(Self::Acme(start_acme(settings, policy)?)),
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Acme(_) => "acme",
            Self::Static(_) => "static",
            Self::Disabled => "disabled",
        }
    }
}

/// Load a PEM key and certificate chain into a server config.
///
/// Fails if either file is missing or unreadable, holds no PEM item of the
/// right kind, or the key does not fit the certificate.
pub fn load_static(
    key_path: &Path,
    cert_path: &Path,
    policy: &TlsPolicy,
) -> Result<Arc<ServerConfig>, ServerError> {
    let cert_error = |reason: String| ServerError::Certificate {
        path: cert_path.to_path_buf(),
        reason,
    };

    let chain = CertificateDer::pem_file_iter(cert_path)
        .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
        .map_err(|e| cert_error(e.to_string()))?;
    if chain.is_empty() {
        return Err(cert_error("no certificates found".to_string()));
    }

    let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| ServerError::Certificate {
        path: key_path.to_path_buf(),
        reason: e.to_string(),
    })?;

    policy
        .with_single_cert(chain, key)
        .map_err(|e| cert_error(format!("unusable key/certificate pair: {e}")))
}

fn start_acme(settings: &AcmeSettings, policy: &TlsPolicy) -> Result<AcmeSource, ServerError> {
    let env_name = if settings.production {
        "production"
    } else {
        "staging"
    };
    tracing::info!(
        domains = ?settings.hosts.iter().collect::<Vec<_>>(),
        contact = settings.contact.as_deref().unwrap_or(""),
        cache = %settings.cache_dir.display(),
        environment = %env_name,
        "Configuring ACME certificate source"
    );

    if !settings.production {
        tracing::warn!(
            "Using Let's Encrypt staging environment - certificates will NOT be trusted by browsers"
        );
    }

    prepare_cache_dir(&settings.cache_dir)?;

    let mut state = AcmeConfig::new(settings.hosts.iter())
        .contact(settings.contact.iter().map(|email| format!("mailto:{email}")))
        .cache(DirCache::new(settings.cache_dir.clone()))
        .directory_lets_encrypt(settings.production)
        .challenge_type(UseChallenge::Http01)
        .state();

    let resolver = AllowlistResolver::new(settings.hosts.clone(), state.resolver());
    let acceptor = state.axum_acceptor(policy.with_resolver(Arc::new(resolver))?);
    let companion = redirect::acme_companion_router(state.http01_challenge_tower_service());

    // Drives issuance and renewal; errors are retried by the state machine
    tokio::spawn(async move {
        loop {
            match state.next().await {
                Some(Ok(event)) => {
                    tracing::info!(event = ?event, "ACME event");
                }
                Some(Err(err)) => {
                    tracing::error!(error = %err, "ACME error");
                }
                None => {
                    tracing::debug!("ACME state stream ended");
                    break;
                }
            }
        }
    });

    Ok(AcmeSource {
        acceptor,
        companion,
    })
}

/// Create the cache directory if needed and check it is writable.
fn prepare_cache_dir(dir: &Path) -> Result<(), ServerError> {
    let unusable = |source| ServerError::CacheDir {
        path: dir.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(dir).map_err(unusable)?;
    let probe = dir.join(CACHE_PROBE_FILE);
    std::fs::write(&probe, b"").map_err(unusable)?;
    std::fs::remove_file(&probe).map_err(unusable)
}
