//! Hardened TLS policy shared by every TLS listener.
//!
//! The policy pins the protocol floor at TLS 1.2 and restricts negotiation to
//! forward-secret AEAD cipher suites. Certificate sources never build a
//! `ServerConfig` themselves; they hand a certificate (or resolver) to
//! [`TlsPolicy`], which is the only place a server config is assembled.

pub mod allowlist;
pub mod source;

use std::sync::Arc;

use rustls::crypto::aws_lc_rs::{self, cipher_suite};
use rustls::crypto::CryptoProvider;
use rustls::server::{ResolvesServerCert, WantsServerCert};
use rustls::{ConfigBuilder, ProtocolVersion, ServerConfig, SupportedCipherSuite, SupportedProtocolVersion};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

/// Enabled protocol versions, newest first
pub static PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Lowest protocol version a client may negotiate
pub const MIN_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::TLSv1_2;

/// ALPN protocols advertised by TLS listeners
pub const ALPN_PROTOCOLS: &[&[u8]] = &[b"h2", b"http/1.1"];

/// The allowed cipher suites, in server preference order.
///
/// TLS 1.3 suites are all AEAD with ephemeral key exchange. The TLS 1.2 suites
/// are ECDHE with AES-GCM, plus ChaCha20-Poly1305 for clients without AES
/// acceleration.
pub fn cipher_suites() -> Vec<SupportedCipherSuite> {
    vec![
        cipher_suite::TLS13_AES_128_GCM_SHA256,
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ]
}

/// TLS policy applied to every server config in the process.
///
/// Cloning shares the same crypto provider.
#[derive(Debug, Clone)]
pub struct TlsPolicy {
    provider: Arc<CryptoProvider>,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsPolicy {
    pub fn new() -> Self {
        let provider = CryptoProvider {
            cipher_suites: cipher_suites(),
            ..aws_lc_rs::default_provider()
        };
        Self {
            provider: Arc::new(provider),
        }
    }

    /// The restricted crypto provider backing this policy
    pub fn provider(&self) -> &Arc<CryptoProvider> {
        &self.provider
    }

    /// Server config that asks `resolver` for a certificate on every handshake.
    pub fn with_resolver(
        &self,
        resolver: Arc<dyn ResolvesServerCert>,
    ) -> Result<Arc<ServerConfig>, rustls::Error> {
        let config = self.builder()?.with_cert_resolver(resolver);
        Ok(finish(config))
    }

    /// Server config that presents the same certificate chain for every handshake.
    pub fn with_single_cert(
        &self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Arc<ServerConfig>, rustls::Error> {
        let config = self.builder()?.with_single_cert(chain, key)?;
        Ok(finish(config))
    }

    fn builder(&self) -> Result<ConfigBuilder<ServerConfig, WantsServerCert>, rustls::Error> {
        Ok(ServerConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(PROTOCOL_VERSIONS)?
            .with_no_client_auth())
    }
}

fn finish(mut config: ServerConfig) -> Arc<ServerConfig> {
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
    Arc::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_suites_are_aead_and_forward_secret() {
        for suite in cipher_suites() {
            let name = format!("{:?}", suite.suite());
            assert!(
                name.starts_with("TLS13_") || name.starts_with("TLS_ECDHE_"),
                "{name} lacks ephemeral key exchange"
            );
            assert!(
                name.contains("_GCM_") || name.contains("CHACHA20_POLY1305"),
                "{name} is not an AEAD suite"
            );
        }
    }

    #[test]
    fn test_cipher_suites_cover_both_signature_kinds() {
        let names: Vec<String> = cipher_suites()
            .iter()
            .map(|s| format!("{:?}", s.suite()))
            .collect();
        for kx in ["ECDSA", "RSA"] {
            for cipher in ["AES_128_GCM", "AES_256_GCM", "CHACHA20_POLY1305"] {
                let expected = format!("TLS_ECDHE_{kx}_WITH_{cipher}");
                assert!(
                    names.iter().any(|n| n.starts_with(&expected)),
                    "missing {expected}"
                );
            }
        }
    }

    #[test]
    fn test_policy_provider_uses_only_allowed_suites() {
        let policy = TlsPolicy::new();
        let allowed = cipher_suites();
        assert_eq!(policy.provider().cipher_suites.len(), allowed.len());
        for suite in &policy.provider().cipher_suites {
            assert!(allowed.iter().any(|a| a.suite() == suite.suite()));
        }
    }

    #[test]
    fn test_protocol_floor_is_tls12() {
        assert_eq!(MIN_PROTOCOL_VERSION, ProtocolVersion::TLSv1_2);
        assert!(PROTOCOL_VERSIONS
            .iter()
            .all(|v| v.version == ProtocolVersion::TLSv1_2 || v.version == ProtocolVersion::TLSv1_3));
    }

    #[test]
    fn test_clones_share_provider() {
        let policy = TlsPolicy::new();
        let shared = policy.clone();
        assert!(Arc::ptr_eq(policy.provider(), shared.provider()));
    }
}
