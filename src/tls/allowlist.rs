//! Host allowlist for automatic certificate provisioning.
//!
//! [`AllowlistResolver`] wraps the provisioning collaborator's certificate
//! resolver and refuses any handshake whose SNI is not on the list. A refused
//! handshake gets no certificate at all, so the client sees a handshake
//! failure rather than a certificate for some other name.

use std::collections::BTreeSet;
use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

/// Non-empty set of hostnames certificates may be issued and served for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAllowlist {
    hosts: BTreeSet<String>,
}

impl HostAllowlist {
    /// Build an allowlist. Returns `None` when no usable hostname is given.
    pub fn new<I, S>(hosts: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts: BTreeSet<String> = hosts
            .into_iter()
            .map(|h| normalize(h.as_ref()))
            .filter(|h| !h.is_empty())
            .collect();
        (!hosts.is_empty()).then_some(Self { hosts })
    }

    /// Case-insensitive membership test; a trailing dot is ignored.
    pub fn contains(&self, host: &str) -> bool {
        self.hosts.contains(&normalize(host))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

fn normalize(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Certificate resolver that only delegates for allowlisted SNI names.
#[derive(Debug)]
pub struct AllowlistResolver {
    allowlist: HostAllowlist,
    inner: Arc<dyn ResolvesServerCert>,
}

impl AllowlistResolver {
    pub fn new(allowlist: HostAllowlist, inner: Arc<dyn ResolvesServerCert>) -> Self {
        Self { allowlist, inner }
    }

    /// Whether a handshake requesting `server_name` may be served.
    ///
    /// Clients that send no SNI are refused.
    pub fn permits(&self, server_name: Option<&str>) -> bool {
        server_name.is_some_and(|name| self.allowlist.contains(name))
    }
}

impl ResolvesServerCert for AllowlistResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if !self.permits(client_hello.server_name()) {
            tracing::debug!(
                server_name = client_hello.server_name().unwrap_or("<none>"),
                "Refusing handshake for host outside allowlist"
            );
            return None;
        }
        self.inner.resolve(client_hello)
    }
}
