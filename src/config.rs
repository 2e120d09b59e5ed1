//! Configuration loading, validation, and constants.
//!
//! Settings come from an optional TOML file overlaid by command line flags.
//! [`Settings::validate`] turns them into an immutable [`ProxyConfig`], rejecting
//! any combination of TLS flags that cannot describe exactly one certificate
//! source. Nothing here opens a socket.

use std::net::{IpAddr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::Deserialize;

use crate::tls::allowlist::HostAllowlist;

// =============================================================================
// Ports
// =============================================================================

/// Conventional plaintext HTTP port
pub const HTTP_PORT: u16 = 80;

/// Conventional HTTPS port, used as the redirect target
pub const HTTPS_PORT: u16 = 443;

/// Listen ports that imply the operator expects TLS
pub const SECURE_PORTS: &[&str] = &["443", "8443", "https"];

// =============================================================================
// Defaults
// =============================================================================

/// Default ACME certificate cache directory
pub const DEFAULT_ACME_DIR: &str = "/opt/acme";

/// Default bind address for the plaintext companion listener
pub const DEFAULT_HTTP_ADDR: &str = ":http";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "tlsfront=info,tower_http=info";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Files consulted, in order, for the machine hostname
const HOSTNAME_FILES: &[&str] = &["/proc/sys/kernel/hostname", "/etc/hostname"];

/// Raw settings as read from a config file and command line.
///
/// Every field has a default so a file may set any subset of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address of the primary (forwarding) listener, e.g. ":443"
    pub addr: String,
    /// Address of the plaintext companion listener
    pub http_addr: String,
    /// Upstream URL every request is forwarded to
    pub proxy: String,
    /// Obtain certificates automatically via ACME
    pub acme: bool,
    /// ACME certificate cache directory
    pub acme_dir: PathBuf,
    /// Use the staging ACME directory instead of production
    pub acme_staging: bool,
    /// Hostnames certificates may be issued for
    pub hosts: Vec<String>,
    /// Static private key path (PEM)
    pub key: String,
    /// Static certificate chain path (PEM)
    pub cert: String,
    /// Contact address registered with the ACME account
    pub email: String,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            addr: String::new(),
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            proxy: String::new(),
            acme: true,
            acme_dir: PathBuf::from(DEFAULT_ACME_DIR),
            acme_staging: false,
            hosts: Vec::new(),
            key: String::new(),
            cert: String::new(),
            email: String::new(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }

    /// Whether structured JSON output was requested
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

/// Validated, immutable proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Primary listener address
    pub listen: SocketAddr,
    /// Plaintext companion listener address, absent when TLS is disabled
    pub http_listen: Option<SocketAddr>,
    /// Upstream every request is forwarded to
    pub upstream: Url,
    /// Configured hostnames (may be empty when TLS is disabled)
    pub hosts: Vec<String>,
    /// The single active certificate source
    pub tls: TlsMode,
}

/// Certificate source selected at startup. Exactly one is active.
#[derive(Debug, Clone)]
pub enum TlsMode {
    /// Automatic provisioning via ACME
    Acme(AcmeSettings),
    /// Key and certificate loaded from disk once at startup
    Static { key_path: PathBuf, cert_path: PathBuf },
    /// Plaintext only
    Disabled,
}

impl TlsMode {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            TlsMode::Acme(_) => "acme",
            TlsMode::Static { .. } => "static",
            TlsMode::Disabled => "disabled",
        }
    }
}

/// Settings for the ACME certificate source
#[derive(Debug, Clone)]
pub struct AcmeSettings {
    /// Hostnames certificates may be issued for (never empty)
    pub hosts: HostAllowlist,
    /// Directory the certificate cache persists into
    pub cache_dir: PathBuf,
    /// Optional contact address, without the mailto: scheme
    pub contact: Option<String>,
    /// Use the production directory rather than staging
    pub production: bool,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Validate the settings, falling back to the machine hostname when no
    /// hostnames were given.
    pub fn validate(self) -> Result<ProxyConfig, ConfigError> {
        self.validate_with(default_hostname())
    }

    fn validate_with(self, fallback_host: Option<String>) -> Result<ProxyConfig, ConfigError> {
        if self.addr.is_empty() {
            return Err(ConfigError::MissingAddress);
        }

        if !https_check(&self.addr, &self.key, &self.cert, self.acme) {
            return Err(ConfigError::TlsFlags {
                addr: self.addr,
                key: self.key,
                cert: self.cert,
                acme: self.acme,
            });
        }

        if self.key.is_empty() != self.cert.is_empty() {
            return Err(ConfigError::PartialKeyPair);
        }

        let mut hosts = normalize_hosts(&self.hosts);
        if hosts.is_empty() {
            hosts.extend(fallback_host);
        }

        let tls = if self.acme {
            let hosts = HostAllowlist::new(hosts.iter().cloned())
                .ok_or(ConfigError::MissingHostname)?;
            TlsMode::Acme(AcmeSettings {
                hosts,
                cache_dir: self.acme_dir,
                contact: Some(self.email).filter(|e| !e.is_empty()),
                production: !self.acme_staging,
            })
        } else if !self.key.is_empty() {
            if hosts.is_empty() {
                return Err(ConfigError::MissingHostname);
            }
            TlsMode::Static {
                key_path: PathBuf::from(self.key),
                cert_path: PathBuf::from(self.cert),
            }
        } else {
            TlsMode::Disabled
        };

        let http_listen = match tls {
            TlsMode::Disabled => None,
            _ => Some(resolve_listen_addr(&self.http_addr)?),
        };

        Ok(ProxyConfig {
            listen: resolve_listen_addr(&self.addr)?,
            http_listen,
            upstream: parse_upstream(&self.proxy)?,
            hosts,
            tls,
        })
    }
}

/// Decide whether a combination of TLS flags is consistent.
///
/// A secure-looking listen port needs a certificate source, and ACME never
/// coexists with a static key or certificate.
pub fn https_check(addr: &str, key: &str, cert: &str, acme: bool) -> bool {
    if is_secure_port(addr) && !acme && (key.is_empty() || cert.is_empty()) {
        return false;
    }
    if acme && (!key.is_empty() || !cert.is_empty()) {
        return false;
    }
    true
}

/// Whether the port of `addr` is one of [`SECURE_PORTS`].
pub fn is_secure_port(addr: &str) -> bool {
    split_host_port(addr)
        .map(|(_, port)| SECURE_PORTS.contains(&port))
        .unwrap_or(false)
}

/// Resolve a `host:port` listen address.
///
/// Accepts `:443`, `:https`, `0.0.0.0:8080`, `[::1]:8443` and resolvable
/// hostnames. An empty host means every interface: the IPv6 wildcard, which
/// also accepts IPv4 on dual-stack hosts (see [`crate::http::bind`]).
pub fn resolve_listen_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    let invalid = |reason: String| ConfigError::Address {
        addr: addr.to_string(),
        reason,
    };

    let (host, port) =
        split_host_port(addr).ok_or_else(|| invalid("expected host:port".to_string()))?;

    let port = match port {
        "http" => HTTP_PORT,
        "https" => HTTPS_PORT,
        p => p
            .parse::<u16>()
            .map_err(|_| invalid(format!("invalid port '{p}'")))?,
    };

    if host.is_empty() {
        return Ok(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    (host, port)
        .to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?
        .next()
        .ok_or_else(|| invalid(format!("'{host}' did not resolve")))
}

fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        return Some((host, tail.strip_prefix(':')?));
    }
    let (host, port) = addr.rsplit_once(':')?;
    // Unbracketed IPv6 literal
    if host.contains(':') {
        return None;
    }
    Some((host, port))
}

/// Parse the upstream target. It must be an absolute http(s) URL with a host.
pub fn parse_upstream(raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::Upstream {
        url: raw.to_string(),
        reason,
    };

    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if !url.has_host() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

/// Split a comma separated hostname list.
pub fn split_hosts(raw: &str) -> Vec<String> {
    raw.split(',').map(str::to_string).collect()
}

/// Trim, lowercase, and drop empty hostnames, keeping first-seen order.
fn normalize_hosts(hosts: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(hosts.len());
    for host in hosts {
        let host = host.trim().to_ascii_lowercase();
        if !host.is_empty() && !out.contains(&host) {
            out.push(host);
        }
    }
    out
}

/// The machine hostname, if the OS exposes one.
fn default_hostname() -> Option<String> {
    HOSTNAME_FILES
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .chain(std::env::var("HOSTNAME").ok())
        .map(|name| name.trim().to_ascii_lowercase())
        .find(|name| !name.is_empty())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("provide an address to listen on")]
    MissingAddress,
    #[error("invalid listen address '{addr}': {reason}")]
    Address { addr: String, reason: String },
    #[error("invalid TLS flags: addr: {addr}, key: {key}, cert: {cert}, acme: {acme}")]
    TlsFlags {
        addr: String,
        key: String,
        cert: String,
        acme: bool,
    },
    #[error("static key and certificate must be supplied together")]
    PartialKeyPair,
    #[error("provide at least one hostname")]
    MissingHostname,
    #[error("invalid upstream URL '{url}': {reason}")]
    Upstream { url: String, reason: String },
}
