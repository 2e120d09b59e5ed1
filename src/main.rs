//! tlsfront: a TLS-terminating reverse proxy.
//!
//! This is the binary entry point. It parses flags, overlays them on an
//! optional TOML config file, initializes tracing, validates the result, and
//! runs the listeners until one of them fails.

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tlsfront::config::{split_hosts, ConfigError, LoggingConfig, Settings, DEFAULT_LOG_FILTER};

/// tlsfront: TLS-terminating reverse proxy for a single upstream
#[derive(Parser, Debug)]
#[command(name = "tlsfront", version, about)]
struct Args {
    /// Path to an optional TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on (e.g. ":443")
    #[arg(long)]
    addr: Option<String>,

    /// Upstream URL to proxy to (e.g. "http://127.0.0.1:9000")
    #[arg(long)]
    proxy: Option<String>,

    /// Obtain certificates automatically via ACME
    #[arg(long, action = ArgAction::Set)]
    acme: Option<bool>,

    /// ACME certificate cache directory
    #[arg(long = "acmedir")]
    acme_dir: Option<PathBuf>,

    /// Use the ACME staging directory
    #[arg(long)]
    acme_staging: bool,

    /// Comma separated hostnames for TLS
    #[arg(long = "host")]
    hosts: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// TLS certificate chain (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// Contact address for the ACME account
    #[arg(long)]
    email: Option<String>,

    /// Address of the plaintext challenge/redirect listener
    #[arg(long)]
    http_addr: Option<String>,

    /// Log level filter (e.g., "tlsfront=debug,tower_http=info")
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log format: "text" or "json"
    #[arg(long)]
    log_format: Option<String>,
}

impl Args {
    /// Settings from the config file (if any), overridden by explicit flags.
    fn settings(&self) -> Result<Settings, ConfigError> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };

        if let Some(addr) = &self.addr {
            settings.addr = addr.clone();
        }
        if let Some(proxy) = &self.proxy {
            settings.proxy = proxy.clone();
        }
        if let Some(acme) = self.acme {
            settings.acme = acme;
        }
        if let Some(dir) = &self.acme_dir {
            settings.acme_dir = dir.clone();
        }
        if self.acme_staging {
            settings.acme_staging = true;
        }
        if let Some(hosts) = &self.hosts {
            settings.hosts = split_hosts(hosts);
        }
        if let Some(key) = &self.key {
            settings.key = key.clone();
        }
        if let Some(cert) = &self.cert {
            settings.cert = cert.clone();
        }
        if let Some(email) = &self.email {
            settings.email = email.clone();
        }
        if let Some(http_addr) = &self.http_addr {
            settings.http_addr = http_addr.clone();
        }
        if let Some(format) = &self.log_format {
            settings.logging.format = format.clone();
        }

        Ok(settings)
    }
}

/// Initialize tracing with filter priority: CLI > env > default
fn init_tracing(log_level: Option<String>, logging: &LoggingConfig) {
    let log_filter = log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(&log_filter));

    if logging.is_json() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let settings = args.settings()?;

    init_tracing(args.log_level.clone(), &settings.logging);

    // Process-wide provider for outbound TLS (ACME directory requests)
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = settings.validate().inspect_err(|err| {
        tracing::error!(error = %err, "Invalid configuration");
    })?;

    tracing::info!(
        listen = %config.listen,
        upstream = %config.upstream,
        tls = config.tls.name(),
        "Loaded configuration"
    );

    tlsfront::http::run(config).await.inspect_err(|err| {
        tracing::error!(error = %err, "Fatal error, exiting");
    })?;

    Ok(())
}
