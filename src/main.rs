//! MeshHub - rendezvous hub for zero-trust mesh endpoints
//!
//! Endpoints keep a registration tunnel open to the hub; callers discover
//! them and reach their services through it.

use anyhow::{Context, Result};
use clap::Parser;
use meshhub_broker::{HubConfig, HubServer, TlsConfig};
use meshhub_control::{CertificateSigner, HubLog, RemoteCaSigner};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

/// MeshHub - rendezvous hub for zero-trust mesh endpoints
#[derive(Parser, Debug)]
#[command(name = "meshhub")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "MESHHUB_LISTEN", default_value = "0.0.0.0:8888")]
    listen: SocketAddr,

    /// Externally reachable name of this hub (host:port), repeatable
    #[arg(long = "name", env = "MESHHUB_NAMES", value_delimiter = ',')]
    names: Vec<String>,

    /// Hub identifier reported in status and ping results
    #[arg(long, env = "MESHHUB_HUB_ID")]
    hub_id: Option<String>,

    /// Maximum number of registered endpoints
    #[arg(long, env = "MESHHUB_MAX_ENDPOINTS", default_value_t = 1000)]
    max_endpoints: usize,

    /// Maximum number of concurrent service tunnels
    #[arg(long, env = "MESHHUB_MAX_SESSIONS", default_value_t = 10000)]
    max_sessions: usize,

    /// TLS certificate (PEM); enables TLS together with --tls-key
    #[arg(long, env = "MESHHUB_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "MESHHUB_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// CA bundle (PEM) for verifying endpoint client certificates
    #[arg(long, env = "MESHHUB_TLS_CLIENT_CA", requires = "tls_cert")]
    tls_client_ca: Option<PathBuf>,

    /// Certificate authority used for /api/sign (host:port or http URL)
    #[arg(long, env = "MESHHUB_CA")]
    ca: Option<String>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, env = "MESHHUB_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn hub_config(&self) -> HubConfig {
        let defaults = HubConfig::default();
        let tls = match (&self.tls_cert, &self.tls_key) {
            (Some(cert_path), Some(key_path)) => Some(TlsConfig {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
                client_ca_path: self.tls_client_ca.clone(),
            }),
            _ => None,
        };

        HubConfig {
            hub_id: self.hub_id.clone().unwrap_or(defaults.hub_id.clone()),
            listen: self.listen,
            names: self.names.clone(),
            max_endpoints: self.max_endpoints,
            max_sessions: self.max_sessions,
            tls,
            log_capacity: HubLog::DEFAULT_CAPACITY,
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    // TLS termination uses ring
    let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider());

    let config = cli.hub_config();
    info!("Starting hub {}", config.hub_id);
    info!("Listening address: {}", config.listen);
    if !config.names.is_empty() {
        info!("Advertised names: {}", config.names.join(", "));
    }
    info!(
        "Capacity: {} endpoints, {} sessions",
        config.max_endpoints, config.max_sessions
    );

    let signer: Option<Arc<dyn CertificateSigner>> = match &cli.ca {
        Some(ca) => {
            let signer = RemoteCaSigner::new(ca).context("Invalid certificate authority")?;
            info!("Certificate authority: {}", ca);
            Some(Arc::new(signer) as Arc<dyn CertificateSigner>)
        }
        None => None,
    };

    let server = HubServer::bind_with_signer(config, signer)
        .await
        .context("Failed to start hub")?;
    info!("Hub bound to {}", server.local_addr());
    info!("Press Ctrl+C to stop");

    server
        .run_until(async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received, stopping hub..."),
                Err(err) => error!("Error listening for shutdown signal: {}", err),
            }
        })
        .await?;

    info!("Hub stopped");
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
