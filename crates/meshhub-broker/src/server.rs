//! Hub server: listener, optional TLS termination and the accept loop

use crate::broker::TunnelBroker;
use crate::config::{HubConfig, TlsConfig};
use crate::context::{CallerSocket, ConnectionContext};
use crate::error::HubError;
use crate::maintenance::spawn_maintenance;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use meshhub_control::{CertificateSigner, EndpointRegistry, HubLog, TaskTracker};
use std::convert::Infallible;
use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

pub struct HubServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    broker: Arc<TunnelBroker>,
    tls: Option<TlsAcceptor>,
    tasks: TaskTracker,
}

impl HubServer {
    /// Bind the hub listener
    pub async fn bind(config: HubConfig) -> Result<Self, HubError> {
        Self::bind_with_signer(config, None).await
    }

    /// Bind the hub listener with a certificate authority for `/api/sign`
    pub async fn bind_with_signer(
        config: HubConfig,
        signer: Option<Arc<dyn CertificateSigner>>,
    ) -> Result<Self, HubError> {
        config.validate()?;

        let tls = match &config.tls {
            Some(tls) => Some(tls_acceptor(tls)?),
            None => None,
        };

        let listener = TcpListener::bind(config.listen).await.map_err(|e| {
            HubError::BindError {
                address: config.listen.ip().to_string(),
                port: config.listen.port(),
                reason: e.to_string(),
            }
        })?;
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(EndpointRegistry::with_limit(config.max_endpoints));
        let log = Arc::new(HubLog::new(config.log_capacity));
        let broker = Arc::new(TunnelBroker::new(Arc::new(config), registry, log, signer)?);
        broker.add_port(local_addr);

        Ok(Self {
            listener,
            local_addr,
            broker,
            tls,
            tasks: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn broker(&self) -> &Arc<TunnelBroker> {
        &self.broker
    }

    /// Serve until the process ends
    pub async fn run(self) -> Result<(), HubError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then close every endpoint tunnel
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), HubError>
    where
        F: Future<Output = ()>,
    {
        spawn_maintenance(&self.broker, &self.tasks);

        let scheme = if self.tls.is_some() { "https" } else { "http" };
        info!("Hub {} listening on {}://{}", self.broker.config().hub_id, scheme, self.local_addr);
        self.broker
            .log()
            .info(format!("Hub started on {}", self.local_addr));

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let broker = self.broker.clone();
                        let tls = self.tls.clone();
                        tokio::spawn(async move {
                            handle_connection(broker, stream, peer_addr, tls).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept hub connection: {}", e);
                    }
                },
            }
        }

        info!("Hub shutting down");
        self.tasks.abort_all();
        for (id, channel) in self.broker.registry().live_channels() {
            debug!(endpoint_id = %id, "Closing endpoint tunnel");
            channel.close("hub shutting down");
        }
        Ok(())
    }
}

async fn handle_connection(
    broker: Arc<TunnelBroker>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
) {
    debug!("New hub connection from {}", peer_addr);
    let local_addr = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            debug!("Connection from {} lost before serving: {}", peer_addr, e);
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    let mut ctx = ConnectionContext::new(peer_addr, local_addr);
    match CallerSocket::from_stream(&stream) {
        Ok(socket) => ctx = ctx.with_socket(socket),
        Err(e) => debug!("No socket handle for {}: {}", peer_addr, e),
    }

    match tls {
        None => serve_io(broker, stream, ctx).await,
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                let certificate = tls_stream
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|chain| chain.first())
                    .map(|cert| certificate_pem(cert.as_ref()));
                if certificate.is_some() {
                    debug!("Client certificate presented by {}", peer_addr);
                }
                serve_io(broker, tls_stream, ctx.with_certificate(certificate)).await
            }
            Err(e) => warn!("TLS handshake failed from {}: {}", peer_addr, e),
        },
    }
}

/// PEM text of a DER certificate
pub(crate) fn certificate_pem(der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for line in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

async fn serve_io<I>(broker: Arc<TunnelBroker>, io: I, ctx: ConnectionContext)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer_addr = ctx.remote_addr();
    let service = service_fn(move |req: Request<Incoming>| {
        let broker = broker.clone();
        let ctx = ctx.clone();
        async move { Ok::<_, Infallible>(broker.handle(req, ctx).await) }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    if let Err(e) = builder
        .serve_connection_with_upgrades(TokioIo::new(io), service)
        .await
    {
        debug!("Hub connection from {} ended: {}", peer_addr, e);
    }
}

fn tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor, HubError> {
    info!("Loading TLS certificate from: {}", tls.cert_path.display());
    let certs = load_certs(&tls.cert_path)?;
    info!("Loading TLS private key from: {}", tls.key_path.display());
    let key = load_private_key(&tls.key_path)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| HubError::Tls(format!("Unsupported protocol versions: {}", e)))?;

    let builder = match &tls.client_ca_path {
        Some(ca_path) => {
            info!("Verifying client certificates against: {}", ca_path.display());
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| HubError::Tls(format!("Invalid client CA: {}", e)))?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .allow_unauthenticated()
                .build()
                .map_err(|e| HubError::Tls(format!("Invalid client CA: {}", e)))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = builder
        .with_single_cert(certs, key)
        .map_err(|e| HubError::Tls(format!("Invalid cert/key: {}", e)))?;
    // CONNECT tunnels need HTTP/1.1 upgrades
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Load TLS certificates from PEM files
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, HubError> {
    let file = File::open(path)
        .map_err(|e| HubError::Tls(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| HubError::Tls(format!("Failed to parse certs: {}", e)))?;
    if certs.is_empty() {
        return Err(HubError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load private key from PEM file
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, HubError> {
    let file = File::open(path)
        .map_err(|e| HubError::Tls(format!("Failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| HubError::Tls(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| HubError::Tls("No private key found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_bind_reports_address_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = HubConfig {
            listen: taken.local_addr().unwrap(),
            ..HubConfig::default()
        };
        match HubServer::bind(config).await {
            Err(HubError::BindError { port, .. }) => {
                assert_eq!(port, taken.local_addr().unwrap().port())
            }
            Err(other) => panic!("expected bind error, got {}", other),
            Ok(_) => panic!("expected bind error"),
        }
    }

    #[tokio::test]
    async fn test_missing_tls_files() {
        let config = HubConfig {
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            tls: Some(TlsConfig {
                cert_path: PathBuf::from("/nonexistent/cert.pem"),
                key_path: PathBuf::from("/nonexistent/key.pem"),
                client_ca_path: None,
            }),
            ..HubConfig::default()
        };
        assert!(matches!(
            HubServer::bind(config).await,
            Err(HubError::Tls(_))
        ));
    }

    #[test]
    fn test_certificate_pem_wraps_at_64_columns() {
        let der = vec![0x30u8; 100];
        let pem = certificate_pem(&der);
        let lines: Vec<&str> = pem.lines().collect();
        assert_eq!(lines.first(), Some(&"-----BEGIN CERTIFICATE-----"));
        assert_eq!(lines.last(), Some(&"-----END CERTIFICATE-----"));
        assert_eq!(lines[1].len(), 64);
        assert!(lines[1..lines.len() - 1].iter().all(|l| l.len() <= 64));

        let body: String = lines[1..lines.len() - 1].concat();
        assert_eq!(STANDARD.decode(body).unwrap(), der);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = HubConfig {
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_sessions: 1,
            ..HubConfig::default()
        };
        assert!(matches!(
            HubServer::bind(config).await,
            Err(HubError::Config(_))
        ));
    }
}
