//! Certificate signing collaborator
//!
//! The hub never handles key material itself. Signing requests are passed
//! to an external certificate authority that exposes `POST /api/sign/{name}`
//! taking a PEM public key and returning a PEM certificate.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

/// Signer errors
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("Invalid CA URL: {0}")]
    InvalidUrl(String),

    #[error("CA unreachable: {0}")]
    Unreachable(String),

    #[error("CA rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid CA response: {0}")]
    InvalidResponse(String),
}

/// Issues certificates for public keys
#[async_trait]
pub trait CertificateSigner: Send + Sync {
    /// Sign `public_key_pem` for `name`, returning the certificate in PEM form
    async fn sign(&self, name: &str, public_key_pem: &str) -> Result<String, SignerError>;
}

/// Signer backed by a remote certificate authority over HTTP
#[derive(Debug, Clone)]
pub struct RemoteCaSigner {
    base: Url,
    timeout: Duration,
}

impl RemoteCaSigner {
    pub fn new(ca_url: &str) -> Result<Self, SignerError> {
        // Bare host:port is accepted for convenience
        let candidate = if ca_url.contains("://") {
            ca_url.to_string()
        } else {
            format!("http://{}", ca_url)
        };
        let base = Url::parse(&candidate).map_err(|e| SignerError::InvalidUrl(e.to_string()))?;
        if base.scheme() != "http" {
            return Err(SignerError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                base.scheme()
            )));
        }
        if base.host_str().is_none() {
            return Err(SignerError::InvalidUrl("missing host".to_string()));
        }
        Ok(Self {
            base,
            timeout: Duration::from_secs(10),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn sign_url(&self, name: &str) -> Result<Url, SignerError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SignerError::InvalidUrl("CA URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["api", "sign", name]);
        Ok(url)
    }

    async fn post(&self, url: &Url, body: Bytes) -> Result<(StatusCode, Bytes), SignerError> {
        let host = url
            .host_str()
            .ok_or_else(|| SignerError::InvalidUrl("missing host".to_string()))?;
        let port = url.port_or_known_default().unwrap_or(80);

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| SignerError::Unreachable(format!("{}:{}: {}", host, port, e)))?;

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| SignerError::Unreachable(format!("HTTP handshake failed: {}", e)))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("CA connection ended: {}", e);
            }
        });

        let target = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        let request = Request::builder()
            .method(Method::POST)
            .uri(target)
            .header(HOST, format!("{}:{}", host, port))
            .header(CONTENT_TYPE, "application/x-pem-file")
            .body(Full::new(body))
            .map_err(|e| SignerError::InvalidUrl(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| SignerError::Unreachable(e.to_string()))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| SignerError::InvalidResponse(e.to_string()))?
            .to_bytes();
        Ok((status, body))
    }
}

#[async_trait]
impl CertificateSigner for RemoteCaSigner {
    async fn sign(&self, name: &str, public_key_pem: &str) -> Result<String, SignerError> {
        let url = self.sign_url(name)?;
        debug!(%url, "Requesting certificate from CA");

        let body = Bytes::copy_from_slice(public_key_pem.as_bytes());
        let (status, body) = tokio::time::timeout(self.timeout, self.post(&url, body))
            .await
            .map_err(|_| SignerError::Unreachable(format!("no response within {:?}", self.timeout)))??;

        let text = String::from_utf8(body.to_vec())
            .map_err(|_| SignerError::InvalidResponse("certificate is not UTF-8".to_string()))?;
        if !status.is_success() {
            return Err(SignerError::Rejected {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }
}
