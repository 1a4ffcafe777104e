//! Registration tunnel and the requests an endpoint sends over it

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Either, Empty, Full};
use hyper::body::{Body, Incoming};
use hyper::client::conn::http1 as client_http1;
use hyper::server::conn::http1 as server_http1;
use hyper::service::Service;
use hyper_util::rt::TokioIo;
use meshhub_proto::{ServiceSpec, StatusReport};
use meshhub_relay::{RelayChannel, RelayConfig, RelayError, Role};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Path the hub pings through every tunnel; answered by [`EndpointSession::serve`]
pub const PING_PATH: &str = "/api/ping";

/// Endpoint session errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection to hub failed: {0}")]
    ConnectionFailed(String),

    #[error("Registration rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A registered endpoint's live tunnel to the hub
pub struct EndpointSession {
    id: String,
    channel: RelayChannel,
}

impl EndpointSession {
    /// Register `id` with the hub at `hub_addr` using default relay settings
    pub async fn connect<A>(hub_addr: A, id: &str, name: Option<&str>) -> Result<Self, ClientError>
    where
        A: ToSocketAddrs + std::fmt::Display,
    {
        Self::connect_with_config(hub_addr, id, name, RelayConfig::default()).await
    }

    pub async fn connect_with_config<A>(
        hub_addr: A,
        id: &str,
        name: Option<&str>,
        config: RelayConfig,
    ) -> Result<Self, ClientError>
    where
        A: ToSocketAddrs + std::fmt::Display,
    {
        let host = hub_addr.to_string();
        let stream = TcpStream::connect(hub_addr)
            .await
            .map_err(|e| ClientError::ConnectionFailed(format!("{}: {}", host, e)))?;
        let _ = stream.set_nodelay(true);

        let (mut sender, conn) = client_http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ClientError::ConnectionFailed(format!("HTTP handshake failed: {}", e)))?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Hub connection ended: {}", e);
            }
        });

        let request = Request::builder()
            .method(Method::CONNECT)
            .uri(registration_target(id, name))
            .header(HOST, host.as_str())
            .body(Empty::<Bytes>::new())
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
        if response.status() != StatusCode::OK {
            let status = response.status().as_u16();
            let body = response
                .into_body()
                .collect()
                .await
                .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
                .unwrap_or_default();
            return Err(ClientError::Rejected { status, body });
        }

        let upgraded = hyper::upgrade::on(response)
            .await
            .map_err(|e| ClientError::ConnectionFailed(format!("tunnel upgrade failed: {}", e)))?;
        let channel = RelayChannel::new(TokioIo::new(upgraded), Role::Client, config);

        info!(endpoint_id = %id, hub = %host, "Registered with hub");
        Ok(Self {
            id: id.to_string(),
            channel,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel(&self) -> &RelayChannel {
        &self.channel
    }

    /// Report liveness and the current name; returns the hub's status code
    pub async fn heartbeat(&self, report: &StatusReport) -> Result<StatusCode, ClientError> {
        self.post_json("/api/status", report).await
    }

    /// Replace the advertised services; returns the hub's status code
    pub async fn publish(&self, services: &[ServiceSpec]) -> Result<StatusCode, ClientError> {
        self.post_json("/api/services", &services).await
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        value: &T,
    ) -> Result<StatusCode, ClientError> {
        let body = serde_json::to_vec(value).map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;

        let response = self.channel.send_request(request).await?;
        let status = response.status();
        // Drain so the stream finishes cleanly
        let _ = response.into_body().collect().await;
        Ok(status)
    }

    /// Serve streams opened by the hub until the tunnel closes.
    ///
    /// Hub pings are answered here; every other request goes to `service`.
    /// CONNECT requests may be upgraded for service tunnels.
    pub async fn serve<S, B>(&self, service: S)
    where
        S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<BoxError> + Send,
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        while let Some(stream) = self.channel.accept_stream().await {
            let service = AnswerPing {
                inner: service.clone(),
            };
            let endpoint_id = self.id.clone();
            tokio::spawn(async move {
                let stream_id = stream.id();
                if let Err(e) = server_http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await
                {
                    debug!(%endpoint_id, "Stream {} ended: {}", stream_id, e);
                }
            });
        }
        debug!(endpoint_id = %self.id, "Stopped serving hub streams");
    }

    /// Close the tunnel; the hub marks the endpoint as disconnected
    pub fn close(&self) {
        self.channel.close("endpoint closed the session");
    }

    /// Resolves with the close reason once the tunnel is gone
    pub async fn closed(&self) -> String {
        self.channel.closed().await
    }
}

fn registration_target(id: &str, name: Option<&str>) -> String {
    let path = format!("/api/endpoints/{}", utf8_percent_encode(id, NON_ALPHANUMERIC));
    match name {
        Some(name) => {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("name", name)
                .finish();
            format!("{}?{}", path, query)
        }
        None => path,
    }
}

/// Answers hub pings before the endpoint's own service sees them
#[derive(Clone)]
struct AnswerPing<S> {
    inner: S,
}

impl<S, B> Service<Request<Incoming>> for AnswerPing<S>
where
    S: Service<Request<Incoming>, Response = Response<B>>,
    S::Future: Send + 'static,
    S::Error: Send,
    B: Body<Data = Bytes> + Send + 'static,
{
    type Response = Response<Either<B, Empty<Bytes>>>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        if req.method() == Method::GET && req.uri().path() == PING_PATH {
            return Box::pin(async { Ok(Response::new(Either::Right(Empty::new()))) });
        }
        let response = self.inner.call(req);
        Box::pin(async move { response.await.map(|r| r.map(Either::Left)) })
    }
}
