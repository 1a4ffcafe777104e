//! HTTP/1.1 exchanges over logical streams

use crate::{RelayChannel, RelayError};
use http::header::{HeaderValue, CONNECTION};
use http::{Method, Request, Response};
use hyper::body::{Body, Incoming};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tracing::debug;

impl RelayChannel {
    /// Send one HTTP request on a fresh logical stream.
    ///
    /// Every stream carries a single exchange, so non-CONNECT requests are
    /// marked `connection: close`. A CONNECT response can be upgraded with
    /// `hyper::upgrade::on`.
    pub async fn send_request<B>(&self, mut req: Request<B>) -> Result<Response<Incoming>, RelayError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let stream = self.open_stream().await?;
        let stream_id = stream.id();

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| self.exchange_error(e))?;

        let channel_id = self.id().to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(%channel_id, "Relay stream {} connection ended: {}", stream_id, e);
            }
        });

        if req.method() != Method::CONNECT {
            req.headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
        }

        sender
            .send_request(req)
            .await
            .map_err(|e| self.exchange_error(e))
    }

    fn exchange_error(&self, err: hyper::Error) -> RelayError {
        // Report why the tunnel went away rather than the symptom
        if self.is_closed() {
            self.closed_error()
        } else {
            RelayError::Http(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{RelayChannel, RelayConfig, RelayError, Role};
    use bytes::Bytes;
    use http::{Request, Response, StatusCode};
    use http_body_util::{BodyExt, Empty, Full};
    use hyper::server::conn::http1 as server_http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::time::Duration;
    use tokio::time::timeout;

    fn serve_echo_path(endpoint: RelayChannel) {
        tokio::spawn(async move {
            while let Some(stream) = endpoint.accept_stream().await {
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        if req.uri().path() == "/api/hang" {
                            std::future::pending::<()>().await;
                        }
                        let body = format!("{} {}", req.method(), req.uri());
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                    });
                    let _ = server_http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
    }

    #[tokio::test]
    async fn test_send_request_over_stream() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let hub = RelayChannel::new(a, Role::Server, RelayConfig::default());
        serve_echo_path(RelayChannel::new(b, Role::Client, RelayConfig::default()));

        let req = Request::get("/api/info?x=1")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let resp = timeout(Duration::from_secs(5), hub.send_request(req))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"GET /api/info?x=1");
    }

    #[tokio::test]
    async fn test_pending_request_fails_when_peer_leaves() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let hub = RelayChannel::new(a, Role::Server, RelayConfig::default());
        let endpoint = RelayChannel::new(b, Role::Client, RelayConfig::default());
        serve_echo_path(endpoint.clone());

        let req = Request::get("/api/hang").body(Empty::<Bytes>::new()).unwrap();
        let pending = tokio::spawn({
            let hub = hub.clone();
            async move { hub.send_request(req).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        endpoint.close("endpoint restarting");

        let result = timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap();
        match result {
            Err(RelayError::PeerGone(reason)) => assert!(reason.contains("endpoint restarting")),
            other => panic!("expected PeerGone, got {:?}", other.map(|r| r.status())),
        }
    }
}
