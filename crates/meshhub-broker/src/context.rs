//! Per-connection request context

use meshhub_control::Origin;
use meshhub_relay::RelayChannel;
use socket2::{SockRef, Socket};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// Second handle on a caller's TCP socket.
///
/// The socket closes once this handle and the connection are both dropped.
#[derive(Debug, Clone)]
pub struct CallerSocket(Arc<Socket>);

impl CallerSocket {
    pub fn from_stream(stream: &TcpStream) -> io::Result<Self> {
        SockRef::from(stream).try_clone().map(|socket| Self(Arc::new(socket)))
    }

    /// Make the final close send a reset instead of a FIN, so the caller
    /// sees an aborted connection rather than a clean end of stream
    pub fn reset_on_close(&self) -> io::Result<()> {
        self.0.set_linger(Some(Duration::ZERO))
    }
}

/// The endpoint a relay stream arrived from
#[derive(Debug, Clone)]
pub struct BoundEndpoint {
    pub id: String,
    pub channel: RelayChannel,
}

/// Where a request came from.
///
/// Requests on a plain hub connection carry only the network origin.
/// Requests on a logical stream of an endpoint tunnel also carry the
/// endpoint id and its channel, which is how heartbeats and publishes
/// resolve their sender.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    certificate: Option<String>,
    endpoint: Option<BoundEndpoint>,
    socket: Option<CallerSocket>,
}

impl ConnectionContext {
    pub fn new(remote_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self::from_inner(ContextInner {
            remote_addr,
            local_addr,
            certificate: None,
            endpoint: None,
            socket: None,
        })
    }

    fn from_inner(inner: ContextInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    fn rebuild(&self) -> ContextInner {
        ContextInner {
            remote_addr: self.inner.remote_addr,
            local_addr: self.inner.local_addr,
            certificate: self.inner.certificate.clone(),
            endpoint: self.inner.endpoint.clone(),
            socket: self.inner.socket.clone(),
        }
    }

    /// Attach the peer certificate presented to the TLS layer (PEM)
    pub fn with_certificate(self, certificate: Option<String>) -> Self {
        Self::from_inner(ContextInner {
            certificate,
            ..self.rebuild()
        })
    }

    /// Attach the caller's TCP socket so a broken tunnel can reset it
    pub fn with_socket(self, socket: CallerSocket) -> Self {
        Self::from_inner(ContextInner {
            socket: Some(socket),
            ..self.rebuild()
        })
    }

    /// Context for streams arriving over the tunnel of endpoint `id`
    pub fn for_endpoint(origin: &Origin, id: &str, channel: RelayChannel) -> Self {
        Self::from_inner(ContextInner {
            remote_addr: origin.remote_addr,
            local_addr: origin.local_addr,
            certificate: origin.certificate.clone(),
            endpoint: Some(BoundEndpoint {
                id: id.to_string(),
                channel,
            }),
            socket: None,
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn certificate(&self) -> Option<&str> {
        self.inner.certificate.as_deref()
    }

    pub fn endpoint(&self) -> Option<&BoundEndpoint> {
        self.inner.endpoint.as_ref()
    }

    /// Raw TCP socket of a direct hub connection; `None` for relay streams
    pub fn caller_socket(&self) -> Option<&CallerSocket> {
        self.inner.socket.as_ref()
    }

    pub fn origin(&self) -> Origin {
        Origin {
            remote_addr: self.inner.remote_addr,
            local_addr: self.inner.local_addr,
            certificate: self.inner.certificate.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshhub_relay::{RelayConfig, Role};

    #[test]
    fn test_plain_connection_has_no_endpoint() {
        let ctx = ConnectionContext::new(
            SocketAddr::from(([10, 0, 0, 1], 5000)),
            SocketAddr::from(([127, 0, 0, 1], 8888)),
        )
        .with_certificate(Some("CERT".to_string()));
        assert!(ctx.endpoint().is_none());
        assert_eq!(ctx.certificate(), Some("CERT"));
        assert_eq!(ctx.origin().remote_addr.port(), 5000);
    }

    #[tokio::test]
    async fn test_endpoint_context_keeps_origin() {
        let (a, _b) = tokio::io::duplex(1024);
        let channel = RelayChannel::new(a, Role::Server, RelayConfig::default());
        let origin = Origin {
            remote_addr: SocketAddr::from(([10, 0, 0, 2], 4000)),
            local_addr: SocketAddr::from(([127, 0, 0, 1], 8888)),
            certificate: None,
        };
        let ctx = ConnectionContext::for_endpoint(&origin, "e1", channel.clone());
        let bound = ctx.endpoint().unwrap();
        assert_eq!(bound.id, "e1");
        assert_eq!(bound.channel.id(), channel.id());
        assert_eq!(ctx.remote_addr(), origin.remote_addr);
        assert!(ctx.caller_socket().is_none());
    }

    #[tokio::test]
    async fn test_reset_socket_aborts_peer() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();

        let ctx = ConnectionContext::new(peer, server.local_addr().unwrap())
            .with_socket(CallerSocket::from_stream(&server).unwrap());
        ctx.caller_socket().unwrap().reset_on_close().unwrap();
        drop(server);
        drop(ctx);

        let mut buf = [0u8; 8];
        let outcome = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap();
        assert_eq!(outcome.unwrap_err().kind(), io::ErrorKind::ConnectionReset);
    }
}
