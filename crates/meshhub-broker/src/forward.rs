//! Forwarding through endpoint tunnels: one-shot requests and spliced
//! service tunnels

use crate::body::{boxed, empty, status_response, strip_hop_by_hop, BoxError, HubBody};
use crate::broker::TunnelBroker;
use crate::context::{CallerSocket, ConnectionContext};
use crate::error::HubError;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, Uri};
use hyper::body::Body;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Characters escaped in a single path segment
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// One slot of the forwarding session budget, released on drop
pub(crate) struct SessionGuard {
    counter: Arc<AtomicUsize>,
}

impl SessionGuard {
    pub(crate) fn acquire(counter: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self {
                counter: counter.clone(),
            })
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// `/api/forward/{ep}/{rest}?q` becomes `/api/{rest}?q` on the endpoint
pub(crate) fn forward_target(rest: &str, query: Option<&str>) -> String {
    match query {
        Some(query) => format!("/api/{}?{}", rest, query),
        None => format!("/api/{}", rest),
    }
}

/// Endpoint-side target of a service tunnel, carrying the caller origin
pub(crate) fn service_target(protocol: &str, service: &str, caller: SocketAddr) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("ip", &caller.ip().to_string())
        .append_pair("port", &caller.port().to_string())
        .finish();
    format!(
        "/api/services/{}/{}?{}",
        utf8_percent_encode(protocol, SEGMENT),
        utf8_percent_encode(service, SEGMENT),
        query
    )
}

impl TunnelBroker {
    /// Relay exactly one request to the endpoint's local API
    pub(crate) async fn forward<B>(
        &self,
        req: Request<B>,
        id: &str,
        rest: &str,
    ) -> Result<Response<HubBody>, HubError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let channel = self.registry.channel(id)?;

        let target = forward_target(rest, req.uri().query());
        let (mut parts, body) = req.into_parts();
        parts.uri = target
            .parse::<Uri>()
            .map_err(|e| HubError::BadRequest(format!("invalid forward path: {}", e)))?;
        strip_hop_by_hop(&mut parts.headers);

        debug!(endpoint_id = %id, method = %parts.method, %target, "Forwarding request");
        let upstream = Request::from_parts(parts, boxed(body));
        let response = channel.send_request(upstream).await?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, boxed(body)))
    }

    /// Open a live tunnel from the caller to a service of an endpoint
    pub(crate) async fn connect_service<B>(
        self: &Arc<Self>,
        req: Request<B>,
        ctx: &ConnectionContext,
        id: &str,
        protocol: &str,
        service: &str,
    ) -> Result<Response<HubBody>, HubError> {
        if !self.registry.contains(id) {
            return Err(HubError::NotFound("Endpoint not found".to_string()));
        }
        if !self.catalog.is_advertised(id, protocol, service) {
            return Err(HubError::NotFound("Service not found".to_string()));
        }
        let channel = self
            .registry
            .channel(id)
            .map_err(|_| HubError::NotFound("Agent not found".to_string()))?;
        let guard = SessionGuard::acquire(&self.sessions, self.config.max_sessions).ok_or_else(
            || HubError::TooManyRequests("Too many forwarding sessions".to_string()),
        )?;

        let mut upstream = Request::new(empty());
        *upstream.method_mut() = Method::CONNECT;
        *upstream.uri_mut() = service_target(protocol, service, ctx.remote_addr())
            .parse::<Uri>()
            .map_err(|e| HubError::BadRequest(format!("invalid service name: {}", e)))?;

        let response = tokio::time::timeout(self.config.connect_timeout, channel.send_request(upstream))
            .await
            .map_err(|_| {
                HubError::GatewayTimeout(format!(
                    "endpoint did not accept {}/{} within {:?}",
                    protocol, service, self.config.connect_timeout
                ))
            })??;
        if response.status() != StatusCode::OK {
            return Err(HubError::BadGateway(format!(
                "endpoint refused {}/{} with {}",
                protocol,
                service,
                response.status()
            )));
        }

        let caller = hyper::upgrade::on(req);
        let endpoint = hyper::upgrade::on(response);
        let broker = self.clone();
        let id = id.to_string();
        let label = format!("{}/{}", protocol, service);
        let socket = ctx.caller_socket().cloned();

        tokio::spawn(async move {
            match tokio::try_join!(caller, endpoint) {
                Ok((caller, endpoint)) => {
                    broker
                        .splice(&id, &label, caller, endpoint, socket.as_ref())
                        .await
                }
                Err(e) => debug!(endpoint_id = %id, service = %label, "Service tunnel upgrade failed: {}", e),
            }
            drop(guard);
        });

        Ok(status_response(StatusCode::OK))
    }

    async fn splice(
        &self,
        id: &str,
        label: &str,
        caller: Upgraded,
        endpoint: Upgraded,
        socket: Option<&CallerSocket>,
    ) {
        let mut caller = TokioIo::new(caller);
        let mut endpoint = TokioIo::new(endpoint);
        info!(endpoint_id = %id, service = %label, "Service tunnel opened");

        match tokio::io::copy_bidirectional(&mut caller, &mut endpoint).await {
            Ok((to_endpoint, to_caller)) => {
                self.registry.record_traffic(id, to_endpoint, to_caller);
                info!(
                    endpoint_id = %id,
                    service = %label,
                    sent = to_endpoint,
                    received = to_caller,
                    "Service tunnel closed"
                );
            }
            Err(e) => {
                debug!(endpoint_id = %id, service = %label, "Service tunnel aborted: {}", e);
                // A relay-stream caller is reset when its stream drops; a
                // TCP caller needs an explicit reset to tell this from EOF
                if let Some(socket) = socket {
                    if let Err(e) = socket.reset_on_close() {
                        warn!(endpoint_id = %id, "Failed to reset caller connection: {}", e);
                    }
                }
            }
        }
    }
}
