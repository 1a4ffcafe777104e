//! Tunnel broker
//!
//! Accepts endpoint registration tunnels, serves the logical streams that
//! arrive over them, and answers every request of the hub HTTP surface.
//! Plain hub connections and relay streams share one dispatch path; the
//! only difference is the [`ConnectionContext`] a request carries.

use crate::body::{BoxError, HubBody};
use crate::config::HubConfig;
use crate::context::ConnectionContext;
use crate::error::HubError;
use crate::routes::{hub_routes, HubRoute};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use http::{Request, Response};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use meshhub_control::{CertificateSigner, EndpointRegistry, HubLog, Origin, ServiceCatalog};
use meshhub_relay::{RelayChannel, RelayStream, Role};
use meshhub_router::{RouteParams, RouteTable};
use std::any::Any;
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, warn};

pub struct TunnelBroker {
    pub(crate) config: Arc<HubConfig>,
    routes: RouteTable<HubRoute>,
    pub(crate) registry: Arc<EndpointRegistry>,
    pub(crate) catalog: ServiceCatalog,
    pub(crate) signer: Option<Arc<dyn CertificateSigner>>,
    pub(crate) log: Arc<HubLog>,
    pub(crate) sessions: Arc<AtomicUsize>,
    pub(crate) started_at: DateTime<Utc>,
    ports: Mutex<BTreeSet<String>>,
}

impl TunnelBroker {
    pub fn new(
        config: Arc<HubConfig>,
        registry: Arc<EndpointRegistry>,
        log: Arc<HubLog>,
        signer: Option<Arc<dyn CertificateSigner>>,
    ) -> Result<Self, HubError> {
        let routes = hub_routes().map_err(|e| HubError::Config(format!("invalid route: {}", e)))?;
        let ports = config.names.iter().cloned().collect();

        Ok(Self {
            catalog: ServiceCatalog::new(registry.clone()),
            config,
            routes,
            registry,
            signer,
            log,
            sessions: Arc::new(AtomicUsize::new(0)),
            started_at: Utc::now(),
            ports: Mutex::new(ports),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    pub fn log(&self) -> &Arc<HubLog> {
        &self.log
    }

    /// Service tunnels currently spliced
    pub fn active_sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Record an address the hub accepts connections on
    pub fn add_port(&self, addr: SocketAddr) {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr.to_string());
    }

    pub(crate) fn ports(&self) -> Vec<String> {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Answer one request.
    ///
    /// Never fails: errors become structured JSON responses and a panicking
    /// handler becomes a 500 without taking the connection task down.
    pub async fn handle<B>(self: &Arc<Self>, req: Request<B>, ctx: ConnectionContext) -> Response<HubBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let response = catch_handler_panic(self.dispatch(req, ctx)).await;
        debug!(%method, %path, status = %response.status(), "Request handled");
        response
    }

    async fn dispatch<B>(
        self: &Arc<Self>,
        req: Request<B>,
        ctx: ConnectionContext,
    ) -> Result<Response<HubBody>, HubError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (route, params) = {
            let matched = self.routes.resolve(req.method(), req.uri().path())?;
            (*matched.handler, matched.params)
        };

        match route {
            HubRoute::HubStatus => Ok(self.hub_status()),
            HubRoute::Heartbeat => self.heartbeat(req, &ctx).await,
            HubRoute::HubLog => Ok(self.hub_log()),
            HubRoute::SignCertificate => self.sign_certificate(req, param(&params, "name")?).await,
            HubRoute::ListEndpoints => self.list_endpoints(&req),
            HubRoute::GetEndpoint => self.get_endpoint(param(&params, "ep")?),
            HubRoute::RegisterEndpoint => self.register_endpoint(req, &ctx, param(&params, "ep")?),
            HubRoute::EndpointServices => self.endpoint_services(param(&params, "ep")?),
            HubRoute::ConnectService => {
                self.connect_service(
                    req,
                    &ctx,
                    param(&params, "ep")?,
                    param(&params, "proto")?,
                    param(&params, "svc")?,
                )
                .await
            }
            HubRoute::ListServices => Ok(self.list_services(&req)),
            HubRoute::PublishServices => self.publish_services(req, &ctx).await,
            HubRoute::ServiceProviders => {
                self.service_providers(param(&params, "proto")?, param(&params, "svc")?)
            }
            HubRoute::AllStats => Ok(self.all_stats()),
            HubRoute::EndpointStats => self.endpoint_stats(param(&params, "ep")?),
            HubRoute::PingEndpoint => Ok(self.ping_endpoint(param(&params, "ep")?).await),
            HubRoute::Forward => {
                let rest = params.rest().unwrap_or_default();
                self.forward(req, param(&params, "ep")?, rest).await
            }
        }
    }

    /// Accept an endpoint registration tunnel.
    ///
    /// Replies 200; once hyper hands over the upgraded connection the
    /// tunnel becomes the endpoint's relay channel.
    fn register_endpoint<B>(
        self: &Arc<Self>,
        req: Request<B>,
        ctx: &ConnectionContext,
        id: &str,
    ) -> Result<Response<HubBody>, HubError> {
        if !self.registry.has_room_for(id) {
            self.log.warn(format!(
                "Endpoint {} from {} refused: too many endpoints",
                id,
                ctx.remote_addr()
            ));
            return Err(HubError::TooManyRequests("Too many endpoints".to_string()));
        }

        let name = crate::body::query_params(req.uri()).remove("name");
        let on_upgrade = hyper::upgrade::on(req);
        let broker = self.clone();
        let origin = ctx.origin();
        let id = id.to_string();

        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => broker.run_endpoint_tunnel(id, name, origin, upgraded).await,
                Err(e) => warn!(endpoint_id = %id, "Endpoint tunnel upgrade failed: {}", e),
            }
        });

        Ok(crate::body::status_response(http::StatusCode::OK))
    }

    async fn run_endpoint_tunnel(
        self: Arc<Self>,
        id: String,
        name: Option<String>,
        origin: Origin,
        upgraded: Upgraded,
    ) {
        let channel = RelayChannel::new(
            TokioIo::new(upgraded),
            Role::Server,
            self.config.relay.clone(),
        );
        self.attach_channel(&id, name.as_deref(), &origin, channel).await;
    }

    /// Bind `channel` to endpoint `id` and serve its streams until it closes
    pub async fn attach_channel(
        self: &Arc<Self>,
        id: &str,
        name: Option<&str>,
        origin: &Origin,
        channel: RelayChannel,
    ) {
        // Authoritative limit check; the one in register_endpoint can race
        let outcome = match self.registry.bind_channel(id, origin, name, channel.clone()) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.log.warn(format!(
                    "Endpoint {} from {} refused: {}",
                    id, origin.remote_addr, e
                ));
                channel.close("too many endpoints");
                return;
            }
        };
        if outcome.superseded.is_some() {
            self.log.info(format!(
                "Endpoint {} reconnected from {}",
                id, origin.remote_addr
            ));
        } else {
            self.log
                .info(format!("Endpoint {} joined from {}", id, origin.remote_addr));
        }

        // Streams are admitted only after the channel is bound
        let ctx = ConnectionContext::for_endpoint(origin, id, channel.clone());
        while let Some(stream) = channel.accept_stream().await {
            let broker = self.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { broker.serve_relay_stream(stream, ctx).await });
        }

        let reason = channel.closed().await;
        if self.registry.release_channel(id, channel.id()) {
            self.log.info(format!("Endpoint {} left: {}", id, reason));
        } else {
            debug!(endpoint_id = %id, channel_id = %channel.id(), "Superseded tunnel closed: {}", reason);
        }
    }

    /// Serve the single HTTP exchange carried by a relay stream
    async fn serve_relay_stream(self: Arc<Self>, stream: RelayStream, ctx: ConnectionContext) {
        let stream_id = stream.id();
        let endpoint_id = ctx.endpoint().map(|e| e.id.clone()).unwrap_or_default();

        let broker = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let broker = broker.clone();
            let ctx = ctx.clone();
            async move { Ok::<_, Infallible>(broker.handle(req, ctx).await) }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            debug!(%endpoint_id, "Relay stream {} ended: {}", stream_id, e);
        }
    }
}

fn param<'a>(params: &'a RouteParams, name: &str) -> Result<&'a str, HubError> {
    params
        .get(name)
        .ok_or_else(|| HubError::Internal(format!("route parameter '{}' missing", name)))
}

/// Run a handler, turning its error or panic into a response
pub(crate) async fn catch_handler_panic<F>(handler: F) -> Response<HubBody>
where
    F: Future<Output = Result<Response<HubBody>, HubError>>,
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            debug!(status = %err.status(), "Request failed: {}", err);
            err.into_response()
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("Request handler panicked: {}", message);
            HubError::HandlerPanic(message).into_response()
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
