//! The hub route table

use http::Method;
use meshhub_router::{PatternError, RouteTable};

/// Handlers of the hub HTTP surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubRoute {
    HubStatus,
    Heartbeat,
    HubLog,
    SignCertificate,
    ListEndpoints,
    GetEndpoint,
    RegisterEndpoint,
    EndpointServices,
    ConnectService,
    ListServices,
    PublishServices,
    ServiceProviders,
    AllStats,
    EndpointStats,
    PingEndpoint,
    Forward,
}

/// Build the route table. Order matters: the first matching pattern wins.
pub fn hub_routes() -> Result<RouteTable<HubRoute>, PatternError> {
    Ok(RouteTable::builder()
        .route(
            "/api/status",
            [(Method::GET, HubRoute::HubStatus), (Method::POST, HubRoute::Heartbeat)],
        )?
        .route("/api/log", [(Method::GET, HubRoute::HubLog)])?
        .route("/api/sign/{name}", [(Method::POST, HubRoute::SignCertificate)])?
        .route("/api/endpoints", [(Method::GET, HubRoute::ListEndpoints)])?
        .route(
            "/api/endpoints/{ep}",
            [
                (Method::GET, HubRoute::GetEndpoint),
                (Method::CONNECT, HubRoute::RegisterEndpoint),
            ],
        )?
        .route("/api/endpoints/{ep}/services", [(Method::GET, HubRoute::EndpointServices)])?
        .route(
            "/api/endpoints/{ep}/services/{proto}/{svc}",
            [(Method::CONNECT, HubRoute::ConnectService)],
        )?
        .route(
            "/api/services",
            [(Method::GET, HubRoute::ListServices), (Method::POST, HubRoute::PublishServices)],
        )?
        .route("/api/services/{proto}/{svc}", [(Method::GET, HubRoute::ServiceProviders)])?
        .route("/api/stats/endpoints", [(Method::GET, HubRoute::AllStats)])?
        .route("/api/stats/endpoints/{ep}", [(Method::GET, HubRoute::EndpointStats)])?
        .route("/api/ping/endpoints/{ep}", [(Method::GET, HubRoute::PingEndpoint)])?
        .route(
            "/api/forward/{ep}/*",
            [
                (Method::GET, HubRoute::Forward),
                (Method::POST, HubRoute::Forward),
                (Method::DELETE, HubRoute::Forward),
            ],
        )?
        .build())
}
