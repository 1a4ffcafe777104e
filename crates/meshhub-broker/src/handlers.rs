//! Hub status, registration bookkeeping and discovery handlers

use crate::body::{
    empty, full, json_response, query_params, read_body, status_response, BoxError, HubBody,
};
use crate::broker::TunnelBroker;
use crate::context::ConnectionContext;
use crate::error::HubError;
use bytes::Bytes;
use chrono::Utc;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode, Uri};
use hyper::body::Body;
use meshhub_control::{EndpointQuery, RegistryError};
use meshhub_proto::{
    EndpointStats, HubLoad, HubStatus, PingResult, ServiceSpec, StatusReport,
};
use meshhub_relay::RelayChannel;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};

/// Page size of `GET /api/endpoints` when no limit is given
pub const DEFAULT_LIST_LIMIT: usize = 100;

impl TunnelBroker {
    pub(crate) fn hub_status(&self) -> Response<HubBody> {
        let status = HubStatus {
            id: self.config.hub_id.clone(),
            since: self.started_at,
            ports: self.ports(),
            capacity: HubLoad {
                endpoints: self.config.max_endpoints,
                sessions: self.config.max_sessions,
            },
            load: HubLoad {
                endpoints: self.registry.len(),
                sessions: self.active_sessions(),
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        json_response(StatusCode::OK, &status)
    }

    pub(crate) fn hub_log(&self) -> Response<HubBody> {
        json_response(StatusCode::OK, &self.log.entries())
    }

    async fn read_json<B, T>(&self, req: Request<B>) -> Result<T, HubError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
        T: DeserializeOwned,
    {
        let body = read_body(req.into_body(), self.config.max_body_size).await?;
        serde_json::from_slice(&body).map_err(|e| HubError::BadRequest(format!("invalid JSON body: {}", e)))
    }

    /// `POST /api/status` over an endpoint's own channel
    pub(crate) async fn heartbeat<B>(
        &self,
        req: Request<B>,
        ctx: &ConnectionContext,
    ) -> Result<Response<HubBody>, HubError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let endpoint = ctx.endpoint().ok_or(HubError::NoSession)?;
        let report: StatusReport = self.read_json(req).await?;
        self.registry.heartbeat(&endpoint.id, report)?;
        Ok(status_response(StatusCode::CREATED))
    }

    /// `POST /api/services` over an endpoint's own channel
    pub(crate) async fn publish_services<B>(
        &self,
        req: Request<B>,
        ctx: &ConnectionContext,
    ) -> Result<Response<HubBody>, HubError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let endpoint = ctx.endpoint().ok_or(HubError::NoSession)?;
        let services: Vec<ServiceSpec> = self.read_json(req).await?;
        let diff = self.registry.publish_services(&endpoint.id, services)?;

        for service in &diff.added {
            self.log.info(format!(
                "Endpoint {} published service {}/{}",
                endpoint.id, service.protocol, service.name
            ));
        }
        for service in &diff.removed {
            self.log.info(format!(
                "Endpoint {} withdrew service {}/{}",
                endpoint.id, service.protocol, service.name
            ));
        }
        Ok(status_response(StatusCode::CREATED))
    }

    pub(crate) async fn sign_certificate<B>(
        &self,
        req: Request<B>,
        name: &str,
    ) -> Result<Response<HubBody>, HubError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| HubError::Unavailable("no certificate authority configured".to_string()))?;

        let body = read_body(req.into_body(), self.config.max_body_size).await?;
        let public_key = std::str::from_utf8(&body)
            .map_err(|_| HubError::BadRequest("public key must be PEM text".to_string()))?;
        if public_key.trim().is_empty() {
            return Err(HubError::BadRequest("public key is empty".to_string()));
        }

        let certificate = signer.sign(name, public_key).await?;
        self.log.info(format!("Issued certificate for {}", name));

        let mut response = Response::new(full(certificate));
        *response.status_mut() = StatusCode::CREATED;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/x-pem-file"));
        Ok(response)
    }

    pub(crate) fn list_endpoints<B>(&self, req: &Request<B>) -> Result<Response<HubBody>, HubError> {
        let query = endpoint_query(req.uri())?;
        let now = Utc::now();
        let summaries: Vec<_> = self
            .registry
            .list(&query)
            .iter()
            .map(|snapshot| snapshot.summary(now, self.config.online_window))
            .collect();
        Ok(json_response(StatusCode::OK, &summaries))
    }

    pub(crate) fn get_endpoint(&self, id: &str) -> Result<Response<HubBody>, HubError> {
        let snapshot = self
            .registry
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        Ok(json_response(
            StatusCode::OK,
            &snapshot.summary(Utc::now(), self.config.online_window),
        ))
    }

    pub(crate) fn endpoint_services(&self, id: &str) -> Result<Response<HubBody>, HubError> {
        let services = self
            .registry
            .services(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        Ok(json_response(StatusCode::OK, &services))
    }

    pub(crate) fn list_services<B>(&self, req: &Request<B>) -> Response<HubBody> {
        let endpoint = query_params(req.uri()).remove("ep");
        json_response(StatusCode::OK, &self.catalog.entries(endpoint.as_deref()))
    }

    pub(crate) fn service_providers(
        &self,
        protocol: &str,
        name: &str,
    ) -> Result<Response<HubBody>, HubError> {
        let providers = self.catalog.providers(protocol, name);
        if providers.is_empty() {
            return Err(HubError::NotFound("Service not found".to_string()));
        }
        Ok(json_response(StatusCode::OK, &providers))
    }

    pub(crate) fn all_stats(&self) -> Response<HubBody> {
        let stats: Vec<EndpointStats> = self
            .registry
            .list_all()
            .into_iter()
            .map(|s| EndpointStats {
                id: s.id,
                sent: s.bytes_sent,
                received: s.bytes_received,
            })
            .collect();
        json_response(StatusCode::OK, &stats)
    }

    pub(crate) fn endpoint_stats(&self, id: &str) -> Result<Response<HubBody>, HubError> {
        let s = self
            .registry
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        Ok(json_response(
            StatusCode::OK,
            &EndpointStats {
                id: s.id,
                sent: s.bytes_sent,
                received: s.bytes_received,
            },
        ))
    }

    /// `GET /api/ping/endpoints/{ep}`: always 200, failures are reported in the body
    pub(crate) async fn ping_endpoint(&self, id: &str) -> Response<HubBody> {
        let start = Utc::now();
        let error = match self.registry.channel(id) {
            Err(RegistryError::NotFound(_)) => Some("Endpoint not found".to_string()),
            Err(_) => Some("Active session not found".to_string()),
            Ok(channel) => match self.ping_channel(&channel).await {
                Ok(rtt) => {
                    self.registry.record_ping(id, Some(rtt));
                    None
                }
                Err(e) => Some(e),
            },
        };

        let result = PingResult {
            hub: self.config.hub_id.clone(),
            start: start.timestamp_millis(),
            end: Utc::now().timestamp_millis(),
            error,
        };
        json_response(StatusCode::OK, &[result])
    }

    /// Round trip of `GET /api/ping` through `channel`
    pub(crate) async fn ping_channel(&self, channel: &RelayChannel) -> Result<Duration, String> {
        let mut req = Request::new(empty());
        *req.uri_mut() = Uri::from_static("/api/ping");

        let started = Instant::now();
        match tokio::time::timeout(self.config.ping_timeout, channel.send_request(req)).await {
            Err(_) => Err("Response timeout".to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Ok(Ok(response)) if response.status().is_success() => Ok(started.elapsed()),
            Ok(Ok(response)) => Err(format!("Endpoint answered ping with {}", response.status())),
        }
    }
}

fn endpoint_query(uri: &Uri) -> Result<EndpointQuery, HubError> {
    let mut params = query_params(uri);
    let number = |value: Option<String>, name: &str| -> Result<Option<usize>, HubError> {
        value
            .map(|v| {
                v.parse::<usize>()
                    .map_err(|_| HubError::BadRequest(format!("invalid {} '{}'", name, v)))
            })
            .transpose()
    };

    Ok(EndpointQuery {
        id: params.remove("id"),
        name: params.remove("name"),
        keyword: params.remove("keyword").filter(|k| !k.is_empty()),
        offset: number(params.remove("offset"), "offset")?.unwrap_or(0),
        limit: Some(number(params.remove("limit"), "limit")?.unwrap_or(DEFAULT_LIST_LIMIT)),
    })
}
