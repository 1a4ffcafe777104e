//! Hub errors and their HTTP representation

use crate::body::{json_response, HubBody};
use http::header::{HeaderValue, ALLOW};
use http::{Method, Response, StatusCode};
use meshhub_control::{RegistryError, SignerError};
use meshhub_proto::ErrorResponse;
use meshhub_relay::RelayError;
use meshhub_router::RouteError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("{0}")]
    NotFound(String),

    #[error("Method {method} not allowed")]
    MethodNotAllowed { method: Method, allowed: Vec<Method> },

    #[error("No agent session established yet")]
    NoSession,

    #[error("Peer gone: {0}")]
    PeerGone(String),

    #[error("Bad gateway: {0}")]
    BadGateway(String),

    #[error("Gateway timeout: {0}")]
    GatewayTimeout(String),

    #[error("{0}")]
    TooManyRequests(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Handler panicked: {0}")]
    HandlerPanic(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

impl HubError {
    pub fn status(&self) -> StatusCode {
        match self {
            HubError::NotFound(_) | HubError::NoSession => StatusCode::NOT_FOUND,
            HubError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            HubError::PeerGone(_) | HubError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            HubError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            HubError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            HubError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HubError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            HubError::HandlerPanic(_)
            | HubError::Internal(_)
            | HubError::Config(_)
            | HubError::Tls(_)
            | HubError::Io(_)
            | HubError::BindError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            HubError::NotFound(_) => "NOT_FOUND",
            HubError::MethodNotAllowed { .. } => "METHOD_NOT_ALLOWED",
            HubError::NoSession => "NO_SESSION",
            HubError::PeerGone(_) => "PEER_GONE",
            HubError::BadGateway(_) => "BAD_GATEWAY",
            HubError::GatewayTimeout(_) => "GATEWAY_TIMEOUT",
            HubError::TooManyRequests(_) => "TOO_MANY_REQUESTS",
            HubError::BadRequest(_) => "BAD_REQUEST",
            HubError::Unavailable(_) => "UNAVAILABLE",
            HubError::HandlerPanic(_) => "HANDLER_PANIC",
            _ => "INTERNAL_ERROR",
        }
    }

    /// JSON `ErrorResponse` with the matching status
    pub fn into_response(self) -> Response<HubBody> {
        let status = self.status();
        let body = ErrorResponse {
            error: self.to_string(),
            code: Some(self.code().to_string()),
        };
        let mut response = json_response(status, &body);

        if let HubError::MethodNotAllowed { allowed, .. } = &self {
            let allow = allowed
                .iter()
                .map(Method::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            if let Ok(value) = HeaderValue::from_str(&allow) {
                response.headers_mut().insert(ALLOW, value);
            }
        }
        response
    }
}

impl From<RouteError> for HubError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::NotFound(_) => HubError::NotFound("Not found".to_string()),
            RouteError::MethodNotAllowed {
                method, allowed, ..
            } => HubError::MethodNotAllowed { method, allowed },
            RouteError::InvalidParameter { name, .. } => {
                HubError::BadRequest(format!("parameter '{}' is not valid UTF-8", name))
            }
        }
    }
}

impl From<RegistryError> for HubError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => HubError::NotFound("Endpoint not found".to_string()),
            RegistryError::NoSession(_) => HubError::NoSession,
            RegistryError::NoChannel(_) => HubError::NotFound("Agent not found".to_string()),
            RegistryError::CapacityReached(_) => {
                HubError::TooManyRequests("Too many endpoints".to_string())
            }
        }
    }
}

impl From<RelayError> for HubError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::PeerGone(reason) => HubError::PeerGone(reason),
            other => HubError::BadGateway(other.to_string()),
        }
    }
}

impl From<SignerError> for HubError {
    fn from(err: SignerError) -> Self {
        HubError::BadGateway(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response<HubBody>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_not_found_body() {
        let response = HubError::NotFound("Endpoint not found".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Endpoint not found");
        assert_eq!(json["code"], "NOT_FOUND");
    }

    #[test]
    fn test_method_not_allowed_sets_allow() {
        let err: HubError = RouteError::MethodNotAllowed {
            method: Method::DELETE,
            path: "/api/endpoints/e1".to_string(),
            allowed: vec![Method::GET, Method::CONNECT],
        }
        .into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "GET, CONNECT");
    }

    #[test]
    fn test_conversions() {
        assert_eq!(
            HubError::from(RegistryError::NoSession("e1".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            HubError::from(RegistryError::NoChannel("e1".into())).to_string(),
            "Agent not found"
        );
        assert!(matches!(
            HubError::from(RelayError::PeerGone("tunnel closed".into())),
            HubError::PeerGone(_)
        ));
        assert_eq!(
            HubError::from(RelayError::StreamReset).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            HubError::from(RegistryError::CapacityReached(2)).to_string(),
            "Too many endpoints"
        );
        let invalid = HubError::from(RouteError::InvalidParameter {
            name: "ep".to_string(),
            path: "/api/endpoints/%FF".to_string(),
        });
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            HubError::GatewayTimeout("no answer".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
