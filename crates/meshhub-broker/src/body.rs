//! Response bodies and small HTTP helpers shared by the handlers

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, TRANSFER_ENCODING, UPGRADE};
use http::{Response, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, Limited};
use hyper::body::Body;
use serde::Serialize;
use std::collections::HashMap;

use crate::error::HubError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the hub produces
pub type HubBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn empty() -> HubBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full(data: impl Into<Bytes>) -> HubBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Box a streaming body, e.g. a response relayed from an endpoint
pub fn boxed<B>(body: B) -> HubBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

pub fn status_response(status: StatusCode) -> Response<HubBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = status;
    response
}

pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<HubBody> {
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            let mut response = Response::new(full(bytes));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => HubError::Internal(format!("failed to encode response: {}", e)).into_response(),
    }
}

/// Read a request body, refusing anything larger than `limit` bytes
pub async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, HubError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    Limited::new(body, limit)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| HubError::BadRequest(format!("failed to read request body: {}", e)))
}

/// Decoded query parameters; the last occurrence of a key wins
pub fn query_params(uri: &Uri) -> HashMap<String, String> {
    uri.query()
        .map(|query| url::form_urlencoded::parse(query.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

/// Remove connection-scoped headers before relaying a message
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by `Connection` are hop-by-hop too
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }

    headers.remove(CONNECTION);
    headers.remove(TRANSFER_ENCODING);
    headers.remove(UPGRADE);
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_params_decoded() {
        let uri: Uri = "/api/endpoints?keyword=my%20box&limit=5&limit=7".parse().unwrap();
        let params = query_params(&uri);
        assert_eq!(params.get("keyword").map(String::as_str), Some("my box"));
        assert_eq!(params.get("limit").map(String::as_str), Some("7"));

        let bare: Uri = "/api/endpoints".parse().unwrap();
        assert!(query_params(&bare).is_empty());
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close, x-trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(CONTENT_TYPE));
    }

    #[tokio::test]
    async fn test_read_body_limit() {
        let body = Full::new(Bytes::from_static(b"0123456789"));
        assert!(matches!(
            read_body(body, 4).await,
            Err(HubError::BadRequest(_))
        ));

        let body = Full::new(Bytes::from_static(b"0123"));
        assert_eq!(read_body(body, 4).await.unwrap(), Bytes::from_static(b"0123"));
    }
}
