//! axum middleware adapter.
//!
//! The request path is the method identifier (`/pkg.Service/Method` for gRPC over
//! HTTP/2) and headers are call metadata. JSON bodies are buffered and bound as
//! `request`; gRPC and websocket calls are authorized as streams, so their bodies
//! are never read. Any other body is passed through unread with `request` null.
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/example.ExampleService/RequestMatch", post(handler))
//!     .layer(axum::middleware::from_fn_with_state(Arc::new(HttpAuthorizer::new(interceptor)), authorize_http));
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::debug;

use crate::context::Metadata;
use crate::error::AuthzError;
use crate::identity::CallInfo;
use crate::interceptor::Interceptor;

pub const DEFAULT_MAX_BODY_BYTES: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct HttpAuthorizer {
    pub interceptor: Interceptor,
    pub max_body_bytes: usize,
}

impl HttpAuthorizer {
    pub fn new(interceptor: Interceptor) -> Self {
        Self { interceptor, max_body_bytes: DEFAULT_MAX_BODY_BYTES }
    }

    pub fn with_max_body_bytes(mut self, n: usize) -> Self {
        self.max_body_bytes = n;
        self
    }
}

pub async fn authorize_http(State(authz): State<Arc<HttpAuthorizer>>, request: Request, next: Next) -> Response {
    let headers = request.headers();
    let grpc = is_grpc(headers);
    let is_stream = grpc || is_websocket(headers);
    let deadline = headers
        .get("grpc-timeout")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_grpc_timeout)
        .map(|d| Instant::now() + d);
    let call = CallInfo::new(request.uri().path(), header_metadata(headers)).with_deadline(deadline);

    let (request, payload) = if !is_stream && is_json(request.headers()) {
        let (parts, body) = request.into_parts();
        let bytes = match axum::body::to_bytes(body, authz.max_body_bytes).await {
            Ok(b) => b,
            Err(e) => {
                debug!(target: "authz", "cannot buffer body for {}: {}", call.method, e);
                return (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    Json(serde_json::json!({"status":"error","error": e.to_string()})),
                )
                    .into_response();
            }
        };
        let payload = if bytes.is_empty() {
            None
        } else {
            match serde_json::from_slice(&bytes) {
                Ok(v) => Some(v),
                Err(e) => {
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(serde_json::json!({"status":"error","error": format!("invalid json body: {}", e)})),
                    )
                        .into_response();
                }
            }
        };
        (Request::from_parts(parts, Body::from(bytes)), payload)
    } else {
        (request, None)
    };

    match authz.interceptor.enforce(&call, payload, is_stream) {
        Ok(_) => next.run(request).await,
        Err(e) => error_response(&e, grpc),
    }
}

fn error_response(e: &AuthzError, grpc: bool) -> Response {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let label = if e.is_denial() { "forbidden" } else { "error" };
    let mut resp = (
        status,
        Json(serde_json::json!({"status": label, "code": e.code_str(), "error": e.to_string()})),
    )
        .into_response();
    if grpc {
        let h = resp.headers_mut();
        h.insert("grpc-status", HeaderValue::from(e.grpc_code()));
        if let Ok(msg) = HeaderValue::from_str(&e.to_string()) {
            h.insert("grpc-message", msg);
        }
    }
    resp
}

/// Every header becomes metadata; values that are not visible ASCII are skipped.
pub fn header_metadata(headers: &HeaderMap) -> Metadata {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect()
}

fn content_type(headers: &HeaderMap) -> &str {
    headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or("")
}

fn is_grpc(headers: &HeaderMap) -> bool {
    content_type(headers).starts_with("application/grpc")
}

fn is_json(headers: &HeaderMap) -> bool {
    let ct = content_type(headers);
    ct.starts_with("application/json") || ct.ends_with("+json")
}

fn is_websocket(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// `grpc-timeout` is up to eight digits followed by a unit: H M S m u n.
pub fn parse_grpc_timeout(v: &str) -> Option<Duration> {
    let v = v.trim();
    if v.len() < 2 || v.len() > 9 {
        return None;
    }
    let (digits, unit) = v.split_at(v.len() - 1);
    let n: u64 = digits.parse().ok()?;
    Some(match unit {
        "H" => Duration::from_secs(n * 3600),
        "M" => Duration::from_secs(n * 60),
        "S" => Duration::from_secs(n),
        "m" => Duration::from_millis(n),
        "u" => Duration::from_micros(n),
        "n" => Duration::from_nanos(n),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grpc_timeout_units() {
        assert_eq!(parse_grpc_timeout("100m"), Some(Duration::from_millis(100)));
        assert_eq!(parse_grpc_timeout("2S"), Some(Duration::from_secs(2)));
        assert_eq!(parse_grpc_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_grpc_timeout("5x"), None);
        assert_eq!(parse_grpc_timeout("m"), None);
        assert_eq!(parse_grpc_timeout("123456789S"), None);
    }

    #[test]
    fn headers_become_metadata() {
        let mut h = HeaderMap::new();
        h.append("x-account-id", HeaderValue::from_static("a"));
        h.append("x-account-id", HeaderValue::from_static("b"));
        let md = header_metadata(&h);
        assert_eq!(md.normalized()["x-account-id"], "a,b");
    }

    #[test]
    fn stream_detection() {
        let mut h = HeaderMap::new();
        h.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/grpc+proto"));
        assert!(is_grpc(&h));
        let mut h = HeaderMap::new();
        h.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket(&h));
    }
}
