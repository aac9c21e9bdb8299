//! Request middleware
//!
//! Host validation, content-type enforcement, bearer authentication, node
//! identity for cluster routes and the route deadline.

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use super::response::ApiError;
use super::AppState;
use crate::cluster::NODE_HEADER;
use crate::error::Error;

/// Advertised address of the peer that sent a cluster request
#[derive(Debug, Clone)]
pub struct PeerAddress(pub String);

/// Reject requests whose Host header is not in `api.allowed_hosts`
pub async fn validate_host(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let allowed = &state.cluster.config().api.allowed_hosts;
    if allowed.is_empty() {
        return next.run(request).await;
    }

    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    let hostname = host.rsplit_once(':').map(|(name, _)| name).unwrap_or(host);

    if allowed.iter().any(|a| a == host || a == hostname) {
        next.run(request).await
    } else {
        ApiError(Error::BadRequest(format!("host {:?} is not allowed", host))).into_response()
    }
}

fn content_type(request: &Request) -> &str {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// Whether the request announces a body
pub(crate) fn has_body(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return true;
    }
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|len| len > 0)
        .unwrap_or(false)
}

/// Requests carrying a body must be JSON
pub async fn require_json(request: Request, next: Next) -> Response {
    if has_body(request.headers()) && !content_type(&request).starts_with("application/json") {
        return ApiError(Error::UnsupportedMediaType("application/json")).into_response();
    }
    next.run(request).await
}

/// Stream routes take raw frames
pub async fn require_stream(request: Request, next: Next) -> Response {
    if !content_type(&request).starts_with("application/octet-stream") {
        return ApiError(Error::UnsupportedMediaType("application/octet-stream")).into_response();
    }
    next.run(request).await
}

/// Resolve the bearer token into an `Authorizer` extension
pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match state.authenticator.authenticate(header) {
        Ok(authorizer) => {
            request.extensions_mut().insert(authorizer);
            next.run(request).await
        }
        Err(e) => ApiError(e).into_response(),
    }
}

/// Cluster routes require a valid node identity header
pub async fn node_identity(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let opened = request
        .headers()
        .get(NODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Unauthorized("missing node identity".into()))
        .and_then(|h| state.cluster.identity().open(h));

    match opened {
        Ok(address) => {
            request.extensions_mut().insert(PeerAddress(address));
            next.run(request).await
        }
        Err(e) => ApiError(e).into_response(),
    }
}

/// Fail buffered routes that run past `api.route_timeout_ms`
pub async fn route_deadline(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let deadline = state.cluster.config().route_timeout();
    match tokio::time::timeout(deadline, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!("Request exceeded the {:?} route deadline", deadline);
            ApiError(Error::Timeout).into_response()
        }
    }
}
