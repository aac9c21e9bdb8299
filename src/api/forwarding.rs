//! Forwarding Gateway
//!
//! Write-class routes only run on the primary. Anywhere else the request is
//! relayed to the primary as is and its answer is streamed back.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::middleware;
use super::response::ApiError;
use super::AppState;
use crate::cluster::Cluster;
use crate::error::{Error, Result};

/// Set on relayed requests to the address of the relaying node
pub const FORWARDED_HEADER: &str = "x-litebase-forwarded-by";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Where a write-class request should run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayDecision {
    ContinueLocally,
    Forward(String),
    Unavailable,
}

/// Decide from the local view of the cluster
pub async fn decide(cluster: &Cluster) -> GatewayDecision {
    if cluster.is_primary().await {
        return GatewayDecision::ContinueLocally;
    }
    match cluster.primary_address().await {
        Some(primary) if primary == cluster.address() => GatewayDecision::ContinueLocally,
        Some(primary) => GatewayDecision::Forward(primary),
        None => GatewayDecision::Unavailable,
    }
}

/// Whole-request timeout for a relay
///
/// Streamed bodies are bounded by the route deadline of the primary, not by
/// a fixed transfer time.
fn relay_timeout(streamed: bool, forward_timeout: Duration) -> Option<Duration> {
    (!streamed).then_some(forward_timeout)
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Middleware for routes whose non-GET methods must run on the primary
pub async fn forward_to_primary(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if matches!(*request.method(), Method::GET | Method::HEAD) {
        return next.run(request).await;
    }

    match decide(&state.cluster).await {
        GatewayDecision::ContinueLocally => next.run(request).await,
        GatewayDecision::Unavailable => ApiError(Error::NoPrimary).into_response(),
        GatewayDecision::Forward(primary) => {
            if let Some(from) = request.headers().get(FORWARDED_HEADER) {
                tracing::warn!(
                    "Refusing request already forwarded by {:?}; primary is {}",
                    from,
                    primary
                );
                return ApiError(Error::NotPrimary(primary)).into_response();
            }

            match relay(&state, &primary, request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!("Forwarding to primary {} failed: {}", primary, e);
                    let error = match e {
                        Error::ConnectionFailed { .. } | Error::ConnectionTimeout(_) => e,
                        other => Error::ConnectionFailed {
                            address: primary.clone(),
                            reason: other.to_string(),
                        },
                    };
                    ApiError(error).into_response()
                }
            }
        }
    }
}

async fn relay(state: &AppState, primary: &str, request: Request) -> Result<Response> {
    let streamed = middleware::has_body(request.headers());
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let url = format!("http://{}{}", primary, path);

    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .map_err(|e| Error::BadRequest(format!("unsupported method: {}", e)))?;

    let mut builder = state
        .client
        .request(method, &url)
        .header(FORWARDED_HEADER, state.cluster.address());
    if let Some(timeout) = relay_timeout(streamed, state.cluster.config().forward_timeout()) {
        builder = builder.timeout(timeout);
    }
    for (name, value) in parts.headers.iter() {
        if is_hop_by_hop(name.as_str()) || name.as_str() == FORWARDED_HEADER {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    if streamed {
        // axum bodies are not Sync, so they are pumped through a channel
        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(16);
        tokio::spawn(async move {
            let mut stream = body.into_data_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(std::io::Error::other);
                let failed = chunk.is_err();
                if tx.send(chunk).await.is_err() || failed {
                    break;
                }
            }
        });
        builder = builder.body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)));
    }

    tracing::debug!("Forwarding {} {} to primary {}", parts.method, path, primary);
    let upstream = builder
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                Error::ConnectionTimeout(primary.to_string())
            } else {
                Error::ConnectionFailed {
                    address: primary.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .map_err(|e| Error::Network(format!("invalid status from primary: {}", e)))?;

    let mut response = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response = response.header(name, value);
        }
    }

    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| Error::Internal(format!("failed to build response: {}", e)))
}
