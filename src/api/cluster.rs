//! Cluster routes

use axum::body::Body;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use serde_json::json;
use std::sync::Arc;

use super::extract::JsonBody;
use super::middleware::PeerAddress;
use super::response::{ApiError, ApiResult, Success};
use super::AppState;
use crate::cluster::{ClusterStatus, ElectionProposal, ElectionResponse, JoinRequest, MembershipSummary};
use crate::error::Error;
use crate::messenger::MessageHandler;

/// `POST /v1/cluster/election`
pub async fn election(
    State(state): State<Arc<AppState>>,
    JsonBody(proposal): JsonBody<ElectionProposal>,
) -> ApiResult<ElectionResponse> {
    Ok(Success(state.cluster.election().propose(proposal).await))
}

/// `POST /v1/cluster/members`
pub async fn join(
    State(state): State<Arc<AppState>>,
    Extension(peer): Extension<PeerAddress>,
    JsonBody(request): JsonBody<JoinRequest>,
) -> ApiResult<MembershipSummary> {
    if peer.0 != request.address {
        return Err(Error::Unauthorized(format!(
            "node identity {} cannot join as {}",
            peer.0, request.address
        ))
        .into());
    }
    Ok(Success(state.cluster.admit(&request).await))
}

/// `DELETE /v1/cluster/members/:address`
pub async fn leave(
    State(state): State<Arc<AppState>>,
    Extension(peer): Extension<PeerAddress>,
    Path(address): Path<String>,
) -> ApiResult<serde_json::Value> {
    if peer.0 != address {
        return Err(Error::Unauthorized(format!(
            "node identity {} cannot remove {}",
            peer.0, address
        ))
        .into());
    }
    if !state.cluster.membership().contains(&address).await {
        return Err(Error::Unauthorized(format!("{} is not a member", address)).into());
    }
    state.cluster.release(&address).await?;
    Ok(Success(json!({ "address": address })))
}

/// `GET /v1/cluster/status`
pub async fn status(State(state): State<Arc<AppState>>) -> ApiResult<ClusterStatus> {
    Ok(Success(state.cluster.status().await))
}

/// `POST /v1/cluster/primary`: query stream, served by the primary only
pub async fn primary_stream(
    State(state): State<Arc<AppState>>,
    Extension(peer): Extension<PeerAddress>,
    body: Body,
) -> Response {
    if !state.cluster.is_primary().await {
        return ApiError(Error::Forbidden("this node is not the primary".into())).into_response();
    }
    serve(&state, peer, body)
}

/// `POST /v1/cluster/connection`: control stream
pub async fn connection_stream(
    State(state): State<Arc<AppState>>,
    Extension(peer): Extension<PeerAddress>,
    body: Body,
) -> Response {
    serve(&state, peer, body)
}

fn serve(state: &AppState, peer: PeerAddress, body: Body) -> Response {
    let handler: Arc<dyn MessageHandler> = state.cluster.clone();
    state
        .cluster
        .messenger()
        .serve_connection(handler, peer.0, body)
}
