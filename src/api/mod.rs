//! HTTP API
//!
//! Cluster routes used between nodes and branch routes used by clients,
//! behind host validation, content-type checks, authentication and the
//! forwarding gateway.

pub mod auth;
mod cluster;
mod databases;
mod extract;
pub mod forwarding;
pub mod middleware;
pub mod response;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use auth::{Authorizer, RequestAuthenticator};
pub use forwarding::{decide, GatewayDecision, FORWARDED_HEADER};
pub use response::{ApiError, ApiResult, Success};

use crate::backup::BackupEngine;
use crate::cluster::Cluster;
use crate::database::DatabaseManager;
use crate::error::{Error, Result};
use crate::restore::RestoreEngine;

/// Shared application state
pub struct AppState {
    pub cluster: Arc<Cluster>,
    pub databases: Arc<DatabaseManager>,
    pub backups: Arc<BackupEngine>,
    pub restores: Arc<RestoreEngine>,
    pub authenticator: RequestAuthenticator,
    /// Client used by the forwarding gateway
    pub client: reqwest::Client,
}

impl AppState {
    pub fn new(
        cluster: Arc<Cluster>,
        databases: Arc<DatabaseManager>,
        backups: Arc<BackupEngine>,
        restores: Arc<RestoreEngine>,
    ) -> Arc<Self> {
        let authenticator = RequestAuthenticator::new(&cluster.config().auth);
        Arc::new(Self {
            cluster,
            databases,
            backups,
            restores,
            authenticator,
            client: reqwest::Client::new(),
        })
    }
}

/// Build the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let streams = Router::new()
        .route("/v1/cluster/primary", post(cluster::primary_stream))
        .route("/v1/cluster/connection", post(cluster::connection_stream))
        .route_layer(from_fn(middleware::require_stream))
        .route_layer(from_fn_with_state(state.clone(), middleware::node_identity));

    let peers = Router::new()
        .route("/v1/cluster/election", post(cluster::election))
        .route("/v1/cluster/members", post(cluster::join))
        .route("/v1/cluster/members/:address", delete(cluster::leave))
        .route_layer(from_fn_with_state(state.clone(), middleware::node_identity));

    let writes = Router::new()
        .route(
            "/v1/databases/:database/:branch/backups",
            get(databases::list_backups).post(databases::create_backup),
        )
        .route(
            "/v1/databases/:database/:branch/backups/:timestamp",
            get(databases::get_backup).delete(databases::delete_backup),
        )
        .route(
            "/v1/databases/:database/:branch/restore",
            post(databases::restore),
        )
        .route_layer(from_fn_with_state(
            state.clone(),
            forwarding::forward_to_primary,
        ));

    let clients = Router::new()
        .route(
            "/v1/databases/:database/:branch/snapshots",
            get(databases::list_snapshots),
        )
        .route(
            "/v1/databases/:database/:branch/snapshots/:timestamp",
            get(databases::get_snapshot),
        )
        .route(
            "/v1/databases/:database/:branch/query",
            post(databases::query),
        )
        .route("/v1/cluster/status", get(cluster::status))
        .merge(writes)
        .route_layer(from_fn_with_state(state.clone(), middleware::authenticate));

    let buffered = peers
        .merge(clients)
        .route_layer(from_fn(middleware::require_json))
        .route_layer(from_fn_with_state(state.clone(), middleware::route_deadline));

    let mut router = buffered
        .merge(streams)
        .layer(from_fn_with_state(state.clone(), middleware::validate_host))
        .layer(TraceLayer::new_for_http());

    if state.cluster.config().api.cors_enabled {
        router = router.layer(CorsLayer::permissive());
    }

    router.with_state(state)
}

/// HTTP API server
pub struct ApiServer {
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Serve on an already bound listener until `shutdown` is cancelled
    pub async fn serve(
        &self,
        listener: tokio::net::TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let app = create_router(Arc::clone(&self.state));
        tracing::info!("HTTP API listening on {}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))
    }

    /// Bind `node.bind_address` and serve
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let bind = self.state.cluster.config().node.bind_address.clone();
        let listener = tokio::net::TcpListener::bind(&bind).await?;
        self.serve(listener, shutdown).await
    }
}
