//! Branch routes: backups, snapshots, restore and queries

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Extension;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use super::auth::{authorize, Authorizer};
use super::extract::JsonBody;
use super::response::{ApiError, ApiResult, Success};
use super::AppState;
use crate::backup::Backup;
use crate::database::{QueryExecutor, SqlValue};
use crate::error::{Error, Result};
use crate::messenger::{QueryFailureKind, QueryRequest};
use crate::restore::ExclusiveRunner;
use crate::snapshot::{RestorePoint, Snapshot};
use crate::storage::BranchKey;

type Auth = Extension<Arc<dyn Authorizer>>;

#[derive(Debug, Deserialize)]
pub struct BranchPath {
    database: String,
    branch: String,
}

impl BranchPath {
    fn key(&self) -> Result<BranchKey> {
        BranchKey::new(&self.database, &self.branch)
    }
}

#[derive(Debug, Deserialize)]
pub struct TimestampPath {
    database: String,
    branch: String,
    timestamp: String,
}

impl TimestampPath {
    fn parse(&self) -> Result<(BranchKey, i64)> {
        let key = BranchKey::new(&self.database, &self.branch)?;
        let timestamp = self
            .timestamp
            .parse::<i64>()
            .map_err(|_| Error::validation("timestamp", "must be an integer"))?;
        Ok((key, timestamp))
    }
}

/// `GET /v1/databases/:database/:branch/backups`
pub async fn list_backups(
    State(state): State<Arc<AppState>>,
    Extension(auth): Auth,
    Path(path): Path<BranchPath>,
) -> ApiResult<Vec<Backup>> {
    let key = path.key()?;
    authorize(auth.as_ref(), &key, "backup:read")?;
    Ok(Success(state.backups.list(&key).await?))
}

/// `POST /v1/databases/:database/:branch/backups`
pub async fn create_backup(
    State(state): State<Arc<AppState>>,
    Extension(auth): Auth,
    Path(path): Path<BranchPath>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let key = path.key()?;
    authorize(auth.as_ref(), &key, "backup:create")?;

    let branch = state.databases.branch(&key).await?;
    let backup = state
        .backups
        .run(
            &key,
            branch.snapshot_logger(),
            branch.files(),
            state.databases.as_ref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Success(backup)))
}

/// `GET /v1/databases/:database/:branch/backups/:timestamp`
pub async fn get_backup(
    State(state): State<Arc<AppState>>,
    Extension(auth): Auth,
    Path(path): Path<TimestampPath>,
) -> ApiResult<Backup> {
    let (key, timestamp) = path.parse()?;
    authorize(auth.as_ref(), &key, "backup:read")?;
    Ok(Success(state.backups.get_backup(&key, timestamp).await?))
}

/// `DELETE /v1/databases/:database/:branch/backups/:timestamp`
pub async fn delete_backup(
    State(state): State<Arc<AppState>>,
    Extension(auth): Auth,
    Path(path): Path<TimestampPath>,
) -> ApiResult<serde_json::Value> {
    let (key, timestamp) = path.parse()?;
    authorize(auth.as_ref(), &key, "backup:delete")?;
    state.backups.delete(&key, timestamp).await?;
    Ok(Success(json!({ "timestamp": timestamp })))
}

/// `GET /v1/databases/:database/:branch/snapshots`
pub async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    Extension(auth): Auth,
    Path(path): Path<BranchPath>,
) -> ApiResult<Vec<Snapshot>> {
    let key = path.key()?;
    authorize(auth.as_ref(), &key, "snapshot:read")?;
    let logger = state.databases.snapshot_logger(&key).await?;
    Ok(Success(logger.get_snapshots().await))
}

/// `GET /v1/databases/:database/:branch/snapshots/:timestamp`
pub async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    Extension(auth): Auth,
    Path(path): Path<TimestampPath>,
) -> ApiResult<Snapshot> {
    let (key, timestamp) = path.parse()?;
    authorize(auth.as_ref(), &key, "snapshot:read")?;
    let logger = state.databases.snapshot_logger(&key).await?;
    match logger.get_snapshot(timestamp).await {
        Some(snapshot) if !snapshot.is_empty() => Ok(Success(snapshot)),
        _ => Err(Error::SnapshotNotFound.into()),
    }
}

/// Where a restore takes its pages from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreSource {
    #[default]
    RestorePoint,
    Backup,
}

#[derive(Debug, Deserialize)]
pub struct RestoreBody {
    target_database: Option<String>,
    target_database_branch: Option<String>,
    timestamp: Option<i64>,
    #[serde(default)]
    source: RestoreSource,
}

#[derive(Debug, Serialize)]
pub struct RestoreOutcome {
    pub target_database: String,
    pub target_database_branch: String,
    /// Timestamp the target was restored to
    pub restored_from: i64,
    /// Restore point recorded on the target afterwards
    pub restore_point: RestorePoint,
}

/// `POST /v1/databases/:database/:branch/restore`
pub async fn restore(
    State(state): State<Arc<AppState>>,
    Extension(auth): Auth,
    Path(path): Path<BranchPath>,
    JsonBody(body): JsonBody<RestoreBody>,
) -> ApiResult<RestoreOutcome> {
    let source = path.key()?;
    let target_database = body
        .target_database
        .ok_or_else(|| Error::validation("target_database", "is required"))?;
    let target_branch = body
        .target_database_branch
        .ok_or_else(|| Error::validation("target_database_branch", "is required"))?;
    let timestamp = body
        .timestamp
        .ok_or_else(|| Error::validation("timestamp", "is required"))?;
    let target = BranchKey::new(target_database, target_branch)?;

    authorize(auth.as_ref(), &source, "restore:read")?;
    authorize(auth.as_ref(), &target, "restore:write")?;

    let databases = &state.databases;
    let target_fs = databases.files(&target);
    let runner = ExclusiveRunner::new(
        databases.clone(),
        target.clone(),
        state.cluster.config().restore_timeout(),
    );

    let restore_point = match body.source {
        RestoreSource::RestorePoint => {
            let logger = databases.snapshot_logger(&source).await?;
            state
                .restores
                .restore_from_timestamp(
                    &source,
                    &target,
                    timestamp,
                    &logger,
                    &databases.files(&source),
                    &target_fs,
                    databases.as_ref(),
                    &runner,
                )
                .await?
        }
        RestoreSource::Backup => {
            let backup = state.backups.get_backup(&source, timestamp).await?;
            let pages = state.backups.load(&backup).await?;
            state
                .restores
                .restore_from_backup(pages, &target, &target_fs, databases.as_ref(), &runner)
                .await?
        }
    };

    Ok(Success(RestoreOutcome {
        target_database: target.database_id,
        target_database_branch: target.branch_id,
        restored_from: timestamp,
        restore_point,
    }))
}

#[derive(Debug, Deserialize)]
pub struct QueryBody {
    statement: Option<String>,
    #[serde(default)]
    parameters: Vec<serde_json::Value>,
}

/// `POST /v1/databases/:database/:branch/query`
///
/// The primary executes; replicas relay the statement over the primary
/// query stream and never execute it themselves.
pub async fn query(
    State(state): State<Arc<AppState>>,
    Extension(auth): Auth,
    Path(path): Path<BranchPath>,
    JsonBody(body): JsonBody<QueryBody>,
) -> ApiResult<serde_json::Value> {
    let key = path.key()?;
    let statement = body
        .statement
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::validation("statement", "is required"))?;
    let parameters = body
        .parameters
        .iter()
        .map(SqlValue::from_json)
        .collect::<Result<Vec<_>>>()?;
    authorize(auth.as_ref(), &key, "query")?;

    let branch = key.to_string();
    let request = QueryRequest::new(key.database_id, key.branch_id, statement, parameters);

    if state.cluster.is_primary().await {
        let result = state
            .databases
            .execute_query(&request)
            .await
            .map_err(|e| match e {
                Error::Database(message) => Error::BadRequest(message),
                other => other,
            })?;
        return Ok(Success(result.to_json()));
    }

    let primary = state
        .cluster
        .primary_address()
        .await
        .ok_or(Error::NoPrimary)?;
    let response = state
        .cluster
        .messenger()
        .query_primary(&primary, request)
        .await?;

    match response.result {
        Ok(result) => Ok(Success(result.to_json())),
        Err(failure) => Err(ApiError(match failure.kind {
            QueryFailureKind::NotPrimary => Error::NotPrimary(primary),
            QueryFailureKind::NotFound => Error::BranchNotFound(branch),
            QueryFailureKind::Invalid => Error::BadRequest(failure.message),
            QueryFailureKind::Internal => Error::Internal(failure.message),
        })),
    }
}
