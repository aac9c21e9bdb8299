#![allow(dead_code)]

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use litebase::api::AppState;
use litebase::storage::BranchKey;
use litebase::{LitebaseConfig, LitebaseNode};

/// Single node config with fast cluster timings
pub fn config(dir: &Path) -> LitebaseConfig {
    let mut config = LitebaseConfig::standalone("127.0.0.1:0", dir.to_path_buf());
    config.cluster.heartbeat_interval_ms = 100;
    config.cluster.heartbeat_timeout_ms = 1000;
    config.cluster.election_window_ms = 1000;
    config.cluster.election_jitter_ms = 100;
    config
}

/// Application state of a node that elected itself primary
pub async fn primary_state(config: LitebaseConfig) -> Arc<AppState> {
    let state = LitebaseNode::build(config).unwrap();
    state.cluster.election().run_election().await.unwrap();
    assert!(state.cluster.is_primary().await);
    state
}

pub fn branch(database: &str, branch: &str) -> BranchKey {
    BranchKey::new(database, branch).unwrap()
}

pub struct Call<'a> {
    pub method: Method,
    pub uri: &'a str,
    pub body: Option<Value>,
    pub headers: Vec<(&'a str, String)>,
}

impl<'a> Call<'a> {
    pub fn new(method: Method, uri: &'a str) -> Self {
        Self {
            method,
            uri,
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: &'a str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub async fn send(self, app: &Router) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(self.method)
            .uri(self.uri)
            .header(header::HOST, "localhost");
        let has_content_type = self
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));
        for (name, value) in &self.headers {
            builder = builder.header(*name, value.as_str());
        }

        let body = match self.body {
            Some(value) => {
                let bytes = serde_json::to_vec(&value).unwrap();
                if !has_content_type {
                    builder = builder.header(header::CONTENT_TYPE, "application/json");
                }
                builder = builder.header(header::CONTENT_LENGTH, bytes.len());
                Body::from(bytes)
            }
            None => Body::empty(),
        };

        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check().await
}
