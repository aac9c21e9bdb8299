//! HTTP API tests against an in-process router

mod common;

use axum::http::{Method, StatusCode};
use serde_json::{json, Value};

use common::{branch, config, primary_state, Call};
use litebase::api::create_router;
use litebase::cluster::{NodeIdentity, NODE_HEADER};
use litebase::config::TokenConfig;
use litebase::LitebaseNode;

const BACKUPS: &str = "/v1/databases/app/main/backups";
const QUERY: &str = "/v1/databases/app/main/query";

fn restore_points(snapshots: &Value) -> Vec<i64> {
    snapshots
        .as_array()
        .unwrap()
        .iter()
        .flat_map(|s| s["restore_points"].as_array().unwrap().clone())
        .map(|p| p["timestamp"].as_i64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_backup_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let state = primary_state(config(dir.path())).await;
    state.databases.create_branch(&branch("app", "main")).await.unwrap();
    let app = create_router(state);

    let (status, body) = Call::new(Method::POST, BACKUPS).send(&app).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "success");
    let timestamp = body["data"]["restore_point"]["timestamp"].as_i64().unwrap();
    assert!(body["data"]["size"].as_u64().unwrap() > 0);

    let uri = format!("{}/{}", BACKUPS, timestamp);
    let (status, body) = Call::new(Method::GET, &uri).send(&app).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["restore_point"]["timestamp"], timestamp);

    let (status, body) = Call::new(Method::GET, BACKUPS).send(&app).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = Call::new(Method::DELETE, &uri).send(&app).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["timestamp"], timestamp);

    let (status, body) = Call::new(Method::GET, &uri).send(&app).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");
    assert_eq!(body["message"], "Error: backup not found");

    let (status, _) = Call::new(Method::DELETE, &uri).send(&app).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_backup_of_unknown_branch() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(primary_state(config(dir.path())).await);

    let (status, body) = Call::new(Method::POST, BACKUPS).send(&app).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "Error: branch not found: app/main");

    let (status, _) = Call::new(Method::GET, &format!("{}/not-a-number", BACKUPS))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_point_in_time_restore() {
    let dir = tempfile::tempdir().unwrap();
    let state = primary_state(config(dir.path())).await;
    state.databases.create_branch(&branch("app", "main")).await.unwrap();
    state.databases.create_branch(&branch("app", "pitr")).await.unwrap();
    let app = create_router(state);

    let (status, _) = Call::new(Method::POST, QUERY)
        .json(json!({ "statement": "CREATE TABLE items (n INTEGER)" }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    for n in 1..=9 {
        let (status, body) = Call::new(Method::POST, QUERY)
            .json(json!({ "statement": "INSERT INTO items VALUES (?1)", "parameters": [n] }))
            .send(&app)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["changes"], 1);
    }

    let (status, body) = Call::new(Method::GET, "/v1/databases/app/main/snapshots")
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    let points = restore_points(&body["data"]);
    // branch creation plus ten writes
    assert_eq!(points.len(), 11);
    assert!(points.windows(2).all(|w| w[0] < w[1]));

    // points[5] follows the fifth write: the table and four rows
    let (status, body) = Call::new(Method::POST, "/v1/databases/app/main/restore")
        .json(json!({
            "target_database": "app",
            "target_database_branch": "pitr",
            "timestamp": points[5],
        }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["restored_from"], points[5]);
    assert_eq!(body["data"]["target_database_branch"], "pitr");

    let (status, body) = Call::new(Method::POST, "/v1/databases/app/pitr/query")
        .json(json!({ "statement": "SELECT COUNT(*) FROM items" }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["rows"], json!([[4]]));

    let (_, body) = Call::new(Method::POST, QUERY)
        .json(json!({ "statement": "SELECT COUNT(*) FROM items" }))
        .send(&app)
        .await;
    assert_eq!(body["data"]["rows"], json!([[9]]));
}

#[tokio::test]
async fn test_restore_from_backup() {
    let dir = tempfile::tempdir().unwrap();
    let state = primary_state(config(dir.path())).await;
    state.databases.create_branch(&branch("app", "main")).await.unwrap();
    let app = create_router(state);

    for statement in [
        "CREATE TABLE items (n INTEGER)",
        "INSERT INTO items VALUES (1), (2), (3)",
    ] {
        let (status, _) = Call::new(Method::POST, QUERY)
            .json(json!({ "statement": statement }))
            .send(&app)
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = Call::new(Method::POST, BACKUPS).send(&app).await;
    assert_eq!(status, StatusCode::CREATED);
    let timestamp = body["data"]["restore_point"]["timestamp"].as_i64().unwrap();

    let (status, _) = Call::new(Method::POST, QUERY)
        .json(json!({ "statement": "INSERT INTO items VALUES (4), (5)" }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = Call::new(Method::POST, "/v1/databases/app/main/restore")
        .json(json!({
            "target_database": "app",
            "target_database_branch": "main",
            "timestamp": timestamp,
            "source": "backup",
        }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["restored_from"], timestamp);
    assert!(body["data"]["restore_point"]["timestamp"].as_i64().unwrap() > timestamp);

    let (status, body) = Call::new(Method::POST, QUERY)
        .json(json!({ "statement": "SELECT n FROM items ORDER BY n" }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["rows"], json!([[1], [2], [3]]));

    let (status, body) = Call::new(Method::POST, "/v1/databases/app/main/restore")
        .json(json!({
            "target_database": "app",
            "target_database_branch": "main",
            "timestamp": timestamp + 1,
            "source": "backup",
        }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "Error: backup not found");
}

#[tokio::test]
async fn test_restore_errors() {
    let dir = tempfile::tempdir().unwrap();
    let state = primary_state(config(dir.path())).await;
    state.databases.create_branch(&branch("app", "main")).await.unwrap();
    let app = create_router(state);
    let uri = "/v1/databases/app/main/restore";

    let (status, body) = Call::new(Method::POST, uri)
        .json(json!({ "target_database": "app", "target_database_branch": "copy" }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["errors"]["timestamp"].is_array());

    let (status, _) = Call::new(Method::POST, uri)
        .json(json!({
            "target_database": "app",
            "target_database_branch": "copy",
            "timestamp": 1,
        }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = Call::new(Method::POST, uri)
        .json(json!({
            "target_database": "app",
            "target_database_branch": "main",
            "timestamp": 1,
        }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "Error: restore point not found");

    let (status, _) = Call::new(Method::POST, uri)
        .json(json!({
            "target_database": "app",
            "target_database_branch": "main",
            "timestamp": 1,
            "source": "backup",
        }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let state = primary_state(config(dir.path())).await;
    state.databases.create_branch(&branch("app", "main")).await.unwrap();
    let app = create_router(state);

    Call::new(Method::POST, QUERY)
        .json(json!({ "statement": "CREATE TABLE t (x)" }))
        .send(&app)
        .await;

    let (status, body) = Call::new(Method::GET, "/v1/databases/app/main/snapshots")
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    let snapshots = body["data"].as_array().unwrap();
    assert_eq!(snapshots.len(), 1);
    let timestamp = snapshots[0]["timestamp"].as_i64().unwrap();
    assert_eq!(snapshots[0]["restore_points"][0]["timestamp"], timestamp);

    let (status, body) = Call::new(
        Method::GET,
        &format!("/v1/databases/app/main/snapshots/{}", timestamp),
    )
    .send(&app)
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["restore_points"].as_array().unwrap().len(), 2);

    let (status, body) = Call::new(
        Method::GET,
        &format!("/v1/databases/app/main/snapshots/{}", timestamp + 1),
    )
    .send(&app)
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "Error: snapshot not found");
}

#[tokio::test]
async fn test_query_errors() {
    let dir = tempfile::tempdir().unwrap();
    let state = primary_state(config(dir.path())).await;
    state.databases.create_branch(&branch("app", "main")).await.unwrap();
    let app = create_router(state);

    let (status, body) = Call::new(Method::POST, QUERY)
        .json(json!({ "parameters": [] }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["errors"]["statement"], json!(["is required"]));

    let (status, _) = Call::new(Method::POST, QUERY)
        .json(json!({ "statement": "SELEC 1" }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = Call::new(Method::POST, "/v1/databases/app/other/query")
        .json(json!({ "statement": "SELECT 1" }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = Call::new(Method::POST, QUERY)
        .json(json!({ "statement": "SELECT 1", "parameters": [[1]] }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_content_type_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let sealed = NodeIdentity::new(&config.cluster.shared_key, "127.0.0.1:9999")
        .seal()
        .unwrap();
    let state = primary_state(config).await;
    state.databases.create_branch(&branch("app", "main")).await.unwrap();
    let app = create_router(state);

    let (status, body) = Call::new(Method::POST, QUERY)
        .json(json!({ "statement": "SELECT 1" }))
        .header("content-type", "text/plain")
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(body["status"], "error");

    let (status, _) = Call::new(Method::POST, "/v1/cluster/connection")
        .json(json!({}))
        .header(NODE_HEADER, sealed)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn test_cluster_routes_require_identity() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let shared_key = config.cluster.shared_key.clone();
    let app = create_router(primary_state(config).await);
    let proposal = json!({ "candidate": "127.0.0.1:9999", "seed": 1, "started_at": 0 });

    let (status, _) = Call::new(Method::POST, "/v1/cluster/election")
        .json(proposal.clone())
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let forged = NodeIdentity::new("some-other-key", "127.0.0.1:9999").seal().unwrap();
    let (status, _) = Call::new(Method::POST, "/v1/cluster/election")
        .json(proposal.clone())
        .header(NODE_HEADER, forged)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let sealed = NodeIdentity::new(&shared_key, "127.0.0.1:9999").seal().unwrap();
    let (status, body) = Call::new(Method::POST, "/v1/cluster/election")
        .json(proposal)
        .header(NODE_HEADER, sealed.clone())
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["established"], true);

    // joining under someone else's address
    let (status, _) = Call::new(Method::POST, "/v1/cluster/members")
        .json(json!({ "id": "b", "address": "127.0.0.1:8888" }))
        .header(NODE_HEADER, sealed)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_leave_requires_membership() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let shared_key = config.cluster.shared_key.clone();
    let app = create_router(primary_state(config).await);
    let sealed = NodeIdentity::new(&shared_key, "127.0.0.1:9999").seal().unwrap();

    let (status, _) = Call::new(Method::DELETE, "/v1/cluster/members/127.0.0.1:9999")
        .header(NODE_HEADER, sealed.clone())
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = Call::new(Method::POST, "/v1/cluster/members")
        .json(json!({ "id": "node-2", "address": "127.0.0.1:9999" }))
        .header(NODE_HEADER, sealed.clone())
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total_nodes"], 2);

    // another node's identity cannot remove it
    let other = NodeIdentity::new(&shared_key, "127.0.0.1:9998").seal().unwrap();
    let (status, _) = Call::new(Method::DELETE, "/v1/cluster/members/127.0.0.1:9999")
        .header(NODE_HEADER, other)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = Call::new(Method::DELETE, "/v1/cluster/members/127.0.0.1:9999")
        .header(NODE_HEADER, sealed)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["address"], "127.0.0.1:9999");
}

#[tokio::test]
async fn test_host_validation() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.api.allowed_hosts = vec!["localhost".into()];
    let app = create_router(primary_state(config).await);

    let (status, _) = Call::new(Method::GET, "/v1/cluster/status").send(&app).await;
    assert_eq!(status, StatusCode::OK);

    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config(dir.path());
    config.api.allowed_hosts = vec!["litebase.internal".into()];
    let app = create_router(primary_state(config).await);

    let (status, _) = Call::new(Method::GET, "/v1/cluster/status").send(&app).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_bearer_tokens() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.auth.tokens = vec![
        TokenConfig {
            token: "reader".into(),
            actions: vec!["backup:read".into(), "snapshot:*".into()],
        },
        TokenConfig {
            token: "admin".into(),
            actions: vec!["*".into()],
        },
    ];
    let state = primary_state(config).await;
    state.databases.create_branch(&branch("app", "main")).await.unwrap();
    let app = create_router(state);

    let (status, _) = Call::new(Method::GET, BACKUPS).send(&app).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = Call::new(Method::GET, BACKUPS)
        .header("authorization", "Bearer wrong")
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = Call::new(Method::GET, BACKUPS)
        .header("authorization", "Bearer reader")
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = Call::new(Method::GET, "/v1/databases/app/main/snapshots")
        .header("authorization", "Bearer reader")
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = Call::new(Method::POST, BACKUPS)
        .header("authorization", "Bearer reader")
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = Call::new(Method::POST, BACKUPS)
        .header("authorization", "Bearer admin")
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_replica_without_primary() {
    let dir = tempfile::tempdir().unwrap();
    let state = LitebaseNode::build(config(dir.path())).unwrap();
    state.databases.create_branch(&branch("app", "main")).await.unwrap();
    let app = create_router(state);

    let (status, body) = Call::new(Method::POST, BACKUPS).send(&app).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["message"], "Error: no primary available");

    // reads are served locally
    let (status, _) = Call::new(Method::GET, BACKUPS).send(&app).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = Call::new(Method::POST, QUERY)
        .json(json!({ "statement": "SELECT 1" }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
