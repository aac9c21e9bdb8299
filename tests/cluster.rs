//! Two nodes on loopback: write forwarding, query relay and failover

mod common;

use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpListener;

use common::{branch, config, eventually};
use litebase::api::FORWARDED_HEADER;
use litebase::LitebaseNode;

async fn start_node(dir: &Path, peers: Vec<String>) -> LitebaseNode {
    let mut config = config(dir);
    config.cluster.peers = peers;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    LitebaseNode::start(config, listener).await.unwrap()
}

async fn stop(node: LitebaseNode) {
    let _ = tokio::time::timeout(Duration::from_secs(10), node.shutdown()).await;
}

fn url(node: &LitebaseNode, path: &str) -> String {
    format!("http://{}{}", node.address(), path)
}

async fn get_json(client: &reqwest::Client, url: String) -> (u16, Value) {
    let response = client.get(url).send().await.unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

async fn post_json(client: &reqwest::Client, url: String, body: Value) -> (u16, Value) {
    let response = client.post(url).json(&body).send().await.unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replica_forwards_writes() {
    let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let a = start_node(dir_a.path(), Vec::new()).await;
    assert!(a.cluster().is_primary().await);

    let b = start_node(dir_b.path(), vec![a.address().to_string()]).await;
    assert!(!b.cluster().is_primary().await);
    assert_eq!(b.cluster().primary_address().await.as_deref(), Some(a.address()));

    a.databases().create_branch(&branch("app", "main")).await.unwrap();
    let client = reqwest::Client::new();

    let response = client
        .post(url(&b, "/v1/databases/app/main/backups"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["database_id"], "app");

    let (_, on_a) = get_json(&client, url(&a, "/v1/databases/app/main/backups")).await;
    assert_eq!(on_a["data"].as_array().unwrap().len(), 1);
    let (_, on_b) = get_json(&client, url(&b, "/v1/databases/app/main/backups")).await;
    assert!(on_b["data"].as_array().unwrap().is_empty());
    assert!(!b.databases().files(&branch("app", "main")).exists());

    // a request already relayed once is not relayed again
    let response = client
        .post(url(&b, "/v1/databases/app/main/backups"))
        .header(FORWARDED_HEADER, "127.0.0.1:1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 503);

    stop(b).await;
    stop(a).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replica_relays_queries() {
    let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let a = start_node(dir_a.path(), Vec::new()).await;
    let b = start_node(dir_b.path(), vec![a.address().to_string()]).await;
    a.databases().create_branch(&branch("app", "main")).await.unwrap();
    let client = reqwest::Client::new();
    let query = "/v1/databases/app/main/query";

    let (status, _) = post_json(
        &client,
        url(&b, query),
        json!({ "statement": "CREATE TABLE t (x INTEGER)" }),
    )
    .await;
    assert_eq!(status, 200);

    let (status, body) = post_json(
        &client,
        url(&b, query),
        json!({ "statement": "INSERT INTO t VALUES (?1)", "parameters": [42] }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["changes"], 1);

    let (status, body) = post_json(
        &client,
        url(&a, query),
        json!({ "statement": "SELECT x FROM t" }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["rows"], json!([[42]]));

    let (status, _) = post_json(
        &client,
        url(&b, "/v1/databases/app/missing/query"),
        json!({ "statement": "SELECT 1" }),
    )
    .await;
    assert_eq!(status, 404);

    let (status, _) = post_json(&client, url(&b, query), json!({ "statement": "SELEC" })).await;
    assert_eq!(status, 400);

    stop(b).await;
    stop(a).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failover_after_step_down() {
    let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let a = start_node(dir_a.path(), Vec::new()).await;
    let b = start_node(dir_b.path(), vec![a.address().to_string()]).await;
    for node in [&a, &b] {
        node.databases().create_branch(&branch("app", "main")).await.unwrap();
    }

    a.cluster().election().step_down().await.unwrap();

    // B must take over within one election round of noticing the step-down;
    // A abstains from the first round after stepping down
    let settings = b.cluster().config();
    let bound = settings.heartbeat_timeout() + settings.election_window() * 2;
    let settled = eventually(bound, || async {
        !a.cluster().is_primary().await
            && b.cluster().is_primary().await
            && a.cluster().primary_address().await.as_deref() == Some(b.address())
    })
    .await;
    assert!(settled, "B did not become primary within {:?}", bound);

    let (primary, replica) = (&b, &a);

    let client = reqwest::Client::new();
    let response = client
        .post(url(replica, "/v1/databases/app/main/backups"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);

    let (_, on_primary) = get_json(&client, url(primary, "/v1/databases/app/main/backups")).await;
    assert_eq!(on_primary["data"].as_array().unwrap().len(), 1);
    let (_, on_replica) = get_json(&client, url(replica, "/v1/databases/app/main/backups")).await;
    assert!(on_replica["data"].as_array().unwrap().is_empty());

    stop(b).await;
    stop(a).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_members_join_and_leave() {
    let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let a = start_node(dir_a.path(), Vec::new()).await;
    let b = start_node(dir_b.path(), vec![a.address().to_string()]).await;
    let b_address = b.address().to_string();
    let client = reqwest::Client::new();

    let (status, body) = get_json(&client, url(&a, "/v1/cluster/status")).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["primary"], a.address());
    let members: Vec<String> = body["data"]["members"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["address"].as_str().unwrap().to_string())
        .collect();
    assert!(members.contains(&b_address));

    stop(b).await;
    let left = eventually(Duration::from_secs(5), || async {
        !a.cluster().membership().contains(&b_address).await
    })
    .await;
    assert!(left);
    assert!(a.cluster().is_primary().await);

    stop(a).await;
}
