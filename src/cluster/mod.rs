//! Cluster
//!
//! The node's view of the cluster: membership, election, messaging and the
//! background loops that keep them current. Constructed once, started, and
//! shut down explicitly.

pub mod election;
pub mod identity;
pub mod membership;
pub mod transport;

pub use election::{
    ElectionConfig, ElectionCoordinator, ElectionProposal, ElectionResponse, ElectionState,
    PeerTransport,
};
pub use identity::{NodeIdentity, NODE_HEADER};
pub use membership::{Membership, MembershipSummary, Node, NodeRole};
pub use transport::{HttpTransport, JoinRequest};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::LitebaseConfig;
use crate::database::QueryExecutor;
use crate::error::{Error, Result};
use crate::messenger::{
    ClusterEvent, MessageHandler, NodeMessage, NodeMessenger, QueryFailure, QueryFailureKind,
    QueryRequest, QueryResponse,
};

/// Snapshot of the local view, served by `GET /v1/cluster/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub node_id: String,
    pub address: String,
    pub state: ElectionState,
    pub primary: Option<String>,
    pub members: Vec<Node>,
    pub inbound_connections: Vec<String>,
    pub outbound_connections: Vec<String>,
}

/// Cluster context shared by every component
pub struct Cluster {
    config: LitebaseConfig,
    node_id: String,
    address: String,
    identity: NodeIdentity,
    membership: Arc<Membership>,
    election: Arc<ElectionCoordinator>,
    messenger: Arc<NodeMessenger>,
    transport: Arc<HttpTransport>,
    executor: Option<Arc<dyn QueryExecutor>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Cluster {
    /// Build the cluster context. Nothing runs until `start`.
    pub fn new(config: LitebaseConfig, executor: Option<Arc<dyn QueryExecutor>>) -> Arc<Self> {
        let node_id = config.node.id.clone();
        let address = config.advertise_address().to_string();
        let identity = NodeIdentity::new(&config.cluster.shared_key, address.clone());
        let cancel = CancellationToken::new();

        let membership = Arc::new(Membership::new(Node::new(node_id.clone(), address.clone())));
        let messenger = Arc::new(NodeMessenger::new(
            node_id.clone(),
            identity.clone(),
            config.request_timeout(),
            cancel.child_token(),
        ));
        let transport = Arc::new(HttpTransport::new(
            identity.clone(),
            messenger.clone(),
            config.request_timeout(),
        ));
        let election = Arc::new(ElectionCoordinator::new(
            node_id.clone(),
            membership.clone(),
            transport.clone(),
            ElectionConfig {
                window: config.election_window(),
                heartbeat_timeout: config.heartbeat_timeout(),
                attempts: config.cluster.election_attempts,
            },
        ));

        Arc::new(Self {
            config,
            node_id,
            address,
            identity,
            membership,
            election,
            messenger,
            transport,
            executor,
            cancel,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Join the configured peers, settle on a primary and start the
    /// heartbeat and monitor loops
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        tracing::info!("Starting cluster node {} at {}", self.node_id, self.address);

        self.join().await;

        if self.election.needs_election().await {
            match self.election.run_election().await {
                Ok(Some(primary)) => tracing::info!("Primary is {}", primary),
                Ok(None) => tracing::warn!("Initial election did not settle on a primary"),
                Err(e) => tracing::warn!("Initial election failed: {}", e),
            }
        }

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(Arc::clone(self).heartbeat_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).monitor_loop()));
        Ok(())
    }

    /// Announce ourselves to every configured peer
    async fn join(&self) {
        let request = JoinRequest {
            id: self.node_id.clone(),
            address: self.address.clone(),
        };

        for peer in &self.config.cluster.peers {
            if peer == &self.address {
                continue;
            }

            let result: Result<MembershipSummary> = self
                .transport
                .post_json(peer, "/v1/cluster/members", &request)
                .await;

            match result {
                Ok(summary) => {
                    for node in &summary.nodes {
                        if node.address != self.address {
                            self.membership.add(&node.id, &node.address).await;
                        }
                    }
                    if let Some(primary) = summary.primary.filter(|p| p != &self.address) {
                        self.membership.set_primary(None, &primary).await;
                    }
                    tracing::info!("Joined cluster via {} ({} nodes)", peer, summary.total_nodes);
                }
                Err(e) => {
                    tracing::warn!("Could not join via {}: {}", peer, e);
                    self.membership.add(peer, peer).await;
                }
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(event) = self.election.heartbeat().await {
                        self.election.broadcast(event).await;
                    }
                }
            }
        }
    }

    async fn monitor_loop(self: Arc<Self>) {
        let jitter_ms = self.config.cluster.election_jitter_ms;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(self.config.heartbeat_interval()) => {}
            }

            if !self.election.needs_election().await {
                continue;
            }

            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(jitter) => {}
            }

            if self.election.needs_election().await {
                tracing::info!("No healthy primary known, starting election");
                if let Err(e) = self.election.run_election().await {
                    tracing::warn!("Election failed: {}", e);
                }
            }
        }
    }

    /// Step down if primary, leave every peer and stop all loops
    pub async fn shutdown(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        tracing::info!("Shutting down cluster node {}", self.node_id);

        self.election.step_down().await?;

        let path = format!("/v1/cluster/members/{}", self.address);
        let peers = self.membership.peers().await;
        let leaves = peers.iter().map(|peer| {
            let path = path.as_str();
            async move {
                if let Err(e) = self.transport.delete(&peer.address, path).await {
                    tracing::debug!("Leave notice to {} failed: {}", peer.address, e);
                }
            }
        });
        futures::future::join_all(leaves).await;

        self.cancel.cancel();
        self.messenger.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &LitebaseConfig {
        &self.config
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn election(&self) -> &Arc<ElectionCoordinator> {
        &self.election
    }

    pub fn messenger(&self) -> &Arc<NodeMessenger> {
        &self.messenger
    }

    /// Token cancelled on shutdown
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn is_primary(&self) -> bool {
        self.election.is_primary().await
    }

    /// Address of the current primary, if any
    pub async fn primary_address(&self) -> Option<String> {
        self.membership.primary().await.map(|n| n.address)
    }

    /// Add a node that asked to join and tell the others
    pub async fn admit(&self, request: &JoinRequest) -> MembershipSummary {
        if self.membership.add(&request.id, &request.address).await {
            tracing::info!("Node {} joined from {}", request.id, request.address);
            let others: Vec<String> = self
                .membership
                .peers()
                .await
                .into_iter()
                .map(|n| n.address)
                .filter(|a| a != &request.address)
                .collect();
            let event = NodeMessage::Broadcast(ClusterEvent::MemberJoined {
                id: request.id.clone(),
                address: request.address.clone(),
            });
            let messenger = self.messenger.clone();
            tokio::spawn(async move {
                messenger.broadcast(&others, event).await;
            });
        }
        self.membership.summary().await
    }

    /// Remove a node that is leaving
    pub async fn release(&self, address: &str) -> Result<()> {
        let removed = self
            .membership
            .remove(address)
            .await
            .ok_or_else(|| Error::NodeNotFound(address.to_string()))?;

        tracing::info!("Node {} left ({})", removed.id, address);
        self.messenger.disconnect(address).await;
        self.election
            .apply_event(&ClusterEvent::MemberLeft {
                address: address.to_string(),
            })
            .await;
        Ok(())
    }

    /// Current local view
    pub async fn status(&self) -> ClusterStatus {
        let summary = self.membership.summary().await;
        ClusterStatus {
            node_id: self.node_id.clone(),
            address: self.address.clone(),
            state: self.election.state().await,
            primary: summary.primary,
            members: summary.nodes,
            inbound_connections: self.messenger.inbound_connections().await,
            outbound_connections: self.messenger.outbound_connections().await,
        }
    }

    /// Run a relayed query; only the primary executes
    pub async fn execute_query(&self, query: QueryRequest) -> QueryResponse {
        let id = query.id.clone();

        if !self.is_primary().await {
            return QueryResponse {
                id,
                result: Err(QueryFailure {
                    kind: QueryFailureKind::NotPrimary,
                    message: "not primary".into(),
                }),
            };
        }

        let Some(executor) = self.executor.as_ref() else {
            return QueryResponse {
                id,
                result: Err(QueryFailure {
                    kind: QueryFailureKind::Internal,
                    message: "queries are not served by this node".into(),
                }),
            };
        };

        let result = executor.execute_query(&query).await.map_err(|e| QueryFailure {
            kind: match &e {
                e if e.is_not_found() => QueryFailureKind::NotFound,
                Error::Database(_) | Error::BadRequest(_) | Error::Validation { .. } => {
                    QueryFailureKind::Invalid
                }
                _ => QueryFailureKind::Internal,
            },
            message: e.to_string(),
        });

        QueryResponse { id, result }
    }

    /// Answer one message from a peer connection
    pub async fn handle_message(&self, message: NodeMessage) -> NodeMessage {
        match message {
            NodeMessage::Handshake { id, address } => {
                self.membership.add(&id, &address).await;
                NodeMessage::Handshake {
                    id: self.node_id.clone(),
                    address: self.address.clone(),
                }
            }
            NodeMessage::ElectionProposal(proposal) => {
                NodeMessage::ElectionResponse(self.election.propose(proposal).await)
            }
            NodeMessage::Broadcast(event) => {
                tracing::trace!("Applying {} event", event.name());
                if let ClusterEvent::MemberLeft { address } = &event {
                    self.messenger.disconnect(address).await;
                }
                self.election.apply_event(&event).await;
                NodeMessage::Ack
            }
            NodeMessage::Query(query) => NodeMessage::QueryResponse(self.execute_query(query).await),
            NodeMessage::QueryResponse(response) => NodeMessage::QueryResponse(response),
            other => NodeMessage::error(format!("unexpected {} message", other.type_name())),
        }
    }
}

#[async_trait]
impl MessageHandler for Cluster {
    async fn handle_message(&self, message: NodeMessage) -> NodeMessage {
        Cluster::handle_message(self, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::QueryRequest;

    fn config(dir: &std::path::Path) -> LitebaseConfig {
        LitebaseConfig::standalone("127.0.0.1:0", dir.to_path_buf())
    }

    #[tokio::test]
    async fn test_standalone_becomes_primary() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Cluster::new(config(dir.path()), None);
        cluster.start().await.unwrap();

        assert!(cluster.is_primary().await);
        assert_eq!(cluster.primary_address().await.as_deref(), Some("127.0.0.1:0"));

        cluster.shutdown().await.unwrap();
        assert!(!cluster.is_primary().await);
    }

    #[tokio::test]
    async fn test_handle_message() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Cluster::new(config(dir.path()), None);

        let reply = cluster
            .handle_message(NodeMessage::Handshake {
                id: "node-2".into(),
                address: "127.0.0.1:9002".into(),
            })
            .await;
        assert!(matches!(reply, NodeMessage::Handshake { .. }));
        assert!(cluster.membership().contains("127.0.0.1:9002").await);

        let reply = cluster
            .handle_message(NodeMessage::Broadcast(ClusterEvent::PrimaryChanged {
                id: "node-2".into(),
                address: "127.0.0.1:9002".into(),
                proposal: None,
            }))
            .await;
        assert_eq!(reply, NodeMessage::Ack);
        assert_eq!(cluster.primary_address().await.as_deref(), Some("127.0.0.1:9002"));

        // Replicas refuse relayed queries
        let reply = cluster
            .handle_message(NodeMessage::Query(QueryRequest::new("db", "main", "SELECT 1", vec![])))
            .await;
        match reply {
            NodeMessage::QueryResponse(response) => {
                assert_eq!(response.result.unwrap_err().kind, QueryFailureKind::NotPrimary);
            }
            other => panic!("unexpected reply {:?}", other),
        }

        assert!(matches!(
            cluster.handle_message(NodeMessage::Ack).await,
            NodeMessage::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_release_unknown_member() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Cluster::new(config(dir.path()), None);
        assert!(matches!(
            cluster.release("127.0.0.1:9009").await,
            Err(Error::NodeNotFound(_))
        ));
    }
}
