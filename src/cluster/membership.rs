//! Cluster Membership
//!
//! Tracks the nodes known locally, their roles and last activity. Nodes are
//! keyed by advertised address since that is what peers authenticate with.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Single writer
    Primary,
    /// Read-only member that forwards writes
    Replica,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "PRIMARY"),
            NodeRole::Replica => write!(f, "REPLICA"),
        }
    }
}

/// A single cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier
    pub id: String,
    /// Advertised address (host:port)
    pub address: String,
    /// Current role
    pub role: NodeRole,
    /// Last activity, unix milliseconds
    pub last_active: i64,
}

impl Node {
    /// Create a replica node that was active just now
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            role: NodeRole::Replica,
            last_active: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Check if the node was active within `timeout`
    pub fn is_healthy(&self, timeout: Duration) -> bool {
        let now = chrono::Utc::now().timestamp_millis();
        now - self.last_active < timeout.as_millis() as i64
    }

    pub fn is_primary(&self) -> bool {
        self.role == NodeRole::Primary
    }
}

/// Registry of known nodes
pub struct Membership {
    /// This node's address
    local_address: String,
    /// All known nodes (including self), keyed by address
    nodes: RwLock<HashMap<String, Node>>,
}

impl Membership {
    /// Create a registry containing only the local node
    pub fn new(local: Node) -> Self {
        let local_address = local.address.clone();
        let mut nodes = HashMap::new();
        nodes.insert(local.address.clone(), local);

        Self {
            local_address,
            nodes: RwLock::new(nodes),
        }
    }

    /// Address of the local node
    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Add a node, or refresh it if the address is already known.
    /// Returns true when the node was not known before.
    pub async fn add(&self, id: &str, address: &str) -> bool {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(address) {
            Some(node) => {
                node.id = id.to_string();
                node.last_active = chrono::Utc::now().timestamp_millis();
                false
            }
            None => {
                nodes.insert(address.to_string(), Node::new(id, address));
                true
            }
        }
    }

    /// Remove a node. The local node is never removed.
    pub async fn remove(&self, address: &str) -> Option<Node> {
        if address == self.local_address {
            return None;
        }
        self.nodes.write().await.remove(address)
    }

    /// Get a node by address
    pub async fn get(&self, address: &str) -> Option<Node> {
        self.nodes.read().await.get(address).cloned()
    }

    /// Check whether an address belongs to a member
    pub async fn contains(&self, address: &str) -> bool {
        self.nodes.read().await.contains_key(address)
    }

    /// Get the local node
    pub async fn local(&self) -> Option<Node> {
        self.get(&self.local_address).await
    }

    /// Record activity for a node
    pub async fn touch(&self, address: &str) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(address) {
            node.last_active = chrono::Utc::now().timestamp_millis();
        } else {
            tracing::debug!("touch: node '{}' not in membership", address);
        }
    }

    /// All nodes, ordered by address
    pub async fn all(&self) -> Vec<Node> {
        let nodes = self.nodes.read().await;
        let mut all: Vec<Node> = nodes.values().cloned().collect();
        all.sort_by(|a, b| a.address.cmp(&b.address));
        all
    }

    /// All nodes except self
    pub async fn peers(&self) -> Vec<Node> {
        let nodes = self.nodes.read().await;
        let mut peers: Vec<Node> = nodes
            .values()
            .filter(|n| n.address != self.local_address)
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        peers
    }

    /// Current primary, if known
    pub async fn primary(&self) -> Option<Node> {
        let nodes = self.nodes.read().await;
        nodes.values().find(|n| n.is_primary()).cloned()
    }

    /// Mark `address` as primary, demoting any other primary.
    /// An unknown address is added first.
    pub async fn set_primary(&self, id: Option<&str>, address: &str) {
        let mut nodes = self.nodes.write().await;

        for node in nodes.values_mut() {
            if node.is_primary() && node.address != address {
                node.role = NodeRole::Replica;
            }
        }

        let node = nodes
            .entry(address.to_string())
            .or_insert_with(|| Node::new(id.unwrap_or(address), address));
        node.role = NodeRole::Primary;
        node.last_active = chrono::Utc::now().timestamp_millis();
    }

    /// Demote every node to replica
    pub async fn clear_primary(&self) {
        let mut nodes = self.nodes.write().await;
        for node in nodes.values_mut() {
            node.role = NodeRole::Replica;
        }
    }

    /// Number of known nodes
    pub async fn size(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// Get cluster summary
    pub async fn summary(&self) -> MembershipSummary {
        let nodes = self.all().await;
        MembershipSummary {
            total_nodes: nodes.len(),
            primary: nodes.iter().find(|n| n.is_primary()).map(|n| n.address.clone()),
            nodes,
        }
    }
}

/// Membership summary information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipSummary {
    pub total_nodes: usize,
    pub primary: Option<String>,
    pub nodes: Vec<Node>,
}
