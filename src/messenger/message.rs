//! Node messages
//!
//! Every message exchanged between nodes. The wire tag is an explicit
//! one-byte discriminant so frames can be checked before the payload is
//! trusted.

use serde::{Deserialize, Serialize};

use crate::cluster::election::{ElectionProposal, ElectionResponse};
use crate::database::{QueryResult, SqlValue};

/// One-byte wire discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 1,
    ElectionProposal = 2,
    ElectionResponse = 3,
    Broadcast = 4,
    Query = 5,
    QueryResponse = 6,
    Ack = 7,
    Error = 8,
    Close = 9,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(tag: u8) -> std::result::Result<Self, u8> {
        Ok(match tag {
            1 => MessageType::Handshake,
            2 => MessageType::ElectionProposal,
            3 => MessageType::ElectionResponse,
            4 => MessageType::Broadcast,
            5 => MessageType::Query,
            6 => MessageType::QueryResponse,
            7 => MessageType::Ack,
            8 => MessageType::Error,
            9 => MessageType::Close,
            other => return Err(other),
        })
    }
}

/// Cluster-wide events carried in `Broadcast` frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEvent {
    /// Periodic liveness signal from the primary
    Heartbeat {
        id: String,
        address: String,
        proposal: Option<ElectionProposal>,
    },
    /// A node won an election
    PrimaryChanged {
        id: String,
        address: String,
        proposal: Option<ElectionProposal>,
    },
    /// The primary gave up its role
    PrimaryStepDown { address: String },
    /// A node joined the cluster
    MemberJoined { id: String, address: String },
    /// A node left the cluster
    MemberLeft { address: String },
}

impl ClusterEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterEvent::Heartbeat { .. } => "Heartbeat",
            ClusterEvent::PrimaryChanged { .. } => "PrimaryChanged",
            ClusterEvent::PrimaryStepDown { .. } => "PrimaryStepDown",
            ClusterEvent::MemberJoined { .. } => "MemberJoined",
            ClusterEvent::MemberLeft { .. } => "MemberLeft",
        }
    }
}

/// A statement relayed to the primary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub id: String,
    pub database_id: String,
    pub branch_id: String,
    pub statement: String,
    pub parameters: Vec<SqlValue>,
}

impl QueryRequest {
    pub fn new(
        database_id: impl Into<String>,
        branch_id: impl Into<String>,
        statement: impl Into<String>,
        parameters: Vec<SqlValue>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            database_id: database_id.into(),
            branch_id: branch_id.into(),
            statement: statement.into(),
            parameters,
        }
    }
}

/// Why the primary could not run a relayed query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryFailureKind {
    NotPrimary,
    NotFound,
    Invalid,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFailure {
    pub kind: QueryFailureKind,
    pub message: String,
}

/// Answer to a `QueryRequest`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub id: String,
    pub result: std::result::Result<QueryResult, QueryFailure>,
}

/// Messages exchanged between nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeMessage {
    /// First frame on every connection, in both directions
    Handshake { id: String, address: String },
    ElectionProposal(ElectionProposal),
    ElectionResponse(ElectionResponse),
    Broadcast(ClusterEvent),
    Query(QueryRequest),
    QueryResponse(QueryResponse),
    Ack,
    Error { message: String },
    /// Orderly end of a connection
    Close,
}

impl NodeMessage {
    /// Wire tag for this variant
    pub fn message_type(&self) -> MessageType {
        match self {
            NodeMessage::Handshake { .. } => MessageType::Handshake,
            NodeMessage::ElectionProposal(_) => MessageType::ElectionProposal,
            NodeMessage::ElectionResponse(_) => MessageType::ElectionResponse,
            NodeMessage::Broadcast(_) => MessageType::Broadcast,
            NodeMessage::Query(_) => MessageType::Query,
            NodeMessage::QueryResponse(_) => MessageType::QueryResponse,
            NodeMessage::Ack => MessageType::Ack,
            NodeMessage::Error { .. } => MessageType::Error,
            NodeMessage::Close => MessageType::Close,
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self.message_type() {
            MessageType::Handshake => "Handshake",
            MessageType::ElectionProposal => "ElectionProposal",
            MessageType::ElectionResponse => "ElectionResponse",
            MessageType::Broadcast => "Broadcast",
            MessageType::Query => "Query",
            MessageType::QueryResponse => "QueryResponse",
            MessageType::Ack => "Ack",
            MessageType::Error => "Error",
            MessageType::Close => "Close",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        NodeMessage::Error {
            message: message.into(),
        }
    }
}
