//! HTTP peer transport
//!
//! Proposals travel as JSON over `POST /v1/cluster/election`; every other
//! message goes over the persistent messenger connection.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::election::{ElectionProposal, ElectionResponse, PeerTransport};
use super::identity::{NodeIdentity, NODE_HEADER};
use crate::error::{Error, Result};
use crate::messenger::{NodeMessage, NodeMessenger};

/// JSON envelope returned by every API route
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: Option<T>,
    message: Option<String>,
}

/// Transport used by running nodes
pub struct HttpTransport {
    client: reqwest::Client,
    identity: NodeIdentity,
    messenger: Arc<NodeMessenger>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(identity: NodeIdentity, messenger: Arc<NodeMessenger>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            identity,
            messenger,
            timeout,
        }
    }

    /// POST a JSON body to a peer route and unwrap the envelope
    pub async fn post_json<B, T>(&self, address: &str, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("http://{}{}", address, path))
            .timeout(self.timeout)
            .header(NODE_HEADER, self.identity.seal()?)
            .json(body)
            .send()
            .await
            .map_err(|e| connection_error(address, e))?;
        unwrap_envelope(address, response).await
    }

    /// DELETE a peer route
    pub async fn delete(&self, address: &str, path: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("http://{}{}", address, path))
            .timeout(self.timeout)
            .header(NODE_HEADER, self.identity.seal()?)
            .send()
            .await
            .map_err(|e| connection_error(address, e))?;
        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "{} answered {} to DELETE {}",
                address,
                response.status(),
                path
            )));
        }
        Ok(())
    }
}

fn connection_error(address: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::ConnectionTimeout(address.to_string())
    } else {
        Error::ConnectionFailed {
            address: address.to_string(),
            reason: e.to_string(),
        }
    }
}

async fn unwrap_envelope<T: DeserializeOwned>(address: &str, response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let envelope: Envelope<T> = response
        .json()
        .await
        .map_err(|e| Error::Network(format!("invalid answer from {}: {}", address, e)))?;

    match envelope.data {
        Some(data) if status.is_success() && envelope.status == "success" => Ok(data),
        _ => Err(Error::Network(format!(
            "{} answered {}: {}",
            address,
            status,
            envelope.message.unwrap_or_default()
        ))),
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn propose(&self, address: &str, proposal: &ElectionProposal) -> Result<ElectionResponse> {
        self.post_json(address, "/v1/cluster/election", proposal).await
    }

    async fn send(&self, address: &str, message: NodeMessage) -> Result<NodeMessage> {
        self.messenger.send(address, message).await
    }
}

/// Body of `POST /v1/cluster/members`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: String,
    pub address: String,
}
