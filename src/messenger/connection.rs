//! Outbound peer connections
//!
//! Each connection is one long-lived HTTP POST: requests are written as frames
//! into the streamed request body and answers are read, in order, from the
//! streamed response body.

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use super::codec::{BufferPool, Decoded, MessageCodec};
use super::message::NodeMessage;
use crate::cluster::identity::{NodeIdentity, NODE_HEADER};
use crate::error::{Error, Result};

/// Control channel between any two nodes
pub const CONNECTION_PATH: &str = "/v1/cluster/connection";

/// Data path from a replica to the primary
pub const PRIMARY_PATH: &str = "/v1/cluster/primary";

const REQUEST_QUEUE: usize = 64;

type Reply = oneshot::Sender<Result<NodeMessage>>;

struct Request {
    message: NodeMessage,
    reply: Reply,
}

/// Everything a connection task needs from its messenger
#[derive(Clone)]
pub struct ConnectionSettings {
    pub local_id: String,
    pub identity: NodeIdentity,
    pub client: reqwest::Client,
    pub pool: Arc<BufferPool>,
}

/// Handle to a running connection task
pub struct PeerConnection {
    address: String,
    requests: mpsc::Sender<Request>,
    cancel: CancellationToken,
}

impl PeerConnection {
    /// Spawn the connection task. Connecting happens in the background;
    /// requests queue until the peer answers the handshake.
    pub fn open(
        address: &str,
        path: &'static str,
        settings: ConnectionSettings,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let task_address = address.to_string();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            match run(&task_address, path, settings, rx, task_cancel).await {
                Ok(()) => tracing::debug!("Connection to {}{} closed", task_address, path),
                Err(e) => tracing::debug!("Connection to {}{} failed: {}", task_address, path, e),
            }
        });

        Self {
            address: address.to_string(),
            requests: tx,
            cancel,
        }
    }

    /// Peer address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// True once the task has stopped accepting requests
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    /// Send a message and wait for the matching answer
    pub async fn request(&self, message: NodeMessage) -> Result<NodeMessage> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request { message, reply })
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }

    fn closed(&self) -> Error {
        Error::ConnectionFailed {
            address: self.address.clone(),
            reason: "connection closed".into(),
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    address: &str,
    path: &'static str,
    settings: ConnectionSettings,
    mut requests: mpsc::Receiver<Request>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut codec = MessageCodec::new(settings.pool.clone());
    let (body_tx, body_rx) = mpsc::channel::<std::io::Result<Bytes>>(REQUEST_QUEUE);

    let handshake = NodeMessage::Handshake {
        id: settings.local_id.clone(),
        address: settings.identity.address().to_string(),
    };
    body_tx
        .send(Ok(codec.encode_frame(&handshake)?))
        .await
        .map_err(|_| Error::Network("request body closed".into()))?;

    let url = format!("http://{}{}", address, path);
    let request = settings
        .client
        .post(&url)
        .header(NODE_HEADER, settings.identity.seal()?)
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .body(reqwest::Body::wrap_stream(ReceiverStream::new(body_rx)))
        .send();

    let response = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        response = request => response.map_err(|e| Error::ConnectionFailed {
            address: address.to_string(),
            reason: e.to_string(),
        })?,
    };

    if !response.status().is_success() {
        return Err(Error::ConnectionFailed {
            address: address.to_string(),
            reason: format!("peer answered {}", response.status()),
        });
    }

    let stream = response
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let mut frames = FramedRead::new(
        StreamReader::new(stream),
        MessageCodec::new(settings.pool.clone()),
    );

    let first = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        frame = frames.next() => frame,
    };
    match first {
        Some(Ok(Decoded::Message(NodeMessage::Handshake { id, .. }))) => {
            tracing::debug!("Connected to {} ({}) on {}", address, id, path);
        }
        Some(Ok(Decoded::Message(NodeMessage::Error { message }))) => {
            return Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: message,
            });
        }
        Some(Err(e)) => return Err(e),
        _ => {
            return Err(Error::Network(format!("expected handshake from {}", address)));
        }
    }

    let mut pending: VecDeque<Reply> = VecDeque::new();

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Ok(frame) = codec.encode_frame(&NodeMessage::Close) {
                    let _ = body_tx.send(Ok(frame)).await;
                }
                break Ok(());
            }
            request = requests.recv() => match request {
                Some(Request { message, reply }) => {
                    let frame = match codec.encode_frame(&message) {
                        Ok(frame) => frame,
                        Err(e) => {
                            let _ = reply.send(Err(e));
                            continue;
                        }
                    };
                    if body_tx.send(Ok(frame)).await.is_err() {
                        let _ = reply.send(Err(Error::Network("request body closed".into())));
                        break Err(Error::Network("request body closed".into()));
                    }
                    pending.push_back(reply);
                }
                None => {
                    if let Ok(frame) = codec.encode_frame(&NodeMessage::Close) {
                        let _ = body_tx.send(Ok(frame)).await;
                    }
                    break Ok(());
                }
            },
            frame = frames.next() => match frame {
                Some(Ok(Decoded::Message(message))) => match pending.pop_front() {
                    Some(reply) => {
                        let _ = reply.send(Ok(message));
                    }
                    None => {
                        tracing::debug!("Unsolicited {} from {}", message.type_name(), address);
                    }
                },
                Some(Ok(Decoded::Malformed(reason))) => {
                    tracing::warn!("Malformed frame from {}: {}", address, reason);
                    if let Some(reply) = pending.pop_front() {
                        let _ = reply.send(Err(Error::Frame(reason)));
                    }
                }
                Some(Err(e)) => break Err(e),
                None => break Err(Error::Network(format!("{} closed the connection", address))),
            }
        }
    };

    for reply in pending.drain(..) {
        let _ = reply.send(Err(Error::ConnectionFailed {
            address: address.to_string(),
            reason: "connection closed".into(),
        }));
    }

    result
}
