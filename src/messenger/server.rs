//! Inbound connections
//!
//! Serves the streamed side of `/v1/cluster/connection` and
//! `/v1/cluster/primary`: frames are read from the request body, handed to a
//! `MessageHandler`, and each answer is flushed into the response body.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use super::codec::{BufferPool, Decoded, MessageCodec};
use super::message::NodeMessage;
use super::NodeMessenger;
use crate::error::{Error, Result};

/// Answers one inbound message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, message: NodeMessage) -> NodeMessage;
}

impl NodeMessenger {
    /// Start serving an inbound connection from `peer` (already authenticated)
    /// and return the streaming response
    pub fn serve_connection(
        self: &Arc<Self>,
        handler: Arc<dyn MessageHandler>,
        peer: String,
        body: Body,
    ) -> Response {
        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(64);
        let messenger = Arc::clone(self);
        let cancel = self.cancel.child_token();
        let pool = self.pool();

        tokio::spawn(async move {
            if let Err(e) = read_loop(&messenger, handler, &peer, body, tx, cancel, pool).await {
                tracing::warn!("Inbound connection from {} failed: {}", peer, e);
            }
            messenger.unregister_inbound(&peer).await;
            tracing::debug!("Inbound connection from {} closed", peer);
        });

        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            Body::from_stream(ReceiverStream::new(rx)),
        )
            .into_response()
    }
}

async fn read_loop(
    messenger: &NodeMessenger,
    handler: Arc<dyn MessageHandler>,
    peer: &str,
    body: Body,
    tx: mpsc::Sender<std::io::Result<Bytes>>,
    cancel: CancellationToken,
    pool: Arc<BufferPool>,
) -> Result<()> {
    let stream = body
        .into_data_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let mut frames = FramedRead::new(StreamReader::new(stream), MessageCodec::new(pool.clone()));
    let mut codec = MessageCodec::new(pool);
    let mut handshaken = false;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(Ok(codec.encode_frame(&NodeMessage::Close)?)).await;
                return Ok(());
            }
            _ = tx.closed() => return Ok(()),
            frame = frames.next() => frame,
        };

        let message = match frame {
            Some(Ok(Decoded::Message(message))) => message,
            Some(Ok(Decoded::Malformed(reason))) => {
                tracing::warn!("Malformed frame from {}: {}", peer, reason);
                // Answer anyway so the caller's FIFO stays aligned
                let frame = codec.encode_frame(&NodeMessage::error(reason))?;
                if tx.send(Ok(frame)).await.is_err() {
                    return Ok(());
                }
                continue;
            }
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
        };

        tracing::trace!("Received {} from {}", message.type_name(), peer);

        let response = match message {
            NodeMessage::Close => return Ok(()),
            NodeMessage::Handshake { ref address, .. } if address != peer => {
                let frame = codec.encode_frame(&NodeMessage::error(
                    "handshake does not match node identity",
                ))?;
                let _ = tx.send(Ok(frame)).await;
                return Err(Error::Unauthorized(format!(
                    "handshake from {} claimed {}",
                    peer, address
                )));
            }
            NodeMessage::Handshake { .. } => {
                if !handshaken {
                    handshaken = true;
                    messenger.register_inbound(peer).await;
                }
                handler.handle_message(message).await
            }
            _ if !handshaken => NodeMessage::error("handshake required"),
            message => handler.handle_message(message).await,
        };

        let frame = codec.encode_frame(&response)?;
        if tx.send(Ok(frame)).await.is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeIdentity;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle_message(&self, message: NodeMessage) -> NodeMessage {
            match message {
                NodeMessage::Handshake { .. } => NodeMessage::Handshake {
                    id: "node-1".into(),
                    address: "127.0.0.1:8081".into(),
                },
                _ => NodeMessage::Ack,
            }
        }
    }

    #[tokio::test]
    async fn test_inbound_registered_after_handshake() {
        let peer = "127.0.0.1:8082".to_string();
        let messenger = Arc::new(NodeMessenger::new(
            "node-1",
            NodeIdentity::new("0123456789abcdef0123", "127.0.0.1:8081"),
            Duration::from_secs(1),
            CancellationToken::new(),
        ));

        let (body_tx, body_rx) = mpsc::channel::<std::io::Result<Bytes>>(8);
        let response = messenger.serve_connection(
            Arc::new(Echo),
            peer.clone(),
            Body::from_stream(ReceiverStream::new(body_rx)),
        );
        let stream = response
            .into_body()
            .into_data_stream()
            .map_err(std::io::Error::other);
        let mut replies = FramedRead::new(
            StreamReader::new(stream),
            MessageCodec::new(messenger.pool()),
        );
        let mut codec = MessageCodec::new(messenger.pool());

        body_tx
            .send(Ok(codec.encode_frame(&NodeMessage::Ack).unwrap()))
            .await
            .unwrap();
        let reply = replies.next().await.unwrap().unwrap();
        assert!(matches!(reply, Decoded::Message(NodeMessage::Error { .. })));
        assert!(messenger.inbound_connections().await.is_empty());

        let handshake = NodeMessage::Handshake {
            id: "node-2".into(),
            address: peer.clone(),
        };
        body_tx
            .send(Ok(codec.encode_frame(&handshake).unwrap()))
            .await
            .unwrap();
        let reply = replies.next().await.unwrap().unwrap();
        assert!(matches!(reply, Decoded::Message(NodeMessage::Handshake { .. })));
        assert_eq!(messenger.inbound_connections().await, vec![peer]);

        // Hanging up mid-frame closes the connection cleanly
        let partial = codec.encode_frame(&NodeMessage::Ack).unwrap();
        body_tx.send(Ok(partial.slice(..3))).await.unwrap();
        drop(body_tx);
        assert!(replies.next().await.is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(messenger.inbound_connections().await.is_empty());
    }
}
