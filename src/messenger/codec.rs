//! Frame codec
//!
//! Frame layout: `[type u8][length u32 LE][crc32 u32 LE][payload]`, where the
//! payload is the bincode encoding of a `NodeMessage`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::{Arc, Mutex};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{MessageType, NodeMessage};
use crate::error::{Error, Result};

/// Default upper bound on a single frame payload
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Wire tag
    pub tag: u8,
    /// Payload length
    pub length: u32,
    /// Payload checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 9;

    /// Create a header for a payload
    pub fn new(tag: MessageType, payload: &[u8]) -> Self {
        Self {
            tag: tag as u8,
            length: payload.len() as u32,
            checksum: crc32fast::hash(payload),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.tag;
        bytes[1..5].copy_from_slice(&self.length.to_le_bytes());
        bytes[5..9].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Parse a header from the front of `bytes` (needs at least `SIZE` bytes)
    pub fn parse(mut bytes: &[u8]) -> Self {
        let tag = bytes.get_u8();
        let length = bytes.get_u32_le();
        let checksum = bytes.get_u32_le();
        Self {
            tag,
            length,
            checksum,
        }
    }
}

/// Reusable encode buffers
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        })
    }

    /// Take a cleared buffer out of the pool
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buffer = self
            .buffers
            .lock()
            .ok()
            .and_then(|mut buffers| buffers.pop())
            .unwrap_or_default();
        PooledBuffer {
            buffer,
            pool: Arc::clone(self),
        }
    }

    /// Buffers currently idle in the pool
    pub fn available(&self) -> usize {
        self.buffers.lock().map(|b| b.len()).unwrap_or(0)
    }

    fn release(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        if let Ok(mut buffers) = self.buffers.lock() {
            if buffers.len() < self.capacity {
                buffers.push(buffer);
            }
        }
    }
}

/// A buffer borrowed from a `BufferPool`; returned once on drop
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buffer
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buffer));
    }
}

/// Result of decoding one frame
#[derive(Debug)]
pub enum Decoded {
    /// A well-formed message
    Message(NodeMessage),
    /// A complete frame that could not be trusted; the stream stays usable
    Malformed(String),
}

/// Codec for `NodeMessage` frames
pub struct MessageCodec {
    pool: Arc<BufferPool>,
    max_frame_size: usize,
}

impl MessageCodec {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Encode a single message into a standalone frame
    pub fn encode_frame(&mut self, message: &NodeMessage) -> Result<Bytes> {
        let mut dst = BytesMut::new();
        self.encode_message(message, &mut dst)?;
        Ok(dst.freeze())
    }

    fn encode_message(&mut self, message: &NodeMessage, dst: &mut BytesMut) -> Result<()> {
        let mut payload = self.pool.acquire();
        bincode::serialize_into(&mut *payload, message)?;

        if payload.len() > self.max_frame_size {
            return Err(Error::Frame(format!(
                "{} frame of {} bytes exceeds limit of {}",
                message.type_name(),
                payload.len(),
                self.max_frame_size
            )));
        }

        let header = FrameHeader::new(message.message_type(), &payload);
        dst.reserve(FrameHeader::SIZE + payload.len());
        dst.put_slice(&header.to_bytes());
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Encoder<NodeMessage> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, message: NodeMessage, dst: &mut BytesMut) -> Result<()> {
        self.encode_message(&message, dst)
    }
}

impl Decoder for MessageCodec {
    type Item = Decoded;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>> {
        if src.len() < FrameHeader::SIZE {
            return Ok(None);
        }

        let header = FrameHeader::parse(&src[..FrameHeader::SIZE]);
        let length = header.length as usize;
        if length > self.max_frame_size {
            return Err(Error::Frame(format!(
                "frame of {} bytes exceeds limit of {}",
                length, self.max_frame_size
            )));
        }

        if src.len() < FrameHeader::SIZE + length {
            src.reserve(FrameHeader::SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(FrameHeader::SIZE);
        let payload = src.split_to(length);

        if crc32fast::hash(&payload) != header.checksum {
            return Ok(Some(Decoded::Malformed("checksum mismatch".into())));
        }

        let tag = match MessageType::try_from(header.tag) {
            Ok(tag) => tag,
            Err(unknown) => {
                return Ok(Some(Decoded::Malformed(format!("unknown message type {}", unknown))))
            }
        };

        let message: NodeMessage = match bincode::deserialize(&payload) {
            Ok(message) => message,
            Err(e) => return Ok(Some(Decoded::Malformed(format!("undecodable payload: {}", e)))),
        };

        if message.message_type() != tag {
            return Ok(Some(Decoded::Malformed(format!(
                "tag {:?} does not match {} payload",
                tag,
                message.type_name()
            ))));
        }

        Ok(Some(Decoded::Message(message)))
    }

    /// A peer that hangs up mid-frame ends the stream like a clean close
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>> {
        if let Some(decoded) = self.decode(src)? {
            return Ok(Some(decoded));
        }
        if !src.is_empty() {
            tracing::debug!("Stream ended with {} bytes of a partial frame", src.len());
            src.clear();
        }
        Ok(None)
    }
}
