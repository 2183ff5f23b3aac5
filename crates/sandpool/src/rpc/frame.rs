//! Length-prefixed frames over a byte stream.
//!
//! Format: `[len: u32 BE][type: u8][request id: u64 BE][payload: JSON]`,
//! where `len` counts everything after itself.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::{Error, Result};

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Type byte plus request id
const HEADER_LEN: usize = 1 + 8;

/// Message types for the RPC protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Requests
    Execute = 1,
    ListCurrentExecutions = 2,
    CancelWorkerExecutions = 3,
    QueryWorkerDb = 4,
    NotifyWorkerReady = 5,

    // Responses
    Reply = 64,
    Fault = 65,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::Execute),
            2 => Ok(MessageType::ListCurrentExecutions),
            3 => Ok(MessageType::CancelWorkerExecutions),
            4 => Ok(MessageType::QueryWorkerDb),
            5 => Ok(MessageType::NotifyWorkerReady),
            64 => Ok(MessageType::Reply),
            65 => Ok(MessageType::Fault),
            _ => Err(Error::Protocol(format!("Unknown message type: {}", value))),
        }
    }
}

/// One message on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub request_id: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MessageType, request_id: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            request_id,
            payload,
        }
    }

    /// Build a frame with a JSON payload
    pub fn json<T: Serialize>(msg_type: MessageType, request_id: u64, data: &T) -> Result<Self> {
        Ok(Self::new(msg_type, request_id, serde_json::to_vec(data)?))
    }

    /// Parse payload as JSON
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Writes frames to a stream
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        let body_len = HEADER_LEN + frame.payload.len();
        if body_len > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!(
                "Frame of {} bytes exceeds limit of {}",
                body_len, MAX_FRAME_LEN
            )));
        }

        let mut buf = Vec::with_capacity(4 + body_len);
        buf.extend_from_slice(&(body_len as u32).to_be_bytes());
        buf.push(frame.msg_type as u8);
        buf.extend_from_slice(&frame.request_id.to_be_bytes());
        buf.extend_from_slice(&frame.payload);

        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Reads frames from a stream
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Receive the next frame; `None` on a clean end of stream.
    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        // Read length (4 bytes, big-endian)
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        if len < HEADER_LEN {
            return Err(Error::Protocol(format!("Frame too short: {} bytes", len)));
        }
        if len > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!(
                "Frame of {} bytes exceeds limit of {}",
                len, MAX_FRAME_LEN
            )));
        }

        let mut header = [0u8; HEADER_LEN];
        self.inner.read_exact(&mut header).await?;
        let msg_type = MessageType::try_from(header[0])?;
        let mut id_buf = [0u8; 8];
        id_buf.copy_from_slice(&header[1..]);
        let request_id = u64::from_be_bytes(id_buf);

        let mut payload = vec![0u8; len - HEADER_LEN];
        if !payload.is_empty() {
            self.inner.read_exact(&mut payload).await?;
        }

        Ok(Some(Frame::new(msg_type, request_id, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_a_stream_in_order() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer
            .send(&Frame::json(MessageType::Execute, 7, &serde_json::json!({"a": 1})).unwrap())
            .await
            .unwrap();
        writer
            .send(&Frame::new(MessageType::ListCurrentExecutions, 8, Vec::new()))
            .await
            .unwrap();
        drop(writer);

        let first = reader.recv().await.unwrap().unwrap();
        assert_eq!(first.msg_type, MessageType::Execute);
        assert_eq!(first.request_id, 7);
        assert_eq!(first.parse_json::<serde_json::Value>().unwrap()["a"], 1);

        let second = reader.recv().await.unwrap().unwrap();
        assert_eq!(second.msg_type, MessageType::ListCurrentExecutions);
        assert!(second.payload.is_empty());

        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_header_layout() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(client);
        writer
            .send(&Frame::new(MessageType::Reply, 0x0102, b"{}".to_vec()))
            .await
            .unwrap();

        let mut raw = [0u8; 15];
        server.read_exact(&mut raw).await.unwrap();
        assert_eq!(&raw[..4], &11u32.to_be_bytes());
        assert_eq!(raw[4], 64);
        assert_eq!(&raw[5..13], &0x0102u64.to_be_bytes());
        assert_eq!(&raw[13..], b"{}");
    }

    #[tokio::test]
    async fn test_rejects_oversized_and_unknown_frames() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);
        client
            .write_all(&((MAX_FRAME_LEN + 1) as u32).to_be_bytes())
            .await
            .unwrap();
        assert!(matches!(reader.recv().await, Err(Error::Protocol(_))));

        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);
        let mut raw = 9u32.to_be_bytes().to_vec();
        raw.push(99);
        raw.extend_from_slice(&1u64.to_be_bytes());
        client.write_all(&raw).await.unwrap();
        assert!(matches!(reader.recv().await, Err(Error::Protocol(_))));
    }
}
