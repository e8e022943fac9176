// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for the worker pipe.
//!
//! Every envelope travels as one frame:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: message type
//! - N bytes: JSON payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload a frame may carry.
pub const MAX_FRAME_SIZE: usize = 64 << 20;

/// Length prefix plus message type.
pub const HEADER_SIZE: usize = size_of::<u32>() + size_of::<u16>();

/// Message types carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    /// Master asks the worker to run a function
    InvokeRequest = 1,
    /// Worker answers an invocation
    InvokeResponse = 2,
    /// Master issues a reload or shutdown
    ControlCommand = 3,
    /// Worker acknowledges a control command
    ControlAck = 4,
    /// Master heartbeat request
    Ping = 5,
    /// Worker heartbeat reply
    Pong = 6,
    /// First frame a worker sends once it can accept work
    Ready = 7,
}

impl MessageType {
    const ALL: [MessageType; 7] = [
        MessageType::InvokeRequest,
        MessageType::InvokeResponse,
        MessageType::ControlCommand,
        MessageType::ControlAck,
        MessageType::Ping,
        MessageType::Pong,
        MessageType::Ready,
    ];
}

impl TryFrom<u16> for MessageType {
    type Error = FrameError;

    fn try_from(tag: u16) -> Result<Self, FrameError> {
        Self::ALL
            .into_iter()
            .find(|kind| *kind as u16 == tag)
            .ok_or(FrameError::UnknownType(tag))
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("payload of {0} bytes exceeds the {MAX_FRAME_SIZE} byte frame limit")]
    Oversized(usize),

    #[error("unknown message type tag {0}")]
    UnknownType(u16),

    #[error("pipe ended inside a frame")]
    Truncated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer closed the pipe on a frame boundary.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    len: usize,
    message_type: MessageType,
}

impl Header {
    fn parse(raw: [u8; HEADER_SIZE]) -> Result<Self, FrameError> {
        let mut raw = &raw[..];
        let len = raw.get_u32() as usize;
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::Oversized(len));
        }
        let message_type = MessageType::try_from(raw.get_u16())?;
        Ok(Self { len, message_type })
    }
}

/// One typed JSON message on the pipe.
#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    /// Serialize `msg` as the payload of a `message_type` frame.
    pub fn new<M: Serialize>(message_type: MessageType, msg: &M) -> Result<Self, FrameError> {
        let payload = serde_json::to_vec(msg)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::Oversized(payload.len()));
        }
        Ok(Self {
            message_type,
            payload: payload.into(),
        })
    }

    pub fn decode<M: DeserializeOwned>(&self) -> Result<M, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Header and payload as they appear on the wire.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        out.put_u32(self.payload.len() as u32);
        out.put_u16(self.message_type as u16);
        out.extend_from_slice(&self.payload);
        out.freeze()
    }

    /// Split one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched while the frame is
    /// still incomplete.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        let Some(raw) = buf.get(..HEADER_SIZE) else {
            return Ok(None);
        };
        let mut head = [0u8; HEADER_SIZE];
        head.copy_from_slice(raw);
        let header = Header::parse(head)?;
        if buf.len() < HEADER_SIZE + header.len {
            return Ok(None);
        }
        buf.advance(HEADER_SIZE);
        Ok(Some(Self {
            message_type: header.message_type,
            payload: buf.split_to(header.len).freeze(),
        }))
    }
}

/// Write one frame and flush.
///
/// Pipes such as a child's stdin buffer writes, so every frame is flushed
/// before returning.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    writer.write_all(&frame.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. EOF before the first header byte is
/// [`FrameError::ConnectionClosed`]; EOF anywhere later is
/// [`FrameError::Truncated`].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut head = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        match reader.read(&mut head[filled..]).await? {
            0 if filled == 0 => return Err(FrameError::ConnectionClosed),
            0 => return Err(FrameError::Truncated),
            n => filled += n,
        }
    }
    let header = Header::parse(head)?;

    let mut payload = BytesMut::zeroed(header.len);
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(e)
        }
    })?;

    Ok(Frame {
        message_type: header.message_type,
        payload: payload.freeze(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping(n: u64) -> Frame {
        Frame::new(MessageType::Ping, &n).unwrap()
    }

    #[test]
    fn test_every_tag_maps_back() {
        for kind in MessageType::ALL {
            assert_eq!(MessageType::try_from(kind as u16).unwrap(), kind);
        }
        assert!(matches!(
            MessageType::try_from(0),
            Err(FrameError::UnknownType(0))
        ));
        assert!(MessageType::try_from(8).is_err());
    }

    #[test]
    fn test_wire_layout_is_big_endian() {
        let frame = Frame::new(MessageType::Ready, &"w").unwrap();
        let bytes = frame.to_bytes();
        assert_eq!(&bytes[..HEADER_SIZE], &[0, 0, 0, 3, 0, 7]);
        assert_eq!(&bytes[HEADER_SIZE..], b"\"w\"");
    }

    #[test]
    fn test_parse_waits_for_complete_frame() {
        let wire = ping(42).to_bytes();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&wire[..4]);
        assert!(Frame::parse(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&wire[4..wire.len() - 1]);
        assert!(Frame::parse(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), wire.len() - 1);

        buf.extend_from_slice(&wire[wire.len() - 1..]);
        let frame = Frame::parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.decode::<u64>().unwrap(), 42);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_leaves_following_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&ping(1).to_bytes());
        buf.extend_from_slice(&ping(2).to_bytes());

        let first = Frame::parse(&mut buf).unwrap().unwrap();
        let second = Frame::parse(&mut buf).unwrap().unwrap();
        assert_eq!(first.decode::<u64>().unwrap(), 1);
        assert_eq!(second.decode::<u64>().unwrap(), 2);
        assert!(Frame::parse(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_header_rejected_before_payload() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_SIZE as u32 + 1);
        buf.put_u16(MessageType::Pong as u16);
        assert!(matches!(
            Frame::parse(&mut buf),
            Err(FrameError::Oversized(n)) if n == MAX_FRAME_SIZE + 1
        ));
    }

    #[tokio::test]
    async fn test_eof_on_boundary_vs_inside_frame() {
        let mut empty: &[u8] = &[];
        assert!(matches!(
            read_frame(&mut empty).await,
            Err(FrameError::ConnectionClosed)
        ));

        let wire = ping(7).to_bytes();
        let mut partial_header = &wire[..3];
        assert!(matches!(
            read_frame(&mut partial_header).await,
            Err(FrameError::Truncated)
        ));
        let mut partial_payload = &wire[..wire.len() - 1];
        assert!(matches!(
            read_frame(&mut partial_payload).await,
            Err(FrameError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_small_pipe_carries_large_frame() {
        let (mut tx, mut rx) = tokio::io::duplex(16);
        let body = "x".repeat(4096);
        let frame = Frame::new(MessageType::InvokeResponse, &body).unwrap();

        let writer = tokio::spawn(async move { write_frame(&mut tx, &frame).await });
        let read = read_frame(&mut rx).await.unwrap();
        writer.await.unwrap().unwrap();

        assert_eq!(read.message_type, MessageType::InvokeResponse);
        assert_eq!(read.decode::<String>().unwrap(), body);
    }
}
