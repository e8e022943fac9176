// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed envelopes exchanged over a worker pipe.
//!
//! Every request-like envelope carries a `correlation_id` chosen by the master;
//! the worker copies it into the matching reply. Ids are never reused on a
//! channel, so a reply that arrives after its waiter gave up can be recognised
//! and dropped.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frame::{Frame, FrameError, MessageType};

/// Token linking a request to its reply on one channel.
pub type CorrelationId = u64;

/// Master → worker: run `function` with `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub correlation_id: CorrelationId,
    pub function: String,
    pub payload: Value,
    pub issued_at: DateTime<Utc>,
    /// The worker gives up on the call once this passes.
    pub deadline: DateTime<Utc>,
}

/// Worker → master: result of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub correlation_id: CorrelationId,
    /// Deployment version of the dispatch table that served the call.
    pub version: u64,
    pub outcome: InvokeOutcome,
    pub completed_at: DateTime<Utc>,
}

/// Result-or-error payload of an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvokeOutcome {
    Success { result: Value },
    Error { kind: InvokeErrorKind, message: String },
}

/// Failure classes a worker can report for an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokeErrorKind {
    /// No entry point with that name in the current dispatch table.
    FunctionNotFound,
    /// The function ran and returned an error.
    Failed,
    /// The request deadline passed before the function finished.
    DeadlineExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Reload,
    Shutdown,
}

impl std::fmt::Display for ControlKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlKind::Reload => write!(f, "reload"),
            ControlKind::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// One entry of the function table shipped with a reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionEntry {
    pub name: String,
    /// Directory holding `artifact.json` for the active version.
    pub artifact_dir: PathBuf,
    /// Provisioned dependency environment, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_dir: Option<PathBuf>,
}

/// Master → worker lifecycle command.
///
/// A reload carries the complete table for `version`; functions absent from
/// `functions` are gone once the worker acknowledges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    pub correlation_id: CorrelationId,
    pub kind: ControlKind,
    pub version: u64,
    #[serde(default)]
    pub functions: Vec<FunctionEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AckResult {
    Ok,
    Error { message: String },
}

/// Worker → master acknowledgement of a [`ControlCommand`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlAck {
    pub correlation_id: CorrelationId,
    pub kind: ControlKind,
    pub version: u64,
    pub result: AckResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub correlation_id: CorrelationId,
    /// Version of the dispatch table the worker is serving.
    pub version: u64,
    /// Invocations accepted but not yet answered.
    pub in_flight: u64,
}

/// Handshake frame; the worker sends it once before anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ready {
    pub pid: u32,
    pub project: String,
}

/// Any message that can cross a worker pipe.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    InvokeRequest(InvokeRequest),
    InvokeResponse(InvokeResponse),
    ControlCommand(ControlCommand),
    ControlAck(ControlAck),
    Ping(Ping),
    Pong(Pong),
    Ready(Ready),
}

impl Envelope {
    pub fn message_type(&self) -> MessageType {
        match self {
            Envelope::InvokeRequest(_) => MessageType::InvokeRequest,
            Envelope::InvokeResponse(_) => MessageType::InvokeResponse,
            Envelope::ControlCommand(_) => MessageType::ControlCommand,
            Envelope::ControlAck(_) => MessageType::ControlAck,
            Envelope::Ping(_) => MessageType::Ping,
            Envelope::Pong(_) => MessageType::Pong,
            Envelope::Ready(_) => MessageType::Ready,
        }
    }

    /// The correlation id, for every kind except the handshake.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Envelope::InvokeRequest(m) => Some(m.correlation_id),
            Envelope::InvokeResponse(m) => Some(m.correlation_id),
            Envelope::ControlCommand(m) => Some(m.correlation_id),
            Envelope::ControlAck(m) => Some(m.correlation_id),
            Envelope::Ping(m) => Some(m.correlation_id),
            Envelope::Pong(m) => Some(m.correlation_id),
            Envelope::Ready(_) => None,
        }
    }

    /// Whether this envelope answers an earlier request.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            Envelope::InvokeResponse(_) | Envelope::ControlAck(_) | Envelope::Pong(_)
        )
    }

    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        let message_type = self.message_type();
        match self {
            Envelope::InvokeRequest(m) => Frame::new(message_type, m),
            Envelope::InvokeResponse(m) => Frame::new(message_type, m),
            Envelope::ControlCommand(m) => Frame::new(message_type, m),
            Envelope::ControlAck(m) => Frame::new(message_type, m),
            Envelope::Ping(m) => Frame::new(message_type, m),
            Envelope::Pong(m) => Frame::new(message_type, m),
            Envelope::Ready(m) => Frame::new(message_type, m),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        Ok(match frame.message_type {
            MessageType::InvokeRequest => Envelope::InvokeRequest(frame.decode()?),
            MessageType::InvokeResponse => Envelope::InvokeResponse(frame.decode()?),
            MessageType::ControlCommand => Envelope::ControlCommand(frame.decode()?),
            MessageType::ControlAck => Envelope::ControlAck(frame.decode()?),
            MessageType::Ping => Envelope::Ping(frame.decode()?),
            MessageType::Pong => Envelope::Pong(frame.decode()?),
            MessageType::Ready => Envelope::Ready(frame.decode()?),
        })
    }
}
