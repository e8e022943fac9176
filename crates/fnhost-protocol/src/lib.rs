// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fnhost Protocol - master ↔ worker IPC
//!
//! This crate defines what travels over the pipe between the fnhost master
//! and each per-project worker process.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     fnhost-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Envelopes: invoke request/response, control command/ack,   │
//! │             ping/pong, ready handshake                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: JSON (serde_json)                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: u32 length + u16 type header                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: worker stdin/stdout (any AsyncRead/AsyncWrite)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use fnhost_protocol::{Envelope, Ping, read_frame, write_frame};
//!
//! let ping = Envelope::Ping(Ping { correlation_id: 1 });
//! write_frame(&mut stdin, &ping.to_frame()?).await?;
//!
//! let reply = Envelope::from_frame(&read_frame(&mut stdout).await?)?;
//! ```

pub mod artifact;
pub mod envelope;
pub mod frame;

pub use artifact::{
    ARTIFACT_FILE, ArtifactError, EXEC_ENTRY_FILE, FunctionArtifact, FunctionCode, MANIFEST_FILE,
};
pub use envelope::{
    AckResult, ControlAck, ControlCommand, ControlKind, CorrelationId, Envelope, FunctionEntry,
    InvokeErrorKind, InvokeOutcome, InvokeRequest, InvokeResponse, Ping, Pong, Ready,
};
pub use frame::{Frame, FrameError, HEADER_SIZE, MAX_FRAME_SIZE, MessageType, read_frame, write_frame};
