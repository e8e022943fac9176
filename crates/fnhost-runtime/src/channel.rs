// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Master end of a worker's IPC channel.
//!
//! Requests are correlated to replies through a table of single-use
//! completion slots keyed by correlation id. Ids come from a per-channel
//! counter and are never reused, so a reply arriving after its caller gave
//! up finds no slot and is dropped as stale.
//!
//! When the reader sees EOF (or a write fails) the channel closes: every
//! pending slot is dropped, which wakes its caller with
//! [`ChannelError::Closed`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fnhost_protocol::{
    ControlAck, ControlCommand, ControlKind, CorrelationId, Envelope, FrameError, FunctionEntry,
    InvokeRequest, InvokeResponse, MessageType, Ping, Pong, Ready, read_frame, write_frame,
};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors from channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The worker end is gone (EOF, write failure, or closed by the master).
    #[error("worker channel closed")]
    Closed,

    /// No matching reply before the deadline.
    #[error("timed out waiting for worker reply")]
    Timeout,

    /// The worker did not open with a `Ready` frame.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A reply of the wrong kind arrived for a request.
    #[error("unexpected reply: {0:?}")]
    UnexpectedReply(MessageType),

    /// Encoding or decoding failed.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The master's view of one worker pipe.
pub struct WorkerChannel {
    ready: Ready,
    writer: tokio::sync::Mutex<BoxWriter>,
    pending: Mutex<HashMap<CorrelationId, oneshot::Sender<Envelope>>>,
    next_id: AtomicU64,
    stale: AtomicU64,
    closed: CancellationToken,
}

/// Removes a pending slot when its caller stops waiting.
struct PendingSlot<'a> {
    channel: &'a WorkerChannel,
    id: CorrelationId,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.channel.pending().remove(&self.id);
    }
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("project", &self.ready.project)
            .field("pid", &self.ready.pid)
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl WorkerChannel {
    /// Wait for the worker's `Ready` frame, then start routing replies.
    pub async fn establish<R, W>(
        reader: R,
        writer: W,
        ready_timeout: Duration,
    ) -> Result<Arc<Self>, ChannelError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut reader = reader;
        let frame = tokio::time::timeout(ready_timeout, read_frame(&mut reader))
            .await
            .map_err(|_| ChannelError::Timeout)?
            .map_err(|e| match e {
                FrameError::ConnectionClosed => ChannelError::Closed,
                other => ChannelError::Frame(other),
            })?;

        let ready = match Envelope::from_frame(&frame)? {
            Envelope::Ready(ready) => ready,
            other => {
                return Err(ChannelError::Handshake(format!(
                    "expected Ready, got {:?}",
                    other.message_type()
                )));
            }
        };

        let channel = Arc::new(Self {
            ready,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stale: AtomicU64::new(0),
            closed: CancellationToken::new(),
        });

        tokio::spawn(channel.clone().read_loop(reader));
        Ok(channel)
    }

    /// The handshake the worker opened with.
    pub fn ready(&self) -> &Ready {
        &self.ready
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Replies that arrived with no waiter.
    pub fn stale_replies(&self) -> u64 {
        self.stale.load(Ordering::SeqCst)
    }

    /// Close the channel and fail every pending request with `Closed`.
    pub fn close(&self) {
        self.closed.cancel();
        let drained: Vec<_> = self.pending().drain().collect();
        if !drained.is_empty() {
            debug!(
                project = %self.ready.project,
                pending = drained.len(),
                "Failing pending requests on closed channel"
            );
        }
    }

    /// Run `function` in the worker; waits at most `wait`.
    pub async fn invoke(
        &self,
        function: &str,
        payload: Value,
        deadline: DateTime<Utc>,
        wait: Duration,
    ) -> Result<InvokeResponse, ChannelError> {
        let reply = self
            .call(
                |correlation_id| {
                    Envelope::InvokeRequest(InvokeRequest {
                        correlation_id,
                        function: function.to_string(),
                        payload,
                        issued_at: Utc::now(),
                        deadline,
                    })
                },
                wait,
            )
            .await?;
        match reply {
            Envelope::InvokeResponse(response) => Ok(response),
            other => Err(ChannelError::UnexpectedReply(other.message_type())),
        }
    }

    /// Send a control command and wait for its ack.
    pub async fn control(
        &self,
        kind: ControlKind,
        version: u64,
        functions: Vec<FunctionEntry>,
        wait: Duration,
    ) -> Result<ControlAck, ChannelError> {
        let reply = self
            .call(
                |correlation_id| {
                    Envelope::ControlCommand(ControlCommand {
                        correlation_id,
                        kind,
                        version,
                        functions,
                    })
                },
                wait,
            )
            .await?;
        match reply {
            Envelope::ControlAck(ack) => Ok(ack),
            other => Err(ChannelError::UnexpectedReply(other.message_type())),
        }
    }

    pub async fn ping(&self, wait: Duration) -> Result<Pong, ChannelError> {
        let reply = self
            .call(
                |correlation_id| Envelope::Ping(Ping { correlation_id }),
                wait,
            )
            .await?;
        match reply {
            Envelope::Pong(pong) => Ok(pong),
            other => Err(ChannelError::UnexpectedReply(other.message_type())),
        }
    }

    /// Register a slot under a fresh id, send the request built for that id,
    /// and wait for the matching reply.
    async fn call<F>(&self, build: F, wait: Duration) -> Result<Envelope, ChannelError>
    where
        F: FnOnce(CorrelationId) -> Envelope,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);
        let _slot = PendingSlot { channel: self, id };

        // Checked after inserting so a concurrent close cannot miss the slot.
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        self.send(&build(id)).await?;

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => Err(ChannelError::Timeout),
        }
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        let frame = envelope.to_frame()?;
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        if let Err(e) = write_frame(&mut *writer, &frame).await {
            warn!(project = %self.ready.project, error = %e, "Write to worker failed");
            self.close();
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    async fn read_loop<R>(self: Arc<Self>, mut reader: R)
    where
        R: AsyncRead + Send + Unpin,
    {
        loop {
            let result = tokio::select! {
                _ = self.closed.cancelled() => break,
                result = read_frame(&mut reader) => result,
            };

            let frame = match result {
                Ok(frame) => frame,
                Err(FrameError::ConnectionClosed) => {
                    debug!(project = %self.ready.project, "Worker closed its end");
                    break;
                }
                Err(e) => {
                    warn!(project = %self.ready.project, error = %e, "Worker channel broken");
                    break;
                }
            };

            match Envelope::from_frame(&frame) {
                Ok(envelope) => self.route(envelope),
                Err(e) => {
                    warn!(project = %self.ready.project, error = %e, "Dropping undecodable frame")
                }
            }
        }

        self.close();
    }

    fn route(&self, envelope: Envelope) {
        let Some(id) = envelope.correlation_id().filter(|_| envelope.is_reply()) else {
            warn!(
                project = %self.ready.project,
                message_type = ?envelope.message_type(),
                "Ignoring unsolicited envelope"
            );
            return;
        };

        let waiter = self.pending().remove(&id);
        match waiter {
            Some(tx) => {
                // The caller may have timed out between lookup and send.
                if tx.send(envelope).is_err() {
                    self.stale.fetch_add(1, Ordering::SeqCst);
                }
            }
            None => {
                self.stale.fetch_add(1, Ordering::SeqCst);
                debug!(project = %self.ready.project, correlation_id = id, "Dropping stale reply");
            }
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<CorrelationId, oneshot::Sender<Envelope>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
