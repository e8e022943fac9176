// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker serve loop.
//!
//! [`WorkerRuntime::serve`] owns one channel to the master:
//!
//! 1. Sends `Ready` as the first frame.
//! 2. Reads envelopes in order. Invocations are spawned onto a task tracker
//!    with the dispatch table snapshot taken at read time. Pings are answered
//!    inline. Reloads are queued to a single reload task that builds the new
//!    table, swaps it in, and only then writes the ack, so requests read
//!    while a build is running are still served by the old table.
//! 3. On `Shutdown` stops reading, finishes queued reloads, drains every
//!    accepted invocation, then acks.
//!
//! All replies go through a bounded queue to a single writer task. A full
//! queue is retried a bounded number of times before the reply is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use fnhost_protocol::{
    AckResult, ControlAck, ControlCommand, ControlKind, Envelope, Frame, FrameError,
    InvokeErrorKind, InvokeOutcome, InvokeRequest, InvokeResponse, Pong, Ready, read_frame,
    write_frame,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::loader::FunctionLoader;
use crate::table::DispatchTable;

/// Why a reply could not be queued.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SendFailure {
    /// The queue stayed full for every attempt.
    Abandoned,
    /// The writer task is gone.
    Closed,
}

/// Sending half of the outbound queue with bounded retry on a full queue.
#[derive(Clone)]
pub(crate) struct Outbound {
    tx: mpsc::Sender<Envelope>,
    attempts: u32,
    backoff: Duration,
}

impl Outbound {
    pub(crate) fn new(tx: mpsc::Sender<Envelope>, attempts: u32, backoff: Duration) -> Self {
        Self {
            tx,
            attempts: attempts.max(1),
            backoff,
        }
    }

    pub(crate) async fn send(&self, envelope: Envelope) -> std::result::Result<(), SendFailure> {
        let mut envelope = envelope;
        for attempt in 1..=self.attempts {
            match self.tx.try_send(envelope) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(SendFailure::Closed),
                Err(mpsc::error::TrySendError::Full(returned)) => {
                    envelope = returned;
                    if attempt < self.attempts {
                        warn!(
                            attempt,
                            max_attempts = self.attempts,
                            "Outbound queue full, retrying"
                        );
                        tokio::time::sleep(self.backoff * attempt).await;
                    }
                }
            }
        }
        Err(SendFailure::Abandoned)
    }
}

/// Serves one project's functions over a master channel.
pub struct WorkerRuntime {
    config: WorkerConfig,
    loader: Arc<dyn FunctionLoader>,
    table: RwLock<Arc<DispatchTable>>,
    permits: Semaphore,
    in_flight: AtomicU64,
}

impl WorkerRuntime {
    pub fn new(config: WorkerConfig, loader: Arc<dyn FunctionLoader>) -> Self {
        let permits = Semaphore::new(config.concurrency.max(1));
        Self {
            config,
            loader,
            table: RwLock::new(Arc::new(DispatchTable::empty())),
            permits,
            in_flight: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Version of the table currently serving new requests.
    pub fn version(&self) -> u64 {
        self.snapshot().version()
    }

    /// Invocations accepted but not yet answered.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Current dispatch table.
    pub fn snapshot(&self) -> Arc<DispatchTable> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run until the master sends `Shutdown` or closes the channel.
    pub async fn serve<R, W>(self: Arc<Self>, mut reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let writer_task = tokio::spawn(write_loop(writer, rx));
        let outbound = Outbound::new(tx, self.config.send_attempts, self.config.send_backoff);
        let tracker = TaskTracker::new();
        let (reloads, pending) = mpsc::unbounded_channel();
        tracker.spawn(Arc::clone(&self).reload_loop(pending, outbound.clone()));

        let ready = Envelope::Ready(Ready {
            pid: std::process::id(),
            project: self.config.project.clone(),
        });
        let result = match outbound.send(ready).await {
            Ok(()) => {
                info!(
                    project = %self.config.project,
                    concurrency = self.config.concurrency,
                    "Worker ready"
                );
                self.read_loop(&mut reader, &outbound, &tracker, reloads)
                    .await
            }
            Err(_) => {
                drop(reloads);
                Err(WorkerError::ChannelClosed)
            }
        };

        tracker.close();
        tracker.wait().await;
        drop(outbound);

        if let Err(e) = writer_task.await {
            error!("Writer task panicked: {}", e);
        }

        info!(project = %self.config.project, "Worker stopped");
        result
    }

    async fn read_loop<R>(
        self: &Arc<Self>,
        reader: &mut R,
        outbound: &Outbound,
        tracker: &TaskTracker,
        reloads: mpsc::UnboundedSender<ControlCommand>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        loop {
            let frame = match read_frame(reader).await {
                Ok(frame) => frame,
                Err(FrameError::ConnectionClosed) => {
                    info!("Master closed the channel");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            let envelope = match Envelope::from_frame(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(message_type = ?frame.message_type, error = %e, "Dropping undecodable frame");
                    continue;
                }
            };

            match envelope {
                Envelope::InvokeRequest(request) => self.accept(request, outbound, tracker),
                Envelope::ControlCommand(command) => match command.kind {
                    ControlKind::Reload => {
                        if reloads.send(command).is_err() {
                            return Err(WorkerError::ChannelClosed);
                        }
                    }
                    ControlKind::Shutdown => {
                        info!(in_flight = self.in_flight(), "Shutdown requested, draining");
                        drop(reloads);
                        tracker.close();
                        tracker.wait().await;
                        let ack = ControlAck {
                            correlation_id: command.correlation_id,
                            kind: ControlKind::Shutdown,
                            version: self.version(),
                            result: AckResult::Ok,
                        };
                        reply(outbound, Envelope::ControlAck(ack)).await?;
                        return Ok(());
                    }
                },
                Envelope::Ping(ping) => {
                    let pong = Pong {
                        correlation_id: ping.correlation_id,
                        version: self.version(),
                        in_flight: self.in_flight(),
                    };
                    reply(outbound, Envelope::Pong(pong)).await?;
                }
                other => {
                    warn!(message_type = ?other.message_type(), "Ignoring unexpected envelope");
                }
            }
        }
    }

    fn accept(self: &Arc<Self>, request: InvokeRequest, outbound: &Outbound, tracker: &TaskTracker) {
        let table = self.snapshot();
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let this = Arc::clone(self);
        let outbound = outbound.clone();
        tracker.spawn(async move {
            let correlation_id = request.correlation_id;
            let response = this.execute(&table, request).await;
            if let Err(failure) = outbound.send(Envelope::InvokeResponse(response)).await {
                error!(correlation_id, ?failure, "Invocation response abandoned");
            }
            this.in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn execute(&self, table: &DispatchTable, request: InvokeRequest) -> InvokeResponse {
        let InvokeRequest {
            correlation_id,
            function,
            payload,
            deadline,
            ..
        } = request;

        let outcome = match table.get(&function) {
            None => InvokeOutcome::Error {
                kind: InvokeErrorKind::FunctionNotFound,
                message: format!("function not found: {}", function),
            },
            Some(handler) => {
                let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                let work = async {
                    let _permit = self.permits.acquire().await.map_err(|e| e.to_string())?;
                    handler.call(payload).await
                };
                match tokio::time::timeout(remaining, work).await {
                    Ok(Ok(result)) => InvokeOutcome::Success { result },
                    Ok(Err(message)) => InvokeOutcome::Error {
                        kind: InvokeErrorKind::Failed,
                        message,
                    },
                    Err(_) => InvokeOutcome::Error {
                        kind: InvokeErrorKind::DeadlineExceeded,
                        message: format!("deadline exceeded for {}", function),
                    },
                }
            }
        };

        debug!(correlation_id, function = %function, version = table.version(), "Invocation finished");

        InvokeResponse {
            correlation_id,
            version: table.version(),
            outcome,
            completed_at: Utc::now(),
        }
    }

    /// Applies reloads one at a time in arrival order.
    async fn reload_loop(
        self: Arc<Self>,
        mut pending: mpsc::UnboundedReceiver<ControlCommand>,
        outbound: Outbound,
    ) {
        while let Some(command) = pending.recv().await {
            let ack = self.reload(&command).await;
            if let Err(failure) = outbound.send(Envelope::ControlAck(ack)).await {
                error!(version = command.version, ?failure, "Reload ack abandoned");
            }
        }
    }

    async fn reload(&self, command: &ControlCommand) -> ControlAck {
        let current = self.snapshot();

        let result = if command.version < current.version() {
            AckResult::Error {
                message: format!(
                    "stale reload: version {} is older than served version {}",
                    command.version,
                    current.version()
                ),
            }
        } else {
            match DispatchTable::build(
                Some(&current),
                command.version,
                &command.functions,
                self.loader.as_ref(),
            )
            .await
            {
                Ok(table) => {
                    let names = table.len();
                    *self.table.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(table);
                    info!(version = command.version, functions = names, "Dispatch table swapped");
                    AckResult::Ok
                }
                Err(e) => AckResult::Error {
                    message: e.to_string(),
                },
            }
        };

        if let AckResult::Error { message } = &result {
            warn!(version = command.version, error = %message, "Reload rejected, keeping current table");
        }

        ControlAck {
            correlation_id: command.correlation_id,
            kind: ControlKind::Reload,
            version: command.version,
            result,
        }
    }
}

async fn reply(outbound: &Outbound, envelope: Envelope) -> Result<()> {
    match outbound.send(envelope).await {
        Ok(()) => Ok(()),
        Err(SendFailure::Closed) => Err(WorkerError::ChannelClosed),
        Err(SendFailure::Abandoned) => {
            error!("Control reply abandoned, outbound queue full");
            Ok(())
        }
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<Envelope>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = rx.recv().await {
        let Some(frame) = encode(envelope) else {
            continue;
        };
        if let Err(e) = write_frame(&mut writer, &frame).await {
            error!(error = %e, "Failed to write to master, closing channel");
            break;
        }
    }
}

/// Encode an outbound envelope. An invocation result that cannot be framed
/// is replaced by a failure reply so the caller is not left waiting.
fn encode(envelope: Envelope) -> Option<Frame> {
    let e = match envelope.to_frame() {
        Ok(frame) => return Some(frame),
        Err(e) => e,
    };
    let Envelope::InvokeResponse(response) = envelope else {
        error!(error = %e, "Failed to encode envelope");
        return None;
    };

    warn!(
        correlation_id = response.correlation_id,
        error = %e,
        "Invocation result not encodable, replying with failure"
    );
    let message = match e {
        FrameError::Oversized(_) => format!("response too large: {}", e),
        other => format!("response could not be encoded: {}", other),
    };
    let fallback = Envelope::InvokeResponse(InvokeResponse {
        outcome: InvokeOutcome::Error {
            kind: InvokeErrorKind::Failed,
            message,
        },
        ..response
    });
    match fallback.to_frame() {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!(error = %e, "Failed to encode failure reply");
            None
        }
    }
}
