// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Global admission control for invocations.
//!
//! A counting semaphore with `capacity` permits plus a bounded wait set of
//! `backlog` callers. Callers beyond both are rejected without waiting.
//! Waiters are served in arrival order: the tokio semaphore hands released
//! permits to queued waiters before any new `try_acquire` can take them.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Errors from [`AdmissionController::acquire`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    /// Ceiling and backlog are both full.
    #[error("admission rejected: concurrency ceiling and backlog exhausted")]
    Rejected,

    /// The caller waited in the backlog until its deadline.
    #[error("deadline elapsed while waiting for admission")]
    DeadlineElapsed,
}

/// One slot of the global concurrency budget. Released on drop.
#[derive(Debug)]
pub struct Ticket {
    _permit: OwnedSemaphorePermit,
}

/// Bounded semaphore with a bounded wait queue.
#[derive(Debug)]
pub struct AdmissionController {
    permits: Arc<Semaphore>,
    capacity: usize,
    backlog: usize,
    waiting: AtomicUsize,
}

/// Leaves the wait set on every exit path.
struct WaitSlot<'a>(&'a AtomicUsize);

impl Drop for WaitSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionController {
    pub fn new(capacity: usize, backlog: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            backlog,
            waiting: AtomicUsize::new(0),
        }
    }

    /// Take a ticket, waiting in the backlog until `deadline` if needed.
    pub async fn acquire(&self, deadline: Instant) -> Result<Ticket, AdmissionError> {
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(Ticket { _permit: permit });
        }

        self.waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                (w < self.backlog).then_some(w + 1)
            })
            .map_err(|_| AdmissionError::Rejected)?;
        let _slot = WaitSlot(&self.waiting);

        match tokio::time::timeout_at(deadline, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(Ticket { _permit: permit }),
            // The semaphore is never closed.
            Ok(Err(_)) => Err(AdmissionError::Rejected),
            Err(_) => Err(AdmissionError::DeadlineElapsed),
        }
    }

    /// Give a ticket back. Dropping it does the same.
    pub fn release(&self, ticket: Ticket) {
        drop(ticket);
    }

    /// Tickets currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Callers currently waiting in the backlog.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn backlog(&self) -> usize {
        self.backlog
    }
}
