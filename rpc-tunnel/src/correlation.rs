//! Request-response correlation.
//!
//! This module holds the pieces that connect an outbound call to its
//! eventual reply:
//! - [`CallIdFactory`]: monotonically increasing call identifiers
//! - [`ReplySlot`]: single-assignment result slot a handle waits on
//! - [`CorrelationTable`]: maps identifiers to slots on a streaming connection
//!
//! # Architecture
//!
//! ```text
//! Send Flow:
//!   1. Allocate id from CallIdFactory
//!   2. Create ReplySlot, hand a CallHandle to the caller
//!   3. register(id, slot) in CorrelationTable
//!   4. Queue the request; the connection writes it once open
//!
//! Reply Flow (delivery context):
//!   5. Reply with numeric id arrives
//!   6. deliver(id, payload): remove the waiting slot and resolve it;
//!      replies for ids that are not outstanding are dropped
//!
//! Teardown:
//!   7. close(): mark the table closed, fail every waiting slot
//!      with ConnectionLost, reject later registrations
//! ```
//!
//! Registration happens before the request can reach the wire, so a reply
//! always finds its slot. The slot stores the reply before signalling, so a
//! caller that starts waiting late still observes it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::envelope::Payload;
use crate::error::CallError;

/// What a slot resolves to.
///
/// `Ok(None)` means the call completed without any payload at all.
pub type Resolution = Result<Option<Payload>, CallError>;

/// Factory for call identifiers.
///
/// Shared by every transport of a tunnel. Identifiers start at 1 and are
/// never reused.
#[derive(Debug)]
pub struct CallIdFactory {
    next_id: AtomicU64,
}

impl CallIdFactory {
    /// Create a factory starting from 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Generate the next call identifier.
    pub fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for CallIdFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-assignment slot holding the outcome of one call.
///
/// Blocking waiters park on a condition variable; async waiters register a
/// waker. The first `resolve` wins, later ones are ignored.
pub struct ReplySlot {
    state: Mutex<SlotState>,
    resolved: Condvar,
}

#[derive(Default)]
struct SlotState {
    resolution: Option<Resolution>,
    cancelled: bool,
    wakers: Vec<Waker>,
}

impl SlotState {
    fn settled(&self) -> Option<Resolution> {
        if self.cancelled {
            return Some(Err(CallError::Cancelled));
        }
        self.resolution.clone()
    }
}

impl ReplySlot {
    /// Create an empty slot.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::default()),
            resolved: Condvar::new(),
        })
    }

    /// Create a slot that is already resolved.
    pub fn resolved(resolution: Resolution) -> Arc<Self> {
        let slot = Self::new();
        slot.resolve(resolution);
        slot
    }

    /// Store the outcome and release every waiter.
    ///
    /// Returns `false` if the slot was already resolved or cancelled.
    pub fn resolve(&self, resolution: Resolution) -> bool {
        let wakers = {
            let mut state = self.state.lock();
            if state.resolution.is_some() || state.cancelled {
                return false;
            }
            state.resolution = Some(resolution);
            std::mem::take(&mut state.wakers)
        };
        self.resolved.notify_all();
        wakers.into_iter().for_each(Waker::wake);
        true
    }

    /// Release waiters without an outcome.
    ///
    /// Returns `false` if the slot already settled.
    pub fn cancel(&self) -> bool {
        let wakers = {
            let mut state = self.state.lock();
            if state.resolution.is_some() || state.cancelled {
                return false;
            }
            state.cancelled = true;
            std::mem::take(&mut state.wakers)
        };
        self.resolved.notify_all();
        wakers.into_iter().for_each(Waker::wake);
        true
    }

    /// Whether the slot has an outcome or was cancelled.
    pub fn is_settled(&self) -> bool {
        let state = self.state.lock();
        state.resolution.is_some() || state.cancelled
    }

    /// Whether the slot was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Block the calling thread until the slot settles.
    pub fn wait(&self) -> Resolution {
        let mut state = self.state.lock();
        loop {
            if let Some(resolution) = state.settled() {
                return resolution;
            }
            self.resolved.wait(&mut state);
        }
    }

    /// Block the calling thread until the slot settles or `timeout` elapses.
    ///
    /// Expiry returns [`CallError::Timeout`] and leaves the slot untouched.
    pub fn wait_timeout(&self, timeout: Duration) -> Resolution {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(resolution) = state.settled() {
                return resolution;
            }
            if self.resolved.wait_until(&mut state, deadline).timed_out() {
                return state.settled().unwrap_or(Err(CallError::Timeout));
            }
        }
    }

    /// Poll for the outcome, registering the task waker if still pending.
    pub fn poll_settled(&self, cx: &mut Context<'_>) -> Poll<Resolution> {
        let mut state = self.state.lock();
        if let Some(resolution) = state.settled() {
            return Poll::Ready(resolution);
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl std::fmt::Debug for ReplySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReplySlot")
            .field("resolved", &state.resolution.is_some())
            .field("cancelled", &state.cancelled)
            .finish()
    }
}

/// Maps in-flight call identifiers to their reply slots.
///
/// Shared between the senders and the delivery context of a streaming
/// connection. A slot is registered before its request is queued, so every
/// legitimate reply finds its waiter; replies for identifiers that are not
/// outstanding are dropped.
#[derive(Default)]
pub struct CorrelationTable {
    inner: Mutex<TableState>,
}

#[derive(Default)]
struct TableState {
    waiting: HashMap<u64, Arc<ReplySlot>>,
    closed: bool,
}

impl CorrelationTable {
    /// Create an empty, open table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `slot` as the waiter for `id`.
    ///
    /// If the table is closed, the slot fails with
    /// [`CallError::ConnectionLost`] right away. Returns `true` when the slot
    /// is left waiting in the table.
    pub fn register(&self, id: u64, slot: Arc<ReplySlot>) -> bool {
        let previous = {
            let mut inner = self.inner.lock();
            if inner.closed {
                drop(inner);
                slot.resolve(Err(CallError::ConnectionLost));
                return false;
            }
            inner.waiting.insert(id, slot)
        };
        if let Some(previous) = previous {
            tracing::warn!(id, "call id registered twice, replacing waiter");
            previous.resolve(Err(CallError::ConnectionLost));
        }
        true
    }

    /// Resolve the waiter for `id` with `payload`.
    ///
    /// The entry is removed, so a duplicate reply, or one for an identifier
    /// that was never issued, is logged and dropped. Returns `true` if a
    /// waiting slot was resolved.
    pub fn deliver(&self, id: u64, payload: Payload) -> bool {
        self.settle(id, Ok(Some(payload)))
    }

    /// Remove `id` and fail its waiter with `error`.
    ///
    /// Returns `true` if a waiting slot was failed.
    pub fn fail(&self, id: u64, error: CallError) -> bool {
        self.settle(id, Err(error))
    }

    fn settle(&self, id: u64, resolution: Resolution) -> bool {
        let slot = {
            let mut inner = self.inner.lock();
            if inner.closed {
                tracing::debug!(id, "reply after close dropped");
                return false;
            }
            inner.waiting.remove(&id)
        };
        match slot {
            Some(slot) => slot.resolve(resolution),
            None => {
                tracing::warn!(id, "reply for unknown or settled call id dropped");
                false
            }
        }
    }

    /// Close the table.
    ///
    /// Every waiting slot fails with [`CallError::ConnectionLost`] and later
    /// registrations are rejected. Returns the number of calls that were
    /// failed. Idempotent.
    pub fn close(&self) -> usize {
        let waiting = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.waiting)
        };
        waiting
            .into_values()
            .filter(|slot| slot.resolve(Err(CallError::ConnectionLost)))
            .count()
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of registered waiters.
    pub fn pending(&self) -> usize {
        self.inner.lock().waiting.len()
    }
}
