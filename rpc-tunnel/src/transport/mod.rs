//! Transports carrying requests to the server.
//!
//! Both variants conform to [`Transport`]: `send` returns immediately with a
//! [`CallHandle`] (or nothing for fire-and-forget requests) and never fails
//! directly; failures travel through the handle.
//!
//! # Connection Lifecycle (streaming)
//!
//! ```text
//! ┌──────────┐ spawn  ┌─────────┐ handshake ┌──────┐ close() ┌─────────┐      ┌────────┐
//! │ Unopened ├───────►│ Opening ├──────────►│ Open ├────────►│ Closing ├─────►│ Closed │
//! └──────────┘        └────┬────┘           └──┬───┘         └─────────┘      └────────┘
//!                          │ I/O failure       │ I/O failure / remote close       ▲
//!                          ▼                   ▼                                  │
//!                     ┌─────────────────────────┐   fail pending: ConnectionLost  │
//!                     │         Failed          ├─────────────────────────────────┘
//!                     └─────────────────────────┘
//! ```

use std::future::Future;
use std::sync::Arc;

use serde::Deserialize;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::correlation::ReplySlot;
use crate::envelope::Request;
use crate::error::CallError;
use crate::handle::CallHandle;

/// One-connection-per-call HTTP transport.
pub mod unary;

/// Persistent multiplexed WebSocket transport.
pub mod streaming;

pub use streaming::WebSocketTransport;
pub use unary::HttpTransport;

/// Which transport carries a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Unary request/response over HTTP.
    Http,
    /// Persistent WebSocket connection.
    WebSocket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Http => write!(f, "http"),
            TransportKind::WebSocket => write!(f, "websocket"),
        }
    }
}

/// Lifecycle state of a streaming connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet started.
    Unopened,
    /// Handshake in progress.
    Opening,
    /// Ready to carry calls.
    Open,
    /// Local teardown in progress.
    Closing,
    /// Closed for good.
    Closed,
    /// A fatal I/O failure ended the connection.
    Failed(String),
}

impl ConnectionState {
    /// Whether the connection can never become open again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed(_)
        )
    }

    /// Whether senders waiting on the connection can stop waiting.
    pub fn is_settled(&self) -> bool {
        *self == ConnectionState::Open || self.is_terminal()
    }
}

/// Common contract of both transports.
pub trait Transport: Send + Sync {
    /// Which variant this is.
    fn kind(&self) -> TransportKind;

    /// Queue `request` for transmission.
    ///
    /// Returns a handle when the request expects a reply, `None` otherwise.
    fn send(&self, request: Request) -> Option<CallHandle>;

    /// Release connections and workers. Idempotent.
    fn close(&self);
}

/// Bounded pool of send workers.
///
/// Each job runs as its own task but must hold one of `max_in_flight`
/// permits while it works, so concurrency stays bounded while the backlog
/// of waiting jobs is not.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    runtime: Handle,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    /// Create a pool spawning onto `runtime`.
    pub fn new(runtime: Handle, max_in_flight: usize) -> Self {
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Run `job` once a permit is free.
    pub fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        self.runtime.spawn(async move {
            // closed only by shutdown(), in which case the job is dropped
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            job.await;
        });
    }

    /// Spawn a task outside the permit budget.
    pub fn spawn<F>(&self, task: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(task)
    }

    /// Run blocking `work` on the runtime's blocking thread pool.
    pub fn spawn_blocking<F>(&self, work: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.runtime.spawn_blocking(work)
    }

    /// Stop admitting queued jobs. Jobs already running finish.
    pub fn shutdown(&self) {
        self.permits.close();
    }
}

/// Fails a slot with a fixed error when dropped while still armed.
///
/// Send jobs carry one so that a job dropped by pool or runtime shutdown,
/// or one that gives up early, still releases its caller.
pub(crate) struct SettleGuard {
    slot: Arc<ReplySlot>,
    error: CallError,
    armed: bool,
}

impl SettleGuard {
    pub(crate) fn new(slot: Arc<ReplySlot>, error: CallError) -> Self {
        Self {
            slot,
            error,
            armed: true,
        }
    }

    pub(crate) fn slot(&self) -> &Arc<ReplySlot> {
        &self.slot
    }

    /// Hand responsibility for the slot to someone else.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        if self.armed {
            self.slot.resolve(Err(self.error.clone()));
        }
    }
}
