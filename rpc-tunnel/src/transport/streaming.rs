//! Streaming transport: one WebSocket connection multiplexing every call.
//!
//! # Tasks
//!
//! ```text
//!   send() ──register(id)──► CorrelationTable ◄── deliver(id, payload) ──┐
//!     │                                                                 │
//!     └──────────────────► outbound queue (FIFO) ──wait Open──► connection task
//!                                                               (socket owner)
//!                                                                       │
//!   EventRouter::dispatch ◄── event dispatcher (blocking thread) ◄── events channel
//! ```
//!
//! `send` registers the call and queues its frame on the caller's thread, so
//! frames reach the socket in the order `send` was called. The connection
//! task only drains the queue once the handshake completed; until then
//! frames wait in it.
//!
//! The connection task is the delivery context: it writes queued frames and
//! reads inbound ones. Replies go straight to the correlation table; events
//! are forwarded to a dedicated dispatcher so a slow handler never holds up
//! call resolution.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::{ConnectionState, Transport, TransportKind, WorkerPool};
use crate::config::TunnelConfig;
use crate::correlation::{CorrelationTable, ReplySlot};
use crate::envelope::{Inbound, Payload, Request};
use crate::error::CallError;
use crate::events::EventRouter;
use crate::handle::CallHandle;

/// WebSocket transport sharing one connection between all calls.
pub struct WebSocketTransport {
    url: Url,
    table: Arc<CorrelationTable>,
    pool: WorkerPool,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

/// Everything the connection task owns.
struct Connection {
    url: Url,
    connect_timeout: Duration,
    table: Arc<CorrelationTable>,
    state: Arc<watch::Sender<ConnectionState>>,
    outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<(String, Value)>,
    shutdown: CancellationToken,
}

impl WebSocketTransport {
    /// Create the transport and start opening the connection.
    ///
    /// Calls may be sent right away; their frames wait in the outbound queue
    /// until the handshake completes.
    pub fn new(
        url: Url,
        config: &TunnelConfig,
        table: Arc<CorrelationTable>,
        router: Arc<EventRouter>,
        runtime: Handle,
    ) -> Self {
        let pool = WorkerPool::new(runtime, config.max_in_flight);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Unopened);
        let state_tx = Arc::new(state_tx);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<(String, Value)>();
        let shutdown = CancellationToken::new();

        pool.spawn_blocking(move || {
            while let Some((event, payload)) = events_rx.blocking_recv() {
                router.dispatch(&event, payload);
            }
        });

        transition(&state_tx, ConnectionState::Opening);
        pool.spawn(
            Connection {
                url: url.clone(),
                connect_timeout: config.connect_timeout,
                table: table.clone(),
                state: state_tx.clone(),
                outbound: outbound_rx,
                events: events_tx,
                shutdown: shutdown.clone(),
            }
            .run(),
        );

        Self {
            url,
            table,
            pool,
            state_tx,
            state_rx,
            outbound: outbound_tx,
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    /// Address of the connection.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Wait until the connection is open or can no longer open.
    ///
    /// Returns `true` if it is open.
    pub async fn wait_open(&self) -> bool {
        wait_until_open(&mut self.state_rx.clone()).await
    }

    /// Number of calls sent and still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.table.pending()
    }
}

impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn send(&self, request: Request) -> Option<CallHandle> {
        let id = request.id;
        let text = match request.to_json() {
            Ok(text) => text,
            Err(e) => return id.map(|_| CallHandle::ready(Err(e))),
        };
        if self.closed.load(Ordering::Acquire) {
            tracing::debug!(method = %request.method, "send on closed websocket transport");
            return id.map(|_| CallHandle::ready(Err(CallError::ConnectionLost)));
        }

        let Some(id) = id else {
            if self.outbound.send(text).is_err() {
                tracing::warn!(
                    method = %request.method,
                    "fire-and-forget call dropped, connection gone"
                );
            }
            return None;
        };

        let slot = ReplySlot::new();
        // registered before queueing, so the reply always finds its waiter
        if self.table.register(id, slot.clone()) && self.outbound.send(text).is_err() {
            tracing::debug!(id, "connection task gone, failing call");
            self.table.fail(id, CallError::ConnectionLost);
        }
        Some(CallHandle::new(slot))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(url = %self.url, "closing websocket transport");
        transition(&self.state_tx, ConnectionState::Closing);
        self.shutdown.cancel();
        let failed = self.table.close();
        if failed > 0 {
            tracing::debug!(failed, "failed pending calls on close");
        }
        self.pool.shutdown();
        transition(&self.state_tx, ConnectionState::Closed);
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl Connection {
    async fn run(mut self) {
        let connect = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        );
        let socket = tokio::select! {
            _ = self.shutdown.cancelled() => {
                self.finish(ConnectionState::Closed);
                return;
            }
            result = connect => match result {
                Ok(Ok((socket, _response))) => socket,
                Ok(Err(e)) => {
                    tracing::error!(url = %self.url, error = %e, "websocket connect failed");
                    self.finish(ConnectionState::Failed(e.to_string()));
                    return;
                }
                Err(_) => {
                    tracing::error!(url = %self.url, "websocket connect timed out");
                    self.finish(ConnectionState::Failed("connect timed out".to_string()));
                    return;
                }
            },
        };

        tracing::debug!(url = %self.url, "websocket open");
        transition(&self.state, ConnectionState::Open);
        let (mut sink, mut stream) = socket.split();

        let end = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break ConnectionState::Closed;
                }
                outbound = self.outbound.recv() => match outbound {
                    Some(text) => {
                        if let Err(e) = sink.send(Message::text(text)).await {
                            break ConnectionState::Failed(e.to_string());
                        }
                    }
                    None => break ConnectionState::Closed,
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.deliver(text.as_str()),
                    Some(Ok(Message::Binary(bytes))) => {
                        tracing::warn!(len = bytes.len(), "binary frame without envelope, dropping");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(?frame, "websocket closed by server");
                        break ConnectionState::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break ConnectionState::Failed(e.to_string()),
                    None => break ConnectionState::Closed,
                },
            }
        };
        if let ConnectionState::Failed(error) = &end {
            tracing::error!(url = %self.url, %error, "websocket connection failed");
        }
        self.finish(end);
    }

    /// Route one inbound text frame.
    fn deliver(&self, text: &str) {
        match Inbound::parse(text) {
            Ok(Inbound::Reply(reply)) => {
                if let Some(id) = reply.id {
                    tracing::debug!(id, "reply received");
                    self.table.deliver(id, Payload::Structured(reply));
                }
            }
            Ok(Inbound::Event { name, payload }) => {
                if self.events.send((name, payload)).is_err() {
                    tracing::warn!("event dispatcher gone, dropping event");
                }
            }
            Ok(Inbound::Incomplete { id }) => {
                tracing::warn!(id, "reply carries neither result nor error, failing call");
                self.table.fail(
                    id,
                    CallError::MalformedEnvelope(format!(
                        "reply {id} carries neither result nor error"
                    )),
                );
            }
            Err(error) => {
                tracing::warn!(%error, "dropping malformed message");
            }
        }
    }

    /// Publish the final state and fail every call still waiting.
    fn finish(&self, end: ConnectionState) {
        transition(&self.state, end);
        let failed = self.table.close();
        if failed > 0 {
            tracing::debug!(failed, "failed pending calls after connection ended");
        }
    }
}

/// Move the connection to `next` unless it already ended.
///
/// `Closed` and `Failed` are final; `Closing` may only become `Closed`.
fn transition(state: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    state.send_if_modified(|current| {
        let allowed = match current {
            ConnectionState::Closed | ConnectionState::Failed(_) => false,
            ConnectionState::Closing => next == ConnectionState::Closed,
            _ => *current != next,
        };
        if allowed {
            *current = next;
        }
        allowed
    })
}

async fn wait_until_open(state: &mut watch::Receiver<ConnectionState>) -> bool {
    match state.wait_for(ConnectionState::is_settled).await {
        Ok(current) => *current == ConnectionState::Open,
        Err(_) => false,
    }
}
