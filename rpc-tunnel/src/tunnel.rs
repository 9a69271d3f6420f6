//! Tunnel: the call dispatcher clients talk to.
//!
//! A `Tunnel` owns one transport of each kind. Both share the call
//! identifier counter, and the streaming transport is wired to the tunnel's
//! correlation table and event router.
//!
//! ```text
//!                    ┌──────────────┐   Http    ┌───────────────┐
//!  call(.., kind) ──►│    Tunnel    ├──────────►│ HttpTransport │
//!                    │  ids, router │ WebSocket ┌────────────────────┐
//!  on(event, h) ────►│              ├──────────►│ WebSocketTransport │──► CorrelationTable
//!                    └──────────────┘           └────────────────────┘──► EventRouter
//! ```
//!
//! Event subscriptions always travel over the streaming transport, whatever
//! the default transport is: only a persistent connection receives pushes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use reqwest::Url;
use serde_json::Value;
use tokio::runtime::{Handle, Runtime};

use crate::config::TunnelConfig;
use crate::correlation::{CallIdFactory, CorrelationTable};
use crate::envelope::{Request, SUBSCRIBE_METHOD, UNSUBSCRIBE_METHOD};
use crate::error::{CallError, TunnelResult};
use crate::events::{EventHandler, EventRouter};
use crate::handle::CallHandle;
use crate::transport::{
    ConnectionState, HttpTransport, Transport, TransportKind, WebSocketTransport,
};

/// Builder for [`Tunnel`].
#[derive(Debug)]
pub struct TunnelBuilder {
    config: TunnelConfig,
    runtime: Option<Handle>,
    lazy_streaming: bool,
}

impl TunnelBuilder {
    /// Start from `config`.
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            runtime: None,
            lazy_streaming: false,
        }
    }

    /// Run transport work on an existing runtime instead of a private one.
    pub fn runtime_handle(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Open the streaming connection on first use instead of at build time.
    pub fn lazy_streaming(mut self, lazy: bool) -> Self {
        self.lazy_streaming = lazy;
        self
    }

    /// Build the tunnel.
    ///
    /// Fails if the endpoint cannot be turned into both transport addresses
    /// or a runtime cannot be started.
    pub fn build(self) -> TunnelResult<Tunnel> {
        let http_url = self.config.http_url()?;
        let websocket_url = self.config.websocket_url()?;

        let (runtime, handle) = match self.runtime {
            Some(handle) => (None, handle),
            None => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(self.config.worker_threads.max(1))
                    .thread_name("rpc-tunnel")
                    .enable_all()
                    .build()?;
                let handle = runtime.handle().clone();
                (Some(runtime), handle)
            }
        };

        let http = HttpTransport::new(http_url, &self.config, handle.clone())?;
        tracing::info!(
            endpoint = %self.config.endpoint,
            default_transport = %self.config.default_transport,
            lazy_streaming = self.lazy_streaming,
            "tunnel created"
        );

        let tunnel = Tunnel {
            default_transport: Mutex::new(self.config.default_transport),
            config: self.config,
            runtime: Mutex::new(runtime),
            handle,
            ids: CallIdFactory::new(),
            router: Arc::new(EventRouter::new()),
            http,
            websocket_url,
            streaming: OnceLock::new(),
            closed: AtomicBool::new(false),
        };
        if !self.lazy_streaming {
            tunnel.streaming();
        }
        Ok(tunnel)
    }
}

/// Client-side RPC dispatcher over HTTP and WebSocket.
///
/// Dropping the tunnel closes it.
pub struct Tunnel {
    config: TunnelConfig,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    ids: CallIdFactory,
    router: Arc<EventRouter>,
    http: HttpTransport,
    websocket_url: Url,
    streaming: OnceLock<WebSocketTransport>,
    default_transport: Mutex<TransportKind>,
    closed: AtomicBool,
}

impl Tunnel {
    /// Create a tunnel with its own runtime and an eagerly opened streaming
    /// connection.
    pub fn new(config: TunnelConfig) -> TunnelResult<Self> {
        Self::builder(config).build()
    }

    /// Start building a tunnel from `config`.
    pub fn builder(config: TunnelConfig) -> TunnelBuilder {
        TunnelBuilder::new(config)
    }

    /// Issue a call over the transport `kind`.
    ///
    /// Returns immediately. When `expect_reply` is set the returned handle
    /// yields the outcome; otherwise the call is fire-and-forget and `None`
    /// is returned. Failures never surface here, only through the handle.
    pub fn call(
        &self,
        method: impl Into<String>,
        params: Vec<Value>,
        expect_reply: bool,
        kind: TransportKind,
    ) -> Option<CallHandle> {
        let request = Request::build(method, params, expect_reply, &self.ids);
        tracing::debug!(method = %request.method, id = ?request.id, %kind, "dispatching call");
        match kind {
            TransportKind::Http => self.http.send(request),
            TransportKind::WebSocket => match self.streaming() {
                Some(streaming) => streaming.send(request),
                None => request
                    .expects_reply()
                    .then(|| CallHandle::ready(Err(CallError::ConnectionLost))),
            },
        }
    }

    /// Issue a call over the current default transport.
    pub fn call_default(
        &self,
        method: impl Into<String>,
        params: Vec<Value>,
        expect_reply: bool,
    ) -> Option<CallHandle> {
        self.call(method, params, expect_reply, self.default_transport())
    }

    /// Transport used by [`call_default`](Self::call_default).
    pub fn default_transport(&self) -> TransportKind {
        *self.default_transport.lock()
    }

    /// Change the transport used by [`call_default`](Self::call_default).
    pub fn set_default_transport(&self, kind: TransportKind) {
        *self.default_transport.lock() = kind;
    }

    /// Register (`Some`) or remove (`None`) the handler for `event`.
    ///
    /// The local mapping is updated first so a push arriving right after the
    /// server sees `rpc.on` finds its handler. The control call is only sent
    /// when the subscription state changes; swapping one handler for another
    /// stays local.
    pub fn on(&self, event: &str, handler: Option<EventHandler>) {
        let subscribe = handler.is_some();
        if !self.router.set(event, handler) {
            tracing::debug!(event, subscribe, "event subscription unchanged");
            return;
        }
        let method = if subscribe {
            SUBSCRIBE_METHOD
        } else {
            UNSUBSCRIBE_METHOD
        };
        tracing::debug!(event, method, "event subscription changed");
        self.call(
            method,
            vec![Value::String(event.to_string())],
            false,
            TransportKind::WebSocket,
        );
    }

    /// Subscribe `handler` to `event`.
    pub fn subscribe<F>(&self, event: &str, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.on(event, Some(Arc::new(handler)));
    }

    /// Drop the subscription to `event`.
    pub fn unsubscribe(&self, event: &str) {
        self.on(event, None);
    }

    /// Event names with an active handler, sorted.
    pub fn subscribed_events(&self) -> Vec<String> {
        self.router.events()
    }

    /// State of the streaming connection.
    ///
    /// `Unopened` while a lazy connection has not been used yet.
    pub fn streaming_state(&self) -> ConnectionState {
        self.streaming
            .get()
            .map_or(ConnectionState::Unopened, WebSocketTransport::state)
    }

    /// Configuration the tunnel was built from.
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Runtime the transports run on.
    pub fn runtime_handle(&self) -> &Handle {
        &self.handle
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tear down both transports and the owned runtime.
    ///
    /// Pending streaming calls fail with [`CallError::ConnectionLost`].
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(endpoint = %self.config.endpoint, "closing tunnel");
        self.http.close();
        if let Some(streaming) = self.streaming.get() {
            streaming.close();
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }

    /// The streaming transport, created on first use.
    ///
    /// `None` once the tunnel is closed and the transport was never created.
    fn streaming(&self) -> Option<&WebSocketTransport> {
        if self.is_closed() {
            return self.streaming.get();
        }
        let streaming = self.streaming.get_or_init(|| {
            tracing::debug!(url = %self.websocket_url, "opening streaming transport");
            WebSocketTransport::new(
                self.websocket_url.clone(),
                &self.config,
                Arc::new(CorrelationTable::new()),
                self.router.clone(),
                self.handle.clone(),
            )
        });
        // lost a race with close()
        if self.is_closed() {
            streaming.close();
        }
        Some(streaming)
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("endpoint", &self.config.endpoint)
            .field("default_transport", &self.default_transport())
            .field("streaming_state", &self.streaming_state())
            .field("closed", &self.is_closed())
            .finish()
    }
}
