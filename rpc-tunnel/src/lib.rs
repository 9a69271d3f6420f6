//! # RPC Tunnel
//!
//! JSON-RPC client core carried over two interchangeable transports.
//!
//! This crate provides:
//! - **Tunnel**: call dispatcher choosing a transport per call
//! - **Transports**: unary HTTP (one POST per call) and streaming WebSocket
//!   (one connection multiplexing every call and server-pushed events)
//! - **Correlation**: call identifiers and the table matching replies to calls
//! - **CallHandle**: blocking or async access to a call's eventual outcome
//! - **EventRouter**: delivery of pushed events to registered handlers
//!
//! ## Usage
//!
//! ```no_run
//! use rpc_tunnel::{Tunnel, TunnelConfig, TransportKind};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tunnel = Tunnel::new(TunnelConfig::new("http://127.0.0.1:8080/"))?;
//!
//! if let Some(handle) = tunnel.call("sum", vec![json!(2), json!(3)], true, TransportKind::Http) {
//!     let sum: u64 = handle.typed().get()?;
//!     assert_eq!(sum, 5);
//! }
//!
//! tunnel.subscribe("ping", |payload| println!("ping: {payload}"));
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Tunnel configuration.
pub mod config;

/// Call identifiers, reply slots and the correlation table.
pub mod correlation;

/// Wire envelopes and reply payloads.
pub mod envelope;

/// Error types for calls and tunnel construction.
pub mod error;

/// Event name to handler routing.
pub mod events;

/// Caller-side handle to a call's outcome.
pub mod handle;

/// Unary and streaming transports.
pub mod transport;

/// The call dispatcher.
pub mod tunnel;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::TunnelConfig;
pub use correlation::{CallIdFactory, CorrelationTable, ReplySlot, Resolution};
pub use envelope::{Inbound, Payload, Reply, ReplyEnvelope, Request};
pub use error::{CallError, TunnelError, TunnelResult};
pub use events::{EventHandler, EventRouter};
pub use handle::CallHandle;
pub use transport::{
    ConnectionState, HttpTransport, Transport, TransportKind, WebSocketTransport, WorkerPool,
};
pub use tunnel::{Tunnel, TunnelBuilder};
