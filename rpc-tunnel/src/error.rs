//! Error types for the rpc-tunnel client core.
//!
//! Two families of errors exist:
//! - [`CallError`]: everything a single call can fail with. It is only ever
//!   observed through a [`CallHandle`](crate::CallHandle), never returned
//!   directly from `send`/`call`.
//! - [`TunnelError`]: failures while building a [`Tunnel`](crate::Tunnel).

use serde_json::Value;
use thiserror::Error;

/// Errors that resolve a call handle.
///
/// `Clone` so a resolved handle can be read more than once.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    /// Connection-level failure on the unary path (refused, reset, timeout).
    #[error("transport error: {0}")]
    Transport(String),

    /// The streaming connection closed or failed while the call was pending,
    /// or before it could be sent.
    #[error("connection lost")]
    ConnectionLost,

    /// The server replied with a populated `error` field.
    ///
    /// Carries the server payload unmodified.
    #[error("remote error: {0}")]
    Remote(Value),

    /// The call resolved without any payload at all.
    #[error("empty result")]
    EmptyResult,

    /// Inbound data could not be parsed into a recognized envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// A timed wait expired. The call itself is still pending.
    #[error("timed out waiting for reply")]
    Timeout,

    /// The handle was cancelled by the caller.
    #[error("call cancelled")]
    Cancelled,

    /// The conversion applied by the handle rejected the reply.
    #[error("failed to decode reply: {0}")]
    Decode(String),
}

impl CallError {
    /// Whether this error comes from the server rather than the client side.
    pub fn is_remote(&self) -> bool {
        matches!(self, CallError::Remote(_))
    }
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        CallError::Decode(err.to_string())
    }
}

/// Errors raised while constructing a tunnel or one of its transports.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The configured endpoint is not a usable URL.
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint {
        /// The offending endpoint string.
        endpoint: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The endpoint scheme has no transport mapping.
    #[error("unsupported scheme in endpoint: {0}")]
    UnsupportedScheme(String),

    /// The HTTP client could not be built.
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    /// The tokio runtime could not be started.
    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Result type for tunnel construction.
pub type TunnelResult<T> = Result<T, TunnelError>;
