//! Configuration for a [`Tunnel`](crate::Tunnel) and its transports.

use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;

use crate::error::{TunnelError, TunnelResult};
use crate::transport::TransportKind;

/// Configuration for tunnel behavior and transport parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Unary endpoint. The streaming address is derived from it by scheme
    /// substitution (`http` to `ws`, `https` to `wss`).
    pub endpoint: String,

    /// Transport used by [`Tunnel::call_default`](crate::Tunnel::call_default).
    pub default_transport: TransportKind,

    /// Maximum number of sends running concurrently per transport.
    /// Further sends queue without limit.
    pub max_in_flight: usize,

    /// Threads of the runtime a tunnel starts when no handle is supplied.
    pub worker_threads: usize,

    /// Timeout for establishing a TCP or WebSocket connection.
    pub connect_timeout: Duration,

    /// Timeout for a whole unary request, if any.
    pub request_timeout: Option<Duration>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/".to_string(),
            default_transport: TransportKind::Http,
            max_in_flight: 10,
            worker_threads: 2,
            connect_timeout: Duration::from_secs(5),
            request_timeout: None,
        }
    }
}

impl TunnelConfig {
    /// Create a default configuration pointing at `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Create a configuration for a service on the local machine.
    pub fn local(port: u16) -> Self {
        Self {
            endpoint: format!("http://127.0.0.1:{port}/"),
            connect_timeout: Duration::from_millis(500),
            request_timeout: Some(Duration::from_secs(5)),
            ..Self::default()
        }
    }

    /// Set the default transport.
    pub fn with_default_transport(mut self, kind: TransportKind) -> Self {
        self.default_transport = kind;
        self
    }

    /// Set the per-transport concurrency ceiling.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Set the number of runtime worker threads.
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the unary request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// URL of the unary transport.
    ///
    /// An endpoint given as `ws://`/`wss://` maps back to `http://`/`https://`.
    pub fn http_url(&self) -> TunnelResult<Url> {
        let url = self.parse_endpoint()?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            "ws" => with_scheme(url, "http"),
            "wss" => with_scheme(url, "https"),
            other => Err(TunnelError::UnsupportedScheme(other.to_string())),
        }
    }

    /// URL of the streaming transport, the persistent-socket analog of
    /// [`http_url`](Self::http_url).
    pub fn websocket_url(&self) -> TunnelResult<Url> {
        let url = self.parse_endpoint()?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            "http" => with_scheme(url, "ws"),
            "https" => with_scheme(url, "wss"),
            other => Err(TunnelError::UnsupportedScheme(other.to_string())),
        }
    }

    fn parse_endpoint(&self) -> TunnelResult<Url> {
        Url::parse(&self.endpoint).map_err(|e| TunnelError::InvalidEndpoint {
            endpoint: self.endpoint.clone(),
            reason: e.to_string(),
        })
    }
}

fn with_scheme(mut url: Url, scheme: &str) -> TunnelResult<Url> {
    let original = url.scheme().to_string();
    url.set_scheme(scheme)
        .map_err(|()| TunnelError::UnsupportedScheme(original))?;
    Ok(url)
}
