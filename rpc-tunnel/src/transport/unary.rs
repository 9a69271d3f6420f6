//! Unary transport: one HTTP POST per call.
//!
//! Each call runs on the worker pool: POST the serialized envelope, read the
//! whole response, classify it by `Content-Type` and resolve the call's slot.
//! Nothing is shared between calls, so a failure only affects its own call.

use std::sync::atomic::{AtomicBool, Ordering};

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use tokio::runtime::Handle;

use super::{SettleGuard, Transport, TransportKind, WorkerPool};
use crate::config::TunnelConfig;
use crate::correlation::{ReplySlot, Resolution};
use crate::envelope::{Payload, ReplyEnvelope, Request};
use crate::error::{CallError, TunnelResult};
use crate::handle::CallHandle;

const JSON_CONTENT_TYPE: &str = "application/json";

/// HTTP transport opening one connection per call.
pub struct HttpTransport {
    client: Client,
    url: Url,
    pool: WorkerPool,
    closed: AtomicBool,
}

impl HttpTransport {
    /// Create a transport posting to `url`, running sends on `runtime`.
    pub fn new(url: Url, config: &TunnelConfig, runtime: Handle) -> TunnelResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            // no keep-alive reuse between calls
            .pool_max_idle_per_host(0);
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            url,
            pool: WorkerPool::new(runtime, config.max_in_flight),
            closed: AtomicBool::new(false),
        })
    }

    /// Endpoint this transport posts to.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Whether [`close`](Transport::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn send(&self, request: Request) -> Option<CallHandle> {
        let expects_reply = request.expects_reply();
        if self.is_closed() {
            tracing::debug!(method = %request.method, "send on closed http transport");
            return expects_reply.then(|| CallHandle::ready(Err(closed_error())));
        }

        let body = match request.to_json() {
            Ok(body) => body,
            Err(e) => return expects_reply.then(|| CallHandle::ready(Err(e))),
        };
        let client = self.client.clone();
        let url = self.url.clone();

        if !expects_reply {
            let method = request.method;
            self.pool.submit(async move {
                if let Err(error) = post(&client, url, body).await {
                    tracing::warn!(%method, %error, "fire-and-forget http call failed");
                }
            });
            return None;
        }

        let slot = ReplySlot::new();
        let guard = SettleGuard::new(slot.clone(), closed_error());
        let id = request.id;
        self.pool.submit(async move {
            let resolution = post(&client, url, body).await;
            tracing::debug!(?id, ok = resolution.is_ok(), "http call resolved");
            guard.slot().resolve(resolution);
        });
        Some(CallHandle::new(slot))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(url = %self.url, "closing http transport");
        self.pool.shutdown();
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn closed_error() -> CallError {
    CallError::Transport("transport closed".to_string())
}

/// Perform one POST and classify the response.
async fn post(client: &Client, url: Url, body: String) -> Resolution {
    let response = client
        .post(url)
        .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
        .body(body)
        .send()
        .await
        .map_err(|e| CallError::Transport(e.to_string()))?;

    let status = response.status();
    let structured = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(is_json_content_type);
    let body = response
        .bytes()
        .await
        .map_err(|e| CallError::Transport(e.to_string()))?;

    if structured {
        // error statuses with a JSON body are still replies
        return ReplyEnvelope::parse_unary(&body).map(|reply| reply.map(Payload::Structured));
    }
    if !status.is_success() {
        return Err(CallError::Transport(format!("http status {status}")));
    }
    Ok(Some(Payload::Binary(body)))
}

/// Compare the media type, ignoring parameters such as `charset`.
fn is_json_content_type(value: &str) -> bool {
    value
        .split(';')
        .next()
        .is_some_and(|media| media.trim().eq_ignore_ascii_case(JSON_CONTENT_TYPE))
}
