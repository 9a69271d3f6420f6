//! Common utilities for end-to-end tunnel tests.
//!
//! Provides an in-process JSON-RPC server answering both POST requests and
//! WebSocket sessions on the same path, so the tunnel's scheme derivation is
//! exercised against a real socket.
//!
//! # Server methods
//!
//! | method  | reply                                                    |
//! |---------|----------------------------------------------------------|
//! | `sum`   | sum of the integer params                                |
//! | `fail`  | `error: {"code": -32000, "message": "boom"}` (HTTP 500)  |
//! | `bytes` | HTTP: raw `application/octet-stream` body `hi`           |
//! | `b64`   | `result: "aGk="`                                         |
//! | `crash` | HTTP 500 with a plain text body                          |
//! | `null`  | HTTP: JSON `null` body                                   |
//! | `slow`  | WebSocket: `result: "slow"` after `params[0]` ms          |
//! | `hold`  | WebSocket: never replies                                 |
//! | `garbage` | WebSocket: malformed frames, then `result: "after"`    |
//! | `hollow` | WebSocket: `{"id": id}` with neither result nor error    |
//! | `emit`  | WebSocket: pushes event `params[0]` with `params[1]`     |
//! | `bye`   | WebSocket: server closes the connection                  |
//! | `abort` | WebSocket: drops the TCP stream without a close frame     |
//! | `rpc.on` | WebSocket: recorded, then pushes `{"id": name, "result": 42}` |
//! | `rpc.off` | WebSocket: recorded                                    |


use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rpc_tunnel::TunnelConfig;
use serde_json::{Value, json};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

/// Delay applied by the `/slow` path before accepting the WebSocket upgrade.
pub const SLOW_HANDSHAKE: Duration = Duration::from_millis(300);

/// What the server observed.
#[derive(Default)]
pub struct ServerLog {
    /// Identifiers of every request that expected a reply.
    pub ids: Mutex<Vec<u64>>,
    /// Methods of fire-and-forget requests received over HTTP.
    pub notifications: Mutex<Vec<String>>,
    /// `rpc.on` / `rpc.off` calls with their params.
    pub control: Mutex<Vec<(String, Value)>>,
}

/// In-process JSON-RPC server on its own runtime.
pub struct TestServer {
    addr: SocketAddr,
    log: Arc<ServerLog>,
    _runtime: Runtime,
}

impl TestServer {
    /// Bind to an ephemeral local port and start serving.
    pub fn start() -> Self {
        init_tracing();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("server runtime");
        let log = Arc::new(ServerLog::default());

        let app = Router::new()
            .route("/", post(rpc_post).get(rpc_websocket))
            .route("/slow", get(slow_websocket))
            .with_state(log.clone());
        let listener = runtime
            .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        runtime.spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "test server stopped");
            }
        });

        Self {
            addr,
            log,
            _runtime: runtime,
        }
    }

    /// Tunnel configuration for the root path.
    pub fn config(&self) -> TunnelConfig {
        TunnelConfig::local(self.addr.port())
    }

    /// Tunnel configuration whose WebSocket handshake is delayed.
    pub fn slow_config(&self) -> TunnelConfig {
        TunnelConfig::new(format!("http://{}/slow", self.addr))
            .with_connect_timeout(Duration::from_secs(5))
    }

    /// What the server saw so far.
    pub fn log(&self) -> &ServerLog {
        &self.log
    }
}

/// Install a test-friendly subscriber once, honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn sum(params: &Value) -> i64 {
    params
        .as_array()
        .map(|values| values.iter().filter_map(Value::as_i64).sum())
        .unwrap_or_default()
}

fn boom() -> Value {
    json!({"code": -32000, "message": "boom"})
}

async fn rpc_post(State(log): State<Arc<ServerLog>>, Json(request): Json<Value>) -> Response {
    let method = request["method"].as_str().unwrap_or_default().to_string();
    let Some(id) = request["id"].as_u64() else {
        log.notifications.lock().push(method);
        return StatusCode::NO_CONTENT.into_response();
    };
    log.ids.lock().push(id);

    match method.as_str() {
        "sum" => Json(json!({"jsonrpc": "2.0", "id": id, "result": sum(&request["params"])}))
            .into_response(),
        "fail" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"jsonrpc": "2.0", "id": id, "error": boom()})),
        )
            .into_response(),
        "bytes" => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            vec![0x68u8, 0x69],
        )
            .into_response(),
        "b64" => Json(json!({"id": id, "result": "aGk="})).into_response(),
        "crash" => (StatusCode::INTERNAL_SERVER_ERROR, "internal").into_response(),
        "null" => Json(Value::Null).into_response(),
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({"id": id, "error": {"code": -32601, "message": "method not found"}})),
        )
            .into_response(),
    }
}

async fn rpc_websocket(ws: WebSocketUpgrade, State(log): State<Arc<ServerLog>>) -> Response {
    ws.on_upgrade(move |socket| websocket_session(socket, log))
}

async fn slow_websocket(ws: WebSocketUpgrade, State(log): State<Arc<ServerLog>>) -> Response {
    tokio::time::sleep(SLOW_HANDSHAKE).await;
    ws.on_upgrade(move |socket| websocket_session(socket, log))
}

fn text(value: Value) -> Message {
    Message::Text(value.to_string().into())
}

async fn websocket_session(socket: WebSocket, log: Arc<ServerLog>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let request: Value = match message {
            Message::Text(body) => match serde_json::from_str(body.as_str()) {
                Ok(request) => request,
                Err(_) => continue,
            },
            Message::Close(_) => break,
            _ => continue,
        };
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params = request["params"].clone();
        let id = request["id"].as_u64();
        if let Some(id) = id {
            log.ids.lock().push(id);
        }

        match (method.as_str(), id) {
            ("rpc.on", _) => {
                log.control.lock().push((method.clone(), params.clone()));
                if let Some(event) = params[0].as_str() {
                    let _ = tx.send(text(json!({"id": event, "result": 42})));
                }
            }
            ("rpc.off", _) => log.control.lock().push((method.clone(), params.clone())),
            ("emit", _) => {
                let _ = tx.send(text(json!({"id": params[0], "result": params[1]})));
            }
            ("bye", _) => {
                let _ = tx.send(Message::Close(None));
                break;
            }
            ("sum", Some(id)) => {
                let _ = tx.send(text(json!({"id": id, "result": sum(&params)})));
            }
            ("fail", Some(id)) => {
                let _ = tx.send(text(json!({"id": id, "error": boom()})));
            }
            ("b64", Some(id)) => {
                let _ = tx.send(text(json!({"id": id, "result": "aGk="})));
            }
            ("slow", Some(id)) => {
                let delay = Duration::from_millis(params[0].as_u64().unwrap_or(100));
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(text(json!({"id": id, "result": "slow"})));
                });
            }
            ("garbage", Some(id)) => {
                let _ = tx.send(Message::Text("{not json".into()));
                let _ = tx.send(text(json!([id])));
                let _ = tx.send(text(json!({"id": 1.5, "result": "fractional"})));
                let _ = tx.send(text(json!({"id": id, "result": "after"})));
            }
            ("hollow", Some(id)) => {
                let _ = tx.send(text(json!({"id": id})));
            }
            ("abort", _) => {
                writer.abort();
                return;
            }
            ("hold", _) => {}
            (_, Some(id)) => {
                let _ = tx.send(text(json!({
                    "id": id,
                    "error": {"code": -32601, "message": "method not found"}
                })));
            }
            (_, None) => {}
        }
    }

    drop(tx);
    let _ = writer.await;
}
