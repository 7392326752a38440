//! Stdio↔SSE proxy: fronts a single stdio MCP backend with an HTTP/SSE
//! endpoint.
//!
//! Endpoints: `GET /health`, `GET /sse` (opens a session; first event is
//! `endpoint` naming the POST target), `POST /message?sessionId=…` (routes a
//! JSON-RPC payload to its session). All sessions share one backend client;
//! on backend exit the reconnect policy decides between exponential-backoff
//! reconnection and shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use mcpd_jsonrpc::{RpcError, ServerHandler};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{to_rpc_error, BackendClient, StdioOptions};
use crate::config::RestartPolicy;
use crate::mcp::{ServerCapabilities, MCP_PROTOCOL_VERSION};
use crate::state::{ServiceState, ServiceStatus, StateStore};


const RECONNECT_BACKOFF_START: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);
const SESSION_QUEUE_CAPACITY: usize = 64;

/// Creates (or re-creates, on reconnect) the backend client.
pub type BackendFactory =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<BackendClient>> + Send + Sync>;

/// Factory for the production case: spawn the configured command as a stdio
/// backend.
pub fn stdio_backend_factory(command: String, args: Vec<String>) -> BackendFactory {
    Arc::new(move || {
        let command = command.clone();
        let args = args.clone();
        Box::pin(async move {
            BackendClient::connect_stdio(&command, &args, StdioOptions::default()).await
        })
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Starting,
    Serving,
    Reconnecting,
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Port to bind on 127.0.0.1; 0 asks the OS.
    pub port: u16,
    /// Service name for the state entry.
    pub name: String,
    pub restart: RestartPolicy,
    /// Where the state entry lives; `None` disables state registration.
    pub state_dir: Option<PathBuf>,
}

type SharedBackend = Arc<RwLock<Option<Arc<BackendClient>>>>;

struct SessionEntry {
    tx: mpsc::Sender<Value>,
    server: Arc<SessionServer>,
}

type SessionMap = Arc<RwLock<HashMap<String, SessionEntry>>>;

#[derive(Clone)]
struct AppState {
    sessions: SessionMap,
    backend: SharedBackend,
    capabilities: ServerCapabilities,
}

pub struct ProxyHandle {
    pub port: u16,
    shutdown: CancellationToken,
    state_rx: watch::Receiver<ProxyState>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl ProxyHandle {
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn state(&self) -> ProxyState {
        *self.state_rx.borrow()
    }

    /// Waits for `state` to be observed (or the proxy to finish).
    pub async fn wait_for_state(&self, state: ProxyState) {
        let mut rx = self.state_rx.clone();
        while *rx.borrow() != state {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn wait(self) -> anyhow::Result<()> {
        self.task.await.context("proxy task panicked")?
    }
}

/// Connects the backend, binds the HTTP listener, and serves until the
/// shutdown token fires (signal) or the reconnect policy gives up.
pub async fn start(options: ProxyOptions, factory: BackendFactory) -> anyhow::Result<ProxyHandle> {
    let (state_tx, state_rx) = watch::channel(ProxyState::Starting);
    let shutdown = CancellationToken::new();

    let client = factory().await.context("start proxy backend")?;
    let capabilities = client.capabilities();
    let backend_pid = client.pid();
    info!(
        name = %options.name,
        pid = ?backend_pid,
        ?capabilities,
        "proxy backend connected"
    );

    let backend: SharedBackend = Arc::new(RwLock::new(Some(Arc::new(client))));
    let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));

    let app_state = AppState {
        sessions: sessions.clone(),
        backend: backend.clone(),
        capabilities,
    };
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/sse", get(sse_handler))
        .route("/message", post(message_handler))
        .with_state(app_state);

    let addr = SocketAddr::from(([127, 0, 0, 1], options.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    let port = listener.local_addr().context("read bound addr")?.port();

    // The effective port matters most with port 0; report it where both
    // humans and wrappers can read it.
    println!("mcpd proxy listening on http://127.0.0.1:{port}");
    info!(port, "proxy listening");

    let store = options.state_dir.as_deref().map(StateStore::in_dir);
    if let Some(store) = &store {
        let mut map = store.load().await;
        map.insert(
            options.name.clone(),
            ServiceStatus {
                state: ServiceState::Ready,
                pid: Some(std::process::id()),
                url: Some(format!("http://127.0.0.1:{port}")),
            },
        );
        store.save(&map).await.context("register proxy state")?;
    }

    let monitor = tokio::spawn(monitor_backend(
        backend.clone(),
        factory,
        options.restart,
        shutdown.clone(),
        state_tx.clone(),
        store.clone(),
        options.name.clone(),
        port,
    ));

    let _ = state_tx.send(ProxyState::Serving);

    let serve_shutdown = shutdown.clone();
    let name = options.name.clone();
    let task = tokio::spawn(async move {
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(serve_shutdown.cancelled_owned());
        let result = server.await.context("proxy http server");

        let _ = state_tx.send(ProxyState::ShuttingDown);
        monitor.abort();

        // Best-effort teardown: sessions first so the backend is unreferenced.
        sessions.write().await.clear();
        let client = backend.write().await.take();
        if let Some(client) = client {
            match Arc::try_unwrap(client) {
                Ok(client) => {
                    if let Err(err) = client.disconnect().await {
                        warn!(error = format!("{err:#}"), "backend disconnect failed");
                    }
                }
                Err(_) => debug!("backend still referenced at shutdown; dropping"),
            }
        }
        if let Some(store) = &store {
            let mut map = store.load().await;
            map.remove(&name);
            if let Err(err) = store.save(&map).await {
                warn!(error = format!("{err:#}"), "failed to remove proxy state entry");
            }
        }
        info!("proxy stopped");
        result
    });

    Ok(ProxyHandle {
        port,
        shutdown,
        state_rx,
        task,
    })
}

async fn health_handler() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageQuery {
    session_id: String,
}

async fn message_handler(
    State(state): State<AppState>,
    Query(MessageQuery { session_id }): Query<MessageQuery>,
    Json(message): Json<Value>,
) -> Result<StatusCode, StatusCode> {
    let (server, tx) = {
        let sessions = state.sessions.read().await;
        let entry = sessions.get(&session_id).ok_or(StatusCode::NOT_FOUND)?;
        (entry.server.clone(), entry.tx.clone())
    };

    if let Some(response) = mcpd_jsonrpc::handle_message(server.as_ref(), message).await {
        tx.send(response).await.map_err(|_| StatusCode::GONE)?;
    }
    Ok(StatusCode::ACCEPTED)
}

async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let session_id = format!("{:032x}", rand::random::<u128>());
    info!(session = %session_id, "sse session opened");

    let (tx, rx) = mpsc::channel::<Value>(SESSION_QUEUE_CAPACITY);
    let server = Arc::new(SessionServer {
        backend: state.backend.clone(),
        capabilities: state.capabilities,
    });
    state.sessions.write().await.insert(
        session_id.clone(),
        SessionEntry {
            tx,
            server,
        },
    );

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/message?sessionId={session_id}"));

    let messages = SessionStream {
        inner: ReceiverStream::new(rx),
        sessions: state.sessions.clone(),
        session_id,
    };
    let stream = futures_util::stream::once(async move { Ok(endpoint) }).chain(messages.map(
        |message| {
            Ok(Event::default()
                .event("message")
                .data(message.to_string()))
        },
    ));
    Sse::new(stream)
}

/// Receiver stream that deregisters its session when the SSE connection
/// goes away.
struct SessionStream {
    inner: ReceiverStream<Value>,
    sessions: SessionMap,
    session_id: String,
}

impl Stream for SessionStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        let sessions = self.sessions.clone();
        let session_id = std::mem::take(&mut self.session_id);
        tokio::spawn(async move {
            info!(session = %session_id, "sse session closed");
            sessions.write().await.remove(&session_id);
        });
    }
}

/// Per-session MCP server bound to the shared backend client. Tools are
/// always wired; resources and prompts only when the backend reported them.
struct SessionServer {
    backend: SharedBackend,
    capabilities: ServerCapabilities,
}

impl SessionServer {
    async fn forward(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let client = {
            let backend = self.backend.read().await;
            backend
                .as_ref()
                .cloned()
                .ok_or_else(|| RpcError::internal("backend is shutting down"))?
        };
        client.request(method, params).await.map_err(to_rpc_error)
    }
}

#[async_trait]
impl ServerHandler for SessionServer {
    async fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let forwarded = match method {
            "initialize" => {
                return Ok(serde_json::json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": self.capabilities.to_value(),
                    "serverInfo": {
                        "name": "mcpd-proxy",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }))
            }
            "ping" => return Ok(serde_json::json!({})),
            "tools/list" | "tools/call" => true,
            "resources/list" | "resources/templates/list" | "resources/read" => {
                self.capabilities.resources
            }
            "prompts/list" | "prompts/get" => self.capabilities.prompts,
            _ => false,
        };

        if !forwarded {
            return Err(RpcError::method_not_found(method));
        }
        self.forward(method, params).await
    }
}

/// Watches the backend transport; on close, reconnects per policy with
/// exponential backoff (1s doubling to a 30s cap), or initiates shutdown.
#[allow(clippy::too_many_arguments)]
async fn monitor_backend(
    backend: SharedBackend,
    factory: BackendFactory,
    restart: RestartPolicy,
    shutdown: CancellationToken,
    state_tx: watch::Sender<ProxyState>,
    store: Option<StateStore>,
    name: String,
    port: u16,
) {
    let mut delay = RECONNECT_BACKOFF_START;
    loop {
        let handle = {
            let backend = backend.read().await;
            match backend.as_ref() {
                Some(client) => client.handle(),
                None => return,
            }
        };

        tokio::select! {
            _ = handle.closed() => {}
            _ = shutdown.cancelled() => return,
        }

        let reason = handle.close_reason().unwrap_or_default();
        warn!(%reason, "proxy backend exited");

        if restart == RestartPolicy::Never {
            shutdown.cancel();
            return;
        }

        let _ = state_tx.send(ProxyState::Reconnecting);
        loop {
            info!(?delay, "reconnecting backend");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return,
            }

            match factory().await {
                Ok(client) => {
                    let client = Arc::new(client);
                    if let Some(store) = &store {
                        let mut map = store.load().await;
                        map.insert(
                            name.clone(),
                            ServiceStatus {
                                state: ServiceState::Ready,
                                pid: Some(std::process::id()),
                                url: Some(format!("http://127.0.0.1:{port}")),
                            },
                        );
                        let _ = store.save(&map).await;
                    }
                    *backend.write().await = Some(client);
                    delay = RECONNECT_BACKOFF_START;
                    let _ = state_tx.send(ProxyState::Serving);
                    info!("backend reconnected");
                    break;
                }
                Err(err) => {
                    error!(error = format!("{err:#}"), "backend reconnect failed");
                    if restart == RestartPolicy::OnFailure && delay >= RECONNECT_BACKOFF_CAP {
                        // Backoff is exhausted; give up.
                        shutdown.cancel();
                        return;
                    }
                    delay = (delay * 2).min(RECONNECT_BACKOFF_CAP);
                }
            }
        }
    }
}

/// Derives the state-entry name from an explicit `--name` or the command's
/// basename.
pub fn derive_name(explicit: Option<&str>, command: &str) -> String {
    if let Some(name) = explicit {
        return name.to_string();
    }
    std::path::Path::new(command)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(command)
        .to_string()
}
