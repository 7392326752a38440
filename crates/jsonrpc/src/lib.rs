#![forbid(unsafe_code)]

//! `mcpd-jsonrpc` is a small line-delimited JSON-RPC 2.0 layer with the
//! transports mcpd needs.
//!
//! Client transports:
//! - stdio (spawned child process; the client owns the child)
//! - arbitrary `AsyncRead`/`AsyncWrite` pairs (in-memory duplex, stdio of the
//!   current process)
//! - HTTP SSE (`GET /sse` + `POST /message`), the scheme served by the mcpd
//!   proxy
//!
//! The server side is intentionally thin: a [`ServerHandler`] trait plus a
//! line loop ([`serve_io`]) and a per-message entry point ([`handle_message`])
//! for transports that frame messages themselves.
//!
//! Design goals:
//! - `serde_json::Value` based, low ceremony
//! - Bounded queues + per-message size limits
//! - Explicit close semantics: every in-flight request fails with the close
//!   reason

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};

mod server;
mod sse;

pub use server::{handle_message, serve_io, RpcError, ServerHandler};
pub use sse::SseOptions;

pub const JSONRPC_PARSE_ERROR: i64 = -32700;
pub const JSONRPC_INVALID_REQUEST: i64 = -32600;
pub const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;
pub const JSONRPC_INVALID_PARAMS: i64 = -32602;
pub const JSONRPC_INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum bytes for a single JSON-RPC message (one line).
    pub max_message_bytes: usize,
    /// Maximum buffered notifications from the peer.
    pub notifications_capacity: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            // Large enough for typical MCP messages, but bounded.
            max_message_bytes: 16 * 1024 * 1024,
            notifications_capacity: 256,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("json-rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolErrorKind {
    /// The client/transport was closed (explicitly or via drop).
    Closed,
    /// Waiting for a child process to exit timed out.
    WaitTimeout,
    /// Invalid user input (e.g. an unparsable URL).
    InvalidInput,
    /// SSE transport error (connect, endpoint handshake, POST bridge).
    Sse,
    /// Catch-all for internal invariants.
    Other,
}

#[derive(Debug, Clone)]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: String,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.message.fmt(f)
    }
}

impl std::error::Error for ProtocolError {}

impl Error {
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol(ProtocolError {
            kind,
            message: message.into(),
        })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Protocol(err) if err.kind == ProtocolErrorKind::Closed)
    }

    pub fn is_wait_timeout(&self) -> bool {
        matches!(self, Error::Protocol(err) if err.kind == ProtocolErrorKind::WaitTimeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Id {
    String(String),
    Integer(i64),
}

type PendingMap = HashMap<Id, oneshot::Sender<Result<Value, Error>>>;
type PendingRequests = Arc<Mutex<PendingMap>>;

fn lock_pending(pending: &PendingRequests) -> std::sync::MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn drain_pending(pending: &PendingRequests, reason: &str) {
    let waiters = {
        let mut pending = lock_pending(pending);
        std::mem::take(&mut *pending)
    };
    for (_, tx) in waiters {
        let _ = tx.send(Err(Error::protocol(ProtocolErrorKind::Closed, reason)));
    }
}

/// Cheap cloneable sending half of a [`Client`].
#[derive(Clone)]
pub struct ClientHandle {
    write: Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
    next_id: Arc<AtomicI64>,
    pending: PendingRequests,
    closed: Arc<AtomicBool>,
    closed_tx: Arc<watch::Sender<bool>>,
    close_reason: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle").finish_non_exhaustive()
    }
}

impl ClientHandle {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }

    /// Resolves once the client transport has closed (peer EOF, I/O error, or
    /// explicit close). Resolves immediately if it already has.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn check_closed(&self) -> Result<(), Error> {
        if !self.closed.load(Ordering::Relaxed) {
            return Ok(());
        }
        let reason = self
            .close_reason()
            .unwrap_or_else(|| "client closed".to_string());
        Err(Error::protocol(ProtocolErrorKind::Closed, reason))
    }

    pub(crate) async fn close_with_reason(&self, reason: impl Into<String>) {
        let reason = reason.into();

        self.closed.store(true, Ordering::Relaxed);
        if let Ok(mut guard) = self.close_reason.lock() {
            if guard.is_none() {
                *guard = Some(reason.clone());
            }
        }
        let _ = self.closed_tx.send(true);

        drain_pending(&self.pending, &reason);
        let mut write = self.write.lock().await;
        let _ = write.shutdown().await;
        // Many `AsyncWrite` impls (e.g. `tokio::process::ChildStdin`) only
        // fully close on drop. Replacing the writer guarantees the underlying
        // write end is closed.
        let _ = std::mem::replace(&mut *write, Box::new(tokio::io::sink()));
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        self.check_closed()?;
        let mut msg = Map::new();
        msg.insert("jsonrpc".to_string(), Value::String("2.0".to_string()));
        msg.insert("method".to_string(), Value::String(method.to_string()));
        if let Some(params) = params.filter(|v| !v.is_null()) {
            msg.insert("params".to_string(), params);
        }

        let mut line = serde_json::to_string(&Value::Object(msg))?;
        line.push('\n');
        self.write_line(&line).await
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        self.check_closed()?;
        let id = Id::Integer(self.next_id.fetch_add(1, Ordering::Relaxed));

        let (tx, rx) = oneshot::channel::<Result<Value, Error>>();
        {
            let mut pending = lock_pending(&self.pending);
            pending.insert(id.clone(), tx);
        }
        let mut guard = PendingRequestGuard::new(self.pending.clone(), id.clone());

        let mut req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
        });
        if let Some(params) = params.filter(|v| !v.is_null()) {
            req["params"] = params;
        }

        let mut line = serde_json::to_string(&req)?;
        line.push('\n');
        self.write_line(&line).await?;

        match rx.await {
            Ok(result) => {
                guard.disarm();
                result
            }
            Err(_) => Err(Error::protocol(
                ProtocolErrorKind::Closed,
                "response channel closed",
            )),
        }
    }

    /// `request` bounded by `timeout`; on timeout the pending entry is
    /// dropped so a late response is discarded.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, Error> {
        match tokio::time::timeout(timeout, self.request(method, params)).await {
            Ok(result) => result,
            Err(_) => Err(Error::protocol(
                ProtocolErrorKind::WaitTimeout,
                format!("request timed out after {timeout:?}: {method}"),
            )),
        }
    }

    pub(crate) async fn respond_error_raw_id(
        &self,
        id: Value,
        code: i64,
        message: impl Into<String>,
    ) -> Result<(), Error> {
        self.check_closed()?;
        let response = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message.into() },
        });
        let mut line = serde_json::to_string(&response)?;
        line.push('\n');
        self.write_line(&line).await
    }

    async fn write_line(&self, line: &str) -> Result<(), Error> {
        self.check_closed()?;
        let mut write = self.write.lock().await;
        write.write_all(line.as_bytes()).await?;
        write.flush().await?;
        Ok(())
    }
}

struct PendingRequestGuard {
    pending: PendingRequests,
    id: Id,
    armed: bool,
}

impl PendingRequestGuard {
    fn new(pending: PendingRequests, id: Id) -> Self {
        Self {
            pending,
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingRequestGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut pending = lock_pending(&self.pending);
        pending.remove(&self.id);
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOnTimeout {
    /// Return an error if the child does not exit within the timeout; the
    /// child is left running.
    ReturnError,
    /// Kill the child if it does not exit within the timeout, then wait up to
    /// `kill_timeout` for it to go away.
    Kill { kill_timeout: Duration },
}

pub struct Client {
    handle: ClientHandle,
    child: Option<Child>,
    notifications_rx: Option<mpsc::Receiver<Notification>>,
    task: tokio::task::JoinHandle<()>,
    transport_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    pub async fn connect_io<R, W>(read: R, write: W) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::connect_io_with_limits(read, write, Limits::default()).await
    }

    pub async fn connect_io_with_limits<R, W>(
        read: R,
        write: W,
        limits: Limits,
    ) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::create(read, write, None, limits).await
    }

    pub async fn spawn<I, S>(program: S, args: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = OsString>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stderr(Stdio::inherit());
        Self::spawn_command(cmd).await
    }

    /// Spawn `cmd` with piped stdin/stdout and attach to it. The returned
    /// client owns the child process; the child is killed if the client is
    /// dropped without an explicit `wait*`.
    pub async fn spawn_command(mut cmd: Command) -> Result<Self, Error> {
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::protocol(ProtocolErrorKind::Other, "child stdin not captured"))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::protocol(ProtocolErrorKind::Other, "child stdout not captured")
        })?;

        Self::create(stdout, stdin, Some(child), Limits::default()).await
    }

    async fn create<R, W>(
        read: R,
        write: W,
        child: Option<Child>,
        limits: Limits,
    ) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let notify_cap = limits.notifications_capacity.max(1);
        let (notify_tx, notify_rx) = mpsc::channel::<Notification>(notify_cap);
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let (closed_tx, _closed_rx) = watch::channel(false);
        let handle = ClientHandle {
            write: Arc::new(tokio::sync::Mutex::new(Box::new(write) as _)),
            next_id: Arc::new(AtomicI64::new(1)),
            pending: pending.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            closed_tx: Arc::new(closed_tx),
            close_reason: Arc::new(Mutex::new(None)),
        };

        let task = spawn_reader_task(read, pending, notify_tx, handle.clone(), limits);

        Ok(Self {
            handle,
            child,
            notifications_rx: Some(notify_rx),
            task,
            transport_tasks: Vec::new(),
        })
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub fn child_id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|child| child.id())
    }

    pub fn take_notifications(&mut self) -> Option<mpsc::Receiver<Notification>> {
        self.notifications_rx.take()
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        self.handle.notify(method, params).await
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        self.handle.request(method, params).await
    }

    pub(crate) fn push_transport_task(&mut self, task: tokio::task::JoinHandle<()>) {
        self.transport_tasks.push(task);
    }

    /// Closes the client and (if present) waits for the underlying child
    /// process to exit. Can hang indefinitely if the child does not exit;
    /// prefer [`Client::wait_with_timeout`] for an upper bound.
    pub async fn wait(&mut self) -> Result<Option<std::process::ExitStatus>, Error> {
        self.shutdown_tasks().await;
        match &mut self.child {
            Some(child) => Ok(Some(child.wait().await?)),
            None => Ok(None),
        }
    }

    /// Closes the client and waits for the underlying child process to exit,
    /// up to `timeout`. Clients without a child return `Ok(None)` without
    /// waiting.
    pub async fn wait_with_timeout(
        &mut self,
        timeout: Duration,
        on_timeout: WaitOnTimeout,
    ) -> Result<Option<std::process::ExitStatus>, Error> {
        self.shutdown_tasks().await;

        let Some(child) = &mut self.child else {
            return Ok(None);
        };

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => Ok(Some(status?)),
            Err(_) => match on_timeout {
                WaitOnTimeout::ReturnError => Err(Error::protocol(
                    ProtocolErrorKind::WaitTimeout,
                    format!("wait timed out after {timeout:?}"),
                )),
                WaitOnTimeout::Kill { kill_timeout } => {
                    let child_id = child.id();
                    if let Err(err) = child.start_kill() {
                        if let Ok(Some(status)) = child.try_wait() {
                            return Ok(Some(status));
                        }
                        return Err(Error::protocol(
                            ProtocolErrorKind::WaitTimeout,
                            format!(
                                "wait timed out after {timeout:?}; failed to kill child (id={child_id:?}): {err}"
                            ),
                        ));
                    }
                    match tokio::time::timeout(kill_timeout, child.wait()).await {
                        Ok(status) => Ok(Some(status?)),
                        Err(_) => Err(Error::protocol(
                            ProtocolErrorKind::WaitTimeout,
                            format!(
                                "wait timed out after {timeout:?}; killed child (id={child_id:?}) but it did not exit within {kill_timeout:?}"
                            ),
                        )),
                    }
                }
            },
        }
    }

    async fn shutdown_tasks(&mut self) {
        self.task.abort();
        for task in self.transport_tasks.drain(..) {
            task.abort();
        }
        self.handle.close_with_reason("client closed").await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.handle.closed.store(true, Ordering::Relaxed);
        if let Ok(mut guard) = self.handle.close_reason.lock() {
            if guard.is_none() {
                *guard = Some("client closed".to_string());
            }
        }
        let _ = self.handle.closed_tx.send(true);
        self.task.abort();
        for task in self.transport_tasks.drain(..) {
            task.abort();
        }
        drain_pending(&self.handle.pending, "client closed");
    }
}

fn spawn_reader_task<R>(
    reader: R,
    pending: PendingRequests,
    notify_tx: mpsc::Sender<Notification>,
    responder: ClientHandle,
    limits: Limits,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let max_message_bytes = limits.max_message_bytes.max(1);
        let mut reader = tokio::io::BufReader::new(reader);
        loop {
            match read_line_limited(&mut reader, max_message_bytes).await {
                Ok(Some(line)) => {
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let value: Value = match serde_json::from_slice(&line) {
                        Ok(value) => value,
                        // Non-JSON noise on the stream is skipped; the peer
                        // may be logging to the wrong fd.
                        Err(_) => continue,
                    };
                    handle_incoming_value(value, &pending, &notify_tx, &responder).await;
                }
                Ok(None) => {
                    responder.close_with_reason("peer closed connection").await;
                    return;
                }
                Err(err) => {
                    responder
                        .close_with_reason(format!("io error: {err}"))
                        .await;
                    return;
                }
            }
        }
    })
}

async fn handle_incoming_value(
    value: Value,
    pending: &PendingRequests,
    notify_tx: &mpsc::Sender<Notification>,
    responder: &ClientHandle,
) {
    let Value::Object(mut obj) = value else {
        return;
    };

    let id = obj.get("id").filter(|id| !id.is_null()).cloned();
    let method = obj
        .get("method")
        .and_then(|m| m.as_str())
        .map(str::to_string);

    match (id, method) {
        // Response to one of our requests.
        (Some(id_value), None) => {
            let Ok(id) = serde_json::from_value::<Id>(id_value) else {
                return;
            };
            let waiter = {
                let mut pending = lock_pending(pending);
                pending.remove(&id)
            };
            let Some(waiter) = waiter else {
                return;
            };
            let result = if let Some(error) = obj.remove("error") {
                let code = error.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
                let message = error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error")
                    .to_string();
                let data = error.get("data").cloned();
                Err(Error::Rpc {
                    code,
                    message,
                    data,
                })
            } else {
                Ok(obj.remove("result").unwrap_or(Value::Null))
            };
            let _ = waiter.send(result);
        }
        // Request from the peer. mcpd never answers peer-originated requests;
        // decline them so the peer is not left waiting.
        (Some(id_value), Some(method)) => {
            let _ = responder
                .respond_error_raw_id(
                    id_value,
                    JSONRPC_METHOD_NOT_FOUND,
                    format!("method not found: {method}"),
                )
                .await;
        }
        // Notification.
        (None, Some(method)) => {
            let params = obj.get("params").cloned();
            // Bounded queue: drop when the consumer is behind or gone.
            let _ = notify_tx.try_send(Notification { method, params });
        }
        (None, None) => {}
    }
}

/// Reads one `\n`-terminated line, rejecting lines longer than `max_bytes`.
/// Returns `Ok(None)` on EOF with no pending bytes.
pub(crate) async fn read_line_limited<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_bytes: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            return Ok(Some(line));
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if line.len() + pos > max_bytes {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("message exceeds {max_bytes} bytes"),
                    ));
                }
                line.extend_from_slice(&buf[..pos]);
                reader.consume(pos + 1);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(line));
            }
            None => {
                let take = buf.len();
                if line.len() + take > max_bytes {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("message exceeds {max_bytes} bytes"),
                    ));
                }
                line.extend_from_slice(buf);
                reader.consume(take);
            }
        }
    }
}
