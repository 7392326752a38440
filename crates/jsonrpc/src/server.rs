//! Minimal JSON-RPC 2.0 server loop.
//!
//! Implement [`ServerHandler`] for your dispatch logic, then either drive it
//! over a byte stream with [`serve_io`] (stdio servers) or feed it one
//! already-framed message at a time with [`handle_message`] (HTTP transports
//! that frame messages themselves).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{
    read_line_limited, Error, Limits, JSONRPC_INTERNAL_ERROR, JSONRPC_INVALID_PARAMS,
    JSONRPC_INVALID_REQUEST, JSONRPC_METHOD_NOT_FOUND, JSONRPC_PARSE_ERROR,
};

#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(JSONRPC_METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(JSONRPC_INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(JSONRPC_INTERNAL_ERROR, message)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

#[async_trait]
pub trait ServerHandler: Send + Sync {
    async fn handle_request(&self, method: &str, params: Option<Value>)
        -> Result<Value, RpcError>;

    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        let _ = (method, params);
    }
}

/// Dispatches one incoming JSON value and returns the response to send back,
/// if any (notifications and responses produce none).
pub async fn handle_message(handler: &dyn ServerHandler, msg: Value) -> Option<Value> {
    let Value::Object(obj) = msg else {
        return Some(error_response(
            Value::Null,
            JSONRPC_INVALID_REQUEST,
            "request must be a json object",
            None,
        ));
    };

    let id = obj.get("id").filter(|id| !id.is_null()).cloned();
    let method = obj.get("method").and_then(|m| m.as_str());
    let params = obj.get("params").cloned();

    match (id, method) {
        (Some(id), Some(method)) => {
            let response = match handler.handle_request(method, params).await {
                Ok(result) => serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": result,
                }),
                Err(err) => error_response(id, err.code, &err.message, err.data),
            };
            Some(response)
        }
        (None, Some(method)) => {
            handler.handle_notification(method, params).await;
            None
        }
        // A bare response; nothing to answer.
        (Some(_), None) => None,
        (None, None) => Some(error_response(
            Value::Null,
            JSONRPC_INVALID_REQUEST,
            "request must carry a method",
            None,
        )),
    }
}

/// Runs `handler` over a line-delimited byte stream until EOF.
pub async fn serve_io<R, W>(read: R, write: W, handler: Arc<dyn ServerHandler>) -> Result<(), Error>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    serve_io_with_limits(read, write, handler, Limits::default()).await
}

pub async fn serve_io_with_limits<R, W>(
    read: R,
    mut write: W,
    handler: Arc<dyn ServerHandler>,
    limits: Limits,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let max_message_bytes = limits.max_message_bytes.max(1);
    let mut reader = tokio::io::BufReader::new(read);

    loop {
        let Some(line) = read_line_limited(&mut reader, max_message_bytes).await? else {
            return Ok(());
        };
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let response = match serde_json::from_slice::<Value>(&line) {
            Ok(msg) => handle_message(handler.as_ref(), msg).await,
            Err(err) => Some(error_response(
                Value::Null,
                JSONRPC_PARSE_ERROR,
                &format!("parse error: {err}"),
                None,
            )),
        };

        if let Some(response) = response {
            let mut out = serde_json::to_vec(&response)?;
            out.push(b'\n');
            write.write_all(&out).await?;
            write.flush().await?;
        }
    }
}

fn error_response(id: Value, code: i64, message: &str, data: Option<Value>) -> Value {
    let mut error = serde_json::json!({ "code": code, "message": message });
    if let Some(data) = data {
        error["data"] = data;
    }
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": error,
    })
}
