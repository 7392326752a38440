//! Backend client adapter: one uniform facade over stdio and SSE MCP
//! clients.
//!
//! `connect*` performs the MCP `initialize` handshake and retains its result
//! so callers can interrogate backend capabilities. Legacy `toolResult`
//! responses are normalized here, at the adapter boundary, and nowhere else.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tokio::process::Command;

use crate::mcp::{CallToolResult, ContentBlock, ListToolsResult, ServerCapabilities, Tool, MCP_PROTOCOL_VERSION};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct StdioOptions {
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

pub struct BackendClient {
    client: mcpd_jsonrpc::Client,
    init_result: Value,
    request_timeout: Duration,
}

impl BackendClient {
    /// Connects to an SSE backend and performs the MCP handshake.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = mcpd_jsonrpc::Client::connect_sse(url)
            .await
            .with_context(|| format!("connect sse backend (url={url})"))?;
        Self::attach(client).await
    }

    /// Spawns `command` as a stdio backend and performs the MCP handshake.
    /// The returned client owns the child process.
    pub async fn connect_stdio(
        command: &str,
        args: &[String],
        opts: StdioOptions,
    ) -> anyhow::Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }
        cmd.stderr(std::process::Stdio::inherit());

        let client = mcpd_jsonrpc::Client::spawn_command(cmd)
            .await
            .with_context(|| format!("spawn stdio backend: {command}"))?;
        Self::attach(client).await
    }

    /// Attaches to an already-connected byte stream (in-process backends,
    /// tests) and performs the MCP handshake.
    pub async fn connect_io<R, W>(read: R, write: W) -> anyhow::Result<Self>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let client = mcpd_jsonrpc::Client::connect_io(read, write)
            .await
            .context("connect io backend")?;
        Self::attach(client).await
    }

    async fn attach(client: mcpd_jsonrpc::Client) -> anyhow::Result<Self> {
        let request_timeout = DEFAULT_REQUEST_TIMEOUT;
        let init_params = serde_json::json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "clientInfo": {
                "name": "mcpd",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {},
        });

        let init_result = client
            .handle()
            .request_with_timeout("initialize", Some(init_params), request_timeout)
            .await
            .context("mcp initialize failed")?;
        client
            .notify("notifications/initialized", None)
            .await
            .context("mcp initialized notification failed")?;

        Ok(Self {
            client,
            init_result,
            request_timeout,
        })
    }

    /// PID of the owned child process; `None` for SSE connections.
    pub fn pid(&self) -> Option<u32> {
        self.client.child_id()
    }

    pub fn initialize_result(&self) -> &Value {
        &self.init_result
    }

    pub fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities::from_initialize_result(&self.init_result)
    }

    pub fn handle(&self) -> mcpd_jsonrpc::ClientHandle {
        self.client.handle()
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> anyhow::Result<Value> {
        self.client
            .handle()
            .request_with_timeout(method, params, self.request_timeout)
            .await
            .with_context(|| format!("mcp request failed: {method}"))
    }

    pub async fn list_tools(&self) -> anyhow::Result<Vec<Tool>> {
        let raw = self.request("tools/list", None).await?;
        let result: ListToolsResult =
            serde_json::from_value(raw).context("deserialize tools/list result")?;
        Ok(result.tools)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> anyhow::Result<CallToolResult> {
        let mut params = serde_json::json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        let raw = self.request("tools/call", Some(params)).await?;
        let normalized = normalize_tool_result(raw);
        serde_json::from_value(normalized).context("deserialize tools/call result")
    }

    /// Closes the transport; a stdio child gets a bounded wait, escalating
    /// to kill.
    pub async fn disconnect(mut self) -> anyhow::Result<()> {
        self.client
            .wait_with_timeout(
                DISCONNECT_GRACE,
                mcpd_jsonrpc::WaitOnTimeout::Kill {
                    kill_timeout: DISCONNECT_GRACE,
                },
            )
            .await
            .context("disconnect backend")?;
        Ok(())
    }
}

/// Maps a failed backend call onto the protocol layer: backend JSON-RPC
/// errors pass through with their own code and message, everything else
/// surfaces as an internal error.
pub(crate) fn to_rpc_error(err: anyhow::Error) -> mcpd_jsonrpc::RpcError {
    for cause in err.chain() {
        if let Some(mcpd_jsonrpc::Error::Rpc {
            code,
            message,
            data,
        }) = cause.downcast_ref::<mcpd_jsonrpc::Error>()
        {
            return mcpd_jsonrpc::RpcError {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            };
        }
    }
    mcpd_jsonrpc::RpcError::internal(format!("{err:#}"))
}

/// Older servers return `{ toolResult: ... }` instead of a `content` array.
/// Synthesize a single text block from it; everything else passes through.
fn normalize_tool_result(raw: Value) -> Value {
    let Value::Object(ref obj) = raw else {
        return raw;
    };
    if obj.contains_key("content") {
        return raw;
    }
    let Some(tool_result) = obj.get("toolResult") else {
        return raw;
    };

    let text = match tool_result {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    serde_json::to_value(CallToolResult {
        content: vec![ContentBlock::text(text)],
        ..Default::default()
    })
    .unwrap_or(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_tool_result_string_becomes_text_block() {
        let raw = serde_json::json!({ "toolResult": "done" });
        let normalized = normalize_tool_result(raw);
        let result: CallToolResult = serde_json::from_value(normalized).unwrap();
        assert_eq!(result.content.len(), 1);
        assert_eq!(result.content[0].as_text(), Some("done"));
    }

    #[test]
    fn legacy_tool_result_value_is_json_encoded() {
        let raw = serde_json::json!({ "toolResult": { "ok": true } });
        let normalized = normalize_tool_result(raw);
        let result: CallToolResult = serde_json::from_value(normalized).unwrap();
        assert_eq!(result.content[0].as_text(), Some(r#"{"ok":true}"#));
    }

    #[test]
    fn modern_results_pass_through() {
        let raw = serde_json::json!({
            "content": [{ "type": "text", "text": "hi" }],
            "isError": false,
        });
        let normalized = normalize_tool_result(raw.clone());
        assert_eq!(normalized, raw);
    }
}
