//! In-process fixtures shared by unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use mcpd_jsonrpc::{RpcError, ServerHandler};
use serde_json::Value;

use crate::client::BackendClient;

/// In-memory MCP backend with a fixed tool inventory. `tools/call` answers
/// `called:<name>` (or echoes `message`/`name` arguments for the echo/greet
/// tools) so routing is observable from the outside.
pub(crate) struct FakeBackend {
    pub tools: Vec<(&'static str, &'static str)>,
}

#[async_trait]
impl ServerHandler for FakeBackend {
    async fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(serde_json::json!({
                "protocolVersion": crate::mcp::MCP_PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "fake", "version": "0.0.0" },
            })),
            "tools/list" => {
                let tools: Vec<Value> = self
                    .tools
                    .iter()
                    .map(|(name, desc)| {
                        serde_json::json!({
                            "name": name,
                            "description": desc,
                            "inputSchema": { "type": "object" },
                        })
                    })
                    .collect();
                Ok(serde_json::json!({ "tools": tools }))
            }
            "tools/call" => {
                let params = params.unwrap_or(Value::Null);
                let name = params.get("name").and_then(|n| n.as_str()).unwrap_or_default();
                let args = params.get("arguments").cloned().unwrap_or(Value::Null);
                let text = match name {
                    "echo" => args
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    "greet" => format!(
                        "Hello, {}!",
                        args.get("name").and_then(|n| n.as_str()).unwrap_or("world")
                    ),
                    other => format!("called:{other}"),
                };
                Ok(serde_json::json!({
                    "content": [{ "type": "text", "text": text }],
                }))
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

/// Spawns a [`FakeBackend`] over an in-memory duplex and returns a connected
/// [`BackendClient`].
pub(crate) async fn fake_client(
    tools: Vec<(&'static str, &'static str)>,
) -> Arc<BackendClient> {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let (near_read, near_write) = tokio::io::split(near);
    let (far_read, far_write) = tokio::io::split(far);
    tokio::spawn(async move {
        let _ = mcpd_jsonrpc::serve_io(far_read, far_write, Arc::new(FakeBackend { tools })).await;
    });
    Arc::new(
        BackendClient::connect_io(near_read, near_write)
            .await
            .expect("fake backend connects"),
    )
}
