//! Front server: exposes the aggregator as an MCP server over stdio.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mcpd_jsonrpc::{RpcError, ServerHandler};
use serde_json::Value;

use crate::aggregator::ToolAggregator;
use crate::client::to_rpc_error;
use crate::mcp::MCP_PROTOCOL_VERSION;
use crate::middleware::{apply_response_chain, Pipeline};

pub struct FrontServer {
    aggregator: Arc<ToolAggregator>,
    /// Response middleware chains keyed by origin service.
    pipelines: HashMap<String, Pipeline>,
}

impl FrontServer {
    pub fn new(aggregator: Arc<ToolAggregator>, pipelines: HashMap<String, Pipeline>) -> Self {
        Self {
            aggregator,
            pipelines,
        }
    }

    /// Serves MCP over this process's stdin/stdout until EOF.
    pub async fn serve_stdio(self: Arc<Self>) -> anyhow::Result<()> {
        mcpd_jsonrpc::serve_io(tokio::io::stdin(), tokio::io::stdout(), self)
            .await
            .map_err(Into::into)
    }

    async fn list_tools(&self) -> Result<Value, RpcError> {
        let tools = self
            .aggregator
            .list_all_tools()
            .await
            .map_err(to_rpc_error)?;
        // Only the wire-facing Tool goes out; service/original_name are
        // routing internals.
        let tools: Vec<Value> = tools
            .into_iter()
            .map(|t| serde_json::to_value(t.tool).map_err(|err| RpcError::internal(err.to_string())))
            .collect::<Result<_, _>>()?;
        Ok(serde_json::json!({ "tools": tools }))
    }

    async fn call_tool(&self, params: Option<Value>) -> Result<Value, RpcError> {
        let params = params.unwrap_or(Value::Null);
        let name = params
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| RpcError::invalid_params("tools/call requires a name"))?;
        let arguments = params.get("arguments").cloned();

        let (service, _) = self.aggregator.parse_name(name).await.map_err(to_rpc_error)?;
        let result = self
            .aggregator
            .route_tool_call(name, arguments)
            .await
            .map_err(to_rpc_error)?;

        let result = match self.pipelines.get(&service) {
            Some(pipeline) => apply_response_chain(pipeline, name, result),
            None => result,
        };
        serde_json::to_value(result).map_err(|err| RpcError::internal(err.to_string()))
    }
}

#[async_trait]
impl ServerHandler for FrontServer {
    async fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(serde_json::json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "mcpd",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
            "ping" => Ok(serde_json::json!({})),
            "tools/list" => self.list_tools().await,
            "tools/call" => self.call_tool(params).await,
            other => Err(RpcError::method_not_found(other)),
        }
    }
}
