//! Typed subset of the MCP schema.
//!
//! These types are intentionally a *subset* of the full MCP schema: enough
//! for tool listing/calling and the capability negotiation the proxy
//! forwards. Everything else stays `serde_json::Value`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// MCP protocol version sent during `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
    #[serde(rename = "nextCursor", default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// One block of a tool result. Text blocks are understood (middlewares
/// rewrite them); every other block shape passes through untouched.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ContentBlock {
    Text(TextContent),
    Other(Value),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(TextContent {
            kind: TextMarker::Text,
            text: text.into(),
            extra: Map::new(),
        })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(block) => Some(&block.text),
            Self::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TextContent {
    #[serde(rename = "type")]
    pub kind: TextMarker,
    pub text: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Discriminant that only (de)serializes as the literal `"text"`, so the
/// untagged [`ContentBlock`] falls through to `Other` for anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum TextMarker {
    #[serde(rename = "text")]
    Text,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(
        rename = "structuredContent",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub structured_content: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CallToolResult {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            ..Default::default()
        }
    }
}

/// Server capabilities relevant to forwarding: which request families the
/// backend answers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerCapabilities {
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
}

impl ServerCapabilities {
    /// Reads the `capabilities` object of an `initialize` result. A backend
    /// that reports nothing still gets tools advertised on its behalf.
    pub fn from_initialize_result(result: &Value) -> Self {
        let caps = result.get("capabilities").and_then(|c| c.as_object());
        let Some(caps) = caps else {
            return Self {
                tools: true,
                ..Default::default()
            };
        };

        let mut out = Self {
            tools: caps.contains_key("tools"),
            resources: caps.contains_key("resources"),
            prompts: caps.contains_key("prompts"),
        };
        if !out.tools && !out.resources && !out.prompts {
            out.tools = true;
        }
        out
    }

    pub fn to_value(self) -> Value {
        let mut caps = Map::new();
        if self.tools {
            caps.insert("tools".to_string(), Value::Object(Map::new()));
        }
        if self.resources {
            caps.insert("resources".to_string(), Value::Object(Map::new()));
        }
        if self.prompts {
            caps.insert("prompts".to_string(), Value::Object(Map::new()));
        }
        Value::Object(caps)
    }
}
