//! Tool aggregator & router.
//!
//! Collects every backend's tool inventory under one namespace and routes
//! calls back to the right backend. Namespacing is conditional: with a
//! single backend, external names are the originals; with several, they are
//! `service_toolname`, and parsing resolves the ambiguity of underscores in
//! service names by taking the longest registered prefix.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::client::BackendClient;
use crate::mcp::{CallToolResult, Tool};

/// A backend tool decorated for external listing. `service` and
/// `original_name` exist for internal routing and are stripped before the
/// wire.
#[derive(Debug, Clone)]
pub struct NamespacedTool {
    pub tool: Tool,
    pub service: String,
    pub original_name: String,
}

struct BackendEntry {
    name: String,
    client: Arc<BackendClient>,
    exclude: HashSet<String>,
}

#[derive(Default)]
pub struct ToolAggregator {
    // Registration order matters for listing; a Vec keeps it.
    backends: tokio::sync::RwLock<Vec<BackendEntry>>,
}

impl ToolAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a backend. Re-adding a name resets its
    /// exclusion set to exactly `exclude`.
    pub async fn add_backend(
        &self,
        name: &str,
        client: Arc<BackendClient>,
        exclude: HashSet<String>,
    ) {
        let mut backends = self.backends.write().await;
        let entry = BackendEntry {
            name: name.to_string(),
            client,
            exclude,
        };
        match backends.iter_mut().find(|b| b.name == name) {
            Some(existing) => *existing = entry,
            None => backends.push(entry),
        }
    }

    pub async fn remove_backend(&self, name: &str) -> bool {
        let mut backends = self.backends.write().await;
        let before = backends.len();
        backends.retain(|b| b.name != name);
        backends.len() != before
    }

    pub async fn backend(&self, name: &str) -> Option<Arc<BackendClient>> {
        let backends = self.backends.read().await;
        backends
            .iter()
            .find(|b| b.name == name)
            .map(|b| b.client.clone())
    }

    pub async fn backend_names(&self) -> Vec<String> {
        let backends = self.backends.read().await;
        backends.iter().map(|b| b.name.clone()).collect()
    }

    /// Fans out `tools/list` to every backend concurrently. Order is the
    /// concatenation of backends in registration order, each with its tools
    /// in backend order.
    pub async fn list_all_tools(&self) -> anyhow::Result<Vec<NamespacedTool>> {
        let (targets, single) = {
            let backends = self.backends.read().await;
            let targets: Vec<(String, Arc<BackendClient>, HashSet<String>)> = backends
                .iter()
                .map(|b| (b.name.clone(), b.client.clone(), b.exclude.clone()))
                .collect();
            let single = backends.len() == 1;
            (targets, single)
        };

        let listings = futures_util::future::join_all(targets.iter().map(
            |(name, client, _)| async move {
                client
                    .list_tools()
                    .await
                    .map_err(|err| anyhow::anyhow!("list tools from {name}: {err:#}"))
            },
        ))
        .await;

        let mut out = Vec::new();
        for ((name, _, exclude), listing) in targets.iter().zip(listings) {
            for tool in listing? {
                if exclude.contains(&tool.name) {
                    continue;
                }
                out.push(namespace_tool(name, tool, single));
            }
        }
        Ok(out)
    }

    /// Splits an external tool name into `(service, original_name)`.
    ///
    /// With a single backend the name is returned unchanged. With several,
    /// every underscore split whose left side names a registered backend is
    /// considered and the longest such prefix wins, so `a_b_tool` routes to
    /// `a_b` even when `a` is also registered.
    pub async fn parse_name(&self, name: &str) -> anyhow::Result<(String, String)> {
        let backends = self.backends.read().await;
        if backends.len() == 1 {
            return Ok((backends[0].name.clone(), name.to_string()));
        }

        let mut best: Option<(usize, &str)> = None;
        for (pos, _) in name.match_indices('_') {
            let (prefix, rest) = name.split_at(pos);
            if backends.iter().any(|b| b.name == prefix) {
                best = Some((pos, &rest[1..]));
            }
        }

        match best {
            Some((pos, tool)) => Ok((name[..pos].to_string(), tool.to_string())),
            None => anyhow::bail!("invalid tool name {name:?}: no matching service prefix"),
        }
    }

    /// Routes a namespaced call to its origin backend.
    pub async fn route_tool_call(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> anyhow::Result<CallToolResult> {
        let (service, original_name) = self.parse_name(name).await?;
        let client = self
            .backend(&service)
            .await
            .ok_or_else(|| anyhow::anyhow!("Unknown service: {service}"))?;
        client.call_tool(&original_name, arguments).await
    }
}

fn namespace_tool(service: &str, tool: Tool, single_backend: bool) -> NamespacedTool {
    let original_name = tool.name.clone();
    let external_name = if single_backend {
        original_name.clone()
    } else {
        format!("{service}_{original_name}")
    };
    let description = match tool.description.as_deref().map(str::trim) {
        Some(desc) if !desc.is_empty() => format!("[{service}] {desc}"),
        _ => format!("[{service}]"),
    };

    NamespacedTool {
        tool: Tool {
            name: external_name,
            description: Some(description),
            ..tool
        },
        service: service.to_string(),
        original_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::ContentBlock;
    use crate::testing::fake_client;

    #[tokio::test]
    async fn single_backend_keeps_original_names() {
        let agg = ToolAggregator::new();
        agg.add_backend(
            "serena",
            fake_client(vec![("find_symbol", "Find a symbol"), ("search", "")]).await,
            HashSet::new(),
        )
        .await;

        let tools = agg.list_all_tools().await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.tool.name.as_str()).collect();
        assert_eq!(names, vec!["find_symbol", "search"]);
        assert_eq!(tools[0].service, "serena");
        assert_eq!(tools[0].original_name, "find_symbol");
        assert_eq!(tools[0].tool.description.as_deref(), Some("[serena] Find a symbol"));
        // Empty backend description still gets the service tag.
        assert_eq!(tools[1].tool.description.as_deref(), Some("[serena]"));

        let result = agg
            .route_tool_call("find_symbol", Some(serde_json::json!({ "query": "x" })))
            .await
            .unwrap();
        assert_eq!(result.content[0].as_text(), Some("called:find_symbol"));
    }

    #[tokio::test]
    async fn multiple_backends_namespace_tools() {
        let agg = ToolAggregator::new();
        agg.add_backend("alpha", fake_client(vec![("run", "Run")]).await, HashSet::new())
            .await;
        agg.add_backend("beta", fake_client(vec![("run", "Run")]).await, HashSet::new())
            .await;

        let tools = agg.list_all_tools().await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.tool.name.as_str()).collect();
        assert_eq!(names, vec!["alpha_run", "beta_run"]);

        let result = agg.route_tool_call("beta_run", None).await.unwrap();
        assert_eq!(result.content[0].as_text(), Some("called:run"));
    }

    #[tokio::test]
    async fn longest_prefix_wins() {
        let agg = ToolAggregator::new();
        agg.add_backend("a", fake_client(vec![("x", "")]).await, HashSet::new())
            .await;
        agg.add_backend("a_b", fake_client(vec![("tool", "")]).await, HashSet::new())
            .await;

        assert_eq!(
            agg.parse_name("a_b_tool").await.unwrap(),
            ("a_b".to_string(), "tool".to_string())
        );
        assert_eq!(
            agg.parse_name("a_x").await.unwrap(),
            ("a".to_string(), "x".to_string())
        );
    }

    #[tokio::test]
    async fn unknown_prefix_is_an_error() {
        let agg = ToolAggregator::new();
        agg.add_backend("a", fake_client(vec![]).await, HashSet::new())
            .await;
        agg.add_backend("b", fake_client(vec![]).await, HashSet::new())
            .await;

        let err = agg.parse_name("zz_tool").await.unwrap_err();
        assert!(
            err.to_string().contains("no matching service prefix"),
            "err={err:#}"
        );
    }

    #[tokio::test]
    async fn excluded_tools_are_hidden() {
        let agg = ToolAggregator::new();
        agg.add_backend(
            "svc",
            fake_client(vec![("keep", ""), ("hide", "")]).await,
            HashSet::from(["hide".to_string()]),
        )
        .await;

        let tools = agg.list_all_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].original_name, "keep");
    }

    #[tokio::test]
    async fn readding_backend_clears_exclusions() {
        let agg = ToolAggregator::new();
        let client = fake_client(vec![("keep", ""), ("hide", "")]).await;
        agg.add_backend("svc", client.clone(), HashSet::from(["hide".to_string()]))
            .await;
        assert!(agg.remove_backend("svc").await);
        agg.add_backend("svc", client, HashSet::new()).await;

        let tools = agg.list_all_tools().await.unwrap();
        assert_eq!(tools.len(), 2);
    }

    #[tokio::test]
    async fn external_name_round_trips_through_parse() {
        let agg = ToolAggregator::new();
        agg.add_backend("svc_one", fake_client(vec![("do_it", "")]).await, HashSet::new())
            .await;
        agg.add_backend("other", fake_client(vec![]).await, HashSet::new())
            .await;

        let tools = agg.list_all_tools().await.unwrap();
        let external = &tools[0].tool.name;
        assert_eq!(external, "svc_one_do_it");
        assert_eq!(
            agg.parse_name(external).await.unwrap(),
            ("svc_one".to_string(), "do_it".to_string())
        );
    }

    #[test]
    fn result_text_helper_reads_first_block() {
        let result = CallToolResult {
            content: vec![ContentBlock::text("hello")],
            ..Default::default()
        };
        assert_eq!(result.content[0].as_text(), Some("hello"));
    }
}
