// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::bail;

use nils_model::ToolSchema;

use crate::tool::Tool;

/// Prefix of tool names owned by the workflow engine.
pub const WORKFLOW_TOOL_PREFIX: &str = "workflow_";

/// Central tool registry.
///
/// Copy-on-replace: readers take an `Arc` snapshot of the underlying map,
/// so an in-flight agent-loop iteration keeps a stable view while
/// hot-reload swaps the whole set with `replace_all`.
pub struct ToolRegistry {
    tools: RwLock<Arc<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn with_tools(tools: Vec<Arc<dyn Tool>>) -> anyhow::Result<Self> {
        let registry = Self::new();
        registry.replace_all(tools)?;
        Ok(registry)
    }

    /// Register one tool. Duplicate names are an error.
    pub fn register(&self, tool: Arc<dyn Tool>) -> anyhow::Result<()> {
        let mut guard = self.tools.write().expect("registry lock poisoned");
        if guard.contains_key(tool.name()) {
            bail!("duplicate tool registration: {}", tool.name());
        }
        let mut next = (**guard).clone();
        next.insert(tool.name().to_string(), tool);
        *guard = Arc::new(next);
        Ok(())
    }

    /// Swap the entire tool set atomically (hot-reload).
    pub fn replace_all(&self, tools: Vec<Arc<dyn Tool>>) -> anyhow::Result<()> {
        let mut next: HashMap<String, Arc<dyn Tool>> = HashMap::with_capacity(tools.len());
        for tool in tools {
            if next.insert(tool.name().to_string(), tool.clone()).is_some() {
                bail!("duplicate tool registration: {}", tool.name());
            }
        }
        *self.tools.write().expect("registry lock poisoned") = Arc::new(next);
        Ok(())
    }

    /// Replace only the `workflow_*` entries, leaving everything else as-is.
    pub fn replace_workflow_tools(&self, tools: Vec<Arc<dyn Tool>>) -> anyhow::Result<()> {
        let mut guard = self.tools.write().expect("registry lock poisoned");
        let mut next: HashMap<String, Arc<dyn Tool>> = guard
            .iter()
            .filter(|(name, _)| !name.starts_with(WORKFLOW_TOOL_PREFIX))
            .map(|(name, tool)| (name.clone(), tool.clone()))
            .collect();
        for tool in tools {
            if !tool.name().starts_with(WORKFLOW_TOOL_PREFIX) {
                bail!(
                    "workflow tool must be named {WORKFLOW_TOOL_PREFIX}*: {}",
                    tool.name()
                );
            }
            if next.insert(tool.name().to_string(), tool.clone()).is_some() {
                bail!("duplicate tool registration: {}", tool.name());
            }
        }
        *guard = Arc::new(next);
        Ok(())
    }

    /// Stable snapshot of the current tool map.
    pub fn snapshot(&self) -> Arc<HashMap<String, Arc<dyn Tool>>> {
        self.tools.read().expect("registry lock poisoned").clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.snapshot().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().keys().cloned().collect();
        names.sort();
        names
    }

    /// Schemas for all registered tools, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .snapshot()
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use tokio_util::sync::CancellationToken;

    use crate::tool::ToolCategory;

    use super::*;

    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn category(&self) -> ToolCategory {
            ToolCategory::Read
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(
            &self,
            _args: &Map<String, Value>,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<String> {
            Ok("echo".into())
        }
    }

    fn tool(name: &'static str) -> Arc<dyn Tool> {
        Arc::new(EchoTool { name })
    }

    #[test]
    fn register_and_get() {
        let reg = ToolRegistry::new();
        reg.register(tool("echo")).unwrap();
        assert!(reg.get("echo").is_some());
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn duplicate_registration_fails() {
        let reg = ToolRegistry::new();
        reg.register(tool("echo")).unwrap();
        let err = reg.register(tool("echo")).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn replace_all_swaps_the_set() {
        let reg = ToolRegistry::new();
        reg.register(tool("a")).unwrap();
        reg.replace_all(vec![tool("b"), tool("c")]).unwrap();
        assert_eq!(reg.names(), vec!["b", "c"]);
    }

    #[test]
    fn snapshot_is_stable_across_replace() {
        let reg = ToolRegistry::new();
        reg.register(tool("a")).unwrap();
        let snap = reg.snapshot();
        reg.replace_all(vec![tool("b")]).unwrap();
        assert!(snap.contains_key("a"), "old snapshot keeps its view");
        assert!(reg.get("a").is_none(), "new reads see the replacement");
    }

    #[test]
    fn replace_workflow_tools_keeps_others() {
        let reg = ToolRegistry::new();
        reg.register(tool("read")).unwrap();
        reg.register(tool("workflow_old")).unwrap();
        reg.replace_workflow_tools(vec![tool("workflow_new")]).unwrap();
        assert_eq!(reg.names(), vec!["read", "workflow_new"]);
    }

    #[test]
    fn replace_workflow_tools_rejects_unprefixed() {
        let reg = ToolRegistry::new();
        assert!(reg.replace_workflow_tools(vec![tool("bad_name")]).is_err());
    }

    #[test]
    fn schemas_are_sorted() {
        let reg = ToolRegistry::new();
        reg.register(tool("zeta")).unwrap();
        reg.register(tool("alpha")).unwrap();
        let schemas = reg.schemas();
        assert_eq!(schemas[0].name, "alpha");
        assert_eq!(schemas[1].name, "zeta");
    }
}
