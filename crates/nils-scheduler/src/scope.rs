// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;

use nils_tools::builtin::canonical_tool_name;
use nils_tools::{ToolCategory, ToolRegistry};

use crate::config::CronPolicy;

/// Derive the tool view a cron job runs with.
///
/// Admin tools are never visible to cron. Without an explicit
/// `allowed_tools` list only read-category tools remain; with one, tools
/// are matched by canonical name (aliases in the list are normalized).
pub fn scoped_registry(global: &ToolRegistry, policy: Option<&CronPolicy>) -> ToolRegistry {
    let allowed: Option<HashSet<String>> = policy
        .and_then(|p| p.allowed_tools.as_ref())
        .map(|names| {
            names
                .iter()
                .map(|n| canonical_tool_name(n).to_string())
                .collect()
        });

    let tools = global
        .snapshot()
        .values()
        .filter(|tool| tool.category() != ToolCategory::Admin)
        .filter(|tool| match &allowed {
            None => tool.category() == ToolCategory::Read,
            Some(set) => set.contains(canonical_tool_name(tool.name())),
        })
        .cloned()
        .collect();

    // The filtered set has unique names by construction.
    ToolRegistry::with_tools(tools).unwrap_or_default()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use tokio_util::sync::CancellationToken;

    use nils_tools::Tool;

    use super::*;

    struct FakeTool {
        name: &'static str,
        category: ToolCategory,
    }

    #[async_trait]
    impl Tool for FakeTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "fake"
        }
        fn category(&self) -> ToolCategory {
            self.category
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(
            &self,
            _args: &Map<String, Value>,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<String> {
            Ok("ok".into())
        }
    }

    fn global() -> ToolRegistry {
        let reg = ToolRegistry::new();
        for (name, category) in [
            ("read", ToolCategory::Read),
            ("grep", ToolCategory::Read),
            ("write", ToolCategory::Write),
            ("bash", ToolCategory::Admin),
        ] {
            reg.register(Arc::new(FakeTool { name, category })).unwrap();
        }
        reg
    }

    #[test]
    fn default_scope_is_read_only() {
        let scoped = scoped_registry(&global(), None);
        assert_eq!(scoped.names(), vec!["grep", "read"]);
    }

    #[test]
    fn admin_is_never_included_even_when_allowed() {
        let policy = CronPolicy {
            allowed_tools: Some(vec!["bash".into(), "read".into()]),
            max_iterations: None,
        };
        let scoped = scoped_registry(&global(), Some(&policy));
        assert_eq!(scoped.names(), vec!["read"]);
    }

    #[test]
    fn allowed_tools_include_write_category() {
        let policy = CronPolicy {
            allowed_tools: Some(vec!["write".into(), "grep".into()]),
            max_iterations: None,
        };
        let scoped = scoped_registry(&global(), Some(&policy));
        assert_eq!(scoped.names(), vec!["grep", "write"]);
    }

    #[test]
    fn aliases_normalize_before_matching() {
        let policy = CronPolicy {
            allowed_tools: Some(vec!["read_file".into()]),
            max_iterations: None,
        };
        let scoped = scoped_registry(&global(), Some(&policy));
        assert_eq!(scoped.names(), vec!["read"]);
    }

    #[test]
    fn empty_allowlist_means_no_tools() {
        let policy = CronPolicy {
            allowed_tools: Some(vec![]),
            max_iterations: None,
        };
        let scoped = scoped_registry(&global(), Some(&policy));
        assert!(scoped.names().is_empty());
    }
}
