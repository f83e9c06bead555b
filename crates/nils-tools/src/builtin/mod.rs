// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod bash;
pub mod edit;
pub mod find;
pub mod grep;
pub mod ls;
pub mod read;
pub mod write;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::tool::{Tool, ToolCategory, ToolContext};

pub use bash::BashTool;
pub use edit::EditTool;
pub use find::FindTool;
pub use grep::GrepTool;
pub use ls::LsTool;
pub use read::ReadTool;
pub use write::WriteTool;

/// The full built-in set, canonical names plus legacy aliases.
pub fn builtin_tools(ctx: Arc<ToolContext>) -> Vec<Arc<dyn Tool>> {
    let read: Arc<dyn Tool> = Arc::new(ReadTool::new(ctx.clone()));
    let write: Arc<dyn Tool> = Arc::new(WriteTool::new(ctx.clone()));
    let ls: Arc<dyn Tool> = Arc::new(LsTool::new(ctx.clone()));
    vec![
        read.clone(),
        write.clone(),
        Arc::new(EditTool::new(ctx.clone())),
        Arc::new(BashTool::new(ctx.clone())),
        ls.clone(),
        Arc::new(GrepTool::new(ctx.clone())),
        Arc::new(FindTool::new(ctx)),
        Arc::new(AliasTool::new("read_file", read)),
        Arc::new(AliasTool::new("write_file", write)),
        Arc::new(AliasTool::new("list_directory", ls)),
    ]
}

/// Legacy name for a canonical tool. The first invocation of each alias
/// logs a deprecation warning; after that it is silent.
pub struct AliasTool {
    alias: &'static str,
    inner: Arc<dyn Tool>,
    warned: AtomicBool,
}

impl AliasTool {
    pub fn new(alias: &'static str, inner: Arc<dyn Tool>) -> Self {
        Self {
            alias,
            inner,
            warned: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Tool for AliasTool {
    fn name(&self) -> &str {
        self.alias
    }
    fn description(&self) -> &str {
        self.inner.description()
    }
    fn category(&self) -> ToolCategory {
        self.inner.category()
    }
    fn parameters_schema(&self) -> Value {
        self.inner.parameters_schema()
    }
    fn output_limit(&self) -> Option<usize> {
        self.inner.output_limit()
    }
    fn timeout(&self) -> Option<std::time::Duration> {
        self.inner.timeout()
    }

    async fn execute(
        &self,
        args: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!(
                alias = self.alias,
                canonical = self.inner.name(),
                "deprecated tool alias invoked; switch to the canonical name"
            );
        }
        self.inner.execute(args, cancel).await
    }
}

#[cfg(test)]
pub(crate) fn test_ctx(root: &std::path::Path) -> Arc<ToolContext> {
    use nils_security::{CommandPolicy, PathPolicy};
    ToolContext::new(
        PathPolicy::new(&[root.display().to_string()], &[]),
        CommandPolicy::default(),
        vec!["PATH".into(), "HOME".into()],
    )
}

/// Resolve a possibly aliased tool name to its canonical form.
pub fn canonical_tool_name(name: &str) -> &str {
    match name {
        "read_file" => "read",
        "write_file" => "write",
        "list_directory" => "ls",
        other => other,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_set_contains_canonical_names_and_aliases() {
        let tools = builtin_tools(Arc::new(ToolContext::default()));
        let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
        for expected in [
            "read", "write", "edit", "bash", "ls", "grep", "find",
            "read_file", "write_file", "list_directory",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn alias_resolution() {
        assert_eq!(canonical_tool_name("read_file"), "read");
        assert_eq!(canonical_tool_name("write_file"), "write");
        assert_eq!(canonical_tool_name("list_directory"), "ls");
        assert_eq!(canonical_tool_name("grep"), "grep");
    }

    #[tokio::test]
    async fn alias_delegates_to_inner() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(tmp.path());
        let read: Arc<dyn Tool> = Arc::new(ReadTool::new(ctx));
        let alias = AliasTool::new("read_file", read);
        std::fs::write(tmp.path().join("f.txt"), "aliased").unwrap();

        let mut args = Map::new();
        args.insert(
            "path".into(),
            Value::String(tmp.path().join("f.txt").display().to_string()),
        );
        let out = alias.execute(&args, &CancellationToken::new()).await.unwrap();
        assert_eq!(out, "aliased");
        assert_eq!(alias.category(), ToolCategory::Read);
    }
}
