// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::tool::{Tool, ToolCategory, ToolContext};

pub struct WriteTool {
    ctx: Arc<ToolContext>,
}

impl WriteTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write UTF-8 content to a file, overwriting any existing content. \
         Parent directories are created automatically. Prefer edit for \
         modifying existing files."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Write
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File to write"},
                "content": {"type": "string", "description": "Content to write"}
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(
        &self,
        args: &Map<String, Value>,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let path = args["path"].as_str().unwrap_or_default();
        let content = args["content"].as_str().unwrap_or_default();

        let decision = self.ctx.paths.validate(path);
        if !decision.allowed {
            anyhow::bail!("path not allowed: {}", decision.reason);
        }

        debug!(path = %decision.resolved.display(), bytes = content.len(), "write tool");
        if let Some(parent) = decision.resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&decision.resolved, content).await?;
        Ok(format!(
            "wrote {} bytes to {}",
            content.len(),
            decision.resolved.display()
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
