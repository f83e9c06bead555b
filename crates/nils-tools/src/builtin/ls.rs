// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::tool::{Tool, ToolCategory, ToolContext};

pub struct LsTool {
    ctx: Arc<ToolContext>,
}

impl LsTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for LsTool {
    fn name(&self) -> &str {
        "ls"
    }

    fn description(&self) -> &str {
        "List a directory, sorted by name. Directories carry a trailing /."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory to list"}
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn execute(
        &self,
        args: &Map<String, Value>,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let path = args["path"].as_str().unwrap_or_default();
        let decision = self.ctx.paths.validate(path);
        if !decision.allowed {
            anyhow::bail!("path not allowed: {}", decision.reason);
        }

        let mut rd = tokio::fs::read_dir(&decision.resolved).await?;
        let mut entries: Vec<String> = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();
        if entries.is_empty() {
            return Ok("(empty directory)".into());
        }
        Ok(entries.join("\n"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
