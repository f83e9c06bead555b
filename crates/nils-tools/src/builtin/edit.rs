// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::tool::{Tool, ToolCategory, ToolContext};

pub struct EditTool {
    ctx: Arc<ToolContext>,
}

impl EditTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Replace one occurrence of oldText with newText in a file. The match \
         must be unique: an exact match is tried first, then a whitespace- \
         flexible match over the same tokens. Returns a minimal unified diff \
         of the change."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Write
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File to edit"},
                "oldText": {"type": "string", "description": "Text to replace (must match exactly once)"},
                "newText": {"type": "string", "description": "Replacement text"}
            },
            "required": ["path", "oldText", "newText"],
            "additionalProperties": false
        })
    }

    async fn execute(
        &self,
        args: &Map<String, Value>,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let path = args["path"].as_str().unwrap_or_default();
        let old_text = args["oldText"].as_str().unwrap_or_default();
        let new_text = args["newText"].as_str().unwrap_or_default();
        if old_text.is_empty() {
            anyhow::bail!("oldText must not be empty");
        }

        let decision = self.ctx.paths.validate(path);
        if !decision.allowed {
            anyhow::bail!("path not allowed: {}", decision.reason);
        }

        let original = tokio::fs::read_to_string(&decision.resolved).await?;
        let (updated, matched) = apply_edit(&original, old_text, new_text)?;
        tokio::fs::write(&decision.resolved, &updated).await?;
        debug!(path = %decision.resolved.display(), "edit applied");

        Ok(unified_diff(path, &matched, new_text))
    }
}

/// Apply the replacement, returning the new content and the exact text that
/// was replaced (which differs from `old_text` when the whitespace-flexible
/// fallback matched).
fn apply_edit(content: &str, old_text: &str, new_text: &str) -> anyhow::Result<(String, String)> {
    let exact: Vec<usize> = content.match_indices(old_text).map(|(i, _)| i).collect();
    match exact.len() {
        1 => {
            let at = exact[0];
            let mut out = String::with_capacity(content.len());
            out.push_str(&content[..at]);
            out.push_str(new_text);
            out.push_str(&content[at + old_text.len()..]);
            return Ok((out, old_text.to_string()));
        }
        n if n > 1 => anyhow::bail!(
            "oldText is ambiguous: {n} exact matches; include more surrounding context"
        ),
        _ => {}
    }

    // Whitespace-flexible fallback: the same tokens separated by any run of
    // whitespace.
    let tokens: Vec<&str> = old_text.split_whitespace().collect();
    if tokens.is_empty() {
        anyhow::bail!("oldText not found");
    }
    let pattern = tokens
        .iter()
        .map(|t| regex::escape(t))
        .collect::<Vec<_>>()
        .join(r"\s+");
    let re = Regex::new(&pattern)?;
    let hits: Vec<regex::Match> = re.find_iter(content).collect();
    match hits.len() {
        0 => anyhow::bail!("oldText not found"),
        1 => {
            let m = hits[0];
            let matched = m.as_str().to_string();
            let mut out = String::with_capacity(content.len());
            out.push_str(&content[..m.start()]);
            out.push_str(new_text);
            out.push_str(&content[m.end()..]);
            Ok((out, matched))
        }
        n => anyhow::bail!(
            "oldText is ambiguous: {n} whitespace-flexible matches; include more surrounding context"
        ),
    }
}

/// Minimal synthesized unified diff: header plus the changed-line hunk.
fn unified_diff(path: &str, removed: &str, added: &str) -> String {
    let mut out = format!("--- {path}\n+++ {path}\n@@ @@\n");
    for line in removed.lines() {
        out.push('-');
        out.push_str(line);
        out.push('\n');
    }
    for line in added.lines() {
        out.push('+');
        out.push_str(line);
        out.push('\n');
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
