// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::tool::{Tool, ToolCategory, ToolContext};

const DEFAULT_MAX_RESULTS: usize = 500;

pub struct FindTool {
    ctx: Arc<ToolContext>,
}

impl FindTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for FindTool {
    fn name(&self) -> &str {
        "find"
    }

    fn description(&self) -> &str {
        "Find files and directories by name under a path. pattern supports * \
         and ? glob wildcards; a pattern without wildcards is a substring \
         test. kind filters to files or directories."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Root to search under"},
                "pattern": {"type": "string", "description": "Glob (*, ?) or substring match on the entry name"},
                "kind": {
                    "type": "string",
                    "enum": ["all", "file", "directory"],
                    "description": "Entry kind filter (default all)"
                },
                "maxResults": {"type": "integer", "description": "Maximum entries to return (default 500)"}
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn execute(
        &self,
        args: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let path = args["path"].as_str().unwrap_or_default();
        let pattern = args
            .get("pattern")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let kind = args
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("all")
            .to_string();
        let max_results = args
            .get("maxResults")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_RESULTS);

        let decision = self.ctx.paths.validate(path);
        if !decision.allowed {
            anyhow::bail!("path not allowed: {}", decision.reason);
        }

        let matcher = NameMatcher::new(&pattern)?;
        let root = decision.resolved.clone();
        let cancel = cancel.clone();
        let (entries, truncated) = tokio::task::spawn_blocking(move || {
            let mut entries: Vec<String> = Vec::new();
            let mut truncated = false;
            for entry in WalkDir::new(&root)
                .min_depth(1)
                .follow_links(false)
                .sort_by_file_name()
            {
                if cancel.is_cancelled() {
                    break;
                }
                let Ok(entry) = entry else { continue };
                let is_dir = entry.file_type().is_dir();
                match kind.as_str() {
                    "file" if is_dir => continue,
                    "directory" if !is_dir => continue,
                    _ => {}
                }
                let name = entry.file_name().to_string_lossy();
                if !matcher.matches(&name) {
                    continue;
                }
                if entries.len() >= max_results {
                    truncated = true;
                    break;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&root)
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|_| entry.path().display().to_string());
                entries.push(if is_dir { format!("{rel}/") } else { rel });
            }
            (entries, truncated)
        })
        .await?;

        if entries.is_empty() {
            return Ok("(no matches)".into());
        }
        let mut out = entries.join("\n");
        if truncated {
            out.push_str(&format!(
                "\n[find truncated] showing first {max_results} entries."
            ));
        }
        Ok(out)
    }
}

/// `*`/`?` glob over the entry name, or substring when no wildcard appears.
enum NameMatcher {
    Any,
    Substring(String),
    Glob(Regex),
}

impl NameMatcher {
    fn new(pattern: &str) -> anyhow::Result<Self> {
        if pattern.is_empty() {
            return Ok(Self::Any);
        }
        if !pattern.contains('*') && !pattern.contains('?') {
            return Ok(Self::Substring(pattern.to_string()));
        }
        let mut source = String::from("^");
        for ch in pattern.chars() {
            match ch {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                c => source.push_str(&regex::escape(&c.to_string())),
            }
        }
        source.push('$');
        Ok(Self::Glob(Regex::new(&source)?))
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Substring(s) => name.contains(s),
            Self::Glob(re) => re.is_match(name),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
