// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::tool::{Tool, ToolCategory, ToolContext};

const DEFAULT_MAX_RESULTS: usize = 200;

pub struct GrepTool {
    ctx: Arc<ToolContext>,
}

impl GrepTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents recursively under a path. pattern is a literal \
         substring by default; set regex=true for full regex syntax. Emits \
         path:line:col:text per match."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File or directory to search"},
                "pattern": {"type": "string", "description": "Text or regex to search for"},
                "regex": {"type": "boolean", "description": "Treat pattern as a regular expression (default false)"},
                "caseSensitive": {"type": "boolean", "description": "Case-sensitive matching (default true)"},
                "maxResults": {"type": "integer", "description": "Maximum matches to return (default 200)"}
            },
            "required": ["path", "pattern"],
            "additionalProperties": false
        })
    }

    async fn execute(
        &self,
        args: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let path = args["path"].as_str().unwrap_or_default();
        let pattern = args["pattern"].as_str().unwrap_or_default().to_string();
        let use_regex = args.get("regex").and_then(Value::as_bool).unwrap_or(false);
        let case_sensitive = args
            .get("caseSensitive")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let max_results = args
            .get("maxResults")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_RESULTS);

        let decision = self.ctx.paths.validate(path);
        if !decision.allowed {
            anyhow::bail!("path not allowed: {}", decision.reason);
        }

        let source = if use_regex {
            pattern.clone()
        } else {
            regex::escape(&pattern)
        };
        let re = RegexBuilder::new(&source)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| anyhow::anyhow!("invalid pattern: {e}"))?;

        let root = decision.resolved.clone();
        let cancel = cancel.clone();
        // The walk is pure blocking I/O.
        let result = tokio::task::spawn_blocking(move || {
            let mut lines: Vec<String> = Vec::new();
            let mut truncated = false;
            for entry in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
                if cancel.is_cancelled() {
                    break;
                }
                let Ok(entry) = entry else { continue };
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(text) = std::fs::read_to_string(entry.path()) else {
                    continue; // binary or unreadable
                };
                for (line_no, line) in text.lines().enumerate() {
                    if let Some(m) = re.find(line) {
                        if lines.len() >= max_results {
                            truncated = true;
                            break;
                        }
                        lines.push(format!(
                            "{}:{}:{}:{}",
                            display_path(entry.path(), &root),
                            line_no + 1,
                            m.start() + 1,
                            line
                        ));
                    }
                }
                if truncated {
                    break;
                }
            }
            (lines, truncated)
        })
        .await?;

        let (lines, truncated) = result;
        if lines.is_empty() {
            return Ok("(no matches)".into());
        }
        let mut out = lines.join("\n");
        if truncated {
            out.push_str(&format!(
                "\n[grep truncated] showing first {max_results} matches."
            ));
        }
        Ok(out)
    }
}

fn display_path(path: &Path, root: &Path) -> String {
    if root.is_file() {
        return root.display().to_string();
    }
    path.strip_prefix(root)
        .map(|rel| rel.display().to_string())
        .unwrap_or_else(|_| path.display().to_string())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::builtin::test_ctx;

    use super::*;

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    fn fixture() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "alpha line\nsecond ALPHA\n").unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/b.txt"), "deep alpha here\n").unwrap();
        tmp
    }

    #[tokio::test]
    async fn literal_match_emits_path_line_col() {
        let tmp = fixture();
        let t = GrepTool::new(test_ctx(tmp.path()));
        let out = t
            .execute(
                &args(json!({"path": tmp.path().display().to_string(), "pattern": "alpha"})),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(out.contains("a.txt:1:1:alpha line"), "{out}");
        assert!(out.contains("sub/b.txt:1:6:deep alpha here"), "{out}");
        assert!(!out.contains("ALPHA"), "case-sensitive by default: {out}");
    }

    #[tokio::test]
    async fn case_insensitive_option() {
        let tmp = fixture();
        let t = GrepTool::new(test_ctx(tmp.path()));
        let out = t
            .execute(
                &args(json!({
                    "path": tmp.path().display().to_string(),
                    "pattern": "alpha",
                    "caseSensitive": false
                })),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(out.contains("second ALPHA"));
    }

    #[tokio::test]
    async fn regex_mode() {
        let tmp = fixture();
        let t = GrepTool::new(test_ctx(tmp.path()));
        let out = t
            .execute(
                &args(json!({
                    "path": tmp.path().display().to_string(),
                    "pattern": "al.ha l\\w+",
                    "regex": true
                })),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(out.contains("a.txt:1:1:alpha line"), "{out}");
    }

    #[tokio::test]
    async fn literal_mode_escapes_metacharacters() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("c.txt"), "price is $5.00 (sale)\n").unwrap();
        let t = GrepTool::new(test_ctx(tmp.path()));
        let out = t
            .execute(
                &args(json!({"path": tmp.path().display().to_string(), "pattern": "$5.00 (sale)"})),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(out.contains("c.txt:1"), "{out}");
    }

    #[tokio::test]
    async fn truncation_notice_at_max_results() {
        let tmp = tempfile::tempdir().unwrap();
        let body: String = (0..50).map(|i| format!("hit {i}\n")).collect();
        std::fs::write(tmp.path().join("many.txt"), body).unwrap();
        let t = GrepTool::new(test_ctx(tmp.path()));
        let out = t
            .execute(
                &args(json!({
                    "path": tmp.path().display().to_string(),
                    "pattern": "hit",
                    "maxResults": 10
                })),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.matches("hit").count(), 10);
        assert!(out.contains("[grep truncated] showing first 10 matches."));
    }

    #[tokio::test]
    async fn no_matches() {
        let tmp = fixture();
        let t = GrepTool::new(test_ctx(tmp.path()));
        let out = t
            .execute(
                &args(json!({"path": tmp.path().display().to_string(), "pattern": "zzz_absent"})),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out, "(no matches)");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_not_followed() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "alpha secret\n").unwrap();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("link")).unwrap();
        let t = GrepTool::new(test_ctx(tmp.path()));
        let out = t
            .execute(
                &args(json!({"path": tmp.path().display().to_string(), "pattern": "alpha"})),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!out.contains("secret"), "{out}");
    }
}
