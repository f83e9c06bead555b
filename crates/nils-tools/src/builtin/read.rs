// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::tool::{Tool, ToolCategory, ToolContext};

/// Bytes reserved for the continuation notice when sizing the payload
/// window.
const NOTICE_RESERVE: usize = 256;

/// Default window when the caller gives no explicit limit.
const DEFAULT_WINDOW: usize = 200_000;

pub struct ReadTool {
    ctx: Arc<ToolContext>,
}

impl ReadTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file. Returns a byte window of the file; when the \
         window does not reach end-of-file a continuation notice gives the \
         offset to resume from. Use offset/limit to page through large files."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File to read"},
                "offset": {"type": "integer", "description": "Byte offset to start from (default 0)"},
                "limit": {"type": "integer", "description": "Maximum bytes to return"}
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
        let offset = args.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_WINDOW);

        let decision = self.ctx.paths.validate(path);
        if !decision.allowed {
            anyhow::bail!("path not allowed: {}", decision.reason);
        }

        debug!(path = %decision.resolved.display(), offset, limit, "read tool");
        let bytes = tokio::fs::read(&decision.resolved).await?;
        let total = bytes.len();
        if offset >= total && total > 0 {
            anyhow::bail!("offset {offset} is past end of file ({total} bytes)");
        }

        // The notice must fit inside the caller's byte budget too.
        let window = limit.saturating_sub(NOTICE_RESERVE).max(1);
        let end = (offset + window).min(total);
        let slice = String::from_utf8_lossy(&bytes[offset..end]).into_owned();

        if end < total {
            Ok(format!(
                "{slice}\n[read truncated] showing bytes {offset}-{end} of {total}.\nContinue with offset={end}."
            ))
        } else {
            Ok(slice)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
