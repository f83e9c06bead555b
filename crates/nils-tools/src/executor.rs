// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::registry::ToolRegistry;
use crate::schema::validate_args;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_OUTPUT_LIMIT: usize = 200_000;

pub const TRUNCATION_NOTICE: &str = "\n[output truncated]";

/// Defaults applied when a tool does not declare its own limits. Derived
/// from the `tools` section of the configuration.
#[derive(Debug, Clone, Copy)]
pub struct ExecLimits {
    pub timeout: Duration,
    pub output_limit: usize,
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }
}

/// What the agent loop feeds back to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub content: String,
    pub is_error: bool,
}

impl ExecOutcome {
    fn ok(content: String) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    fn err(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Execute one tool call end to end: lookup, argument validation, the
/// timeout/cancellation race, error mapping, and output capping.
///
/// The tool runs under a child token: a timeout or the outer cancel firing
/// cancels the child before this function returns, so a well-behaved tool
/// stops doing work promptly.
pub async fn execute_tool(
    registry: &ToolRegistry,
    name: &str,
    args: &Map<String, Value>,
    cancel: &CancellationToken,
    limits: ExecLimits,
) -> ExecOutcome {
    let Some(tool) = registry.get(name) else {
        return ExecOutcome::err(format!("Unknown tool: {name}"));
    };

    let errors = validate_args(&tool.parameters_schema(), args);
    if !errors.is_empty() {
        let joined = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n");
        return ExecOutcome::err(joined);
    }

    let timeout = tool.timeout().unwrap_or(limits.timeout).max(MIN_TIMEOUT);
    let inner = cancel.child_token();
    debug!(tool = name, timeout_ms = timeout.as_millis() as u64, "executing tool");

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            inner.cancel();
            return ExecOutcome::err("Tool execution cancelled.");
        }
        _ = tokio::time::sleep(timeout) => {
            inner.cancel();
            return ExecOutcome::err(format!(
                "Tool execution timed out after {}ms.",
                timeout.as_millis()
            ));
        }
        r = tool.execute(args, &inner) => r,
    };

    match result {
        Ok(content) => {
            let limit = tool.output_limit().unwrap_or(limits.output_limit);
            ExecOutcome::ok(truncate_output(content, limit))
        }
        Err(e) => ExecOutcome::err(format!("Tool execution failed: {e}")),
    }
}

/// Cap `content` at `limit` bytes (not chars), appending the truncation
/// notice when anything was dropped.
pub fn truncate_output(content: String, limit: usize) -> String {
    if content.len() <= limit {
        return content;
    }
    let mut cut = limit;
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{TRUNCATION_NOTICE}", &content[..cut])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
