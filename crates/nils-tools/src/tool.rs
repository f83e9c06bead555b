// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use nils_security::{CommandPolicy, PathPolicy};

/// Gate used by the cron scheduler to scope tool visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Read,
    Write,
    Admin,
}

/// Shared sandbox handles injected into every built-in tool.
#[derive(Default)]
pub struct ToolContext {
    pub paths: PathPolicy,
    pub commands: CommandPolicy,
    /// Environment keys subprocesses may inherit
    pub allowed_env: Vec<String>,
}

impl ToolContext {
    pub fn new(paths: PathPolicy, commands: CommandPolicy, allowed_env: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            paths,
            commands,
            allowed_env,
        })
    }
}

/// Trait every tool implements. Execution receives parsed JSON arguments
/// (already schema-validated by the executor) and a cancellation token that
/// must be honored at every await point.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn category(&self) -> ToolCategory;
    /// JSON Schema for the arguments object
    fn parameters_schema(&self) -> Value;
    /// Byte cap on the returned content; `None` uses the executor default.
    fn output_limit(&self) -> Option<usize> {
        None
    }
    /// Execution deadline; `None` uses the executor default.
    fn timeout(&self) -> Option<Duration> {
        None
    }
    async fn execute(
        &self,
        args: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String>;
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tool({})", self.name())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
