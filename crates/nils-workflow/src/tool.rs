// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use nils_tools::{Tool, ToolCategory};

use crate::engine::WorkflowEngine;

/// Expose every loaded workflow to the agent as a `workflow_<name>` tool.
/// Workflows whose parameter declarations cannot be turned into a schema
/// are skipped with a warning.
pub fn workflow_tools(engine: &Arc<WorkflowEngine>) -> Vec<Arc<dyn Tool>> {
    engine
        .specs()
        .iter()
        .filter_map(|spec| match spec.parameters_schema() {
            Ok(schema) => Some(Arc::new(WorkflowTool {
                tool_name: format!("workflow_{}", spec.name),
                workflow: spec.name.clone(),
                description: if spec.description.is_empty() {
                    format!("Run the {} workflow", spec.name)
                } else {
                    spec.description.clone()
                },
                schema,
                engine: engine.clone(),
            }) as Arc<dyn Tool>),
            Err(e) => {
                warn!(workflow = %spec.name, error = %e, "workflow not exposed as tool");
                None
            }
        })
        .collect()
}

struct WorkflowTool {
    tool_name: String,
    workflow: String,
    description: String,
    schema: Value,
    engine: Arc<WorkflowEngine>,
}

#[async_trait]
impl Tool for WorkflowTool {
    fn name(&self) -> &str {
        &self.tool_name
    }
    fn description(&self) -> &str {
        &self.description
    }
    fn category(&self) -> ToolCategory {
        ToolCategory::Write
    }
    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(
        &self,
        args: &Map<String, Value>,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let result = self.engine.run(&self.workflow, args.clone()).await?;
        Ok(serde_json::to_string_pretty(&result)?)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
