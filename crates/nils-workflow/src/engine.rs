// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nils_core::{run_agent_loop, AgentEvent, LoopOptions, RetrySettings};
use nils_model::{Message, StopReason, StreamFactory};
use nils_store::{
    message_to_append_input, AppendInput, CreateSessionOptions, RecordBlock, RecordRole,
    SessionStore, TurnMetrics,
};
use nils_tools::{validate_args, ExecLimits, ToolRegistry};

use crate::condition::evaluate_condition;
use crate::spec::{OnFailure, StepSpec, WorkflowSpec};

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow not found: {0}")]
    NotFound(String),
    #[error("invalid workflow parameters: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunResult {
    pub workflow: String,
    pub session_id: String,
    pub steps: Vec<StepResult>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct EngineConfig {
    pub max_iterations: u32,
    pub limits: ExecLimits,
    pub retry: Option<RetrySettings>,
    pub system_prompt: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            limits: ExecLimits::default(),
            retry: None,
            system_prompt: String::new(),
        }
    }
}

/// Runs YAML workflows: each step is one agent-loop run inside a dedicated
/// workflow session, gated by its condition and failure policy.
pub struct WorkflowEngine {
    specs: HashMap<String, WorkflowSpec>,
    store: Arc<SessionStore>,
    registry: Arc<ToolRegistry>,
    factory: Arc<dyn StreamFactory>,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(
        specs: Vec<WorkflowSpec>,
        store: Arc<SessionStore>,
        registry: Arc<ToolRegistry>,
        factory: Arc<dyn StreamFactory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            specs: specs.into_iter().map(|s| (s.name.clone(), s)).collect(),
            store,
            registry,
            factory,
            config,
        }
    }

    pub fn specs(&self) -> Vec<&WorkflowSpec> {
        let mut specs: Vec<&WorkflowSpec> = self.specs.values().collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn get(&self, name: &str) -> Option<&WorkflowSpec> {
        self.specs.get(name)
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub async fn run(
        &self,
        name: &str,
        mut params: Map<String, Value>,
    ) -> Result<WorkflowRunResult, WorkflowError> {
        let spec = self
            .specs
            .get(name)
            .ok_or_else(|| WorkflowError::NotFound(name.to_string()))?;

        let schema = spec.parameters_schema()?;
        spec.apply_defaults(&mut params);
        let errors = validate_args(&schema, &params);
        if !errors.is_empty() {
            let joined = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n");
            return Err(WorkflowError::InvalidParams(joined));
        }

        let session = self
            .store
            .create(CreateSessionOptions {
                name: Some(format!("[workflow] {name}")),
                model: self.factory.model().to_string(),
                ..CreateSessionOptions::default()
            })
            .await?;
        info!(workflow = name, session = %session.id, "workflow run started");

        let mut steps: Vec<StepResult> = spec
            .steps
            .iter()
            .map(|s| StepResult {
                name: s.name.clone(),
                status: StepStatus::Pending,
                output: None,
                error: None,
            })
            .collect();

        let mut halted = false;
        let mut skip_rest = false;
        for (i, step) in spec.steps.iter().enumerate() {
            if halted {
                break; // remaining steps stay pending
            }
            if skip_rest {
                steps[i].status = StepStatus::Skipped;
                continue;
            }

            if let Some(condition) = &step.condition {
                match evaluate_condition(condition, &params) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(workflow = name, step = %step.name, "condition false; skipping");
                        steps[i].status = StepStatus::Skipped;
                        continue;
                    }
                    Err(e) => {
                        warn!(workflow = name, step = %step.name, error = %e, "condition error; skipping");
                        steps[i].status = StepStatus::Skipped;
                        steps[i].error = Some(format!("condition error: {e}"));
                        continue;
                    }
                }
            }

            match self.run_step(&session.id, step, &params).await {
                Ok((output, None)) => {
                    steps[i].status = StepStatus::Succeeded;
                    steps[i].output = output;
                }
                Ok((output, Some(reason))) => {
                    steps[i].status = StepStatus::Failed;
                    steps[i].output = output;
                    steps[i].error = Some(reason);
                }
                Err(e) => {
                    steps[i].status = StepStatus::Failed;
                    steps[i].error = Some(e.to_string());
                }
            }

            if steps[i].status == StepStatus::Failed {
                match step.on_failure {
                    OnFailure::Halt => halted = true,
                    OnFailure::SkipRemaining => skip_rest = true,
                    OnFailure::Continue => {}
                }
            }
        }

        let success = !steps.iter().any(|s| s.status == StepStatus::Failed);
        let error = steps
            .iter()
            .find(|s| s.status == StepStatus::Failed)
            .and_then(|s| s.error.clone());
        Ok(WorkflowRunResult {
            workflow: name.to_string(),
            session_id: session.id,
            steps,
            success,
            error,
        })
    }

    /// Run one step: expand the prompt, append it, drive the agent loop,
    /// persist what it produced. Returns the final assistant text plus a
    /// failure reason when the step counts as failed.
    async fn run_step(
        &self,
        session_id: &str,
        step: &StepSpec,
        params: &Map<String, Value>,
    ) -> anyhow::Result<(Option<String>, Option<String>)> {
        let prompt = expand_templates(&step.prompt, params)?;

        self.store
            .append_message(
                session_id,
                AppendInput {
                    role: RecordRole::User,
                    content: vec![RecordBlock::Text { text: prompt }],
                    is_error: None,
                    tool_call_id: None,
                    tool_name: None,
                },
            )
            .await?;
        let context = self.store.build_context(session_id).await?;
        let boundary = context.len();

        // Workflow runs have no live subscribers; drain events to nowhere.
        let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let opts = LoopOptions {
            max_iterations: self.config.max_iterations,
            system_prompt: self.config.system_prompt.clone(),
            retry: self.config.retry.clone(),
            limits: self.config.limits,
            session_id: Some(session_id.to_string()),
            ..LoopOptions::default()
        };
        let outcome = run_agent_loop(
            self.factory.as_ref(),
            &self.registry,
            context,
            &opts,
            &CancellationToken::new(),
            &tx,
        )
        .await;
        drop(tx);
        let _ = drain.await;
        let outcome = outcome?;

        let new_messages = &outcome.messages[boundary..];
        for message in new_messages {
            self.store
                .append_message(session_id, message_to_append_input(message))
                .await?;
        }
        self.store
            .record_turn_metrics(
                session_id,
                TurnMetrics {
                    duration_ms: outcome.stats.duration_ms,
                    input_tokens: outcome.stats.input_tokens,
                    output_tokens: outcome.stats.output_tokens,
                    tool_calls: outcome.stats.tool_calls,
                    total_tokens: outcome.stats.total_tokens,
                },
            )
            .await?;

        let output = final_assistant_text(new_messages);
        let failure = classify_failure(new_messages);
        Ok((output, failure))
    }
}

/// Expand `{{ parameters.<name> }}` placeholders. Any unknown reference
/// fails the step.
fn expand_templates(prompt: &str, params: &Map<String, Value>) -> anyhow::Result<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\{\{\s*([a-zA-Z0-9_.]+)\s*\}\}").unwrap());

    let mut error: Option<String> = None;
    let out = re
        .replace_all(prompt, |caps: &regex::Captures| {
            let reference = &caps[1];
            let value = reference
                .strip_prefix("parameters.")
                .and_then(|name| params.get(name));
            match value {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => {
                    error.get_or_insert_with(|| format!("unknown template reference: {reference}"));
                    String::new()
                }
            }
        })
        .into_owned();

    match error {
        Some(message) => anyhow::bail!(message),
        None => Ok(out),
    }
}

fn final_assistant_text(messages: &[Message]) -> Option<String> {
    messages.iter().rev().find_map(|m| match m {
        Message::Assistant { .. } => Some(m.text()),
        _ => None,
    })
}

/// A step failed when the loop hit its iteration cap, any tool result was
/// an error, or the final text reads like a failure report.
fn classify_failure(messages: &[Message]) -> Option<String> {
    static FAILURE_RE: OnceLock<Regex> = OnceLock::new();
    let re = FAILURE_RE.get_or_init(|| Regex::new(r"(?i)\b(fail(ed)?|error)\b").unwrap());

    for message in messages {
        if let Message::Assistant { stop_reason, .. } = message {
            if *stop_reason == StopReason::Error {
                return Some("agent stopped at the iteration limit".into());
            }
        }
        if let Message::ToolResult { is_error: true, content, .. } = message {
            let text: String = content.iter().filter_map(|b| b.as_text()).collect();
            return Some(format!("tool error: {text}"));
        }
    }
    let text = final_assistant_text(messages)?;
    if re.is_match(&text) {
        return Some(format!("assistant reported failure: {text}"));
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
