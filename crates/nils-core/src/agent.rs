// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nils_model::{
    ContentBlock, Message, StopReason, StreamEvent, StreamFactory, StreamOptions, StreamRequest,
    Usage,
};
use nils_tools::{execute_tool, ExecLimits, ToolRegistry};

use crate::events::AgentEvent;
use crate::retry::{with_retry, RetrySettings};

/// Resolves the API key before each model call (OAuth keys can rotate
/// between iterations of one run).
#[async_trait]
pub trait ApiKeyResolver: Send + Sync {
    async fn resolve(&self) -> anyhow::Result<Option<String>>;
}

pub struct LoopOptions {
    pub max_iterations: u32,
    pub system_prompt: String,
    pub retry: Option<RetrySettings>,
    pub api_key_resolver: Option<Arc<dyn ApiKeyResolver>>,
    pub limits: ExecLimits,
    pub session_id: Option<String>,
    pub run_id: Option<String>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            system_prompt: String::new(),
            retry: None,
            api_key_resolver: None,
            limits: ExecLimits::default(),
            session_id: None,
            run_id: None,
        }
    }
}

/// Per-run counters handed back for metadata accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnStats {
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_calls: u64,
    pub total_tokens: u64,
}

#[derive(Debug)]
pub struct LoopOutcome {
    /// The full message list, initial context plus everything this run
    /// produced. The caller persists the suffix past its own boundary.
    pub messages: Vec<Message>,
    pub stats: TurnStats,
}

/// The agent loop: stream a model turn, execute any requested tools, feed
/// the results back, repeat — bounded by `max_iterations`.
///
/// Every event is forwarded through `events`; cancellation is re-checked at
/// each suspension point and propagated into the stream and every tool
/// execution.
pub async fn run_agent_loop(
    factory: &dyn StreamFactory,
    registry: &ToolRegistry,
    mut messages: Vec<Message>,
    opts: &LoopOptions,
    cancel: &CancellationToken,
    events: &mpsc::Sender<AgentEvent>,
) -> anyhow::Result<LoopOutcome> {
    let started = Instant::now();
    let mut stats = TurnStats::default();
    let mut iteration: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            anyhow::bail!("run cancelled");
        }
        iteration += 1;
        if iteration > opts.max_iterations {
            let notice = "Stopped: maximum iteration limit reached.";
            messages.push(Message::Assistant {
                content: vec![ContentBlock::text(notice)],
                stop_reason: StopReason::Error,
                usage: Usage::default(),
                model: factory.model().to_string(),
                provider: factory.provider().to_string(),
                api: factory.api().to_string(),
                timestamp: Utc::now(),
            });
            let _ = events
                .send(AgentEvent::Error {
                    message: notice.to_string(),
                })
                .await;
            stats.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(LoopOutcome { messages, stats });
        }

        let api_key = match &opts.api_key_resolver {
            Some(resolver) => resolver.resolve().await.unwrap_or_else(|e| {
                warn!(error = %e, "api key resolution failed; proceeding without");
                None
            }),
            None => None,
        };

        let request = StreamRequest {
            messages: messages.clone(),
            system_prompt: opts.system_prompt.clone(),
            tools: registry.schemas(),
        };
        let stream_opts = StreamOptions {
            api_key,
            cancel: cancel.clone(),
        };

        debug!(
            iteration,
            session = opts.session_id.as_deref().unwrap_or("-"),
            run = opts.run_id.as_deref().unwrap_or("-"),
            "starting model turn"
        );

        let mut stream = match &opts.retry {
            Some(retry) => {
                let mut pending: Vec<AgentEvent> = Vec::new();
                let result = with_retry(
                    retry,
                    cancel,
                    |attempt, delay_ms, status, message| {
                        pending.push(AgentEvent::Status {
                            attempt,
                            delay_ms,
                            status,
                            message,
                        });
                    },
                    || factory.stream(request.clone(), stream_opts.clone()),
                )
                .await;
                for event in pending {
                    let _ = events.send(event).await;
                }
                result?
            }
            None => factory.stream(request.clone(), stream_opts.clone()).await?,
        };

        // Pump the turn: forward every event, keep the terminal message.
        let mut assistant: Option<Message> = None;
        while let Some(event) = stream.next().await {
            let event = event?;
            if let StreamEvent::Completed { message } = &event {
                assistant = Some(message.clone());
            }
            let _ = events.send(AgentEvent::Stream(event)).await;
        }
        let assistant =
            assistant.ok_or_else(|| anyhow::anyhow!("model stream ended without a message"))?;

        if let Some(usage) = assistant.usage() {
            stats.input_tokens += usage.input;
            stats.output_tokens += usage.output;
            stats.total_tokens += usage.total_tokens;
        }
        let stop_reason = assistant.stop_reason().unwrap_or(StopReason::Stop);
        let tool_calls: Vec<(String, String, serde_json::Map<String, serde_json::Value>)> =
            assistant
                .tool_calls()
                .into_iter()
                .map(|(id, name, args)| (id.to_string(), name.to_string(), args.clone()))
                .collect();
        messages.push(assistant);

        if stop_reason != StopReason::ToolUse {
            stats.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(LoopOutcome { messages, stats });
        }

        for (id, name, args) in tool_calls {
            if cancel.is_cancelled() {
                anyhow::bail!("run cancelled");
            }
            let outcome = execute_tool(registry, &name, &args, cancel, opts.limits).await;
            stats.tool_calls += 1;
            log_tool_outcome(&name, &outcome.content, outcome.is_error);

            messages.push(Message::tool_result(
                id.as_str(),
                Some(name.clone()),
                outcome.content.as_str(),
                outcome.is_error,
            ));
            let _ = events
                .send(AgentEvent::ToolResult {
                    tool_call_id: id,
                    tool_name: name,
                    content: outcome.content,
                    is_error: outcome.is_error,
                })
                .await;
        }
    }
}

/// Surface notable tool outcomes in the diagnostic log. Substring checks
/// are heuristic by design: the executor formats these messages.
fn log_tool_outcome(name: &str, content: &str, is_error: bool) {
    if content.contains("[output truncated]") {
        debug!(tool = name, "tool output truncated");
    }
    if is_error {
        if content.contains("timed out") {
            warn!(tool = name, "tool timed out");
        } else if content.contains("blocked") || content.contains("not allowed") {
            warn!(tool = name, "tool refused by policy");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use std::sync::Arc;

    use nils_model::ScriptedFactory;
    use nils_tools::{Tool, ToolCategory};

    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "returns its value argument"
        }
        fn category(&self) -> ToolCategory {
            ToolCategory::Read
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"value": {"type": "string"}},
                "required": ["value"]
            })
        }
        async fn execute(
            &self,
            args: &Map<String, Value>,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<String> {
            Ok(args["value"].as_str().unwrap_or_default().to_string())
        }
    }

    fn echo_registry() -> ToolRegistry {
        let reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool)).unwrap();
        reg
    }

    fn drain(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn tool_use_round_trip() {
        let mut args = Map::new();
        args.insert("value".into(), json!("x"));
        let factory = ScriptedFactory::tool_then_text("tc1", "echo", args, "done");
        let registry = echo_registry();
        let (tx, rx) = mpsc::channel(64);

        let outcome = run_agent_loop(
            &factory,
            &registry,
            vec![Message::user("use echo")],
            &LoopOptions {
                max_iterations: 5,
                ..LoopOptions::default()
            },
            &CancellationToken::new(),
            &tx,
        )
        .await
        .unwrap();

        let messages = outcome.messages;
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].text(), "use echo");
        assert_eq!(messages[1].tool_calls().len(), 1);
        match &messages[2] {
            Message::ToolResult {
                content,
                tool_call_id,
                is_error,
                ..
            } => {
                assert_eq!(tool_call_id, "tc1");
                assert!(!is_error);
                assert_eq!(content[0].as_text(), Some("x"));
            }
            other => panic!("expected tool result, got {other:?}"),
        }
        assert_eq!(messages[3].text(), "done");
        assert_eq!(outcome.stats.tool_calls, 1);

        let events = drain(rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolResult { tool_call_id, .. } if tool_call_id == "tc1")));
    }

    #[tokio::test]
    async fn iteration_cap_appends_synthetic_stop() {
        // The model asks for the same tool forever.
        let mut args = Map::new();
        args.insert("value".into(), json!("loop"));
        let scripts: Vec<_> = (0..5)
            .map(|i| ScriptedFactory::tool_call_script(&format!("tc{i}"), "echo", args.clone()))
            .collect();
        let factory = ScriptedFactory::new(scripts);
        let registry = echo_registry();
        let (tx, rx) = mpsc::channel(64);

        let outcome = run_agent_loop(
            &factory,
            &registry,
            vec![Message::user("go")],
            &LoopOptions {
                max_iterations: 2,
                ..LoopOptions::default()
            },
            &CancellationToken::new(),
            &tx,
        )
        .await
        .unwrap();

        let last = outcome.messages.last().unwrap();
        assert_eq!(last.text(), "Stopped: maximum iteration limit reached.");
        assert_eq!(last.usage().unwrap().total_tokens, 0);
        let events = drain(rx);
        assert!(events.iter().any(
            |e| matches!(e, AgentEvent::Error { message } if message.contains("iteration limit"))
        ));
    }

    #[tokio::test]
    async fn retry_emits_status_then_succeeds() {
        let factory = ScriptedFactory::always_text("ok").with_failures(vec![429]);
        let registry = ToolRegistry::new();
        let (tx, rx) = mpsc::channel(64);

        let outcome = run_agent_loop(
            &factory,
            &registry,
            vec![Message::user("hi")],
            &LoopOptions {
                retry: Some(RetrySettings {
                    base_delay_ms: 1,
                    max_delay_ms: 5,
                    max_retries: 2,
                    retryable_statuses: vec![429, 500],
                }),
                ..LoopOptions::default()
            },
            &CancellationToken::new(),
            &tx,
        )
        .await
        .unwrap();

        assert_eq!(outcome.messages.last().unwrap().text(), "ok");
        let events = drain(rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Status { status: 429, attempt: 1, .. })));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error() {
        let factory = ScriptedFactory::always_text("never").with_failures(vec![500, 500, 500, 500]);
        let registry = ToolRegistry::new();
        let (tx, _rx) = mpsc::channel(64);

        let err = run_agent_loop(
            &factory,
            &registry,
            vec![Message::user("hi")],
            &LoopOptions {
                retry: Some(RetrySettings {
                    base_delay_ms: 1,
                    max_delay_ms: 2,
                    max_retries: 1,
                    retryable_statuses: vec![500],
                }),
                ..LoopOptions::default()
            },
            &CancellationToken::new(),
            &tx,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn pre_cancelled_run_does_nothing() {
        let factory = ScriptedFactory::always_text("never");
        let registry = ToolRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run_agent_loop(
            &factory,
            &registry,
            vec![Message::user("hi")],
            &LoopOptions::default(),
            &cancel,
            &tx,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert!(factory.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_tool_result_is_error_but_loop_continues() {
        let mut args = Map::new();
        args.insert("value".into(), json!("x"));
        let factory = ScriptedFactory::tool_then_text("tc1", "missing_tool", args, "recovered");
        let registry = echo_registry();
        let (tx, rx) = mpsc::channel(64);

        let outcome = run_agent_loop(
            &factory,
            &registry,
            vec![Message::user("go")],
            &LoopOptions::default(),
            &CancellationToken::new(),
            &tx,
        )
        .await
        .unwrap();

        match &outcome.messages[2] {
            Message::ToolResult { is_error, content, .. } => {
                assert!(is_error);
                assert_eq!(content[0].as_text(), Some("Unknown tool: missing_tool"));
            }
            other => panic!("expected tool result, got {other:?}"),
        }
        assert_eq!(outcome.messages.last().unwrap().text(), "recovered");
        drop(rx);
    }
}
