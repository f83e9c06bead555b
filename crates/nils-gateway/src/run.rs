// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use nils_core::{run_agent_loop, AgentEvent, ApiKeyResolver, LoopOptions, RetrySettings};
use nils_log::Logger;
use nils_model::{Message, StreamEvent, StreamFactory, StreamOptions};
use nils_store::{
    message_to_append_input, AppendInput, RecordBlock, RecordRole, SessionStore, TurnMetrics,
};
use nils_tools::{ExecLimits, ToolRegistry};

use crate::frames::ServerFrame;
use crate::hub::{RunGuard, RunJob, WsHub};
use crate::prompt::PreparedSystemPrompt;
use crate::summarize::{complete_text, FactorySummarizer};

/// Everything one run needs, snapshotted when the job is dequeued so a
/// hot-reload mid-queue cannot tear state out from under an active run.
#[derive(Clone)]
pub struct RunContext {
    pub store: Arc<SessionStore>,
    pub registry: Arc<ToolRegistry>,
    pub factory: Arc<dyn StreamFactory>,
    pub prepared: Arc<PreparedSystemPrompt>,
    pub logger: Arc<Logger>,
    pub max_iterations: u32,
    pub limits: ExecLimits,
    pub retry: Option<RetrySettings>,
    pub api_key: Option<String>,
    pub api_key_resolver: Option<Arc<dyn ApiKeyResolver>>,
}

/// Execute one queued `send_message` turn end to end.
pub async fn run_step(hub: Arc<WsHub>, ctx: RunContext, session_id: String, job: RunJob) {
    let run_id = job.run_id.clone();

    if let Err(e) = ctx.store.get(&session_id).await {
        hub.emit(&ServerFrame::Error {
            session_id: session_id.clone(),
            run_id: Some(run_id),
            message: e.to_string(),
        });
        return;
    }

    let cancel = hub.register_run(&session_id, &run_id);
    let _guard = RunGuard::new(&hub, &session_id, &run_id);

    hub.emit(&ServerFrame::RunStart {
        session_id: session_id.clone(),
        run_id: run_id.clone(),
        started_at: Utc::now().to_rfc3339(),
    });

    let result = drive_run(&hub, &ctx, &session_id, &run_id, &job.content, cancel).await;
    if let Err(e) = result {
        ctx.logger.error(
            "gateway",
            "run_failed",
            json!({
                "sessionId": session_id,
                "runId": run_id,
                "message": e.to_string(),
            }),
        );
        hub.emit(&ServerFrame::Error {
            session_id,
            run_id: Some(run_id),
            message: e.to_string(),
        });
    }
}

async fn drive_run(
    hub: &Arc<WsHub>,
    ctx: &RunContext,
    session_id: &str,
    run_id: &str,
    content: &str,
    cancel: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    ctx.store
        .append_message(
            session_id,
            AppendInput {
                role: RecordRole::User,
                content: vec![RecordBlock::Text {
                    text: content.to_string(),
                }],
                is_error: None,
                tool_call_id: None,
                tool_name: None,
            },
        )
        .await?;

    let metadata = ctx.store.get(session_id).await?;
    let should_generate_title =
        metadata.name == "New Session" && metadata.message_count == 1;

    let summarizer = FactorySummarizer::new(ctx.factory.clone(), ctx.api_key.clone());
    let context = ctx
        .store
        .build_context_for_run(session_id, &summarizer)
        .await?;
    let boundary = context.len();
    let system_prompt = ctx
        .prepared
        .compose(metadata.system_prompt_override.as_deref());

    // Forward loop events to the session's subscribers as they happen.
    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
    let forwarder = {
        let hub = hub.clone();
        let session_id = session_id.to_string();
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Some(frame) = map_event(&session_id, &run_id, event) {
                    hub.emit(&frame);
                }
            }
        })
    };

    let opts = LoopOptions {
        max_iterations: ctx.max_iterations,
        system_prompt,
        retry: ctx.retry.clone(),
        limits: ctx.limits,
        session_id: Some(session_id.to_string()),
        run_id: Some(run_id.to_string()),
        api_key_resolver: ctx.api_key_resolver.clone(),
    };
    let outcome = run_agent_loop(
        ctx.factory.as_ref(),
        &ctx.registry,
        context,
        &opts,
        &cancel,
        &tx,
    )
    .await;
    drop(tx);
    let _ = forwarder.await;
    let outcome = outcome?;

    let new_messages = &outcome.messages[boundary..];
    for message in new_messages {
        ctx.store
            .append_message(session_id, message_to_append_input(message))
            .await?;
    }
    ctx.store
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

    let final_text = new_messages
        .iter()
        .rev()
        .find_map(|m| match m {
            Message::Assistant { .. } => Some(m.text()),
            _ => None,
        })
        .unwrap_or_default();
    hub.emit(&ServerFrame::MessageComplete {
        session_id: session_id.to_string(),
        run_id: run_id.to_string(),
        content: final_text.clone(),
    });

    if should_generate_title {
        spawn_title_generation(
            hub.clone(),
            ctx.clone(),
            session_id.to_string(),
            run_id.to_string(),
            content.to_string(),
            final_text,
        );
    }
    Ok(())
}

/// Fire-and-forget: failures are swallowed, success announces the rename.
fn spawn_title_generation(
    hub: Arc<WsHub>,
    ctx: RunContext,
    session_id: String,
    run_id: String,
    user_text: String,
    assistant_text: String,
) {
    tokio::spawn(async move {
        let factory = ctx.factory.clone();
        let api_key = ctx.api_key.clone();
        let generated = ctx
            .store
            .generate_title(&session_id, &user_text, &assistant_text, move |prompt| {
                let factory = factory.clone();
                async move {
                    complete_text(
                        factory.as_ref(),
                        &prompt,
                        StreamOptions {
                            api_key,
                            ..StreamOptions::default()
                        },
                    )
                    .await
                }
            })
            .await;
        match generated {
            Ok(Some(name)) => {
                hub.emit(&ServerFrame::SessionRenamed {
                    session_id,
                    run_id,
                    name,
                });
            }
            Ok(None) => {}
            Err(e) => debug!(session = %session_id, error = %e, "title generation failed"),
        }
    });
}

fn map_event(session_id: &str, run_id: &str, event: AgentEvent) -> Option<ServerFrame> {
    let session_id = session_id.to_string();
    let run_id = run_id.to_string();
    match event {
        AgentEvent::Stream(StreamEvent::TextDelta { delta }) => Some(ServerFrame::StreamDelta {
            session_id,
            run_id,
            delta,
        }),
        AgentEvent::Stream(StreamEvent::ToolCallEnd { id, name, arguments }) => {
            Some(ServerFrame::ToolStart {
                session_id,
                run_id,
                id,
                name,
                arguments,
            })
        }
        AgentEvent::Stream(_) => None,
        AgentEvent::ToolResult {
            tool_call_id,
            tool_name,
            content,
            is_error,
        } => Some(ServerFrame::ToolResult {
            session_id,
            run_id,
            tool_call_id,
            tool_name,
            content,
            is_error,
        }),
        AgentEvent::Status {
            attempt,
            delay_ms,
            status,
            message,
        } => Some(ServerFrame::Status {
            session_id,
            run_id,
            attempt,
            delay_ms,
            status,
            message,
        }),
        AgentEvent::Error { message } => Some(ServerFrame::Error {
            session_id,
            run_id: Some(run_id),
            message,
        }),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use nils_model::ScriptedFactory;
    use nils_store::{CreateSessionOptions, SessionStore, StoreSettings};

    use super::*;

    fn ctx(tmp: &std::path::Path, factory: ScriptedFactory) -> RunContext {
        RunContext {
            store: Arc::new(SessionStore::new(tmp, StoreSettings::default())),
            registry: Arc::new(ToolRegistry::new()),
            factory: Arc::new(factory),
            prepared: Arc::new(PreparedSystemPrompt::default()),
            logger: Arc::new(Logger::disabled()),
            max_iterations: 5,
            limits: ExecLimits::default(),
            retry: None,
            api_key: None,
            api_key_resolver: None,
        }
    }

    async fn subscribe_all(hub: &Arc<WsHub>, session: &str) -> mpsc::UnboundedReceiver<String> {
        let (conn, rx) = hub.connect();
        hub.subscribe(conn, session);
        rx
    }

    fn frames(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(serde_json::from_str(&line).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn run_emits_lifecycle_frames_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let c = ctx(
            tmp.path(),
            ScriptedFactory::new(vec![ScriptedFactory::text_script("answer")]),
        );
        let session = c
            .store
            .create(CreateSessionOptions {
                name: Some("named".into()),
                ..CreateSessionOptions::default()
            })
            .await
            .unwrap();
        let hub = Arc::new(WsHub::new());
        let mut rx = subscribe_all(&hub, &session.id).await;

        run_step(
            hub.clone(),
            c.clone(),
            session.id.clone(),
            RunJob {
                run_id: "RUN1".into(),
                content: "question".into(),
            },
        )
        .await;

        let frames = frames(&mut rx);
        let types: Vec<&str> = frames.iter().map(|f| f["type"].as_str().unwrap()).collect();
        assert_eq!(types[0], "run_start");
        assert!(types.contains(&"stream_delta"));
        assert_eq!(*types.last().unwrap(), "message_complete");
        let complete = frames.last().unwrap();
        assert_eq!(complete["content"], "answer");
        assert_eq!(complete["runId"], "RUN1");

        // Persisted: user + assistant.
        let ctx_msgs = c.store.build_context(&session.id).await.unwrap();
        assert_eq!(ctx_msgs.len(), 2);
        assert_eq!(ctx_msgs[1].text(), "answer");

        // Metrics recorded, active-run registry clean.
        let meta = c.store.get(&session.id).await.unwrap();
        assert_eq!(meta.metrics.total_turns, 1);
        assert_eq!(hub.active_run_count(), 0);
    }

    #[tokio::test]
    async fn unknown_session_emits_error() {
        let tmp = tempfile::tempdir().unwrap();
        let c = ctx(tmp.path(), ScriptedFactory::always_text("x"));
        let hub = Arc::new(WsHub::new());
        let fake = nils_store::generate_id();
        let mut rx = subscribe_all(&hub, &fake).await;

        run_step(
            hub.clone(),
            c,
            fake.clone(),
            RunJob {
                run_id: "R".into(),
                content: "hello".into(),
            },
        )
        .await;

        let frames = frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "error");
        assert!(frames[0]["message"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn first_exchange_triggers_title_generation() {
        let tmp = tempfile::tempdir().unwrap();
        let c = ctx(
            tmp.path(),
            ScriptedFactory::new(vec![
                ScriptedFactory::text_script("the answer"),
                ScriptedFactory::text_script("Build Failure Triage"),
            ]),
        );
        let session = c.store.create(CreateSessionOptions::default()).await.unwrap();
        let hub = Arc::new(WsHub::new());
        let mut rx = subscribe_all(&hub, &session.id).await;

        run_step(
            hub.clone(),
            c.clone(),
            session.id.clone(),
            RunJob {
                run_id: "R1".into(),
                content: "why did the build fail?".into(),
            },
        )
        .await;

        // Title generation is fire-and-forget; give it a moment.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let name = c.store.get(&session.id).await.unwrap().name;
            if name != "New Session" {
                assert_eq!(name, "Build Failure Triage");
                break;
            }
            assert!(Instant::now() < deadline, "title was never generated");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let frames = frames(&mut rx);
        assert!(frames.iter().any(|f| f["type"] == "session_renamed"
            && f["name"] == "Build Failure Triage"));
    }

    #[tokio::test]
    async fn queued_runs_are_serialized_in_fifo_order() {
        let tmp = tempfile::tempdir().unwrap();
        let c = ctx(
            tmp.path(),
            ScriptedFactory::new(vec![
                ScriptedFactory::text_script("first answer"),
                ScriptedFactory::text_script("second answer"),
            ])
            .with_delay_ms(50),
        );
        let session = c
            .store
            .create(CreateSessionOptions {
                name: Some("named".into()),
                ..CreateSessionOptions::default()
            })
            .await
            .unwrap();
        let hub = Arc::new(WsHub::new());
        let mut rx = subscribe_all(&hub, &session.id).await;

        // Serial FIFO worker, exactly like the ws layer's session queue.
        let (queue_tx, mut queue_rx) = mpsc::channel::<RunJob>(8);
        let worker = {
            let hub = hub.clone();
            let c = c.clone();
            let sid = session.id.clone();
            tokio::spawn(async move {
                while let Some(job) = queue_rx.recv().await {
                    run_step(hub.clone(), c.clone(), sid.clone(), job).await;
                }
            })
        };

        for (run, content) in [("RUN-A", "one"), ("RUN-B", "two")] {
            queue_tx
                .send(RunJob {
                    run_id: run.into(),
                    content: content.into(),
                })
                .await
                .unwrap();
        }
        drop(queue_tx);
        worker.await.unwrap();

        let frames = frames(&mut rx);
        let starts: Vec<&serde_json::Value> =
            frames.iter().filter(|f| f["type"] == "run_start").collect();
        let completes: Vec<&serde_json::Value> = frames
            .iter()
            .filter(|f| f["type"] == "message_complete")
            .collect();
        assert_eq!(starts.len(), 2);
        assert_eq!(completes.len(), 2);
        assert_eq!(completes[0]["runId"], "RUN-A");
        assert_eq!(completes[1]["runId"], "RUN-B");

        let t1 = chrono::DateTime::parse_from_rfc3339(starts[0]["startedAt"].as_str().unwrap())
            .unwrap();
        let t2 = chrono::DateTime::parse_from_rfc3339(starts[1]["startedAt"].as_str().unwrap())
            .unwrap();
        assert!(
            (t2 - t1) >= chrono::Duration::milliseconds(50),
            "second run must start after the first's 50ms model turn"
        );
    }

    #[tokio::test]
    async fn second_run_does_not_retitle() {
        let tmp = tempfile::tempdir().unwrap();
        let c = ctx(
            tmp.path(),
            ScriptedFactory::new(vec![
                ScriptedFactory::text_script("one"),
                ScriptedFactory::text_script("Title One"),
                ScriptedFactory::text_script("two"),
            ]),
        );
        let session = c.store.create(CreateSessionOptions::default()).await.unwrap();
        let hub = Arc::new(WsHub::new());

        for (run, content) in [("R1", "first"), ("R2", "second")] {
            run_step(
                hub.clone(),
                c.clone(),
                session.id.clone(),
                RunJob {
                    run_id: run.into(),
                    content: content.into(),
                },
            )
            .await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(c.store.get(&session.id).await.unwrap().name, "Title One");
    }
}
