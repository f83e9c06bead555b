// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use serde_json::{Map, Value};

use crate::{
    ContentBlock, EventStream, Message, ProviderError, StopReason, StreamEvent, StreamFactory,
    StreamOptions, StreamRequest, Usage,
};

/// A pre-scripted stream factory. Each call to `stream` pops the next event
/// script from the front of the queue, so tests can specify exact event
/// sequences — including tool calls — without network access.
pub struct ScriptedFactory {
    scripts: Mutex<Vec<Vec<StreamEvent>>>,
    /// Every request seen by this factory, for test inspection.
    pub requests: Mutex<Vec<StreamRequest>>,
    /// HTTP errors returned before the first successful call (for retry tests).
    failures: Mutex<Vec<u16>>,
    delay_ms: u64,
}

impl ScriptedFactory {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            requests: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            delay_ms: 0,
        }
    }

    /// Fail the first `statuses.len()` calls with the given HTTP statuses,
    /// then serve the scripts.
    pub fn with_failures(mut self, statuses: Vec<u16>) -> Self {
        self.failures = Mutex::new(statuses);
        self
    }

    /// Sleep this long before yielding events, to make run overlap visible
    /// in queue-ordering tests.
    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    /// Factory that always answers with a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let text = reply.into();
        Self::new(vec![Self::text_script(&text)])
    }

    /// Two-round script: a tool call, then a final text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Map<String, Value>,
        final_text: impl Into<String>,
    ) -> Self {
        let id = tool_id.into();
        let name = tool_name.into();
        Self::new(vec![
            Self::tool_call_script(&id, &name, arguments),
            Self::text_script(&final_text.into()),
        ])
    }

    /// Event script for a plain text turn ending in `stopReason=stop`.
    pub fn text_script(text: &str) -> Vec<StreamEvent> {
        vec![
            StreamEvent::TextDelta { delta: text.to_string() },
            StreamEvent::Completed {
                message: assistant(vec![ContentBlock::text(text)], StopReason::Stop),
            },
        ]
    }

    /// Event script for a tool-use turn ending in `stopReason=toolUse`.
    pub fn tool_call_script(id: &str, name: &str, arguments: Map<String, Value>) -> Vec<StreamEvent> {
        vec![
            StreamEvent::ToolCallStart {
                id: id.to_string(),
                name: name.to_string(),
            },
            StreamEvent::ToolCallEnd {
                id: id.to_string(),
                name: name.to_string(),
                arguments: arguments.clone(),
            },
            StreamEvent::Completed {
                message: assistant(
                    vec![ContentBlock::tool_call(id, name, arguments)],
                    StopReason::ToolUse,
                ),
            },
        ]
    }
}

/// Dev/mock provider that echoes the last user message back. Used when the
/// configuration selects `provider: mock`.
#[derive(Default)]
pub struct EchoFactory;

#[async_trait]
impl StreamFactory for EchoFactory {
    fn provider(&self) -> &str {
        "mock"
    }
    fn model(&self) -> &str {
        "mock-model"
    }

    async fn stream(
        &self,
        req: StreamRequest,
        opts: StreamOptions,
    ) -> Result<EventStream, ProviderError> {
        if opts.cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let reply = req
            .messages
            .iter()
            .rev()
            .find_map(|m| match m {
                Message::User { .. } => Some(m.text()),
                _ => None,
            })
            .unwrap_or_else(|| "[no input]".into());
        let text = format!("MOCK: {reply}");
        let events: Vec<Result<StreamEvent, ProviderError>> =
            ScriptedFactory::text_script(&text).into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(events)))
    }
}

fn assistant(content: Vec<ContentBlock>, stop_reason: StopReason) -> Message {
    Message::Assistant {
        content,
        stop_reason,
        usage: Usage {
            input: 10,
            output: 10,
            total_tokens: 20,
            ..Usage::default()
        },
        model: "mock-model".into(),
        provider: "mock".into(),
        api: "messages".into(),
        timestamp: Utc::now(),
    }
}

#[async_trait]
impl StreamFactory for ScriptedFactory {
    fn provider(&self) -> &str {
        "mock"
    }
    fn model(&self) -> &str {
        "mock-model"
    }

    async fn stream(
        &self,
        req: StreamRequest,
        opts: StreamOptions,
    ) -> Result<EventStream, ProviderError> {
        if opts.cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        self.requests.lock().unwrap().push(req);

        {
            let mut failures = self.failures.lock().unwrap();
            if !failures.is_empty() {
                let status = failures.remove(0);
                let retry_after = (status == 429).then(|| std::time::Duration::from_millis(0));
                return Err(ProviderError::Http {
                    status,
                    retry_after,
                    message: "scripted failure".into(),
                });
            }
        }

        if self.delay_ms > 0 {
            tokio::select! {
                _ = opts.cancel.cancelled() => return Err(ProviderError::Cancelled),
                _ = tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)) => {}
            }
        }

        let mut scripts = self.scripts.lock().unwrap();
        if scripts.is_empty() {
            return Err(ProviderError::Aborted("mock script exhausted".into()));
        }
        let events: Vec<Result<StreamEvent, ProviderError>> =
            scripts.remove(0).into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(events)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
