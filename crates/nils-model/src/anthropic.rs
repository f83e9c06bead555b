// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::{
    ContentBlock, EventStream, Message, ProviderError, StopReason, StreamEvent, StreamFactory,
    StreamOptions, StreamRequest, Usage,
};

/// Streaming driver for the Anthropic Messages API.
pub struct AnthropicFactory {
    model: String,
    base_url: String,
    api_key: Option<String>,
    max_tokens: u32,
    client: reqwest::Client,
}

impl AnthropicFactory {
    pub fn new(model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            model: model.into(),
            base_url: "https://api.anthropic.com".into(),
            api_key,
            max_tokens: 8192,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_body(&self, req: &StreamRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "stream": true,
            "messages": req.messages.iter().map(wire_message).collect::<Vec<_>>(),
        });
        if !req.system_prompt.is_empty() {
            body["system"] = json!(req.system_prompt);
        }
        if !req.tools.is_empty() {
            body["tools"] = json!(req
                .tools
                .iter()
                .map(|t| json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                }))
                .collect::<Vec<_>>());
        }
        body
    }
}

/// Convert a runtime message into the Anthropic wire shape.
///
/// Tool results travel as user-role `tool_result` blocks; thinking blocks
/// are never sent back.
fn wire_message(msg: &Message) -> Value {
    match msg {
        Message::User { content } => json!({
            "role": "user",
            "content": content.iter().filter_map(wire_block).collect::<Vec<_>>(),
        }),
        Message::Assistant { content, .. } => json!({
            "role": "assistant",
            "content": content.iter().filter_map(wire_block).collect::<Vec<_>>(),
        }),
        Message::ToolResult {
            content,
            tool_call_id,
            is_error,
            ..
        } => json!({
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": tool_call_id,
                "content": content.iter().filter_map(ContentBlock::as_text).collect::<Vec<_>>().join(""),
                "is_error": is_error,
            }],
        }),
    }
}

fn wire_block(block: &ContentBlock) -> Option<Value> {
    match block {
        ContentBlock::Text { text } => Some(json!({"type": "text", "text": text})),
        ContentBlock::ToolCall { id, name, arguments } => Some(json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": arguments,
        })),
        ContentBlock::Thinking { .. } => None,
    }
}

#[async_trait]
impl StreamFactory for AnthropicFactory {
    fn provider(&self) -> &str {
        "anthropic"
    }
    fn model(&self) -> &str {
        &self.model
    }

    async fn stream(
        &self,
        req: StreamRequest,
        opts: StreamOptions,
    ) -> Result<EventStream, ProviderError> {
        let key = opts
            .api_key
            .clone()
            .or_else(|| self.api_key.clone())
            .ok_or_else(|| ProviderError::Other(anyhow::anyhow!("no Anthropic API key configured")))?;

        let body = self.build_body(&req);
        debug!(model = %self.model, messages = req.messages.len(), "sending anthropic request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Other(anyhow::anyhow!("Anthropic request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = parse_retry_after(resp.headers());
            let message = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status,
                retry_after,
                message,
            });
        }

        let (tx, rx) = mpsc::channel::<Result<StreamEvent, ProviderError>>(64);
        let model = self.model.clone();
        let cancel = opts.cancel.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(ProviderError::Cancelled),
                r = pump_sse(resp, &model, tx.clone()) => r,
            };
            if let Err(e) = result {
                let _ = tx.send(Err(e)).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Parse a `Retry-After` header: either delta-seconds or an HTTP-date.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    if let Ok(secs) = raw.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = chrono::DateTime::parse_from_rfc2822(raw.trim()).ok()?;
    let delta = when.with_timezone(&Utc) - Utc::now();
    delta.to_std().ok()
}

/// Drain the SSE body, translating Anthropic events into [`StreamEvent`]s
/// and assembling the terminal assistant message.
async fn pump_sse(
    resp: reqwest::Response,
    model: &str,
    tx: mpsc::Sender<Result<StreamEvent, ProviderError>>,
) -> Result<(), ProviderError> {
    let mut bytes = resp.bytes_stream();
    // SSE lines can split across TCP chunks, so carry a remainder forward.
    let mut buf = String::new();
    let mut asm = Assembler::new(model);

    while let Some(chunk) = bytes.next().await {
        let chunk = chunk.map_err(|e| ProviderError::Aborted(e.to_string()))?;
        buf.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(pos) = buf.find('\n') {
            let line = buf[..pos].trim_end_matches('\r').to_string();
            buf.drain(..=pos);
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            let Ok(v) = serde_json::from_str::<Value>(data.trim()) else {
                continue;
            };
            for event in asm.ingest(&v) {
                if tx.send(Ok(event)).await.is_err() {
                    return Ok(()); // consumer went away
                }
            }
            if asm.done {
                let message = asm.finish();
                let _ = tx.send(Ok(StreamEvent::Completed { message })).await;
                return Ok(());
            }
        }
    }
    Err(ProviderError::Aborted(
        "stream ended before message_stop".into(),
    ))
}

/// Accumulates streamed content blocks into the final assistant message.
struct Assembler {
    model: String,
    blocks: Vec<ContentBlock>,
    current_text: String,
    current_thinking: String,
    pending_tool: Option<(String, String, String)>, // id, name, args json buffer
    stop_reason: StopReason,
    usage: Usage,
    done: bool,
}

impl Assembler {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            blocks: Vec::new(),
            current_text: String::new(),
            current_thinking: String::new(),
            pending_tool: None,
            stop_reason: StopReason::Stop,
            usage: Usage::default(),
            done: false,
        }
    }

    fn ingest(&mut self, v: &Value) -> Vec<StreamEvent> {
        match v["type"].as_str().unwrap_or("") {
            "message_start" => {
                let usage = &v["message"]["usage"];
                self.usage.input = usage["input_tokens"].as_u64().unwrap_or(0);
                self.usage.cache_read = usage["cache_read_input_tokens"].as_u64().unwrap_or(0);
                self.usage.cache_write = usage["cache_creation_input_tokens"].as_u64().unwrap_or(0);
                vec![]
            }
            "content_block_start" => {
                let block = &v["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    let id = block["id"].as_str().unwrap_or("").to_string();
                    let name = block["name"].as_str().unwrap_or("").to_string();
                    self.pending_tool = Some((id.clone(), name.clone(), String::new()));
                    return vec![StreamEvent::ToolCallStart { id, name }];
                }
                vec![]
            }
            "content_block_delta" => {
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        let text = delta["text"].as_str().unwrap_or("").to_string();
                        self.current_text.push_str(&text);
                        vec![StreamEvent::TextDelta { delta: text }]
                    }
                    "thinking_delta" => {
                        let t = delta["thinking"].as_str().unwrap_or("").to_string();
                        self.current_thinking.push_str(&t);
                        vec![StreamEvent::ThinkingDelta { delta: t }]
                    }
                    "input_json_delta" => {
                        if let Some((_, _, args)) = self.pending_tool.as_mut() {
                            args.push_str(delta["partial_json"].as_str().unwrap_or(""));
                        }
                        vec![]
                    }
                    _ => vec![],
                }
            }
            "content_block_stop" => {
                if !self.current_text.is_empty() {
                    self.blocks
                        .push(ContentBlock::text(std::mem::take(&mut self.current_text)));
                }
                if !self.current_thinking.is_empty() {
                    self.blocks.push(ContentBlock::Thinking {
                        thinking: std::mem::take(&mut self.current_thinking),
                    });
                }
                if let Some((id, name, args_buf)) = self.pending_tool.take() {
                    let arguments: Map<String, Value> = if args_buf.is_empty() {
                        Map::new()
                    } else {
                        serde_json::from_str(&args_buf).unwrap_or_else(|e| {
                            warn!(tool = %name, error = %e, "unparseable tool arguments from model");
                            Map::new()
                        })
                    };
                    self.blocks
                        .push(ContentBlock::tool_call(&id, &name, arguments.clone()));
                    return vec![StreamEvent::ToolCallEnd { id, name, arguments }];
                }
                vec![]
            }
            "message_delta" => {
                if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                    self.stop_reason = match reason {
                        "tool_use" => StopReason::ToolUse,
                        "max_tokens" => StopReason::Length,
                        "end_turn" | "stop_sequence" => StopReason::Stop,
                        _ => StopReason::Error,
                    };
                }
                if let Some(out) = v["usage"]["output_tokens"].as_u64() {
                    self.usage.output = out;
                }
                vec![]
            }
            "message_stop" => {
                self.done = true;
                vec![]
            }
            "error" => {
                warn!(body = %v, "anthropic stream error event");
                self.stop_reason = StopReason::Error;
                self.done = true;
                vec![]
            }
            _ => vec![],
        }
    }

    fn finish(&mut self) -> Message {
        if !self.current_text.is_empty() {
            self.blocks
                .push(ContentBlock::text(std::mem::take(&mut self.current_text)));
        }
        self.usage.total_tokens = self.usage.input + self.usage.output;
        Message::Assistant {
            content: std::mem::take(&mut self.blocks),
            stop_reason: self.stop_reason,
            usage: self.usage,
            model: std::mem::take(&mut self.model),
            provider: "anthropic".into(),
            api: "messages".into(),
            timestamp: Utc::now(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
