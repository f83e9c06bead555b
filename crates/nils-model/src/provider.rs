// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::{Message, ToolSchema};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ProviderError>> + Send>>;

/// Events yielded by a model stream.
///
/// The terminal `Completed` event carries the fully assembled assistant
/// message; every driver guarantees it is the last event of a successful
/// stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta {
        delta: String,
    },
    ThinkingDelta {
        delta: String,
    },
    #[serde(rename = "toolcall_start")]
    ToolCallStart {
        id: String,
        name: String,
    },
    #[serde(rename = "toolcall_end")]
    ToolCallEnd {
        id: String,
        name: String,
        arguments: Map<String, Value>,
    },
    Completed {
        message: Message,
    },
}

/// Errors surfaced by a provider driver.
///
/// HTTP failures keep their status so the retry layer can classify them;
/// `retry_after` carries a parsed `Retry-After` header when the provider
/// sent one.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider returned HTTP {status}: {message}")]
    Http {
        status: u16,
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("model stream aborted: {0}")]
    Aborted(String),
    #[error("run cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// One model call: full context plus the tool catalog.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    pub messages: Vec<Message>,
    pub system_prompt: String,
    pub tools: Vec<ToolSchema>,
}

/// Per-call options resolved by the agent loop.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub api_key: Option<String>,
    pub cancel: CancellationToken,
}

/// The model abstraction the agent loop runs against.
///
/// Implementations stream deltas and finish with a `Completed` event; they
/// must honor `opts.cancel` at every await point.
#[async_trait]
pub trait StreamFactory: Send + Sync {
    /// Provider identifier recorded on assistant messages.
    fn provider(&self) -> &str;

    /// Model name recorded on assistant messages.
    fn model(&self) -> &str;

    /// Wire API flavor recorded on assistant messages (e.g. "messages").
    fn api(&self) -> &str {
        "messages"
    }

    async fn stream(
        &self,
        req: StreamRequest,
        opts: StreamOptions,
    ) -> Result<EventStream, ProviderError>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_event_wire_names() {
        let e = StreamEvent::TextDelta { delta: "x".into() };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "text_delta");

        let e = StreamEvent::ToolCallEnd {
            id: "tc".into(),
            name: "read".into(),
            arguments: Map::new(),
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "toolcall_end");
    }

    #[test]
    fn http_error_keeps_status_and_retry_after() {
        let e = ProviderError::Http {
            status: 429,
            retry_after: Some(Duration::from_secs(3)),
            message: "slow down".into(),
        };
        assert_eq!(e.status(), Some(429));
        assert_eq!(e.retry_after(), Some(Duration::from_secs(3)));
        assert!(e.to_string().contains("429"));
    }

    #[test]
    fn non_http_errors_have_no_status() {
        assert_eq!(ProviderError::Aborted("eof".into()).status(), None);
        assert_eq!(ProviderError::Cancelled.status(), None);
    }
}
