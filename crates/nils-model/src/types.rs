// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Content blocks ───────────────────────────────────────────────────────────

/// A single content block inside a message.
///
/// Thinking blocks exist only in memory: the persistence layer drops them
/// when converting a message into a session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Map<String, Value>,
    },
    Thinking {
        thinking: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        Self::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

// ─── Usage & stop reason ──────────────────────────────────────────────────────

/// Why the model ended its turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    #[default]
    Stop,
    ToolUse,
    Length,
    Error,
}

/// Token accounting for one assistant turn.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub total_tokens: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub cost: f64,
}

// ─── Messages ─────────────────────────────────────────────────────────────────

/// A message in a conversation, tagged by role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "camelCase")]
pub enum Message {
    #[serde(rename_all = "camelCase")]
    User { content: Vec<ContentBlock> },
    #[serde(rename_all = "camelCase")]
    Assistant {
        content: Vec<ContentBlock>,
        stop_reason: StopReason,
        usage: Usage,
        model: String,
        provider: String,
        api: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        content: Vec<ContentBlock>,
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        is_error: bool,
        timestamp: DateTime<Utc>,
    },
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: Option<String>,
        text: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            content: vec![ContentBlock::text(text)],
            tool_call_id: tool_call_id.into(),
            tool_name,
            is_error,
            timestamp: Utc::now(),
        }
    }

    /// Concatenated text of all `Text` blocks.
    pub fn text(&self) -> String {
        self.content()
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn content(&self) -> &[ContentBlock] {
        match self {
            Self::User { content }
            | Self::Assistant { content, .. }
            | Self::ToolResult { content, .. } => content,
        }
    }

    /// Tool-call blocks in content order.
    pub fn tool_calls(&self) -> Vec<(&str, &str, &Map<String, Value>)> {
        self.content()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolCall { id, name, arguments } => {
                    Some((id.as_str(), name.as_str(), arguments))
                }
                _ => None,
            })
            .collect()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self {
            Self::Assistant { stop_reason, .. } => Some(*stop_reason),
            _ => None,
        }
    }

    pub fn usage(&self) -> Option<&Usage> {
        match self {
            Self::Assistant { usage, .. } => Some(usage),
            _ => None,
        }
    }
}

// ─── Tool schemas ─────────────────────────────────────────────────────────────

/// Tool definition forwarded to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
