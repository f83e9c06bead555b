// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use nils_model::{ContentBlock, Message, StopReason, Usage};

pub const SCHEMA_VERSION: u32 = 1;

// ─── Wire records ─────────────────────────────────────────────────────────────

/// One line of `session.jsonl`, tagged by `recordType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "recordType", rename_all = "camelCase")]
pub enum SessionRecord {
    #[serde(rename_all = "camelCase")]
    Message {
        seq: u64,
        schema_version: u32,
        role: RecordRole,
        content: Vec<RecordBlock>,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Compaction {
        seq: u64,
        schema_version: u32,
        summary: String,
        first_kept_seq: u64,
        tokens_before: u64,
        /// Sorted, deduplicated
        read_files: Vec<String>,
        /// Sorted, deduplicated
        modified_files: Vec<String>,
        timestamp: DateTime<Utc>,
    },
}

impl SessionRecord {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Message { seq, .. } | Self::Compaction { seq, .. } => *seq,
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self, Self::Message { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordRole {
    User,
    Assistant,
    ToolResult,
}

/// Persisted content block. Thinking blocks are intentionally absent: they
/// never reach disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RecordBlock {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Map<String, Value>,
    },
}

// ─── Append input & conversions ───────────────────────────────────────────────

/// What callers hand to `append_message`; the store assigns seq + timestamp.
#[derive(Debug, Clone)]
pub struct AppendInput {
    pub role: RecordRole,
    pub content: Vec<RecordBlock>,
    pub is_error: Option<bool>,
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
}

/// Convert a runtime message into an append input, dropping thinking blocks.
pub fn message_to_append_input(msg: &Message) -> AppendInput {
    let content: Vec<RecordBlock> = msg
        .content()
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(RecordBlock::Text { text: text.clone() }),
            ContentBlock::ToolCall { id, name, arguments } => Some(RecordBlock::ToolCall {
                id: id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
            }),
            ContentBlock::Thinking { .. } => None,
        })
        .collect();

    match msg {
        Message::User { .. } => AppendInput {
            role: RecordRole::User,
            content,
            is_error: None,
            tool_call_id: None,
            tool_name: None,
        },
        Message::Assistant { .. } => AppendInput {
            role: RecordRole::Assistant,
            content,
            is_error: None,
            tool_call_id: None,
            tool_name: None,
        },
        Message::ToolResult {
            tool_call_id,
            tool_name,
            is_error,
            ..
        } => AppendInput {
            role: RecordRole::ToolResult,
            content,
            is_error: Some(*is_error),
            tool_call_id: Some(tool_call_id.clone()),
            tool_name: tool_name.clone(),
        },
    }
}

/// Rebuild a runtime message from a persisted record for context replay.
///
/// Assistant turn metadata (usage, stop reason, model) is not persisted, so
/// replayed assistant messages carry neutral values — only the content
/// matters when the context is sent back to the model.
pub fn record_to_message(record: &SessionRecord) -> Option<Message> {
    let SessionRecord::Message {
        role,
        content,
        timestamp,
        is_error,
        tool_call_id,
        tool_name,
        ..
    } = record
    else {
        return None;
    };

    let blocks: Vec<ContentBlock> = content
        .iter()
        .map(|b| match b {
            RecordBlock::Text { text } => ContentBlock::text(text.clone()),
            RecordBlock::ToolCall { id, name, arguments } => {
                ContentBlock::tool_call(id.clone(), name.clone(), arguments.clone())
            }
        })
        .collect();

    Some(match role {
        RecordRole::User => Message::User { content: blocks },
        RecordRole::Assistant => Message::Assistant {
            content: blocks,
            stop_reason: StopReason::Stop,
            usage: Usage::default(),
            model: String::new(),
            provider: String::new(),
            api: String::new(),
            timestamp: *timestamp,
        },
        RecordRole::ToolResult => Message::ToolResult {
            content: blocks,
            tool_call_id: tool_call_id.clone().unwrap_or_default(),
            tool_name: tool_name.clone(),
            is_error: is_error.unwrap_or(false),
            timestamp: *timestamp,
        },
    })
}

// ─── Token estimation ─────────────────────────────────────────────────────────

/// chars → tokens approximation used for compaction budgeting.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4).max(1)
}

/// Estimated token weight of one record's textual content.
pub fn record_tokens(record: &SessionRecord) -> u64 {
    match record {
        SessionRecord::Message { content, .. } => content
            .iter()
            .map(|b| match b {
                RecordBlock::Text { text } => estimate_tokens(text),
                RecordBlock::ToolCall { name, arguments, .. } => {
                    estimate_tokens(name) + estimate_tokens(&Value::Object(arguments.clone()).to_string())
                }
            })
            .sum(),
        SessionRecord::Compaction { summary, .. } => estimate_tokens(summary),
    }
}

// ─── Metadata ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum SessionSource {
    #[default]
    Interactive,
    Cron,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub total_turns: u64,
    pub total_tokens: u64,
    pub total_tool_calls: u64,
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub message_count: u64,
    pub next_seq: u64,
    pub model: String,
    pub name: String,
    #[serde(default)]
    pub source: SessionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_override: Option<String>,
    #[serde(default)]
    pub metrics: SessionMetrics,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
