// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::records::{record_tokens, RecordBlock, RecordRole, SessionRecord, SCHEMA_VERSION};

// ─── Summarizer seam ──────────────────────────────────────────────────────────

/// Whether this is the first compaction of a session or a refinement of an
/// existing summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryMode {
    Initial,
    Update,
}

/// External summary producer (normally one tool-free model call).
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, mode: SummaryMode, prompt: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Copy)]
pub struct CompactionSettings {
    pub keep_recent_tokens: u64,
    pub reserve_tokens: u64,
}

const SUMMARIZE_INSTRUCTION: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, file \
     names, and tool outputs that may be relevant to future work. The summary will replace \
     the original history to free up context space.";

// ─── Engine ───────────────────────────────────────────────────────────────────

/// Decide a cut point and produce the compaction overlay record.
///
/// Returns `Ok(None)` when the history is too small or the cut would be
/// degenerate. Never cuts between an assistant tool call and its matching
/// tool result.
pub async fn plan_compaction(
    records: &[SessionRecord],
    settings: &CompactionSettings,
    summarizer: &dyn Summarizer,
) -> anyhow::Result<Option<SessionRecord>> {
    let messages: Vec<&SessionRecord> = records.iter().filter(|r| r.is_message()).collect();
    if messages.len() < 2 {
        return Ok(None);
    }

    // Walk newest → oldest until the recent tail holds keep_recent_tokens.
    let mut acc: u64 = 0;
    let mut cut_index: usize = 0;
    for (i, record) in messages.iter().enumerate().rev() {
        acc += record_tokens(record);
        if acc >= settings.keep_recent_tokens {
            cut_index = i;
            break;
        }
    }

    // Never orphan a tool result from the assistant message that called it.
    while cut_index > 0 && splits_tool_pair(&messages, cut_index) {
        cut_index -= 1;
    }

    if cut_index == 0 || cut_index >= messages.len() {
        return Ok(None);
    }

    let previous = records.iter().rev().find_map(|r| match r {
        SessionRecord::Compaction {
            summary,
            read_files,
            modified_files,
            ..
        } => Some((summary.clone(), read_files.clone(), modified_files.clone())),
        _ => None,
    });

    let serialized = serialize_transcript(&messages[..cut_index]);
    let tokens_before: u64 = messages[..cut_index].iter().map(|r| record_tokens(r)).sum();

    let (mode, prompt) = match &previous {
        Some((prev_summary, _, _)) => (
            SummaryMode::Update,
            format!(
                "{SUMMARIZE_INSTRUCTION}\n\n<previous-summary>\n{prev_summary}\n</previous-summary>\n\n{serialized}"
            ),
        ),
        None => (
            SummaryMode::Initial,
            format!("{SUMMARIZE_INSTRUCTION}\n\n{serialized}"),
        ),
    };

    let summary = match summarizer.summarize(mode, &prompt).await {
        Ok(s) if !s.trim().is_empty() => s,
        _ => fallback_summary(&serialized),
    };

    let (read_files, modified_files) =
        collect_file_sets(&messages[..cut_index], previous.as_ref());

    let max_seq = records.iter().map(SessionRecord::seq).max().unwrap_or(0);
    let first_kept_seq = messages[cut_index].seq();
    debug!(first_kept_seq, tokens_before, "compaction planned");

    Ok(Some(SessionRecord::Compaction {
        seq: max_seq + 1,
        schema_version: SCHEMA_VERSION,
        summary,
        first_kept_seq,
        tokens_before,
        read_files,
        modified_files,
        timestamp: Utc::now(),
    }))
}

/// True when `messages[cut]` is a tool result answering a tool call inside
/// `messages[cut-1]`.
fn splits_tool_pair(messages: &[&SessionRecord], cut: usize) -> bool {
    let SessionRecord::Message {
        role: RecordRole::ToolResult,
        tool_call_id: Some(result_id),
        ..
    } = messages[cut]
    else {
        return false;
    };
    let SessionRecord::Message {
        role: RecordRole::Assistant,
        content,
        ..
    } = messages[cut - 1]
    else {
        return false;
    };
    content.iter().any(
        |b| matches!(b, RecordBlock::ToolCall { id, .. } if id == result_id),
    )
}

/// Flatten compacted messages into the summarizer prompt, one block per
/// message.
fn serialize_transcript(messages: &[&SessionRecord]) -> String {
    let mut out: Vec<String> = Vec::with_capacity(messages.len());
    for record in messages {
        let SessionRecord::Message { role, content, .. } = record else {
            continue;
        };
        let text: String = content
            .iter()
            .filter_map(|b| match b {
                RecordBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        match role {
            RecordRole::User => out.push(format!("[User]: {text}")),
            RecordRole::ToolResult => out.push(format!("[Tool result]: {text}")),
            RecordRole::Assistant => {
                let calls: Vec<String> = content
                    .iter()
                    .filter_map(|b| match b {
                        RecordBlock::ToolCall { name, arguments, .. } => Some(format!(
                            "{name}({})",
                            Value::Object(arguments.clone())
                        )),
                        _ => None,
                    })
                    .collect();
                if !text.is_empty() {
                    out.push(format!("[Assistant]: {text}"));
                }
                if !calls.is_empty() {
                    out.push(format!("[Assistant tool calls]: {}", calls.join(", ")));
                }
            }
        }
    }
    out.join("\n")
}

/// Deterministic replacement when the model returns nothing usable.
fn fallback_summary(serialized: &str) -> String {
    let excerpt: String = serialized.chars().take(500).collect();
    format!(
        "[Summary unavailable]\nThe compacted history could not be summarized. \
         Literal excerpt of the dropped conversation:\n{excerpt}"
    )
}

/// Accumulate file sets from read/write tool calls, merged with the previous
/// overlay. A write invalidates a prior read of the same file.
fn collect_file_sets(
    messages: &[&SessionRecord],
    previous: Option<&(String, Vec<String>, Vec<String>)>,
) -> (Vec<String>, Vec<String>) {
    let mut read: BTreeSet<String> = BTreeSet::new();
    let mut modified: BTreeSet<String> = BTreeSet::new();
    if let Some((_, prev_read, prev_modified)) = previous {
        read.extend(prev_read.iter().cloned());
        modified.extend(prev_modified.iter().cloned());
    }

    for record in messages {
        let SessionRecord::Message { content, .. } = record else {
            continue;
        };
        for block in content.iter() {
            let RecordBlock::ToolCall { name, arguments, .. } = block else {
                continue;
            };
            let Some(path) = arguments.get("path").and_then(Value::as_str) else {
                continue;
            };
            match name.as_str() {
                "read" | "read_file" => {
                    read.insert(path.to_string());
                }
                "write" | "write_file" => {
                    modified.insert(path.to_string());
                }
                _ => {}
            }
        }
    }

    for m in &modified {
        read.remove(m);
    }
    (read.into_iter().collect(), modified.into_iter().collect())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
