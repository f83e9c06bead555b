// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod compact;
mod id;
mod records;
mod store;
mod title;

pub use compact::{plan_compaction, CompactionSettings, SummaryMode, Summarizer};
pub use id::{generate_id, is_valid_id};
pub use records::{
    estimate_tokens, message_to_append_input, record_to_message, AppendInput, RecordBlock,
    RecordRole, SessionMetadata, SessionMetrics, SessionRecord, SessionSource, SCHEMA_VERSION,
};
pub use store::{
    CreateSessionOptions, SessionListItem, SessionStore, StoreError, StoreSettings, TurnMetrics,
};
pub use title::{normalize_title, title_fallback, title_prompt};
