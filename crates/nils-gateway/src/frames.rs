// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Frames a client may send over `/ws`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    SendMessage { session_id: String, content: String },
    Cancel { session_id: String, run_id: String },
}

/// Frames the server emits to every subscriber of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    RunStart {
        session_id: String,
        run_id: String,
        started_at: String,
    },
    StreamDelta {
        session_id: String,
        run_id: String,
        delta: String,
    },
    ToolStart {
        session_id: String,
        run_id: String,
        id: String,
        name: String,
        arguments: Map<String, Value>,
    },
    ToolResult {
        session_id: String,
        run_id: String,
        tool_call_id: String,
        tool_name: String,
        content: String,
        is_error: bool,
    },
    Status {
        session_id: String,
        run_id: String,
        attempt: u32,
        delay_ms: u64,
        status: u16,
        message: String,
    },
    MessageComplete {
        session_id: String,
        run_id: String,
        content: String,
    },
    SessionRenamed {
        session_id: String,
        run_id: String,
        name: String,
    },
    Error {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        message: String,
    },
}

impl ServerFrame {
    pub fn session_id(&self) -> &str {
        match self {
            Self::RunStart { session_id, .. }
            | Self::StreamDelta { session_id, .. }
            | Self::ToolStart { session_id, .. }
            | Self::ToolResult { session_id, .. }
            | Self::Status { session_id, .. }
            | Self::MessageComplete { session_id, .. }
            | Self::SessionRenamed { session_id, .. }
            | Self::Error { session_id, .. } => session_id,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
