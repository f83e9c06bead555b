// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use nils_model::StreamEvent;

/// Events emitted by the agent loop during one run. Consumers (the
/// WebSocket orchestrator, the workflow engine, tests) subscribe through an
/// mpsc channel and translate these into their own wire frames.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A raw provider stream event, forwarded as-is
    Stream(StreamEvent),
    /// A tool call finished and its result was appended to the context
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: String,
        is_error: bool,
    },
    /// A transient provider failure is being retried
    Status {
        attempt: u32,
        delay_ms: u64,
        status: u16,
        message: String,
    },
    /// The run failed or hit its iteration cap
    Error { message: String },
}
