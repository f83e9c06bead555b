// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod events;
mod retry;

pub use agent::{run_agent_loop, ApiKeyResolver, LoopOptions, LoopOutcome, TurnStats};
pub use events::AgentEvent;
pub use retry::{with_retry, RetrySettings};
