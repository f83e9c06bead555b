// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod loader;
mod paths;
mod schema;

pub use loader::load;
pub use paths::AgentPaths;
pub use schema::{
    CompactionConfig, Config, LoggingConfig, ModelConfig, RetryConfig, RotationConfig,
    SecurityConfig, ServerConfig, SystemPromptConfig, ToolsConfig,
};
