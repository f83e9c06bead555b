// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so enabled-by-default fields need a named function.
fn default_true() -> bool {
    true
}

/// Root configuration document.
///
/// Canonical key names are camelCase on the wire; every field also accepts
/// its snake_case alias so hand-written YAML stays ergonomic. Unknown keys
/// are dropped silently.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default, alias = "system_prompt")]
    pub system_prompt: SystemPromptConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
}

/// Model selection forwarded to the provider layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /// Provider identifier: "anthropic" | "mock"
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    #[serde(default, alias = "api_key_env")]
    pub api_key_env: Option<String>,
    /// Context window used for compaction budgeting
    #[serde(default = "default_context_window", alias = "context_window")]
    pub context_window: usize,
}

fn default_context_window() -> usize {
    200_000
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            name: "claude-sonnet-4-5".into(),
            api_key_env: None,
            context_window: default_context_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsConfig {
    /// Maximum number of stream→tool rounds per run
    #[serde(default = "default_max_iterations", alias = "max_iterations")]
    pub max_iterations: u32,
    /// Byte cap on a single tool result returned to the model
    #[serde(default = "default_output_limit", alias = "output_limit")]
    pub output_limit: usize,
    /// Per-tool execution timeout in seconds
    #[serde(default = "default_tool_timeout")]
    pub timeout: u64,
}

fn default_max_iterations() -> u32 {
    20
}
fn default_output_limit() -> usize {
    200_000
}
fn default_tool_timeout() -> u64 {
    120
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            output_limit: default_output_limit(),
            timeout: default_tool_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Path of the JSON-lines agent log. None disables file logging.
    #[serde(default)]
    pub file: Option<String>,
    /// Minimum level written: "debug" | "info" | "warn" | "error"
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Mirror log lines to stdout
    #[serde(default = "default_true")]
    pub stdout: bool,
    #[serde(default)]
    pub rotation: RotationConfig,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: None,
            level: default_log_level(),
            stdout: true,
            rotation: RotationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationConfig {
    /// Archives older than this many days are deleted
    #[serde(default = "default_max_days", alias = "max_days")]
    pub max_days: u32,
    /// Rotate when the live file exceeds this many megabytes
    #[serde(default = "default_max_size_mb", alias = "max_size_mb")]
    pub max_size_mb: u64,
}

fn default_max_days() -> u32 {
    14
}
fn default_max_size_mb() -> u64 {
    50
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_days: default_max_days(),
            max_size_mb: default_max_size_mb(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms", alias = "base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms", alias = "max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_retries", alias = "max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retryable_statuses", alias = "retryable_statuses")]
    pub retryable_statuses: Vec<u16>,
}

fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retryable_statuses() -> Vec<u16> {
    vec![429, 500, 502, 503, 529]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
            retryable_statuses: default_retryable_statuses(),
        }
    }
}

/// Sandbox policy for tools and subprocesses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    /// Environment keys copied into tool subprocesses; everything else is dropped
    #[serde(default, alias = "allowed_env")]
    pub allowed_env: Vec<String>,
    /// Filesystem roots tools may touch
    #[serde(default, alias = "allowed_paths")]
    pub allowed_paths: Vec<String>,
    /// Boundaries inside allowed roots that stay off-limits (deny wins)
    #[serde(default, alias = "denied_paths")]
    pub denied_paths: Vec<String>,
    /// Identity-header logins accepted from non-loopback clients.
    /// Empty means no allowlist is enforced.
    #[serde(default, alias = "allowed_users")]
    pub allowed_users: Vec<String>,
    /// Extra regex patterns rejected by the bash command filter
    #[serde(default, alias = "blocked_commands")]
    pub blocked_commands: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPromptConfig {
    /// File whose contents become the identity block of the system prompt
    #[serde(default, alias = "identity_file")]
    pub identity_file: Option<String>,
    /// Optional extra instructions appended after the identity block
    #[serde(default, alias = "custom_instructions_file")]
    pub custom_instructions_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Recent-tail token budget preserved verbatim across a compaction
    #[serde(default = "default_keep_recent_tokens", alias = "keep_recent_tokens")]
    pub keep_recent_tokens: usize,
    /// Headroom subtracted from the context window before triggering
    #[serde(default = "default_reserve_tokens", alias = "reserve_tokens")]
    pub reserve_tokens: usize,
}

fn default_keep_recent_tokens() -> usize {
    20_000
}
fn default_reserve_tokens() -> usize {
    16_384
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keep_recent_tokens: default_keep_recent_tokens(),
            reserve_tokens: default_reserve_tokens(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
