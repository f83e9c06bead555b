// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod anthropic;
mod auth;
mod mock;
mod provider;
mod types;

pub use anthropic::AnthropicFactory;
pub use auth::{get_oauth_api_key, Credential, CredentialStore};
pub use mock::{EchoFactory, ScriptedFactory};
pub use provider::{
    EventStream, ProviderError, StreamEvent, StreamFactory, StreamOptions, StreamRequest,
};
pub use types::{ContentBlock, Message, StopReason, ToolSchema, Usage};
