// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod frames;
mod hub;
mod identity;
mod prompt;
mod rest;
mod run;
mod summarize;
mod supervisor;
mod watcher;
mod ws;

pub use frames::{ClientFrame, ServerFrame};
pub use hub::WsHub;
pub use prompt::PreparedSystemPrompt;
pub use supervisor::{build_router, Supervisor};
pub use watcher::spawn_watcher;
