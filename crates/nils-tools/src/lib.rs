// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
mod cli_tools;
mod executor;
mod registry;
mod schema;
mod tool;

pub use cli_tools::{load_cli_tools, CliParamSpec, CliToolSpec, CliToolsDoc};
pub use executor::{execute_tool, ExecLimits, ExecOutcome};
pub use registry::ToolRegistry;
pub use schema::{validate_args, ValidationError};
pub use tool::{Tool, ToolCategory, ToolContext};
