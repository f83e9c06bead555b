// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Single-tenant AI-agent runtime: chat sessions, tools, and cron jobs.
#[derive(Debug, Parser)]
#[command(name = "nils", version, about)]
pub struct Cli {
    /// Agent root directory (default: ~/.nils, or NILS_ROOT)
    #[arg(long, global = true, env = "NILS_ROOT")]
    pub root: Option<PathBuf>,

    /// Console log level for diagnostics (debug|info|warn|error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the gateway server and run until interrupted
    Serve,
    /// Session store maintenance
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum SessionCommands {
    /// List sessions, most recently active first
    List,
    /// Delete a session and its log
    Delete { id: String },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
