// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod logger;
mod redact;
mod rotate;

pub use logger::{Level, Logger};
pub use redact::redact;
pub use rotate::RotatingFile;

/// Initialise stdout tracing for the process.
///
/// The JSON agent log ([`Logger`]) is separate: tracing is developer
/// diagnostics, the agent log is the operational record.
pub fn init_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("nils={level},warn")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
