// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Load configuration from an explicit file, falling back to defaults when
/// the file does not exist.
///
/// A file that exists but fails to parse is an error — silently running with
/// defaults after a typo'd edit would be far worse than refusing to start.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.is_file() {
        debug!(path = %path.display(), "no config file; using defaults");
        return Ok(Config::default());
    }
    debug!(path = %path.display(), "loading config");
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
