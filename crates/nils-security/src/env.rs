// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

/// Build the environment for a tool subprocess.
///
/// Only `allowed_keys` are copied from the parent process; everything else
/// is dropped so stray credentials in the server's environment never leak
/// into a child. Tool-specific `overrides` are applied on top and win over
/// inherited values.
pub fn build_tool_env(
    allowed_keys: &[String],
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for key in allowed_keys {
        if let Ok(value) = std::env::var(key) {
            env.insert(key.clone(), value);
        }
    }
    for (key, value) in overrides {
        env.insert(key.clone(), value.clone());
    }
    env
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
