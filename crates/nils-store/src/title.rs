// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Default name given to new sessions; title generation only ever replaces
/// this value.
pub const DEFAULT_SESSION_NAME: &str = "New Session";

/// Build the title-generation prompt.
///
/// The separators are literal backslash-n sequences, not newlines — kept
/// exactly as the original template wrote them.
pub fn title_prompt(user_text: &str, assistant_text: &str) -> String {
    format!(
        "Generate a concise title (at most 6 words) for this conversation.\\n\
         User: {user_text}\\nAssistant: {assistant_text}\\n\
         Respond with the title only, no quotes."
    )
}

/// Normalize a generated title: single line, surrounding quotes stripped,
/// at most six words. Returns `None` when nothing usable remains.
pub fn normalize_title(raw: &str) -> Option<String> {
    let first_line = raw.lines().next().unwrap_or("").trim();
    let unquoted = first_line.trim_matches(|c| c == '"' || c == '\'').trim();
    if unquoted.is_empty() {
        return None;
    }
    let title = unquoted
        .split_whitespace()
        .take(6)
        .collect::<Vec<_>>()
        .join(" ");
    Some(title)
}

/// Fallback title: a 60-char prefix of the user's first message.
pub fn title_fallback(user_text: &str) -> String {
    let one_line = user_text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if one_line.chars().count() <= 60 {
        if one_line.is_empty() {
            return DEFAULT_SESSION_NAME.to_string();
        }
        return one_line;
    }
    let prefix: String = one_line.chars().take(60).collect();
    format!("{prefix}...")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
