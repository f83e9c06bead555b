// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use rand::Rng;

/// Crockford base32 alphabet (no I, L, O, U).
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Generate a 26-character ULID-shaped identifier: a 10-character encoding
/// of the millisecond epoch followed by 16 random characters. The time
/// prefix makes IDs sort roughly by creation order, which keeps the session
/// directory listing readable.
pub fn generate_id() -> String {
    let ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let mut out = Vec::with_capacity(26);

    for i in (0..10).rev() {
        let idx = ((ms >> (5 * i)) & 0x1f) as usize;
        out.push(ALPHABET[idx]);
    }
    let mut rng = rand::thread_rng();
    for _ in 0..16 {
        out.push(ALPHABET[rng.gen_range(0..32)]);
    }
    // The alphabet is pure ASCII.
    String::from_utf8(out).unwrap_or_default()
}

/// Validate the 26-character Crockford-base32 shape (case-sensitive upper).
pub fn is_valid_id(s: &str) -> bool {
    s.len() == 26 && s.bytes().all(|b| ALPHABET.contains(&b))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
