// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Identifier validation shared by every persisted entity.
//!
//! Session, terminal, attempt, and resume-token identifiers all use the same
//! alphabet. Validation happens before any filesystem access so a hostile
//! identifier can never name a path outside the base directory.

use std::sync::OnceLock;

use regex::Regex;

/// Allowed identifier shape for sessions, terminals, attempts, and tokens.
pub const ID_PATTERN: &str = "^[A-Za-z0-9_-]{1,64}$";

fn id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // pattern is a compile-time constant
        Regex::new(ID_PATTERN).unwrap()
    })
}

/// Whether `id` matches the identifier alphabet.
pub fn is_valid(id: &str) -> bool {
    id_regex().is_match(id)
}

/// Validate an identifier, returning it on success.
///
/// The error carries the offending identifier so storage-layer callers can
/// surface it without touching the filesystem.
pub fn validate(id: &str) -> Result<&str, InvalidId> {
    if is_valid(id) {
        Ok(id)
    } else {
        Err(InvalidId { id: id.to_owned() })
    }
}

/// An identifier that failed the `[A-Za-z0-9_-]{1,64}` check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identifier: {id:?}")]
pub struct InvalidId {
    pub id: String,
}

/// Generate a fresh random identifier (uuid v4, hyphenated — 36 chars,
/// well inside the 64-char limit).
pub fn generate() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
#[path = "id_tests.rs"]
mod tests;
