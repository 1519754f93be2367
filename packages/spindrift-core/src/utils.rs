//! General utilities shared across the application.

use std::time::{SystemTime, UNIX_EPOCH};

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Used for event timestamps only; scheduling always goes through the
/// monotonic [`crate::clock::Clock`]. Returns 0 if the system clock is
/// before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Endpoint Name Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum endpoint name length.
pub const MAX_NAME_LEN: usize = 64;

/// Characters forbidden in endpoint names (filesystem/URL safety).
pub const FORBIDDEN_NAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Why an endpoint name was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameValidationError {
    /// Name was empty or whitespace-only.
    Empty,
    /// Name exceeded [`MAX_NAME_LEN`] characters.
    TooLong(usize),
    /// Name contained a forbidden character.
    ForbiddenChar(char),
}

impl std::fmt::Display for NameValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "name must not be empty"),
            Self::TooLong(len) => {
                write!(f, "name is {len} characters, maximum is {MAX_NAME_LEN}")
            }
            Self::ForbiddenChar(c) => write!(f, "name contains forbidden character '{c}'"),
        }
    }
}

impl std::error::Error for NameValidationError {}

/// Validates an endpoint name.
///
/// Names are used as YAML keys, URL path segments, and log identifiers, so
/// path separators and shell-hostile characters are rejected outright.
///
/// # Errors
///
/// [`NameValidationError`] describing the first violation found.
pub fn validate_player_name(name: &str) -> Result<(), NameValidationError> {
    if name.trim().is_empty() {
        return Err(NameValidationError::Empty);
    }
    let len = name.chars().count();
    if len > MAX_NAME_LEN {
        return Err(NameValidationError::TooLong(len));
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN_NAME_CHARS.contains(c)) {
        return Err(NameValidationError::ForbiddenChar(c));
    }
    Ok(())
}
