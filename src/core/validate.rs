//! Strict-mode submission checks: function policy, function form and
//! argument transport safety.
//!
//! The pattern scan is a defence-in-depth hint, not a sandbox; isolation is
//! the worker runtime's job. It will both over- and under-reject, which is
//! the accepted trade-off for a synchronous submission-time check.

use serde::Serialize;
use serde_json::Value;

use crate::core::error::PoolError;

/// Case-insensitive substrings rejected in submitted function text.
const DENIED_PATTERNS: &[&str] = &[
    // dynamic module loading
    "import(",
    "require(",
    // dynamic code construction
    "new function",
    "eval(",
    // process and global-object access
    "process.",
    "globalthis",
    "global.",
    // source-path globals
    "__dirname",
    "__filename",
    // subprocess and filesystem modules
    "child_process",
    "fs.",
];

/// Submission-time validator; a no-op when strict mode is off.
pub(crate) struct InputValidator {
    strict: bool,
}

impl InputValidator {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Check the function text against the deny-list and the supported
    /// function forms.
    pub fn check_function(&self, source: &str) -> Result<(), PoolError> {
        if !self.strict {
            return Ok(());
        }
        let lowered = source.to_lowercase();
        for pattern in DENIED_PATTERNS {
            if lowered.contains(pattern) {
                return Err(PoolError::Validation(format!(
                    "function text contains disallowed pattern `{pattern}`"
                )));
            }
        }
        if !is_supported_form(source) {
            return Err(PoolError::Validation(
                "function must be an arrow or a `function` form".into(),
            ));
        }
        Ok(())
    }

    /// Encode one argument into its transport value.
    ///
    /// Encoding is what enforces the argument-shape rule: only values that
    /// reduce to scalars, sequences and string-keyed maps survive the trip
    /// into a [`Value`]. Runs regardless of strict mode because the request
    /// envelope cannot carry anything else.
    pub fn encode_arg<A: Serialize>(index: usize, arg: &A) -> Result<Value, PoolError> {
        serde_json::to_value(arg).map_err(|err| {
            PoolError::Validation(format!("argument {index} is not transport-safe: {err}"))
        })
    }
}

/// Accepts arrow functions and `function` declarations, optionally `async`.
fn is_supported_form(source: &str) -> bool {
    let trimmed = source.trim_start();
    let body = trimmed
        .strip_prefix("async")
        .map_or(trimmed, str::trim_start);
    if body.starts_with("function") {
        return true;
    }
    if body.starts_with('(') {
        return body.contains("=>");
    }
    // Single-parameter arrow without parentheses: `x => ...`
    let ident_len: usize = body
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$'))
        .map(char::len_utf8)
        .sum();
    ident_len > 0 && body[ident_len..].trim_start().starts_with("=>")
}
