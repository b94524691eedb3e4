//! # Structured Output Decoding
//!
//! Models wrap JSON in markdown fences or prose. Every caller goes through
//! [`decode_structured`] and, when it wants a default instead of an error,
//! [`or_fallback`].

use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("model reply was empty")]
    Empty,

    #[error("no JSON object or array in model reply")]
    NoJson,

    #[error("model reply did not match the expected shape: {0}")]
    Shape(#[from] serde_json::Error),
}

/// Strip fences, locate the outermost JSON value and deserialize it
pub fn decode_structured<T: DeserializeOwned>(raw: &str) -> Result<T, DecodeError> {
    let text = strip_fences(raw.trim());
    if text.is_empty() {
        return Err(DecodeError::Empty);
    }
    let json = outermost_json(text).ok_or(DecodeError::NoJson)?;
    Ok(serde_json::from_str(json)?)
}

/// Shared fallback policy: log the decode failure and substitute `fallback`
pub fn or_fallback<T>(result: Result<T, DecodeError>, caller: &str, fallback: impl FnOnce() -> T) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(caller = %caller, error = %e, "Structured decode failed, using fallback");
            fallback()
        }
    }
}

fn strip_fences(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text;
    };
    let after = &text[open + 3..];
    // Skip the info string ("json", "JSON", ...) up to the first newline
    let body = match after.find('\n') {
        Some(nl) if !after[..nl].contains('{') && !after[..nl].contains('[') => &after[nl + 1..],
        _ => after,
    };
    match body.find("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

fn outermost_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let close = if text.as_bytes()[start] == b'{' { '}' } else { ']' };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}
