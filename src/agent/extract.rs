//! Fenced code extraction from model replies

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref PYTHON_FENCE: Regex =
        Regex::new(r"```python([\s\S]*?)```").expect("failed to compile code fence pattern");
}

/// Concatenate every ```` ```python ```` block in `reply`, in order, joined by a
/// blank line.
///
/// An unterminated fence never matches, so a reply that is still streaming
/// yields an empty string until its first block closes.
pub fn extract_code(reply: &str) -> String {
    PYTHON_FENCE
        .captures_iter(reply)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Whether `reply` already contains at least one complete python block
pub fn has_code(reply: &str) -> bool {
    PYTHON_FENCE.is_match(reply)
}
