//! Token cost estimation.

/// Count of whitespace-delimited words in `text`.
///
/// Used for both prompt and response costs. Unicode whitespace is the
/// delimiter; there is no locale-dependent behavior.
pub fn estimate_tokens(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}
