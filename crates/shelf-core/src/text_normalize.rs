//! Title normalization used for dedup keys and metadata confidence checks.
//!
//! Normalization is intentionally conservative: case-fold, trim, and collapse
//! internal whitespace. No fuzzy matching happens at this layer; stricter
//! matchers plug in above it.

/// Normalizes a media title for comparison: lowercased, trimmed, internal
/// whitespace collapsed to single spaces.
pub fn normalize_title(raw: &str) -> String {
    raw.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}
