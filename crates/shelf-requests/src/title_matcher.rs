//! Pluggable title matching for dedup and scan fulfillment.

use shelf_core::normalize_title;

/// Decides whether a candidate title refers to the same item as a query.
///
/// The engine only depends on this trait, so a stricter matcher (edit
/// distance, alias tables) can be plugged in without changing the engine
/// contract.
pub trait TitleMatcher: Send + Sync {
    fn matches(&self, candidate: &str, query: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
/// Default matcher: exact equality after normalization.
pub struct NormalizedTitleMatcher;

impl TitleMatcher for NormalizedTitleMatcher {
    fn matches(&self, candidate: &str, query: &str) -> bool {
        let normalized = normalize_title(query);
        !normalized.is_empty() && normalize_title(candidate) == normalized
    }
}
