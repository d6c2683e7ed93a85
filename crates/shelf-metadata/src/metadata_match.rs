//! Pure confidence gate over provider search results.

use serde::{Deserialize, Serialize};
use shelf_core::normalize_title;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One candidate from a provider search.
pub struct MetadataCandidate {
    pub provider_id: u64,
    pub name: String,
    #[serde(default)]
    pub alternative_names: Vec<String>,
    #[serde(default)]
    pub cover_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A confident provider match for a request.
pub struct MetadataMatch {
    pub provider_id: u64,
    pub canonical_title: String,
    #[serde(default)]
    pub cover_url: Option<String>,
}

/// Accepts a candidate only when its canonical title or one of its
/// alternative names equals the query after normalization. Candidates are
/// scanned in provider ranking order; the first confident one wins.
pub fn choose_confident_match(
    query: &str,
    candidates: &[MetadataCandidate],
) -> Option<MetadataMatch> {
    let normalized_query = normalize_title(query);
    if normalized_query.is_empty() {
        return None;
    }
    candidates
        .iter()
        .find(|candidate| {
            normalize_title(&candidate.name) == normalized_query
                || candidate
                    .alternative_names
                    .iter()
                    .any(|name| normalize_title(name) == normalized_query)
        })
        .map(|candidate| MetadataMatch {
            provider_id: candidate.provider_id,
            canonical_title: candidate.name.clone(),
            cover_url: candidate.cover_url.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(provider_id: u64, name: &str, alternatives: &[&str]) -> MetadataCandidate {
        MetadataCandidate {
            provider_id,
            name: name.to_string(),
            alternative_names: alternatives.iter().map(|name| name.to_string()).collect(),
            cover_url: None,
        }
    }

    #[test]
    fn exact_normalized_title_is_accepted() {
        let candidates = vec![candidate(10, "Chrono Trigger", &[])];
        let chosen = choose_confident_match("  chrono   TRIGGER ", &candidates).expect("match");
        assert_eq!(chosen.provider_id, 10);
        assert_eq!(chosen.canonical_title, "Chrono Trigger");
    }

    #[test]
    fn alternative_name_is_accepted() {
        let candidates = vec![candidate(11, "Mother 2", &["EarthBound"])];
        let chosen = choose_confident_match("earthbound", &candidates).expect("match");
        assert_eq!(chosen.provider_id, 11);
        assert_eq!(chosen.canonical_title, "Mother 2");
    }

    #[test]
    fn near_misses_are_rejected_rather_than_guessed() {
        let candidates = vec![
            candidate(12, "Chrono Cross", &[]),
            candidate(13, "Chrono Trigger DS", &[]),
        ];
        assert!(choose_confident_match("Chrono Trigger", &candidates).is_none());
    }

    #[test]
    fn ranking_order_breaks_ties() {
        let candidates = vec![
            candidate(20, "Tetris", &[]),
            candidate(21, "Tetris", &[]),
        ];
        let chosen = choose_confident_match("tetris", &candidates).expect("match");
        assert_eq!(chosen.provider_id, 20);
    }

    #[test]
    fn empty_query_matches_nothing() {
        let candidates = vec![candidate(30, "", &[])];
        assert!(choose_confident_match("   ", &candidates).is_none());
    }
}
