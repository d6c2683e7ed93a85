//! Foundational low-level utilities shared across Shelfkeeper crates.
//!
//! Provides unix-time helpers used for request timestamps and cache expiry,
//! atomic text-file writes used by sync-state persistence, and the title
//! normalization applied before any dedup or metadata comparison.

pub mod atomic_io;
pub mod text_normalize;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use text_normalize::normalize_title;
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, is_expired_unix_ms};

#[cfg(test)]
mod tests {
    use std::fs::read_to_string;

    use super::*;

    #[test]
    fn timestamp_units_stay_consistent() {
        let now_s = current_unix_timestamp();
        let now_ms = current_unix_timestamp_ms();
        let now_ms_s = now_ms / 1_000;
        assert!(now_ms_s >= now_s);
        assert!(now_ms_s <= now_s.saturating_add(1));
    }

    #[test]
    fn is_expired_unix_ms_respects_none_and_bounds() {
        let now = current_unix_timestamp_ms();
        assert!(!is_expired_unix_ms(None, now));
        assert!(is_expired_unix_ms(Some(now), now));
        assert!(is_expired_unix_ms(Some(now.saturating_sub(1)), now));
        assert!(!is_expired_unix_ms(Some(now.saturating_add(1)), now));
    }

    #[test]
    fn write_text_atomic_writes_content() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("state.json");
        write_text_atomic(&path, "{\"ok\":true}").expect("write");
        let contents = read_to_string(&path).expect("read");
        assert_eq!(contents, "{\"ok\":true}");
    }

    #[test]
    fn write_text_atomic_replaces_existing_content() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("state.json");
        write_text_atomic(&path, "first").expect("write");
        write_text_atomic(&path, "second").expect("rewrite");
        assert_eq!(read_to_string(&path).expect("read"), "second");
    }

    #[test]
    fn normalize_title_folds_case_and_whitespace() {
        assert_eq!(normalize_title("  Chrono   TRIGGER  "), "chrono trigger");
        assert_eq!(normalize_title("Mother\t3"), "mother 3");
        assert_eq!(normalize_title(""), "");
    }
}
