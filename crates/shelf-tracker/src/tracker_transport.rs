//! Transport classification and backoff helpers for tracker calls.

use thiserror::Error;

/// Non-success HTTP status from the tracker, kept typed so failure
/// handling can tell an outage from a terminal rejection.
#[derive(Debug, Error)]
#[error("tracker returned {status} for {detail}")]
pub struct TrackerStatusError {
    pub status: u16,
    pub detail: String,
}

/// Application-level rejection decoded from a tracker response envelope.
/// Repeating the same payload cannot succeed.
#[derive(Debug, Error)]
#[error("tracker rejected {operation}: {detail}")]
pub struct TrackerRejection {
    pub operation: &'static str,
    pub detail: String,
}

/// Statuses worth retrying on a later pass. Auth failures are not listed:
/// the client handles those with a single re-authentication attempt.
pub fn is_retryable_tracker_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..=599).contains(&status)
}

/// Connection-level failures (timeouts, refused connections) are retryable;
/// anything that produced a decoded response is not.
pub fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() && error.status().is_none()
}

/// Whether a failed tracker call is worth queueing for another attempt.
/// Unrecognized errors default to retryable; only a decoded terminal
/// status or an envelope rejection is dropped.
pub fn is_retryable_tracker_error(error: &anyhow::Error) -> bool {
    if let Some(status_error) = error.downcast_ref::<TrackerStatusError>() {
        return is_retryable_tracker_status(status_error.status);
    }
    if error.downcast_ref::<TrackerRejection>().is_some() {
        return false;
    }
    if let Some(transport_error) = error.downcast_ref::<reqwest::Error>() {
        return is_retryable_transport_error(transport_error);
    }
    true
}

/// Exponential backoff delay for the given zero-based attempt, capped at
/// five doublings so the schedule stays bounded.
pub fn retry_delay_ms(base_delay_ms: u64, attempt: u32) -> u64 {
    let exponent = attempt.min(5);
    base_delay_ms.max(1).saturating_mul(1_u64 << exponent)
}

/// Truncates response bodies before they land in error messages or logs.
pub fn truncate_for_error(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let truncated: String = body.chars().take(max_chars).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        for status in [408, 429, 500, 502, 503, 599] {
            assert!(is_retryable_tracker_status(status), "status {status}");
        }
        for status in [200, 201, 400, 401, 403, 404] {
            assert!(!is_retryable_tracker_status(status), "status {status}");
        }
    }

    #[test]
    fn typed_errors_classify_through_anyhow() {
        let outage = anyhow::Error::new(TrackerStatusError {
            status: 503,
            detail: "/request".to_string(),
        });
        assert!(is_retryable_tracker_error(&outage));

        let bad_payload = anyhow::Error::new(TrackerStatusError {
            status: 400,
            detail: "/request".to_string(),
        });
        assert!(!is_retryable_tracker_error(&bad_payload));

        let rejection = anyhow::Error::new(TrackerRejection {
            operation: "request creation",
            detail: "unknown platform".to_string(),
        })
        .context("push failed");
        assert!(!is_retryable_tracker_error(&rejection));

        let unknown = anyhow::anyhow!("connection reset mid-read");
        assert!(is_retryable_tracker_error(&unknown));
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        assert_eq!(retry_delay_ms(500, 0), 500);
        assert_eq!(retry_delay_ms(500, 1), 1_000);
        assert_eq!(retry_delay_ms(500, 3), 4_000);
        assert_eq!(retry_delay_ms(500, 5), 16_000);
        assert_eq!(retry_delay_ms(500, 12), 16_000);
        assert_eq!(retry_delay_ms(0, 4), 16);
    }

    #[test]
    fn truncation_marks_elided_content() {
        assert_eq!(truncate_for_error("short", 10), "short");
        assert_eq!(truncate_for_error("abcdefghij", 4), "abcd…");
    }
}
