//! The request lifecycle transition table.
//!
//! `pending` is the sole initial state; `fulfilled`, `rejected`, and
//! `cancelled` are terminal. Any edge not listed here is invalid and must
//! fail with `RequestError::Conflict`, never silently no-op, so racing
//! callers can detect that another authority resolved the request first.

use crate::request_record::RequestStatus;

/// Returns true when the edge `from -> to` is part of the lifecycle.
pub fn transition_allowed(from: RequestStatus, to: RequestStatus) -> bool {
    matches!(
        (from, to),
        (
            RequestStatus::Pending,
            RequestStatus::Fulfilled | RequestStatus::Rejected | RequestStatus::Cancelled
        )
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use RequestStatus::*;

    const ALL: [RequestStatus; 4] = [Pending, Fulfilled, Rejected, Cancelled];

    #[test]
    fn only_pending_has_outgoing_edges() {
        for from in ALL {
            for to in ALL {
                let allowed = transition_allowed(from, to);
                let expected = from == Pending && to != Pending;
                assert_eq!(allowed, expected, "edge {from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn terminal_states_match_is_terminal() {
        for status in ALL {
            let has_outgoing = ALL.iter().any(|to| transition_allowed(status, *to));
            assert_eq!(status.is_terminal(), !has_outgoing);
        }
    }
}
