//! Request records, lifecycle state machine, and the durable request store.
//!
//! This crate owns the central `RequestRecord` entity: the closed status
//! enum and its transition table, the typed error taxonomy surfaced to
//! callers, the SQLite-backed store that is the sole writer of request
//! state, the pluggable title matcher used for dedup, and a cache-aside
//! TTL layer over individual records.

pub mod request_cache;
pub mod request_error;
pub mod request_record;
pub mod request_store;
pub mod request_transitions;
pub mod title_matcher;

pub use request_cache::{RequestRecordCache, RequestRecordCacheConfig};
pub use request_error::{RequestError, RequestResult};
pub use request_record::{
    AdminNote, FulfillmentSource, NewRequest, Requester, RequestMetadata, RequestRecord,
    RequestStatus,
};
pub use request_store::{InsertOutcome, RequestStore};
pub use request_transitions::transition_allowed;
pub use title_matcher::{NormalizedTitleMatcher, TitleMatcher};
