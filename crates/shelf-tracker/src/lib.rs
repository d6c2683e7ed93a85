//! External request-tracker adapter: HTTP client, transport retry helpers,
//! and the persisted outbound sync queue.
//!
//! The tracker is optional and eventually consistent. Outbound pushes are
//! queued with bounded retries and never block a local operation; inbound
//! status is read by the engine's reconciliation pass through the client's
//! fetch API.

pub mod tracker_client;
pub mod tracker_sync_state;
pub mod tracker_transport;

pub use tracker_client::{
    RemoteStatusFetch, RemoteTrackerStatus, TrackerClient, TrackerClientConfig,
    TrackerCreateRequest,
};
pub use tracker_sync_state::{
    OutboundSyncEntry, OutboundSyncKind, TrackerRetryPolicy, TrackerSyncStateStore,
};
pub use tracker_transport::{
    is_retryable_tracker_error, is_retryable_tracker_status, is_retryable_transport_error,
    retry_delay_ms, truncate_for_error, TrackerRejection, TrackerStatusError,
};
