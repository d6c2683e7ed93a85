//! The request engine: public operations, scan fulfillment, and tracker
//! reconciliation composed over the component crates.
//!
//! The engine is the single orchestrator of request state. It owns the
//! submission pipeline (validate, dedup, enrich, persist, push, notify),
//! enforces the lifecycle state machine through the store, listens for
//! library-scan completions, and runs the bounded bidirectional sync with
//! the optional external tracker.

pub mod engine_adapters;
pub mod engine_ports;
pub mod request_engine;
pub mod scan_listener;
pub mod tracker_sync_runtime;

pub use engine_ports::{CatalogItem, CatalogPlatform, LibraryCatalog, MetadataProvider, TrackerPort};
pub use request_engine::{RequestEngine, RequestEngineConfig, SubmitOutcome, SubmitRequest};
pub use scan_listener::{ScanCompleted, ScanFulfillmentReport, ScanItem};
pub use tracker_sync_runtime::{
    spawn_tracker_sync_loop, ReconcileReport, TrackerSyncHandle, TrackerSyncRuntimeConfig,
};
