//! Notification payloads and the at-least-once dispatcher.
//!
//! Delivery is decoupled from transport: the engine hands fully shaped
//! payloads to a `NotificationSink` implemented by the chat-platform
//! layer. The dispatcher owns transition-level idempotency and scan-batch
//! collapsing; delivery failures surface as receipts and log lines, never
//! as operation errors, because state changes are authoritative regardless
//! of notification success.

pub mod notify_dispatcher;
pub mod notify_payload;

pub use notify_dispatcher::{
    NotificationDispatcher, NotificationSink, NotifyDeliveryReceipt, NotifyDispatcherConfig,
};
pub use notify_payload::{AdminSurfaceUpdate, DirectMessagePayload};
