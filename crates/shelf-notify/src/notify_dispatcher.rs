//! Transition-deduplicated delivery over a pluggable sink.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use shelf_requests::{RequestRecord, Requester, RequestStatus};

use crate::notify_payload::{AdminSurfaceUpdate, DirectMessagePayload};

pub const DELIVERY_STATUS_DELIVERED: &str = "delivered";
pub const DELIVERY_STATUS_FAILED: &str = "failed";
pub const DELIVERY_STATUS_DUPLICATE: &str = "duplicate";

const REASON_DIRECT_DELIVERY_FAILED: &str = "direct_delivery_failed";
const REASON_ADMIN_DELIVERY_FAILED: &str = "admin_delivery_failed";
const REASON_TRANSITION_ALREADY_NOTIFIED: &str = "transition_already_notified";

const ADMIN_SURFACE_RECIPIENT: &str = "admin-surface";

/// Transport seam implemented by the chat-platform layer.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver_direct(&self, payload: &DirectMessagePayload) -> Result<()>;
    async fn post_admin_update(&self, update: &AdminSurfaceUpdate) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
/// Public struct `NotifyDispatcherConfig` used across Shelfkeeper components.
pub struct NotifyDispatcherConfig {
    /// Above this many fulfilled entries for one requester, a scan burst
    /// collapses into a single summary message.
    pub batch_summary_threshold: usize,
}

impl Default for NotifyDispatcherConfig {
    fn default() -> Self {
        Self {
            batch_summary_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of one delivery attempt.
pub struct NotifyDeliveryReceipt {
    pub recipient: String,
    pub status: String,
    pub reason_code: Option<String>,
}

impl NotifyDeliveryReceipt {
    fn delivered(recipient: &str) -> Self {
        Self {
            recipient: recipient.to_string(),
            status: DELIVERY_STATUS_DELIVERED.to_string(),
            reason_code: None,
        }
    }

    fn failed(recipient: &str, reason_code: &str) -> Self {
        Self {
            recipient: recipient.to_string(),
            status: DELIVERY_STATUS_FAILED.to_string(),
            reason_code: Some(reason_code.to_string()),
        }
    }

    fn duplicate(recipient: &str) -> Self {
        Self {
            recipient: recipient.to_string(),
            status: DELIVERY_STATUS_DUPLICATE.to_string(),
            reason_code: Some(REASON_TRANSITION_ALREADY_NOTIFIED.to_string()),
        }
    }
}

/// Delivers acknowledgments and transition notifications at least once,
/// deduplicated per `(request, terminal status)` token.
pub struct NotificationDispatcher {
    sink: std::sync::Arc<dyn NotificationSink>,
    config: NotifyDispatcherConfig,
    delivered_tokens: Mutex<HashSet<String>>,
}

impl NotificationDispatcher {
    pub fn new(sink: std::sync::Arc<dyn NotificationSink>, config: NotifyDispatcherConfig) -> Self {
        Self {
            sink,
            config,
            delivered_tokens: Mutex::new(HashSet::new()),
        }
    }

    /// Private acknowledgment to the submitting (or joining) requester.
    pub async fn notify_submission_ack(
        &self,
        record: &RequestRecord,
        requester: &Requester,
        joined: bool,
    ) -> NotifyDeliveryReceipt {
        let body = if joined {
            format!(
                "You were added to the existing request for '{}' on {}; you will be notified together with the other requesters when it is resolved.",
                record.title, record.platform
            )
        } else {
            format!(
                "Your request for '{}' on {} was submitted and is now pending.",
                record.title, record.platform
            )
        };
        let payload = DirectMessagePayload {
            recipient: requester.user_id.clone(),
            title: format!("Request #{}", record.id),
            body,
            request_id: Some(record.id),
        };
        self.deliver(&payload).await
    }

    /// Notifies every attached requester plus the admin surface about a
    /// terminal transition. Exactly one burst goes out per transition; a
    /// second call for the same `(request, status)` yields duplicate
    /// receipts and delivers nothing.
    pub async fn notify_transition(
        &self,
        record: &RequestRecord,
        note: Option<&str>,
    ) -> Vec<NotifyDeliveryReceipt> {
        if !self.claim_transition(record.id, record.status) {
            debug!(
                request_id = record.id,
                status = record.status.as_str(),
                "transition already notified; suppressing burst"
            );
            return record
                .requesters
                .iter()
                .map(|requester| NotifyDeliveryReceipt::duplicate(&requester.user_id))
                .collect();
        }

        let mut receipts = Vec::new();
        for requester in &record.requesters {
            let payload = DirectMessagePayload {
                recipient: requester.user_id.clone(),
                title: format!("Request #{}", record.id),
                body: transition_body(record, note),
                request_id: Some(record.id),
            };
            receipts.push(self.deliver(&payload).await);
        }

        let update = AdminSurfaceUpdate {
            request_id: Some(record.id),
            status: record.status.as_str().to_string(),
            summary: format!(
                "Request #{} ('{}' on {}) is now {}.",
                record.id, record.title, record.platform, record.status
            ),
        };
        receipts.push(self.post_admin(&update).await);
        receipts
    }

    /// One grouped burst for a scan fulfillment batch: each requester gets
    /// a single message covering all of their fulfilled requests, collapsed
    /// into a summary above the configured threshold, plus one admin-surface
    /// update for the whole batch.
    pub async fn notify_scan_batch(
        &self,
        platform: &str,
        records: &[RequestRecord],
    ) -> Vec<NotifyDeliveryReceipt> {
        let mut receipts = Vec::new();
        let mut per_requester: BTreeMap<String, Vec<&RequestRecord>> = BTreeMap::new();
        let mut claimed = 0_usize;

        for record in records {
            if !self.claim_transition(record.id, record.status) {
                for requester in &record.requesters {
                    receipts.push(NotifyDeliveryReceipt::duplicate(&requester.user_id));
                }
                continue;
            }
            claimed += 1;
            for requester in &record.requesters {
                per_requester
                    .entry(requester.user_id.clone())
                    .or_default()
                    .push(record);
            }
        }
        if claimed == 0 {
            return receipts;
        }

        for (user_id, fulfilled) in &per_requester {
            let body = scan_batch_body(fulfilled, self.config.batch_summary_threshold);
            let payload = DirectMessagePayload {
                recipient: user_id.clone(),
                title: "Requests fulfilled".to_string(),
                body,
                request_id: if fulfilled.len() == 1 {
                    Some(fulfilled[0].id)
                } else {
                    None
                },
            };
            receipts.push(self.deliver(&payload).await);
        }

        let update = AdminSurfaceUpdate {
            request_id: None,
            status: RequestStatus::Fulfilled.as_str().to_string(),
            summary: format!(
                "Library scan on {platform} auto-fulfilled {claimed} request(s)."
            ),
        };
        receipts.push(self.post_admin(&update).await);
        receipts
    }

    /// Returns true when a transition burst for this id/status has already
    /// gone out.
    pub fn transition_already_notified(&self, request_id: i64, status: RequestStatus) -> bool {
        self.lock_tokens()
            .contains(&transition_token(request_id, status))
    }

    fn claim_transition(&self, request_id: i64, status: RequestStatus) -> bool {
        self.lock_tokens().insert(transition_token(request_id, status))
    }

    async fn deliver(&self, payload: &DirectMessagePayload) -> NotifyDeliveryReceipt {
        match self.sink.deliver_direct(payload).await {
            Ok(()) => NotifyDeliveryReceipt::delivered(&payload.recipient),
            Err(error) => {
                warn!(
                    recipient = payload.recipient.as_str(),
                    request_id = payload.request_id,
                    %error,
                    "direct notification delivery failed"
                );
                NotifyDeliveryReceipt::failed(&payload.recipient, REASON_DIRECT_DELIVERY_FAILED)
            }
        }
    }

    async fn post_admin(&self, update: &AdminSurfaceUpdate) -> NotifyDeliveryReceipt {
        match self.sink.post_admin_update(update).await {
            Ok(()) => NotifyDeliveryReceipt::delivered(ADMIN_SURFACE_RECIPIENT),
            Err(error) => {
                warn!(
                    request_id = update.request_id,
                    status = update.status.as_str(),
                    %error,
                    "admin surface update failed"
                );
                NotifyDeliveryReceipt::failed(ADMIN_SURFACE_RECIPIENT, REASON_ADMIN_DELIVERY_FAILED)
            }
        }
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        match self.delivered_tokens.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn transition_token(request_id: i64, status: RequestStatus) -> String {
    format!("transition:{request_id}:{}", status.as_str())
}

fn transition_body(record: &RequestRecord, note: Option<&str>) -> String {
    let mut body = match record.status {
        RequestStatus::Fulfilled => {
            format!("Your request for '{}' has been fulfilled!", record.title)
        }
        RequestStatus::Rejected => {
            format!("Your request for '{}' has been rejected.", record.title)
        }
        RequestStatus::Cancelled => {
            format!("The request for '{}' was cancelled.", record.title)
        }
        RequestStatus::Pending => format!("Your request for '{}' is pending.", record.title),
    };
    if let Some(note) = note.filter(|note| !note.trim().is_empty()) {
        body.push_str(&format!("\nNote: {note}"));
    }
    body
}

fn scan_batch_body(fulfilled: &[&RequestRecord], summary_threshold: usize) -> String {
    match fulfilled {
        [single] => format!(
            "Good news! Your request for '{}' has been automatically fulfilled by a library scan.",
            single.title
        ),
        many if many.len() <= summary_threshold => {
            let list = many
                .iter()
                .map(|record| format!("• {}", record.title))
                .collect::<Vec<_>>()
                .join("\n");
            format!("Good news! Several of your requests were fulfilled by a library scan:\n{list}")
        }
        many => format!(
            "Good news! {} of your requests were fulfilled by the latest library scan.",
            many.len()
        ),
    }
}
