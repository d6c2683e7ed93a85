//! Scan-driven auto-fulfillment.
//!
//! A completed library scan reports the items it added; every open request
//! matching one of them is fulfilled with `Scan` as the source. Each
//! request is handled in isolation so one failure never abandons the rest
//! of the batch, and a `Conflict` from the store just means another
//! authority resolved the request first.

use tracing::{debug, info, warn};

use shelf_core::current_unix_timestamp_ms;
use shelf_requests::{AdminNote, FulfillmentSource, RequestResult, RequestStatus};

use crate::request_engine::RequestEngine;

const SCAN_NOTE_AUTHOR: &str = "library-scan";

#[derive(Debug, Clone)]
/// One item a scan added to the library.
pub struct ScanItem {
    pub title: String,
    pub catalog_ref: Option<String>,
}

#[derive(Debug, Clone)]
/// A completed-scan event from the library server.
pub struct ScanCompleted {
    pub platform: String,
    pub new_items: Vec<ScanItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// What one scan event did to the open request queue.
pub struct ScanFulfillmentReport {
    pub matched: usize,
    pub fulfilled: Vec<i64>,
    pub already_resolved: Vec<i64>,
    pub failed: Vec<i64>,
}

impl RequestEngine {
    /// Fulfills every open request on the scanned platform whose title
    /// matches a newly added item. Notifications for the whole batch go
    /// out as one grouped burst per requester.
    pub async fn handle_scan_completed(
        &self,
        scan: ScanCompleted,
    ) -> RequestResult<ScanFulfillmentReport> {
        let mut report = ScanFulfillmentReport::default();
        if scan.new_items.is_empty() {
            return Ok(report);
        }

        let pending = self.store.list_pending(Some(&scan.platform))?;
        let mut fulfilled_records = Vec::new();

        for record in pending {
            let matched_item = scan
                .new_items
                .iter()
                .find(|item| self.matcher.matches(&item.title, &record.title));
            let Some(item) = matched_item else {
                continue;
            };
            report.matched += 1;

            let note = AdminNote {
                author: SCAN_NOTE_AUTHOR.to_string(),
                body: format!(
                    "Automatically fulfilled by library scan; catalogued as '{}'.",
                    item.title
                ),
                created_unix_ms: current_unix_timestamp_ms(),
            };
            match self.store.transition(
                record.id,
                RequestStatus::Fulfilled,
                Some(FulfillmentSource::Scan),
                Some(note),
            ) {
                Ok(updated) => {
                    report.fulfilled.push(updated.id);
                    fulfilled_records.push(updated);
                }
                Err(error) if error.is_conflict() => {
                    // Lost the race to an admin or the sync loop.
                    debug!(
                        request_id = record.id,
                        "scan fulfillment skipped; request already resolved"
                    );
                    report.already_resolved.push(record.id);
                }
                Err(error) => {
                    warn!(request_id = record.id, %error, "scan fulfillment failed");
                    report.failed.push(record.id);
                }
            }
        }

        if fulfilled_records.is_empty() {
            return Ok(report);
        }
        for record in &fulfilled_records {
            self.record_cache_invalidate(record.id);
        }
        self.dispatcher
            .notify_scan_batch(&scan.platform, &fulfilled_records)
            .await;

        if let Some(bridge) = &self.tracker {
            for record in &fulfilled_records {
                let queued = bridge.lock_sync().enqueue_status_update(
                    record.id,
                    record.status.as_str(),
                    None,
                );
                match queued {
                    Ok(()) => self.flush_outbound_for(record.id).await,
                    Err(error) => {
                        warn!(request_id = record.id, %error, "failed to queue tracker status push");
                    }
                }
            }
        }

        info!(
            platform = scan.platform.as_str(),
            fulfilled = report.fulfilled.len(),
            already_resolved = report.already_resolved.len(),
            failed = report.failed.len(),
            "library scan processed"
        );
        Ok(report)
    }
}
