//! Bidirectional tracker reconciliation and its background loop.
//!
//! Outbound: queued creates and status updates are pushed with bounded
//! retries; the queue entry is the retry ledger. Inbound: pending requests
//! with a usable remote link are polled, remote terminal statuses are
//! applied locally with `Remote` as the source (never echoed back), and a
//! vanished remote record marks the link stale. A request that is already
//! terminal locally ignores later remote updates.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use shelf_core::current_unix_timestamp_ms;
use shelf_requests::{AdminNote, FulfillmentSource, RequestError, RequestResult, RequestStatus};
use shelf_tracker::{
    is_retryable_tracker_error, OutboundSyncEntry, OutboundSyncKind, RemoteStatusFetch,
    RemoteTrackerStatus,
};

use crate::request_engine::{RequestEngine, TrackerBridge};

const REMOTE_NOTE_AUTHOR: &str = "tracker";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// What one reconcile pass accomplished.
pub struct ReconcileReport {
    pub pushed_creates: usize,
    pub pushed_updates: usize,
    pub push_failures: usize,
    pub fetch_failures: usize,
    pub gave_up: usize,
    pub remote_applied: Vec<i64>,
    pub stale_links: Vec<i64>,
}

#[derive(Debug, Clone, Copy)]
/// Public struct `TrackerSyncRuntimeConfig` used across Shelfkeeper components.
pub struct TrackerSyncRuntimeConfig {
    pub interval_ms: u64,
}

impl Default for TrackerSyncRuntimeConfig {
    fn default() -> Self {
        Self {
            interval_ms: 300_000,
        }
    }
}

enum PushOutcome {
    CreatedLink,
    UpdatedStatus,
    AlreadyLinked,
    Discarded,
    InFlight,
    Failed { exhausted: bool },
}

impl RequestEngine {
    /// One full reconcile pass: flush due outbound pushes, then poll every
    /// linked pending request for remote terminal transitions. A no-op
    /// when no tracker is configured.
    pub async fn run_reconcile_once(&self) -> RequestResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let Some(bridge) = &self.tracker else {
            return Ok(report);
        };

        let now_ms = current_unix_timestamp_ms();
        let due = bridge.lock_sync().entries_due(now_ms);
        for (request_id, entry) in due {
            match self.attempt_outbound(bridge, request_id, &entry).await {
                PushOutcome::CreatedLink => report.pushed_creates += 1,
                PushOutcome::UpdatedStatus => report.pushed_updates += 1,
                PushOutcome::AlreadyLinked | PushOutcome::Discarded | PushOutcome::InFlight => {}
                PushOutcome::Failed { exhausted } => {
                    report.push_failures += 1;
                    if exhausted {
                        report.gave_up += 1;
                    }
                }
            }
        }

        self.reconcile_inbound(bridge, &mut report).await?;

        if report != ReconcileReport::default() {
            info!(
                pushed_creates = report.pushed_creates,
                pushed_updates = report.pushed_updates,
                push_failures = report.push_failures,
                fetch_failures = report.fetch_failures,
                remote_applied = report.remote_applied.len(),
                stale_links = report.stale_links.len(),
                "tracker reconcile pass finished"
            );
        }
        Ok(report)
    }

    /// Best-effort inline flush of the queued push for one request, used
    /// right after enqueueing so the common case does not wait for the
    /// next reconcile tick. Failures stay queued for the loop.
    pub(crate) async fn flush_outbound_for(&self, request_id: i64) {
        let Some(bridge) = &self.tracker else {
            return;
        };
        let now_ms = current_unix_timestamp_ms();
        let entry = bridge
            .lock_sync()
            .entries_due(now_ms)
            .into_iter()
            .find(|(id, _)| *id == request_id)
            .map(|(_, entry)| entry);
        if let Some(entry) = entry {
            self.attempt_outbound(bridge, request_id, &entry).await;
        }
    }

    async fn attempt_outbound(
        &self,
        bridge: &TrackerBridge,
        request_id: i64,
        entry: &OutboundSyncEntry,
    ) -> PushOutcome {
        if !bridge.claim(request_id) {
            debug!(request_id, "tracker push already in flight; skipping");
            return PushOutcome::InFlight;
        }
        let outcome = self.push_outbound(bridge, request_id, entry).await;
        bridge.release(request_id);
        outcome
    }

    async fn push_outbound(
        &self,
        bridge: &TrackerBridge,
        request_id: i64,
        entry: &OutboundSyncEntry,
    ) -> PushOutcome {
        let record = match self.store.get(request_id) {
            Ok(record) => record,
            Err(RequestError::NotFound(_)) => {
                warn!(request_id, "queued tracker push references a missing request; dropping");
                self.sync_discard(bridge, request_id);
                return PushOutcome::Discarded;
            }
            Err(error) => {
                warn!(request_id, %error, "failed to load request for tracker push");
                return self.sync_retry_later(bridge, request_id, &error.to_string());
            }
        };

        match entry.kind {
            OutboundSyncKind::Create => {
                if record.external_ref.is_some() {
                    self.sync_success(bridge, request_id);
                    return PushOutcome::AlreadyLinked;
                }
                match bridge.port.push_create(&record).await {
                    Ok(remote_ref) => {
                        match self.store.set_external_ref(request_id, &remote_ref) {
                            Ok(true) => {}
                            Ok(false) => {
                                debug!(request_id, "external ref already set; keeping the first");
                            }
                            Err(error) => {
                                warn!(request_id, %error, "failed to persist external ref");
                                return self.sync_retry_later(bridge, request_id, &error.to_string());
                            }
                        }
                        self.record_cache_invalidate(request_id);
                        self.sync_success(bridge, request_id);
                        PushOutcome::CreatedLink
                    }
                    Err(error) => self.sync_failure(bridge, request_id, &error),
                }
            }
            OutboundSyncKind::StatusUpdate => {
                let Some(status) = entry.status.as_deref().and_then(RequestStatus::parse) else {
                    warn!(request_id, "queued status push carries no usable status; dropping");
                    self.sync_discard(bridge, request_id);
                    return PushOutcome::Discarded;
                };
                let external_ref = record
                    .external_ref
                    .as_deref()
                    .filter(|_| !record.external_ref_stale);
                let Some(external_ref) = external_ref else {
                    // The request was resolved before it was ever pushed, or
                    // its remote record vanished. Nothing to update.
                    debug!(request_id, "queued status push has no remote link; dropping");
                    self.sync_discard(bridge, request_id);
                    return PushOutcome::Discarded;
                };
                match bridge
                    .port
                    .push_status(external_ref, status, entry.note.as_deref())
                    .await
                {
                    Ok(()) => {
                        self.sync_success(bridge, request_id);
                        PushOutcome::UpdatedStatus
                    }
                    Err(error) => self.sync_failure(bridge, request_id, &error),
                }
            }
        }
    }

    async fn reconcile_inbound(
        &self,
        bridge: &TrackerBridge,
        report: &mut ReconcileReport,
    ) -> RequestResult<()> {
        let linked = self.store.list_pending_with_external_ref()?;
        for record in linked {
            let Some(external_ref) = record.external_ref.as_deref() else {
                continue;
            };
            let fetched = match bridge.port.fetch_status(external_ref).await {
                Ok(fetched) => fetched,
                Err(error) => {
                    warn!(
                        request_id = record.id,
                        external_ref,
                        %error,
                        "remote status fetch failed"
                    );
                    report.fetch_failures += 1;
                    continue;
                }
            };

            match fetched {
                RemoteStatusFetch::Missing => {
                    warn!(
                        request_id = record.id,
                        external_ref, "remote record is gone; marking link stale"
                    );
                    self.store.mark_external_ref_stale(record.id)?;
                    self.record_cache_invalidate(record.id);
                    report.stale_links.push(record.id);
                }
                RemoteStatusFetch::Status(remote) => {
                    let Some(local) = local_status_for(remote) else {
                        continue;
                    };
                    let note = AdminNote {
                        author: REMOTE_NOTE_AUTHOR.to_string(),
                        body: format!("Marked {local} by the external tracker."),
                        created_unix_ms: current_unix_timestamp_ms(),
                    };
                    match self.store.transition(
                        record.id,
                        local,
                        Some(FulfillmentSource::Remote),
                        Some(note),
                    ) {
                        Ok(updated) => {
                            self.finish_transition(&updated, None).await;
                            report.remote_applied.push(updated.id);
                        }
                        Err(error) if error.is_conflict() => {
                            debug!(
                                request_id = record.id,
                                "remote terminal status ignored; request already resolved locally"
                            );
                        }
                        Err(error) => {
                            warn!(request_id = record.id, %error, "failed to apply remote status");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn sync_success(&self, bridge: &TrackerBridge, request_id: i64) {
        if let Err(error) = bridge.lock_sync().record_success(request_id) {
            warn!(request_id, %error, "failed to persist sync queue");
        }
    }

    fn sync_discard(&self, bridge: &TrackerBridge, request_id: i64) {
        if let Err(error) = bridge.lock_sync().discard(request_id) {
            warn!(request_id, %error, "failed to persist sync queue");
        }
    }

    /// Records a failed port call. Terminal failures (a decoded 4xx, an
    /// envelope rejection) are dropped from the queue instead of being
    /// retried into the same wall.
    fn sync_failure(
        &self,
        bridge: &TrackerBridge,
        request_id: i64,
        error: &anyhow::Error,
    ) -> PushOutcome {
        if !is_retryable_tracker_error(error) {
            warn!(request_id, %error, "tracker push rejected terminally; dropping");
            self.sync_discard(bridge, request_id);
            return PushOutcome::Failed { exhausted: true };
        }
        self.sync_retry_later(bridge, request_id, &error.to_string())
    }

    fn sync_retry_later(
        &self,
        bridge: &TrackerBridge,
        request_id: i64,
        detail: &str,
    ) -> PushOutcome {
        let now_ms = current_unix_timestamp_ms();
        let exhausted = bridge
            .lock_sync()
            .record_failure(request_id, detail, now_ms, self.config.retry);
        match exhausted {
            Ok(true) => {
                warn!(request_id, detail, "tracker push exhausted its retry budget");
                PushOutcome::Failed { exhausted: true }
            }
            Ok(false) => PushOutcome::Failed { exhausted: false },
            Err(error) => {
                warn!(request_id, %error, "failed to persist sync queue");
                PushOutcome::Failed { exhausted: false }
            }
        }
    }
}

/// Remote terminal statuses map onto the local vocabulary; pending and
/// approved are observation-only.
fn local_status_for(remote: RemoteTrackerStatus) -> Option<RequestStatus> {
    match remote {
        RemoteTrackerStatus::Fulfilled => Some(RequestStatus::Fulfilled),
        RemoteTrackerStatus::Rejected => Some(RequestStatus::Rejected),
        RemoteTrackerStatus::Cancelled => Some(RequestStatus::Cancelled),
        RemoteTrackerStatus::Pending | RemoteTrackerStatus::Approved => None,
    }
}

/// Handle for the background reconcile loop.
pub struct TrackerSyncHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TrackerSyncHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// Spawns the periodic reconcile loop. The first pass runs immediately.
pub fn spawn_tracker_sync_loop(
    engine: Arc<RequestEngine>,
    config: TrackerSyncRuntimeConfig,
) -> TrackerSyncHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(config.interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = engine.run_reconcile_once().await {
                        warn!(%error, "tracker reconcile pass failed");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
    TrackerSyncHandle { shutdown, handle }
}
