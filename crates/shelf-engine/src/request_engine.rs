//! The request lifecycle orchestrator.
//!
//! `RequestEngine` owns the submission pipeline and the public mutation
//! operations. Persistence decisions belong to the store; the engine
//! composes it with the catalog, the optional metadata provider, the
//! optional tracker bridge, and the notification dispatcher. Enrichment,
//! tracker pushes, and notifications are all best-effort: their failure
//! never loses a request.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use shelf_core::{current_unix_timestamp_ms, normalize_title};
use shelf_notify::NotificationDispatcher;
use shelf_requests::{
    AdminNote, FulfillmentSource, InsertOutcome, NewRequest, NormalizedTitleMatcher,
    RequestError, RequestRecord, RequestRecordCache, RequestRecordCacheConfig, RequestResult,
    RequestStatus, RequestStore, Requester, TitleMatcher,
};
use shelf_tracker::{TrackerRetryPolicy, TrackerSyncStateStore};

use crate::engine_ports::{CatalogItem, CatalogPlatform, LibraryCatalog, MetadataProvider, TrackerPort};

#[derive(Debug, Clone, Copy)]
/// Public struct `RequestEngineConfig` used across Shelfkeeper components.
pub struct RequestEngineConfig {
    /// Maximum open requests any single user may hold, counting dedup-joins.
    pub pending_cap_per_user: usize,
    pub platform_cache_ttl_ms: u64,
    pub record_cache: RequestRecordCacheConfig,
    pub retry: TrackerRetryPolicy,
}

impl Default for RequestEngineConfig {
    fn default() -> Self {
        Self {
            pending_cap_per_user: 5,
            platform_cache_ttl_ms: 300_000,
            record_cache: RequestRecordCacheConfig::default(),
            retry: TrackerRetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
/// Input for the submission pipeline.
pub struct SubmitRequest {
    pub requester: Requester,
    pub platform: String,
    pub title: String,
    pub details: Option<String>,
}

#[derive(Debug, Clone)]
/// What a submission resolved to.
pub enum SubmitOutcome {
    /// A fresh pending request was created.
    Created(RequestRecord),
    /// The title already had an open request; the requester was attached
    /// to it instead.
    Joined(RequestRecord),
    /// The title is already in the library; nothing was created.
    AlreadyInLibrary(Vec<CatalogItem>),
}

pub(crate) struct TrackerBridge {
    pub(crate) port: Arc<dyn TrackerPort>,
    pub(crate) sync: Mutex<TrackerSyncStateStore>,
    in_flight: Mutex<HashSet<i64>>,
}

impl TrackerBridge {
    pub(crate) fn lock_sync(&self) -> MutexGuard<'_, TrackerSyncStateStore> {
        match self.sync.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Marks a queue entry as being pushed right now. Returns false when
    /// another caller already holds it, so an inline flush and a reconcile
    /// tick never push the same entry twice.
    pub(crate) fn claim(&self, request_id: i64) -> bool {
        self.lock_in_flight().insert(request_id)
    }

    pub(crate) fn release(&self, request_id: i64) {
        self.lock_in_flight().remove(&request_id);
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashSet<i64>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct CachedPlatforms {
    platforms: Vec<CatalogPlatform>,
    expires_unix_ms: u64,
}

/// Orchestrates submissions, admin resolutions, scan fulfillment, and
/// tracker sync over the component crates.
pub struct RequestEngine {
    pub(crate) store: Arc<RequestStore>,
    pub(crate) catalog: Arc<dyn LibraryCatalog>,
    pub(crate) metadata: Option<Arc<dyn MetadataProvider>>,
    pub(crate) tracker: Option<TrackerBridge>,
    pub(crate) dispatcher: Arc<NotificationDispatcher>,
    pub(crate) matcher: Arc<dyn TitleMatcher>,
    pub(crate) config: RequestEngineConfig,
    record_cache: RequestRecordCache,
    platform_cache: Mutex<Option<CachedPlatforms>>,
}

impl RequestEngine {
    pub fn new(
        store: Arc<RequestStore>,
        catalog: Arc<dyn LibraryCatalog>,
        dispatcher: Arc<NotificationDispatcher>,
        config: RequestEngineConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            metadata: None,
            tracker: None,
            dispatcher,
            matcher: Arc::new(NormalizedTitleMatcher),
            record_cache: RequestRecordCache::new(config.record_cache),
            platform_cache: Mutex::new(None),
            config,
        }
    }

    pub fn with_metadata_provider(mut self, provider: Arc<dyn MetadataProvider>) -> Self {
        self.metadata = Some(provider);
        self
    }

    pub fn with_tracker(mut self, port: Arc<dyn TrackerPort>, sync: TrackerSyncStateStore) -> Self {
        self.tracker = Some(TrackerBridge {
            port,
            sync: Mutex::new(sync),
            in_flight: Mutex::new(HashSet::new()),
        });
        self
    }

    pub fn with_title_matcher(mut self, matcher: Arc<dyn TitleMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// The submission pipeline: validate, resolve the platform, check the
    /// catalog, dedup against open requests, enrich, persist, push, ack.
    pub async fn submit(&self, submit: SubmitRequest) -> RequestResult<SubmitOutcome> {
        let title = submit.title.trim();
        if title.is_empty() {
            return Err(RequestError::Validation(
                "request title must not be empty".to_string(),
            ));
        }
        let platform = self.resolve_platform(&submit.platform).await?;

        let in_library = self.find_in_catalog(&platform, title).await;
        if !in_library.is_empty() {
            debug!(
                platform = platform.name.as_str(),
                title, "submission matched catalog items; not creating a request"
            );
            return Ok(SubmitOutcome::AlreadyInLibrary(in_library));
        }

        if let Some(open) = self
            .store
            .find_pending_by_key(&platform.name, &normalize_title(title))?
        {
            let joined = self.store.join_requester(
                open.id,
                &submit.requester,
                self.config.pending_cap_per_user,
            )?;
            self.record_cache.invalidate(joined.id);
            self.dispatcher
                .notify_submission_ack(&joined, &submit.requester, true)
                .await;
            return Ok(SubmitOutcome::Joined(joined));
        }

        let metadata = match &self.metadata {
            Some(provider) => match provider.lookup(&platform.name, title).await {
                Ok(metadata) => metadata,
                Err(error) => {
                    warn!(
                        platform = platform.name.as_str(),
                        title,
                        %error,
                        "metadata lookup failed; submitting without enrichment"
                    );
                    None
                }
            },
            None => None,
        };

        let inserted = self.store.insert_pending(
            NewRequest {
                requester: submit.requester.clone(),
                platform: platform.name.clone(),
                title: title.to_string(),
                details: submit
                    .details
                    .filter(|details| !details.trim().is_empty()),
                metadata,
            },
            self.config.pending_cap_per_user,
        )?;
        let record = match inserted {
            InsertOutcome::Created(record) => record,
            // A concurrent submission of the same title won the insert
            // while this one was enriching; fold into it.
            InsertOutcome::JoinedExisting(joined) => {
                self.record_cache.invalidate(joined.id);
                self.dispatcher
                    .notify_submission_ack(&joined, &submit.requester, true)
                    .await;
                return Ok(SubmitOutcome::Joined(joined));
            }
        };

        if let Some(bridge) = &self.tracker {
            let queued = bridge.lock_sync().enqueue_create(record.id);
            match queued {
                Ok(()) => self.flush_outbound_for(record.id).await,
                Err(error) => {
                    warn!(request_id = record.id, %error, "failed to queue tracker create push");
                }
            }
        }

        self.dispatcher
            .notify_submission_ack(&record, &submit.requester, false)
            .await;
        Ok(SubmitOutcome::Created(record))
    }

    /// Requester-initiated cancellation. Only the primary requester or an
    /// admin may cancel.
    pub async fn cancel(
        &self,
        id: i64,
        actor_user_id: &str,
        is_admin: bool,
    ) -> RequestResult<RequestRecord> {
        let record = self.store.get(id)?;
        if !is_admin && record.primary_requester().user_id != actor_user_id {
            return Err(RequestError::Validation(format!(
                "only the primary requester or an admin can cancel request {id}"
            )));
        }
        let updated = self.store.transition(id, RequestStatus::Cancelled, None, None)?;
        self.finish_transition(&updated, None).await;
        Ok(updated)
    }

    /// Admin fulfillment with an optional note.
    pub async fn fulfill(
        &self,
        id: i64,
        actor: &str,
        note: Option<&str>,
    ) -> RequestResult<RequestRecord> {
        self.resolve_as_admin(id, RequestStatus::Fulfilled, actor, note)
            .await
    }

    /// Admin rejection with an optional note.
    pub async fn reject(
        &self,
        id: i64,
        actor: &str,
        note: Option<&str>,
    ) -> RequestResult<RequestRecord> {
        self.resolve_as_admin(id, RequestStatus::Rejected, actor, note)
            .await
    }

    async fn resolve_as_admin(
        &self,
        id: i64,
        to: RequestStatus,
        actor: &str,
        note: Option<&str>,
    ) -> RequestResult<RequestRecord> {
        let note_text = note.map(str::trim).filter(|text| !text.is_empty());
        let admin_note = note_text.map(|body| AdminNote {
            author: actor.to_string(),
            body: body.to_string(),
            created_unix_ms: current_unix_timestamp_ms(),
        });
        let updated = self
            .store
            .transition(id, to, Some(FulfillmentSource::Admin), admin_note)?;
        self.finish_transition(&updated, note_text).await;
        Ok(updated)
    }

    /// Appends an annotation; valid in any state.
    pub fn annotate(&self, id: i64, author: &str, body: &str) -> RequestResult<RequestRecord> {
        let body = body.trim();
        if body.is_empty() {
            return Err(RequestError::Validation(
                "annotation body must not be empty".to_string(),
            ));
        }
        let updated = self.store.append_note(
            id,
            AdminNote {
                author: author.to_string(),
                body: body.to_string(),
                created_unix_ms: current_unix_timestamp_ms(),
            },
        )?;
        self.record_cache.invalidate(id);
        Ok(updated)
    }

    /// Cache-aside read of a single request.
    pub fn get(&self, id: i64) -> RequestResult<RequestRecord> {
        if let Some(record) = self.record_cache.get(id) {
            return Ok(record);
        }
        let record = self.store.get(id)?;
        self.record_cache.insert(record.clone());
        Ok(record)
    }

    /// Pending requests, oldest first, optionally limited to one platform.
    pub fn list_pending(&self, platform: Option<&str>) -> RequestResult<Vec<RequestRecord>> {
        self.store.list_pending(platform)
    }

    /// Every request the user is attached to, newest first.
    pub fn list_for_user(&self, user_id: &str) -> RequestResult<Vec<RequestRecord>> {
        self.store.list_for_user(user_id)
    }

    /// Re-runs enrichment for one request. The stored metadata is only
    /// replaced on a confident match; an inconclusive lookup keeps whatever
    /// is already there.
    pub async fn reenrich(&self, id: i64) -> RequestResult<RequestRecord> {
        let provider = self
            .metadata
            .as_ref()
            .ok_or_else(|| RequestError::dependency("metadata provider", "not configured"))?;
        let record = self.store.get(id)?;
        let found = provider
            .lookup(&record.platform, &record.title)
            .await
            .map_err(|error| RequestError::dependency("metadata provider", error))?;
        match found {
            Some(metadata) => {
                let updated = self.store.update_metadata(id, Some(metadata))?;
                self.record_cache.invalidate(id);
                Ok(updated)
            }
            None => {
                debug!(request_id = id, "re-enrichment found no confident match");
                Ok(record)
            }
        }
    }

    /// Post-transition fan-out shared by every path that resolves a
    /// request: cache invalidation, the notification burst, and (except for
    /// remote-driven transitions, which would echo) the tracker push.
    pub(crate) async fn finish_transition(&self, record: &RequestRecord, note: Option<&str>) {
        self.record_cache.invalidate(record.id);
        self.dispatcher.notify_transition(record, note).await;

        let remote_driven = record.fulfillment_source == Some(FulfillmentSource::Remote);
        if remote_driven {
            return;
        }
        if let Some(bridge) = &self.tracker {
            let queued = bridge
                .lock_sync()
                .enqueue_status_update(record.id, record.status.as_str(), note);
            match queued {
                Ok(()) => self.flush_outbound_for(record.id).await,
                Err(error) => {
                    warn!(request_id = record.id, %error, "failed to queue tracker status push");
                }
            }
        }
    }

    async fn find_in_catalog(&self, platform: &CatalogPlatform, title: &str) -> Vec<CatalogItem> {
        let items = match self.catalog.search_items(&platform.id, title).await {
            Ok(items) => items,
            Err(error) => {
                // Degraded catalog must not block submissions; dedup against
                // open requests still applies.
                warn!(
                    platform = platform.name.as_str(),
                    title,
                    %error,
                    "catalog search failed; skipping library dedup"
                );
                return Vec::new();
            }
        };
        items
            .into_iter()
            .filter(|item| self.matcher.matches(&item.name, title))
            .collect()
    }

    async fn resolve_platform(&self, requested: &str) -> RequestResult<CatalogPlatform> {
        let requested = requested.trim();
        if requested.is_empty() {
            return Err(RequestError::Validation(
                "platform must not be empty".to_string(),
            ));
        }
        let platforms = self.platform_list().await?;
        let needle = requested.to_lowercase();
        platforms
            .into_iter()
            .find(|platform| {
                platform.id.to_lowercase() == needle
                    || platform.name.to_lowercase() == needle
                    || platform.display_name().to_lowercase() == needle
            })
            .ok_or_else(|| RequestError::Validation(format!("unknown platform '{requested}'")))
    }

    /// TTL-cached platform list. When the catalog is unreachable a stale
    /// cached list is still accepted; only a cold cache escalates to a
    /// dependency failure.
    async fn platform_list(&self) -> RequestResult<Vec<CatalogPlatform>> {
        let now_ms = current_unix_timestamp_ms();
        if let Some(cached) = &*self.lock_platforms() {
            if cached.expires_unix_ms > now_ms {
                return Ok(cached.platforms.clone());
            }
        }

        match self.catalog.list_platforms().await {
            Ok(platforms) => {
                *self.lock_platforms() = Some(CachedPlatforms {
                    platforms: platforms.clone(),
                    expires_unix_ms: now_ms.saturating_add(self.config.platform_cache_ttl_ms),
                });
                Ok(platforms)
            }
            Err(error) => {
                if let Some(cached) = &*self.lock_platforms() {
                    warn!(%error, "platform list refresh failed; using stale cache");
                    return Ok(cached.platforms.clone());
                }
                Err(RequestError::dependency("library catalog", error))
            }
        }
    }

    pub(crate) fn record_cache_invalidate(&self, id: i64) {
        self.record_cache.invalidate(id);
    }

    fn lock_platforms(&self) -> MutexGuard<'_, Option<CachedPlatforms>> {
        match self.platform_cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
