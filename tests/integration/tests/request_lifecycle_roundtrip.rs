use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use shelf_engine::{
    CatalogItem, CatalogPlatform, LibraryCatalog, RequestEngine, RequestEngineConfig,
    ScanCompleted, ScanItem, SubmitOutcome, SubmitRequest, TrackerPort,
};
use shelf_notify::{
    AdminSurfaceUpdate, DirectMessagePayload, NotificationDispatcher, NotificationSink,
    NotifyDispatcherConfig,
};
use shelf_requests::{
    FulfillmentSource, RequestRecord, RequestStatus, RequestStore, Requester,
};
use shelf_tracker::{RemoteStatusFetch, RemoteTrackerStatus, TrackerSyncStateStore};

static WORKSPACE_COUNTER: AtomicU64 = AtomicU64::new(1);

struct IsolatedWorkspace {
    root: PathBuf,
}

impl IsolatedWorkspace {
    fn new(label: &str) -> Self {
        let tick = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let count = WORKSPACE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "shelfkeeper-{label}-{}-{tick}-{count}",
            std::process::id()
        ));
        fs::create_dir_all(&root).expect("must create isolated workspace root");
        Self { root }
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for IsolatedWorkspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

struct ScriptedCatalog {
    platforms: Vec<CatalogPlatform>,
}

impl ScriptedCatalog {
    fn snes_only() -> Arc<Self> {
        Arc::new(Self {
            platforms: vec![CatalogPlatform {
                id: "6".to_string(),
                name: "SNES".to_string(),
                custom_name: None,
            }],
        })
    }
}

#[async_trait]
impl LibraryCatalog for ScriptedCatalog {
    async fn list_platforms(&self) -> Result<Vec<CatalogPlatform>> {
        Ok(self.platforms.clone())
    }

    async fn search_items(&self, _platform_id: &str, _term: &str) -> Result<Vec<CatalogItem>> {
        Ok(Vec::new())
    }
}

struct ScriptedTracker {
    create_calls: AtomicUsize,
    status_pushes: AsyncMutex<Vec<(String, RequestStatus)>>,
    remote: AsyncMutex<HashMap<String, RemoteStatusFetch>>,
}

impl ScriptedTracker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            create_calls: AtomicUsize::new(0),
            status_pushes: AsyncMutex::new(Vec::new()),
            remote: AsyncMutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl TrackerPort for ScriptedTracker {
    async fn push_create(&self, record: &RequestRecord) -> Result<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("remote-{}", record.id))
    }

    async fn push_status(
        &self,
        external_ref: &str,
        status: RequestStatus,
        _note: Option<&str>,
    ) -> Result<()> {
        self.status_pushes
            .lock()
            .await
            .push((external_ref.to_string(), status));
        Ok(())
    }

    async fn fetch_status(&self, external_ref: &str) -> Result<RemoteStatusFetch> {
        Ok(self
            .remote
            .lock()
            .await
            .get(external_ref)
            .cloned()
            .unwrap_or(RemoteStatusFetch::Status(RemoteTrackerStatus::Pending)))
    }
}

struct RecordingSink {
    directs: AsyncMutex<Vec<DirectMessagePayload>>,
    admin_updates: AsyncMutex<Vec<AdminSurfaceUpdate>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            directs: AsyncMutex::new(Vec::new()),
            admin_updates: AsyncMutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver_direct(&self, payload: &DirectMessagePayload) -> Result<()> {
        self.directs.lock().await.push(payload.clone());
        Ok(())
    }

    async fn post_admin_update(&self, update: &AdminSurfaceUpdate) -> Result<()> {
        self.admin_updates.lock().await.push(update.clone());
        Ok(())
    }
}

struct LifecycleHarness {
    engine: Arc<RequestEngine>,
    store: Arc<RequestStore>,
    tracker: Arc<ScriptedTracker>,
    sink: Arc<RecordingSink>,
    _workspace: IsolatedWorkspace,
}

fn lifecycle_harness(label: &str) -> LifecycleHarness {
    let workspace = IsolatedWorkspace::new(label);
    let store = Arc::new(
        RequestStore::open(&workspace.root().join("requests.db")).expect("open request store"),
    );
    let sink = RecordingSink::new();
    let dispatcher = Arc::new(NotificationDispatcher::new(
        sink.clone(),
        NotifyDispatcherConfig::default(),
    ));
    let tracker = ScriptedTracker::new();
    let sync = TrackerSyncStateStore::load(workspace.root().join("tracker-sync.json"))
        .expect("load sync state");
    let engine = Arc::new(
        RequestEngine::new(
            store.clone(),
            ScriptedCatalog::snes_only(),
            dispatcher,
            RequestEngineConfig::default(),
        )
        .with_tracker(tracker.clone(), sync),
    );
    LifecycleHarness {
        engine,
        store,
        tracker,
        sink,
        _workspace: workspace,
    }
}

fn submit_for(user: &str, title: &str) -> SubmitRequest {
    SubmitRequest {
        requester: Requester::new(user, format!("User {user}")),
        platform: "snes".to_string(),
        title: title.to_string(),
        details: None,
    }
}

fn created(outcome: SubmitOutcome) -> RequestRecord {
    match outcome {
        SubmitOutcome::Created(record) => record,
        other => panic!("expected Created, got {other:?}"),
    }
}

#[tokio::test]
async fn submission_to_scan_fulfillment_roundtrip() {
    let harness = lifecycle_harness("scan-roundtrip");

    let record = created(
        harness
            .engine
            .submit(submit_for("u1", "Chrono Trigger"))
            .await
            .expect("submit"),
    );
    assert_eq!(record.status, RequestStatus::Pending);
    // The creation was pushed inline and the remote link persisted.
    assert_eq!(harness.tracker.create_calls.load(Ordering::SeqCst), 1);
    let linked = harness.store.get(record.id).expect("get");
    assert_eq!(linked.external_ref.as_deref(), Some(format!("remote-{}", record.id).as_str()));

    // A second user asking for the same title joins instead of duplicating.
    let outcome = harness
        .engine
        .submit(submit_for("u2", "chrono  trigger"))
        .await
        .expect("join");
    let SubmitOutcome::Joined(joined) = outcome else {
        panic!("expected Joined");
    };
    assert_eq!(joined.id, record.id);
    assert_eq!(joined.requesters.len(), 2);

    let report = harness
        .engine
        .handle_scan_completed(ScanCompleted {
            platform: "SNES".to_string(),
            new_items: vec![ScanItem {
                title: "Chrono Trigger".to_string(),
                catalog_ref: Some("chrono-trigger.sfc".to_string()),
            }],
        })
        .await
        .expect("scan");
    assert_eq!(report.fulfilled, vec![record.id]);

    let resolved = harness.store.get(record.id).expect("get");
    assert_eq!(resolved.status, RequestStatus::Fulfilled);
    assert_eq!(resolved.fulfillment_source, Some(FulfillmentSource::Scan));
    assert!(resolved.resolved_unix_ms.is_some());

    // Both requesters hear about the fulfillment exactly once.
    let directs = harness.sink.directs.lock().await;
    let fulfillment_messages: Vec<_> = directs
        .iter()
        .filter(|payload| payload.title == "Requests fulfilled")
        .collect();
    assert_eq!(fulfillment_messages.len(), 2);

    // And the tracker was told the request closed.
    let pushes = harness.tracker.status_pushes.lock().await;
    assert_eq!(
        *pushes,
        vec![(format!("remote-{}", record.id), RequestStatus::Fulfilled)]
    );
}

#[tokio::test]
async fn remote_rejection_reconciles_into_the_local_store() {
    let harness = lifecycle_harness("remote-reconcile");

    let record = created(
        harness
            .engine
            .submit(submit_for("u1", "Earthbound"))
            .await
            .expect("submit"),
    );
    let external_ref = format!("remote-{}", record.id);
    harness.tracker.remote.lock().await.insert(
        external_ref.clone(),
        RemoteStatusFetch::Status(RemoteTrackerStatus::Rejected),
    );

    let report = harness.engine.run_reconcile_once().await.expect("reconcile");
    assert_eq!(report.remote_applied, vec![record.id]);

    let resolved = harness.store.get(record.id).expect("get");
    assert_eq!(resolved.status, RequestStatus::Rejected);
    assert_eq!(resolved.fulfillment_source, Some(FulfillmentSource::Remote));

    // The remote decision is not echoed back as a status push.
    assert!(harness.tracker.status_pushes.lock().await.is_empty());

    // A second pass has nothing left to do.
    let report = harness.engine.run_reconcile_once().await.expect("reconcile");
    assert!(report.remote_applied.is_empty());
    assert_eq!(report, shelf_engine::ReconcileReport::default());
}

#[tokio::test]
async fn request_state_survives_a_store_reopen() {
    let workspace = IsolatedWorkspace::new("store-reopen");
    let db_path = workspace.root().join("requests.db");

    let first_id = {
        let store = Arc::new(RequestStore::open(&db_path).expect("open"));
        let sink = RecordingSink::new();
        let dispatcher = Arc::new(NotificationDispatcher::new(
            sink,
            NotifyDispatcherConfig::default(),
        ));
        let engine = RequestEngine::new(
            store,
            ScriptedCatalog::snes_only(),
            dispatcher,
            RequestEngineConfig::default(),
        );
        let record = created(
            engine
                .submit(submit_for("u1", "Secret of Mana"))
                .await
                .expect("submit"),
        );
        engine
            .annotate(record.id, "admin", "waiting on a verified dump")
            .expect("annotate");
        record.id
    };

    let reopened = RequestStore::open(&db_path).expect("reopen");
    let record = reopened.get(first_id).expect("get");
    assert_eq!(record.status, RequestStatus::Pending);
    assert_eq!(record.title, "Secret of Mana");
    assert_eq!(record.admin_notes.len(), 1);
    assert_eq!(record.admin_notes[0].body, "waiting on a verified dump");
    assert_eq!(
        reopened.count_pending_for_user("u1").expect("count"),
        1
    );
}
