//! SQLite-backed request store: the sole writer of request state.
//!
//! All mutation runs through one connection mutex, so a scan-triggered and
//! an admin-triggered fulfillment racing on the same request serialize
//! here; the loser observes the terminal state and gets a `Conflict`.
//! Records are never deleted: resolved requests stay for audit and dedup.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row};
use shelf_core::{current_unix_timestamp_ms, normalize_title};

use crate::request_error::{RequestError, RequestResult};
use crate::request_record::{
    AdminNote, FulfillmentSource, NewRequest, Requester, RequestMetadata, RequestRecord,
    RequestStatus,
};
use crate::request_transitions::transition_allowed;

/// Durable table of requests keyed by local id, with a dedup index on
/// `(platform, normalized_title, status)` and a sync index on
/// `external_ref`.
pub struct RequestStore {
    connection: Mutex<Connection>,
}

#[derive(Debug, Clone)]
/// How an insert resolved: a fresh pending request, or a join onto an
/// open request that beat this insert to the same dedup key.
pub enum InsertOutcome {
    Created(RequestRecord),
    JoinedExisting(RequestRecord),
}

impl RequestStore {
    pub fn open(path: &Path) -> RequestResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|error| {
                    RequestError::Storage(format!(
                        "failed to create request store directory {}: {error}",
                        parent.display()
                    ))
                })?;
            }
        }
        let connection = Connection::open(path).map_err(|error| {
            RequestError::Storage(format!(
                "failed to open request store {}: {error}",
                path.display()
            ))
        })?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        initialize_request_schema(&connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// In-memory store for tests and ephemeral runs.
    pub fn open_in_memory() -> RequestResult<Self> {
        let connection = Connection::open_in_memory()
            .map_err(|error| RequestError::Storage(error.to_string()))?;
        initialize_request_schema(&connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// Creates a pending request, enforcing the per-user pending cap inside
    /// the same transaction as the insert.
    ///
    /// The dedup key is re-checked here: callers look it up before any slow
    /// enrichment, so a concurrent submission of the same title can land in
    /// between. When an open request already holds the key the insert
    /// becomes a join instead of a duplicate.
    pub fn insert_pending(&self, new: NewRequest, cap: usize) -> RequestResult<InsertOutcome> {
        let mut guard = self.lock();
        let transaction = guard.transaction()?;

        let normalized = normalize_title(&new.title);
        if let Some(open_id) = find_pending_id_tx(&transaction, &new.platform, &normalized)? {
            let joined = join_requester_tx(&transaction, open_id, &new.requester, cap)?;
            transaction.commit()?;
            return Ok(InsertOutcome::JoinedExisting(joined));
        }

        let pending = count_pending_for_user_tx(&transaction, &new.requester.user_id)?;
        if pending >= cap {
            return Err(RequestError::CapExceeded {
                user_id: new.requester.user_id,
                cap,
            });
        }

        let now_ms = current_unix_timestamp_ms();
        let metadata_json = encode_metadata(&new.metadata)?;
        transaction.execute(
            r#"
            INSERT INTO requests
                (platform, title, normalized_title, details, status,
                 created_unix_ms, metadata_json, admin_notes_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '[]')
            "#,
            params![
                new.platform,
                new.title,
                normalized,
                new.details,
                RequestStatus::Pending.as_str(),
                now_ms as i64,
                metadata_json,
            ],
        )?;
        let id = transaction.last_insert_rowid();
        attach_requester_tx(&transaction, id, &new.requester, 0)?;

        let record = load_record_tx(&transaction, id)?;
        transaction.commit()?;
        Ok(InsertOutcome::Created(record))
    }

    pub fn get(&self, id: i64) -> RequestResult<RequestRecord> {
        let guard = self.lock();
        load_record_tx(&guard, id)
    }

    /// Pending requests ordered oldest first, optionally filtered by
    /// platform (case-insensitive).
    pub fn list_pending(&self, platform: Option<&str>) -> RequestResult<Vec<RequestRecord>> {
        let guard = self.lock();
        let ids: Vec<i64> = match platform {
            Some(platform) => collect_ids(
                &guard,
                r#"
                SELECT id FROM requests
                WHERE status = 'pending' AND LOWER(platform) = LOWER(?1)
                ORDER BY created_unix_ms ASC, id ASC
                "#,
                params![platform],
            )?,
            None => collect_ids(
                &guard,
                r#"
                SELECT id FROM requests
                WHERE status = 'pending'
                ORDER BY created_unix_ms ASC, id ASC
                "#,
                params![],
            )?,
        };
        ids.into_iter()
            .map(|id| load_record_tx(&guard, id))
            .collect()
    }

    /// Every request a user is attached to, newest first.
    pub fn list_for_user(&self, user_id: &str) -> RequestResult<Vec<RequestRecord>> {
        let guard = self.lock();
        let ids = collect_ids(
            &guard,
            r#"
            SELECT r.id FROM requests r
            JOIN request_requesters q ON q.request_id = r.id
            WHERE q.user_id = ?1
            ORDER BY r.created_unix_ms DESC, r.id DESC
            "#,
            params![user_id],
        )?;
        ids.into_iter()
            .map(|id| load_record_tx(&guard, id))
            .collect()
    }

    /// Pending requests carrying a usable external correlation, for inbound
    /// reconciliation.
    pub fn list_pending_with_external_ref(&self) -> RequestResult<Vec<RequestRecord>> {
        let guard = self.lock();
        let ids = collect_ids(
            &guard,
            r#"
            SELECT id FROM requests
            WHERE status = 'pending'
              AND external_ref IS NOT NULL
              AND external_ref_stale = 0
            ORDER BY id ASC
            "#,
            params![],
        )?;
        ids.into_iter()
            .map(|id| load_record_tx(&guard, id))
            .collect()
    }

    /// Dedup lookup: an open request for the same `(platform, normalized
    /// title)` pair.
    pub fn find_pending_by_key(
        &self,
        platform: &str,
        normalized_title: &str,
    ) -> RequestResult<Option<RequestRecord>> {
        let guard = self.lock();
        match find_pending_id_tx(&guard, platform, normalized_title)? {
            Some(id) => Ok(Some(load_record_tx(&guard, id)?)),
            None => Ok(None),
        }
    }

    /// Dedup-join: attaches an additional requester to an open request.
    /// Joining is idempotent for an already-attached user and enforces the
    /// joining user's pending cap atomically.
    pub fn join_requester(
        &self,
        id: i64,
        requester: &Requester,
        cap: usize,
    ) -> RequestResult<RequestRecord> {
        let mut guard = self.lock();
        let transaction = guard.transaction()?;
        let updated = join_requester_tx(&transaction, id, requester, cap)?;
        transaction.commit()?;
        Ok(updated)
    }

    /// Applies a terminal transition. The conditional update on
    /// `status = 'pending'` makes the store the arbiter of races: exactly
    /// one caller wins, every other gets `Conflict` naming the current
    /// state.
    pub fn transition(
        &self,
        id: i64,
        to: RequestStatus,
        source: Option<FulfillmentSource>,
        note: Option<AdminNote>,
    ) -> RequestResult<RequestRecord> {
        let mut guard = self.lock();
        let transaction = guard.transaction()?;

        let record = load_record_tx(&transaction, id)?;
        if !transition_allowed(record.status, to) {
            return Err(RequestError::Conflict {
                id,
                status: record.status,
            });
        }

        let mut notes = record.admin_notes.clone();
        if let Some(note) = note {
            notes.push(note);
        }
        let notes_json = serde_json::to_string(&notes)?;
        let now_ms = current_unix_timestamp_ms();
        let changed = transaction.execute(
            r#"
            UPDATE requests
            SET status = ?1,
                resolved_unix_ms = ?2,
                fulfillment_source = ?3,
                admin_notes_json = ?4
            WHERE id = ?5 AND status = 'pending'
            "#,
            params![
                to.as_str(),
                now_ms as i64,
                source.map(FulfillmentSource::as_str),
                notes_json,
                id,
            ],
        )?;
        if changed == 0 {
            let current = load_record_tx(&transaction, id)?;
            return Err(RequestError::Conflict {
                id,
                status: current.status,
            });
        }

        let updated = load_record_tx(&transaction, id)?;
        transaction.commit()?;
        Ok(updated)
    }

    /// Appends an annotation. Valid in any state; the note log is
    /// append-only audit history.
    pub fn append_note(&self, id: i64, note: AdminNote) -> RequestResult<RequestRecord> {
        let mut guard = self.lock();
        let transaction = guard.transaction()?;

        let record = load_record_tx(&transaction, id)?;
        let mut notes = record.admin_notes;
        notes.push(note);
        let notes_json = serde_json::to_string(&notes)?;
        transaction.execute(
            "UPDATE requests SET admin_notes_json = ?1 WHERE id = ?2",
            params![notes_json, id],
        )?;

        let updated = load_record_tx(&transaction, id)?;
        transaction.commit()?;
        Ok(updated)
    }

    /// Replaces the enrichment metadata, used by explicit re-enrichment.
    pub fn update_metadata(
        &self,
        id: i64,
        metadata: Option<RequestMetadata>,
    ) -> RequestResult<RequestRecord> {
        let mut guard = self.lock();
        let transaction = guard.transaction()?;

        load_record_tx(&transaction, id)?;
        let metadata_json = encode_metadata(&metadata)?;
        transaction.execute(
            "UPDATE requests SET metadata_json = ?1 WHERE id = ?2",
            params![metadata_json, id],
        )?;

        let updated = load_record_tx(&transaction, id)?;
        transaction.commit()?;
        Ok(updated)
    }

    /// Stores the external correlation from the first successful push.
    /// Returns false (and changes nothing) when a ref is already set:
    /// `external_ref` is immutable once assigned.
    pub fn set_external_ref(&self, id: i64, external_ref: &str) -> RequestResult<bool> {
        let guard = self.lock();
        load_record_tx(&guard, id)?;
        let changed = guard.execute(
            "UPDATE requests SET external_ref = ?1 WHERE id = ?2 AND external_ref IS NULL",
            params![external_ref, id],
        )?;
        Ok(changed > 0)
    }

    /// Marks the external correlation stale (remote record gone). The ref
    /// itself is kept so the request is never re-created remotely.
    pub fn mark_external_ref_stale(&self, id: i64) -> RequestResult<()> {
        let guard = self.lock();
        load_record_tx(&guard, id)?;
        guard.execute(
            "UPDATE requests SET external_ref_stale = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn count_pending_for_user(&self, user_id: &str) -> RequestResult<usize> {
        let guard = self.lock();
        count_pending_for_user_tx(&guard, user_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.connection.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn initialize_request_schema(connection: &Connection) -> RequestResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            platform TEXT NOT NULL,
            title TEXT NOT NULL,
            normalized_title TEXT NOT NULL,
            details TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            created_unix_ms INTEGER NOT NULL,
            resolved_unix_ms INTEGER,
            fulfillment_source TEXT,
            external_ref TEXT,
            external_ref_stale INTEGER NOT NULL DEFAULT 0,
            metadata_json TEXT,
            admin_notes_json TEXT NOT NULL DEFAULT '[]'
        );
        CREATE TABLE IF NOT EXISTS request_requesters (
            request_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            user_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            PRIMARY KEY (request_id, user_id)
        );
        CREATE INDEX IF NOT EXISTS idx_requests_dedup
            ON requests (platform, normalized_title, status);
        CREATE INDEX IF NOT EXISTS idx_requests_external_ref
            ON requests (external_ref);
        CREATE INDEX IF NOT EXISTS idx_request_requesters_user
            ON request_requesters (user_id);
        "#,
    )?;
    Ok(())
}

fn find_pending_id_tx(
    connection: &Connection,
    platform: &str,
    normalized_title: &str,
) -> RequestResult<Option<i64>> {
    let id = connection
        .query_row(
            r#"
            SELECT id FROM requests
            WHERE status = 'pending'
              AND LOWER(platform) = LOWER(?1)
              AND normalized_title = ?2
            ORDER BY id ASC
            LIMIT 1
            "#,
            params![platform, normalized_title],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn join_requester_tx(
    connection: &Connection,
    id: i64,
    requester: &Requester,
    cap: usize,
) -> RequestResult<RequestRecord> {
    let record = load_record_tx(connection, id)?;
    if record.status != RequestStatus::Pending {
        return Err(RequestError::Conflict {
            id,
            status: record.status,
        });
    }
    if record.has_requester(&requester.user_id) {
        return Ok(record);
    }

    let pending = count_pending_for_user_tx(connection, &requester.user_id)?;
    if pending >= cap {
        return Err(RequestError::CapExceeded {
            user_id: requester.user_id.clone(),
            cap,
        });
    }

    attach_requester_tx(connection, id, requester, record.requesters.len() as i64)?;
    load_record_tx(connection, id)
}

fn count_pending_for_user_tx(connection: &Connection, user_id: &str) -> RequestResult<usize> {
    let count: i64 = connection.query_row(
        r#"
        SELECT COUNT(*) FROM requests r
        JOIN request_requesters q ON q.request_id = r.id
        WHERE q.user_id = ?1 AND r.status = 'pending'
        "#,
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(usize::try_from(count).unwrap_or(usize::MAX))
}

fn attach_requester_tx(
    connection: &Connection,
    request_id: i64,
    requester: &Requester,
    position: i64,
) -> RequestResult<()> {
    connection.execute(
        r#"
        INSERT OR IGNORE INTO request_requesters
            (request_id, position, user_id, display_name)
        VALUES (?1, ?2, ?3, ?4)
        "#,
        params![
            request_id,
            position,
            requester.user_id,
            requester.display_name
        ],
    )?;
    Ok(())
}

fn collect_ids(
    connection: &Connection,
    sql: &str,
    sql_params: impl rusqlite::Params,
) -> RequestResult<Vec<i64>> {
    let mut statement = connection.prepare(sql)?;
    let mut rows = statement.query(sql_params)?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next()? {
        ids.push(row.get(0)?);
    }
    Ok(ids)
}

fn load_record_tx(connection: &Connection, id: i64) -> RequestResult<RequestRecord> {
    let row = connection
        .query_row(
            r#"
            SELECT id, platform, title, normalized_title, details, status,
                   created_unix_ms, resolved_unix_ms, fulfillment_source,
                   external_ref, external_ref_stale, metadata_json,
                   admin_notes_json
            FROM requests
            WHERE id = ?1
            "#,
            params![id],
            decode_request_row,
        )
        .optional()?;
    let mut record = row.ok_or(RequestError::NotFound(id))?;

    let mut statement = connection.prepare(
        r#"
        SELECT user_id, display_name FROM request_requesters
        WHERE request_id = ?1
        ORDER BY position ASC
        "#,
    )?;
    let mut rows = statement.query(params![id])?;
    while let Some(row) = rows.next()? {
        record.requesters.push(Requester {
            user_id: row.get(0)?,
            display_name: row.get(1)?,
        });
    }
    if record.requesters.is_empty() {
        return Err(RequestError::Storage(format!(
            "request {id} has no attached requesters"
        )));
    }
    Ok(record)
}

fn decode_request_row(row: &Row<'_>) -> rusqlite::Result<RequestRecord> {
    let status_raw: String = row.get(5)?;
    let source_raw: Option<String> = row.get(8)?;
    let metadata_json: Option<String> = row.get(11)?;
    let notes_json: String = row.get(12)?;

    let status = RequestStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown request status '{status_raw}'").into(),
        )
    })?;
    let fulfillment_source = source_raw.as_deref().and_then(FulfillmentSource::parse);
    let metadata = match metadata_json.as_deref() {
        Some(raw) => serde_json::from_str(raw).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                11,
                rusqlite::types::Type::Text,
                Box::new(error),
            )
        })?,
        None => None,
    };
    let admin_notes = serde_json::from_str(&notes_json).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(
            12,
            rusqlite::types::Type::Text,
            Box::new(error),
        )
    })?;

    Ok(RequestRecord {
        id: row.get(0)?,
        platform: row.get(1)?,
        title: row.get(2)?,
        normalized_title: row.get(3)?,
        details: row.get(4)?,
        status,
        created_unix_ms: row.get::<_, i64>(6)? as u64,
        resolved_unix_ms: row.get::<_, Option<i64>>(7)?.map(|value| value as u64),
        fulfillment_source,
        external_ref: row.get(9)?,
        external_ref_stale: row.get::<_, i64>(10)? != 0,
        metadata,
        requesters: Vec::new(),
        admin_notes,
    })
}

fn encode_metadata(metadata: &Option<RequestMetadata>) -> RequestResult<Option<String>> {
    match metadata {
        Some(metadata) => Ok(Some(serde_json::to_string(metadata)?)),
        None => Ok(None),
    }
}
