//! Persisted outbound sync queue with bounded retries.
//!
//! Every queued push carries its attempt count and next-attempt time; when
//! the retry budget is exhausted the entry is kept in a `gave_up` state so
//! reconciliation stays an explicit, bounded policy rather than an
//! open-ended background loop.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use shelf_core::write_text_atomic;

use crate::tracker_transport::retry_delay_ms;

const TRACKER_SYNC_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy)]
/// Bounded retry policy for outbound pushes.
pub struct TrackerRetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for TrackerRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// What kind of push a queue entry represents.
pub enum OutboundSyncKind {
    Create,
    StatusUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// One queued outbound push for a local request.
pub struct OutboundSyncEntry {
    pub kind: OutboundSyncKind,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub gave_up: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub next_attempt_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrackerSyncState {
    schema_version: u32,
    #[serde(default)]
    entries: BTreeMap<i64, OutboundSyncEntry>,
}

impl Default for TrackerSyncState {
    fn default() -> Self {
        Self {
            schema_version: TRACKER_SYNC_SCHEMA_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

/// File-backed store for the outbound sync queue.
pub struct TrackerSyncStateStore {
    path: PathBuf,
    state: TrackerSyncState,
}

impl TrackerSyncStateStore {
    /// Loads the persisted queue, starting fresh on parse failure or a
    /// schema mismatch rather than refusing to run.
    pub fn load(path: PathBuf) -> Result<Self> {
        let mut state = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read sync state file {}", path.display()))?;
            match serde_json::from_str::<TrackerSyncState>(&raw) {
                Ok(state) => state,
                Err(error) => {
                    warn!(
                        path = %path.display(),
                        %error,
                        "failed to parse tracker sync state; starting fresh"
                    );
                    TrackerSyncState::default()
                }
            }
        } else {
            TrackerSyncState::default()
        };

        if state.schema_version != TRACKER_SYNC_SCHEMA_VERSION {
            warn!(
                expected = TRACKER_SYNC_SCHEMA_VERSION,
                found = state.schema_version,
                "unsupported tracker sync state schema; starting fresh"
            );
            state = TrackerSyncState::default();
        }

        Ok(Self { path, state })
    }

    /// Queues a creation push. An existing entry for the id is kept (its
    /// attempt history still applies).
    pub fn enqueue_create(&mut self, request_id: i64) -> Result<()> {
        self.state
            .entries
            .entry(request_id)
            .or_insert(OutboundSyncEntry {
                kind: OutboundSyncKind::Create,
                status: None,
                note: None,
                attempts: 0,
                gave_up: false,
                last_error: None,
                next_attempt_unix_ms: 0,
            });
        self.persist()
    }

    /// Queues a status-update push, replacing any queued entry for the id:
    /// the terminal status supersedes a still-unpushed creation.
    pub fn enqueue_status_update(
        &mut self,
        request_id: i64,
        status: &str,
        note: Option<&str>,
    ) -> Result<()> {
        self.state.entries.insert(
            request_id,
            OutboundSyncEntry {
                kind: OutboundSyncKind::StatusUpdate,
                status: Some(status.to_string()),
                note: note.map(ToOwned::to_owned),
                attempts: 0,
                gave_up: false,
                last_error: None,
                next_attempt_unix_ms: 0,
            },
        );
        self.persist()
    }

    /// Entries whose next attempt is due and that still have retry budget.
    pub fn entries_due(&self, now_unix_ms: u64) -> Vec<(i64, OutboundSyncEntry)> {
        self.state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.gave_up && entry.next_attempt_unix_ms <= now_unix_ms)
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    pub fn record_success(&mut self, request_id: i64) -> Result<()> {
        self.state.entries.remove(&request_id);
        self.persist()
    }

    /// Records a failed attempt; returns true when the entry just exhausted
    /// its retry budget.
    pub fn record_failure(
        &mut self,
        request_id: i64,
        error: &str,
        now_unix_ms: u64,
        policy: TrackerRetryPolicy,
    ) -> Result<bool> {
        let mut exhausted = false;
        if let Some(entry) = self.state.entries.get_mut(&request_id) {
            entry.attempts = entry.attempts.saturating_add(1);
            entry.last_error = Some(error.to_string());
            if entry.attempts >= policy.max_attempts {
                entry.gave_up = true;
                exhausted = true;
            } else {
                entry.next_attempt_unix_ms =
                    now_unix_ms.saturating_add(retry_delay_ms(policy.base_delay_ms, entry.attempts));
            }
        }
        self.persist()?;
        Ok(exhausted)
    }

    /// Drops an entry that can never be delivered (for example a status
    /// update whose request lost its remote link).
    pub fn discard(&mut self, request_id: i64) -> Result<()> {
        self.state.entries.remove(&request_id);
        self.persist()
    }

    pub fn gave_up_ids(&self) -> Vec<i64> {
        self.state
            .entries
            .iter()
            .filter(|(_, entry)| entry.gave_up)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.entries.is_empty()
    }

    fn persist(&self) -> Result<()> {
        let encoded = serde_json::to_string_pretty(&self.state)
            .context("failed to encode tracker sync state")?;
        write_text_atomic(&self.path, &encoded)
    }
}
