//! Cache-aside TTL layer over individual request records.
//!
//! The store remains the single source of truth; this cache only absorbs
//! repeated reads of the same record. Every mutation path must invalidate
//! the touched id.

use std::collections::HashMap;
use std::sync::Mutex;

use shelf_core::{current_unix_timestamp_ms, is_expired_unix_ms};

use crate::request_record::RequestRecord;

#[derive(Debug, Clone, Copy)]
pub struct RequestRecordCacheConfig {
    pub ttl_ms: u64,
}

impl Default for RequestRecordCacheConfig {
    fn default() -> Self {
        Self { ttl_ms: 30_000 }
    }
}

struct CacheEntry {
    record: RequestRecord,
    expires_unix_ms: u64,
}

/// TTL cache keyed by request id.
pub struct RequestRecordCache {
    config: RequestRecordCacheConfig,
    entries: Mutex<HashMap<i64, CacheEntry>>,
}

impl RequestRecordCache {
    pub fn new(config: RequestRecordCacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: i64) -> Option<RequestRecord> {
        let now_ms = current_unix_timestamp_ms();
        let mut entries = self.lock();
        match entries.get(&id) {
            Some(entry) if !is_expired_unix_ms(Some(entry.expires_unix_ms), now_ms) => {
                Some(entry.record.clone())
            }
            Some(_) => {
                entries.remove(&id);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, record: RequestRecord) {
        let expires_unix_ms = current_unix_timestamp_ms().saturating_add(self.config.ttl_ms);
        self.lock().insert(
            record.id,
            CacheEntry {
                record,
                expires_unix_ms,
            },
        );
    }

    pub fn invalidate(&self, id: i64) {
        self.lock().remove(&id);
    }

    /// Drops every expired entry; returns how many were evicted.
    pub fn purge_expired(&self) -> usize {
        let now_ms = current_unix_timestamp_ms();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !is_expired_unix_ms(Some(entry.expires_unix_ms), now_ms));
        before - entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, CacheEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
