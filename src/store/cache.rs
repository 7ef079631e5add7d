//! Viewer-scoped persistent cache of room lists and message lists.
//!
//! The cache is an optimization, never a source of truth: every failure is
//! logged and swallowed, and `load` reports anything unusable as a miss.

use chrono::Utc;
use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use synccore::store::traits::CacheBackend;
use synccore::store::{CacheEntry, CacheEntryHeader, CacheScope};

#[derive(Clone)]
pub struct PersistentCache {
    backend: Arc<dyn CacheBackend>,
    viewer_id: String,
    retention: chrono::Duration,
}

impl PersistentCache {
    pub fn new(backend: Arc<dyn CacheBackend>, viewer_id: impl Into<String>, retention: Duration) -> Self {
        Self {
            backend,
            viewer_id: viewer_id.into(),
            retention: chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    /// Replaces the entry for `scope` with `data` stamped with the current time.
    pub async fn save<T: Serialize + ?Sized>(&self, scope: &CacheScope, data: &T) {
        let entry = CacheEntry {
            written_at: Utc::now(),
            data,
        };
        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(target: "Cache", "Failed to encode {scope}: {e}");
                return;
            }
        };
        if let Err(e) = self.backend.put(&scope.key_for(&self.viewer_id), bytes).await {
            warn!(target: "Cache", "Failed to persist {scope}: {e}");
        }
    }

    /// Cached data for `scope`, or `None` on a cold, expired or corrupt entry.
    pub async fn load<T: DeserializeOwned>(&self, scope: &CacheScope) -> Option<T> {
        let key = scope.key_for(&self.viewer_id);
        let bytes = match self.backend.get(&key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(target: "Cache", "Failed to read {scope}: {e}");
                return None;
            }
        };
        let entry: CacheEntry<T> = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(target: "Cache", "Discarding corrupt entry {scope}: {e}");
                self.purge(&key).await;
                return None;
            }
        };
        if entry.is_expired(Utc::now(), self.retention) {
            debug!(target: "Cache", "Entry {scope} expired, purging");
            self.purge(&key).await;
            return None;
        }
        Some(entry.data)
    }

    /// Removes every expired or unreadable entry of this viewer. Returns how
    /// many were removed.
    pub async fn sweep(&self) -> usize {
        let keys = match self
            .backend
            .keys(&CacheScope::viewer_prefix(&self.viewer_id))
            .await
        {
            Ok(keys) => keys,
            Err(e) => {
                warn!(target: "Cache", "Sweep could not list entries: {e}");
                return 0;
            }
        };

        let now = Utc::now();
        let mut purged = 0;
        for key in keys {
            let stale = match self.backend.get(&key).await {
                Ok(Some(bytes)) => serde_json::from_slice::<CacheEntryHeader>(&bytes)
                    .map(|h| now.signed_duration_since(h.written_at) > self.retention)
                    .unwrap_or(true),
                Ok(None) => false,
                Err(e) => {
                    warn!(target: "Cache", "Sweep could not read {key}: {e}");
                    false
                }
            };
            if stale {
                self.purge(&key).await;
                purged += 1;
            }
        }
        debug!(target: "Cache", "Sweep removed {purged} entries for {}", self.viewer_id);
        purged
    }

    async fn purge(&self, key: &str) {
        if let Err(e) = self.backend.delete(key).await {
            warn!(target: "Cache", "Failed to purge {key}: {e}");
        }
    }
}
