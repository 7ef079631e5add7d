pub mod error;
pub mod traits;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a cache entry holds: the room list, or one room's messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheScope {
    Rooms,
    Messages(String),
}

impl CacheScope {
    /// Backend key for this scope, namespaced by viewer so accounts sharing a
    /// device never read each other's entries.
    pub fn key_for(&self, viewer_id: &str) -> String {
        match self {
            CacheScope::Rooms => format!("{}{viewer_id}/rooms", Self::PREFIX),
            CacheScope::Messages(room) => format!("{}{viewer_id}/messages/{room}", Self::PREFIX),
        }
    }

    /// Common prefix of every key belonging to `viewer_id`.
    pub fn viewer_prefix(viewer_id: &str) -> String {
        format!("{}{viewer_id}/", Self::PREFIX)
    }

    const PREFIX: &'static str = "chat/";
}

impl std::fmt::Display for CacheScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheScope::Rooms => f.write_str("rooms"),
            CacheScope::Messages(room) => write!(f, "messages/{room}"),
        }
    }
}

/// Persisted payload plus the time it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub written_at: DateTime<Utc>,
    pub data: T,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T) -> Self {
        Self {
            written_at: Utc::now(),
            data,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        now.signed_duration_since(self.written_at) > retention
    }
}

/// Just the header of an entry, for sweeping without decoding payloads.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheEntryHeader {
    pub written_at: DateTime<Utc>,
}
