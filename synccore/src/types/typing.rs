use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ephemeral "user is typing in room" signal. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingSignal {
    pub room_id: String,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
}

impl TypingSignal {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.started_at)
    }
}
