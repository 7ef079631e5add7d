use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::MessagePreview;
use super::profile::SenderKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMember {
    pub user_id: String,
    pub kind: SenderKind,
    pub joined_at: DateTime<Utc>,
}

/// A chat room the viewer belongs to. Always replaced wholesale on refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub members: Vec<RoomMember>,
    #[serde(default)]
    pub last_message: Option<MessagePreview>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Room {
    pub fn has_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m.user_id == user_id)
    }
}
