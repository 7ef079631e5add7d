use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::profile::{SenderKind, SenderProfile, Viewer};

const PLACEHOLDER_PREFIX: &str = "temp-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    System,
}

impl MessageKind {
    fn preview_label(&self) -> Option<&'static str> {
        match self {
            MessageKind::Text | MessageKind::System => None,
            MessageKind::Image => Some("[Image]"),
            MessageKind::File => Some("[File]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// A chat message as shown in a room timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_kind: SenderKind,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub file: Option<FileAttachment>,
    /// Reaction symbol -> count.
    #[serde(default)]
    pub reactions: BTreeMap<String, u32>,
    #[serde(default)]
    pub sender_profile: Option<SenderProfile>,
    /// Set only on optimistic placeholders awaiting confirmation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending: bool,
}

impl Message {
    /// Builds the optimistic placeholder for a send issued by `viewer`.
    pub fn optimistic(viewer: &Viewer, room_id: &str, body: &str, kind: MessageKind) -> Self {
        Self {
            id: next_placeholder_id(),
            room_id: room_id.to_string(),
            sender_id: viewer.id.clone(),
            sender_kind: viewer.kind,
            body: body.to_string(),
            kind,
            created_at: Utc::now(),
            edited: false,
            edited_at: None,
            deleted_at: None,
            reply_to: None,
            file: None,
            reactions: BTreeMap::new(),
            sender_profile: Some(viewer.profile.clone()),
            pending: true,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn preview(&self) -> MessagePreview {
        let text = if self.is_deleted() {
            "Message deleted".to_string()
        } else {
            match (self.kind.preview_label(), self.body.trim()) {
                (Some(label), "") => label.to_string(),
                (Some(label), body) => format!("{label} {body}"),
                (None, body) => body.to_string(),
            }
        };
        MessagePreview {
            message_id: self.id.clone(),
            sender_id: self.sender_id.clone(),
            text,
            sent_at: self.created_at,
        }
    }
}

/// Short last-message summary carried by a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub message_id: String,
    pub sender_id: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// Payload of a send request. The sender is resolved by the backend session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub room_id: String,
    pub body: String,
    pub kind: MessageKind,
}

static PLACEHOLDER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generates a locally unique placeholder id, `temp-<unix millis>-<sequence>`.
pub fn next_placeholder_id() -> String {
    let seq = PLACEHOLDER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "{PLACEHOLDER_PREFIX}{}-{seq}",
        Utc::now().timestamp_millis()
    )
}

pub fn is_placeholder_id(id: &str) -> bool {
    id.starts_with(PLACEHOLDER_PREFIX)
}
