//! Row-change notifications delivered by the push transport.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

/// Backend tables the sync core watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Rooms,
    RoomMembers,
    Messages,
    TypingIndicators,
    ReadMarkers,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Rooms => "rooms",
            Table::RoomMembers => "room_members",
            Table::Messages => "messages",
            Table::TypingIndicators => "typing_indicators",
            Table::ReadMarkers => "read_markers",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which event kinds a subscription wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventMask {
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
}

impl EventMask {
    pub const ALL: Self = Self {
        insert: true,
        update: true,
        delete: true,
    };
    pub const INSERT: Self = Self {
        insert: true,
        update: false,
        delete: false,
    };

    pub fn contains(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Insert => self.insert,
            EventKind::Update => self.update,
            EventKind::Delete => self.delete,
        }
    }
}

/// A subscription scope. One subscription exists per (room, concern) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Rooms,
    Memberships,
    /// Messages in one room, or in every room when `room_id` is `None`.
    Messages { room_id: Option<String> },
    Typing { room_id: String },
    ReadMarkers,
}

impl Channel {
    pub fn table(&self) -> Table {
        match self {
            Channel::Rooms => Table::Rooms,
            Channel::Memberships => Table::RoomMembers,
            Channel::Messages { .. } => Table::Messages,
            Channel::Typing { .. } => Table::TypingIndicators,
            Channel::ReadMarkers => Table::ReadMarkers,
        }
    }

    fn room_filter(&self) -> Option<&str> {
        match self {
            Channel::Messages { room_id } => room_id.as_deref(),
            Channel::Typing { room_id } => Some(room_id),
            _ => None,
        }
    }

    /// Whether an event on the wire belongs to this channel.
    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table() {
            return false;
        }
        match self.room_filter() {
            Some(room) => event.room_id() == Some(room),
            None => true,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.room_filter() {
            Some(room) => write!(f, "{}:{}", self.table(), room),
            None => write!(f, "{}", self.table()),
        }
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("unexpected table {actual}, expected {expected}")]
    WrongTable { expected: Table, actual: Table },
    #[error("row is missing field `{0}`")]
    MissingField(&'static str),
    #[error("malformed {table} row: {source}")]
    Malformed {
        table: Table,
        #[source]
        source: serde_json::Error,
    },
}

/// One insert/update/delete on a watched table. For deletes `row` carries the
/// removed record's identifying columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: EventKind,
    pub table: Table,
    pub row: serde_json::Value,
}

impl ChangeEvent {
    pub fn new(kind: EventKind, table: Table, row: serde_json::Value) -> Self {
        Self { kind, table, row }
    }

    pub fn room_id(&self) -> Option<&str> {
        self.str_field("room_id")
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.row.get(name).and_then(|v| v.as_str())
    }

    pub fn require_str(&self, name: &'static str) -> Result<&str, EventError> {
        self.str_field(name).ok_or(EventError::MissingField(name))
    }

    /// Decodes the row as `T`, checking it came from `table`.
    pub fn decode<T: DeserializeOwned>(&self, table: Table) -> Result<T, EventError> {
        if self.table != table {
            return Err(EventError::WrongTable {
                expected: table,
                actual: self.table,
            });
        }
        serde_json::from_value(self.row.clone()).map_err(|source| EventError::Malformed {
            table: self.table,
            source,
        })
    }
}
