use synccore::events::EventError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetch failed: {0}")]
    Fetch(#[source] anyhow::Error),
    #[error("send failed: {0}")]
    Send(#[source] anyhow::Error),
    #[error("no room is open")]
    NoRoomOpen,
    #[error("room {0} was closed before the operation completed")]
    RoomClosed(String),
    #[error("subscribing to {channel} failed: {source}")]
    Subscribe {
        channel: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("bad push event: {0}")]
    Event(#[from] EventError),
}

pub type Result<T> = std::result::Result<T, SyncError>;
