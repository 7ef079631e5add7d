// Re-export the runtime-agnostic core
pub use synccore::{dedupe, events, net, presence, types};

pub mod backend;
pub mod client;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod store;
pub mod timeline;
pub mod transport;
pub mod typing;
pub mod unread;

#[cfg(test)]
mod test_utils;

pub use backend::{BackendSession, MemoryBackend};
pub use client::{Client, ClientBuilder};
pub use config::SyncConfig;
pub use directory::{DirectorySnapshot, DirectoryStatus, RoomDirectory};
pub use error::SyncError;
pub use timeline::{MessageTimeline, TimelineSnapshot, TimelineStatus};
pub use typing::TypingTracker;
pub use unread::{UnreadCounter, UnreadSnapshot};
