//! Contracts of the hosted backend the sync core talks to.
//!
//! The platform layer drives these; the backend session behind them already
//! knows who is signed in, so only `viewer_id` arguments that the backend API
//! itself takes are passed explicitly.

use async_trait::async_trait;

use crate::types::{Message, NewMessage, Room, SenderKind, SenderProfile};

#[async_trait]
pub trait QueryApi: Send + Sync {
    /// Every room `viewer_id` belongs to.
    async fn list_rooms(&self, viewer_id: &str) -> Result<Vec<Room>, anyhow::Error>;

    /// One page of a room's history, oldest first. `offset` counts back from
    /// the newest message; soft-deleted messages are not returned.
    async fn list_messages(
        &self,
        room_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, anyhow::Error>;

    async fn unread_count(&self, viewer_id: &str) -> Result<u64, anyhow::Error>;
}

#[async_trait]
pub trait MutationApi: Send + Sync {
    async fn send_message(&self, message: NewMessage) -> Result<Message, anyhow::Error>;

    async fn mark_read(&self, room_id: &str, viewer_id: &str) -> Result<(), anyhow::Error>;

    async fn set_typing(
        &self,
        room_id: &str,
        viewer_id: &str,
        is_typing: bool,
    ) -> Result<(), anyhow::Error>;
}

/// Resolves the denormalized profile that push-delivered rows lack.
#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn resolve_sender_profile(
        &self,
        sender_id: &str,
        kind: SenderKind,
    ) -> Result<SenderProfile, anyhow::Error>;
}
