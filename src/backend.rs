//! In-process backend of record.
//!
//! Holds rooms, memberships, messages, read markers and typing rows in memory
//! and publishes a row-change event for every mutation. A [`BackendSession`]
//! binds it to one viewer and implements every collaborator contract the
//! client needs, so several clients can share one backend and observe each
//! other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use rand::RngCore;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use synccore::events::{ChangeEvent, Channel, EventKind, EventMask, Table};
use synccore::net::{MutationApi, ProfileLookup, QueryApi};
use synccore::types::{Message, NewMessage, Room, RoomMember, SenderKind, SenderProfile, Viewer};
use tokio::sync::mpsc;

use crate::config::DEFAULT_SUBSCRIPTION_CAPACITY;
use crate::transport::{PushTransport, Subscription};

#[derive(Default)]
struct Tables {
    rooms: BTreeMap<String, Room>,
    // Oldest first, soft-deleted rows included.
    messages: HashMap<String, Vec<Message>>,
    profiles: HashMap<String, SenderProfile>,
    // (room, user) -> last read
    read_markers: HashMap<(String, String), DateTime<Utc>>,
    typing: HashMap<(String, String), DateTime<Utc>>,
}

impl Tables {
    fn room(&self, room_id: &str) -> anyhow::Result<&Room> {
        self.rooms
            .get(room_id)
            .ok_or_else(|| anyhow::anyhow!("room {room_id} does not exist"))
    }

    fn room_mut(&mut self, room_id: &str) -> anyhow::Result<&mut Room> {
        self.rooms
            .get_mut(room_id)
            .ok_or_else(|| anyhow::anyhow!("room {room_id} does not exist"))
    }

    fn message_mut(&mut self, message_id: &str) -> anyhow::Result<&mut Message> {
        self.messages
            .values_mut()
            .flat_map(|list| list.iter_mut())
            .find(|m| m.id == message_id)
            .ok_or_else(|| anyhow::anyhow!("message {message_id} does not exist"))
    }

    fn member_kind(&self, room_id: &str, user_id: &str) -> anyhow::Result<SenderKind> {
        self.room(room_id)?
            .members
            .iter()
            .find(|m| m.user_id == user_id)
            .map(|m| m.kind)
            .ok_or_else(|| anyhow::anyhow!("{user_id} is not a member of {room_id}"))
    }

    // Rebuilds the denormalized last-message summary of a room.
    fn refresh_summary(&mut self, room_id: &str) {
        let last = self
            .messages
            .get(room_id)
            .and_then(|list| list.iter().rev().find(|m| !m.is_deleted()))
            .map(Message::preview);
        if let Some(room) = self.rooms.get_mut(room_id) {
            if let Some(preview) = &last {
                room.last_activity_at = Some(preview.sent_at);
            }
            room.last_message = last;
        }
    }

    fn with_profile(&self, mut message: Message) -> Message {
        message.sender_profile = self.profiles.get(&message.sender_id).cloned();
        message
    }
}

struct Subscriber {
    id: u64,
    channel: Channel,
    mask: EventMask,
    tx: mpsc::Sender<ChangeEvent>,
}

pub struct MemoryBackend {
    tables: Mutex<Tables>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber: AtomicU64,
    capacity: usize,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_SUBSCRIPTION_CAPACITY)
    }

    /// `capacity` bounds each subscription's buffer; a subscriber that falls
    /// further behind loses events.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            tables: Mutex::new(Tables::default()),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            capacity: capacity.max(1),
        })
    }

    /// Binds a client-facing session to `viewer`, registering its profile.
    pub fn session(self: &Arc<Self>, viewer: &Viewer) -> Arc<BackendSession> {
        self.register_profile(viewer.profile.clone());
        Arc::new(BackendSession {
            backend: self.clone(),
            viewer_id: viewer.id.clone(),
        })
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_profile(&self, profile: SenderProfile) {
        self.tables().profiles.insert(profile.id.clone(), profile);
    }

    pub fn create_room(&self, name: &str, description: Option<&str>) -> Room {
        let room = Room {
            id: new_id("room"),
            name: name.to_string(),
            description: description.map(str::to_string),
            avatar_url: None,
            members: Vec::new(),
            last_message: None,
            last_activity_at: Some(Utc::now()),
        };
        let mut tables = self.tables();
        tables.rooms.insert(room.id.clone(), room.clone());
        debug!(target: "Backend", "Created room {} ({})", room.id, room.name);
        self.publish(EventKind::Insert, Table::Rooms, to_row(&room));
        room
    }

    pub fn add_member(&self, room_id: &str, user_id: &str, kind: SenderKind) -> anyhow::Result<()> {
        let mut tables = self.tables();
        let room = tables.room_mut(room_id)?;
        if room.has_member(user_id) {
            return Ok(());
        }
        let member = RoomMember {
            user_id: user_id.to_string(),
            kind,
            joined_at: Utc::now(),
        };
        room.members.push(member.clone());
        let mut row = to_row(&member);
        row["room_id"] = json!(room_id);
        self.publish(EventKind::Insert, Table::RoomMembers, row);
        Ok(())
    }

    pub fn remove_member(&self, room_id: &str, user_id: &str) -> anyhow::Result<bool> {
        let mut tables = self.tables();
        let room = tables.room_mut(room_id)?;
        let before = room.members.len();
        room.members.retain(|m| m.user_id != user_id);
        if room.members.len() == before {
            return Ok(false);
        }
        self.publish(
            EventKind::Delete,
            Table::RoomMembers,
            json!({ "room_id": room_id, "user_id": user_id }),
        );
        Ok(true)
    }

    /// Posts a message as `sender_id`, who must be a member of the room.
    pub fn post(&self, sender_id: &str, new: NewMessage) -> anyhow::Result<Message> {
        let mut tables = self.tables();
        let sender_kind = tables.member_kind(&new.room_id, sender_id)?;
        let message = Message {
            id: new_id("msg"),
            room_id: new.room_id.clone(),
            sender_id: sender_id.to_string(),
            sender_kind,
            body: new.body,
            kind: new.kind,
            created_at: Utc::now(),
            edited: false,
            edited_at: None,
            deleted_at: None,
            reply_to: None,
            file: None,
            reactions: BTreeMap::new(),
            sender_profile: None,
            pending: false,
        };
        tables
            .messages
            .entry(new.room_id.clone())
            .or_default()
            .push(message.clone());
        tables.refresh_summary(&new.room_id);
        self.publish(EventKind::Insert, Table::Messages, to_row(&message));
        Ok(message)
    }

    pub fn edit_message(&self, message_id: &str, body: &str) -> anyhow::Result<Message> {
        let mut tables = self.tables();
        let message = tables.message_mut(message_id)?;
        if message.is_deleted() {
            anyhow::bail!("message {message_id} was deleted");
        }
        message.body = body.to_string();
        message.edited = true;
        message.edited_at = Some(Utc::now());
        let edited = message.clone();
        tables.refresh_summary(&edited.room_id);
        self.publish(EventKind::Update, Table::Messages, to_row(&edited));
        self.publish_room(&tables, &edited.room_id);
        Ok(edited)
    }

    /// Soft-deletes a message: it stays stored but disappears from pages.
    pub fn delete_message(&self, message_id: &str) -> anyhow::Result<()> {
        let mut tables = self.tables();
        let message = tables.message_mut(message_id)?;
        if message.is_deleted() {
            return Ok(());
        }
        message.deleted_at = Some(Utc::now());
        let room_id = message.room_id.clone();
        tables.refresh_summary(&room_id);
        self.publish(
            EventKind::Delete,
            Table::Messages,
            json!({ "id": message_id, "room_id": room_id }),
        );
        self.publish_room(&tables, &room_id);
        Ok(())
    }

    pub fn react(&self, message_id: &str, symbol: &str) -> anyhow::Result<Message> {
        let mut tables = self.tables();
        let message = tables.message_mut(message_id)?;
        *message.reactions.entry(symbol.to_string()).or_default() += 1;
        let reacted = message.clone();
        self.publish(EventKind::Update, Table::Messages, to_row(&reacted));
        Ok(reacted)
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers();
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.len()
    }

    fn publish_room(&self, tables: &Tables, room_id: &str) {
        if let Some(room) = tables.rooms.get(room_id) {
            self.publish(EventKind::Update, Table::Rooms, to_row(room));
        }
    }

    // Called with the tables lock held so subscribers see events in commit order.
    fn publish(&self, kind: EventKind, table: Table, row: Value) {
        let event = ChangeEvent::new(kind, table, row);
        let mut subscribers = self.subscribers();
        subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in subscribers.iter() {
            if !subscriber.mask.contains(kind) || !subscriber.channel.accepts(&event) {
                continue;
            }
            if let Err(e) = subscriber.tx.try_send(event.clone()) {
                warn!(target: "Backend", "Dropping {kind:?} on {} for subscriber {}: {e}", subscriber.channel, subscriber.id);
            }
        }
    }

    fn register(self: &Arc<Self>, channel: Channel, mask: EventMask) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers().push(Subscriber {
            id,
            channel: channel.clone(),
            mask,
            tx,
        });
        debug!(target: "Backend", "Subscriber {id} joined {channel}");
        let backend: Weak<Self> = Arc::downgrade(self);
        Subscription::new(channel, rx).on_release(move || {
            if let Some(backend) = backend.upgrade() {
                backend.subscribers().retain(|s| s.id != id);
            }
        })
    }
}

/// One viewer's view of a [`MemoryBackend`].
pub struct BackendSession {
    backend: Arc<MemoryBackend>,
    viewer_id: String,
}

impl BackendSession {
    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    fn ensure_self(&self, user_id: &str) -> anyhow::Result<()> {
        if user_id != self.viewer_id {
            anyhow::bail!("session of {} cannot act for {user_id}", self.viewer_id);
        }
        Ok(())
    }
}

#[async_trait]
impl QueryApi for BackendSession {
    async fn list_rooms(&self, viewer_id: &str) -> Result<Vec<Room>, anyhow::Error> {
        self.ensure_self(viewer_id)?;
        let tables = self.backend.tables();
        let mut rooms: Vec<Room> = tables
            .rooms
            .values()
            .filter(|r| r.has_member(viewer_id))
            .cloned()
            .collect();
        rooms.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(rooms)
    }

    async fn list_messages(
        &self,
        room_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, anyhow::Error> {
        let tables = self.backend.tables();
        tables.member_kind(room_id, &self.viewer_id)?;
        let visible: Vec<&Message> = tables
            .messages
            .get(room_id)
            .map(|list| list.iter().filter(|m| !m.is_deleted()).collect())
            .unwrap_or_default();
        let end = visible.len().saturating_sub(offset);
        let start = end.saturating_sub(limit);
        Ok(visible[start..end]
            .iter()
            .map(|m| tables.with_profile((*m).clone()))
            .collect())
    }

    async fn unread_count(&self, viewer_id: &str) -> Result<u64, anyhow::Error> {
        self.ensure_self(viewer_id)?;
        let tables = self.backend.tables();
        let count = tables
            .rooms
            .values()
            .filter(|r| r.has_member(viewer_id))
            .map(|room| {
                let marker = tables
                    .read_markers
                    .get(&(room.id.clone(), viewer_id.to_string()));
                tables
                    .messages
                    .get(&room.id)
                    .map(|list| {
                        list.iter()
                            .filter(|m| !m.is_deleted() && m.sender_id != viewer_id)
                            .filter(|m| marker.is_none_or(|read| m.created_at > *read))
                            .count() as u64
                    })
                    .unwrap_or(0)
            })
            .sum();
        Ok(count)
    }
}

#[async_trait]
impl MutationApi for BackendSession {
    async fn send_message(&self, new: NewMessage) -> Result<Message, anyhow::Error> {
        self.backend.post(&self.viewer_id, new)
    }

    async fn mark_read(&self, room_id: &str, viewer_id: &str) -> Result<(), anyhow::Error> {
        self.ensure_self(viewer_id)?;
        let mut tables = self.backend.tables();
        tables.member_kind(room_id, viewer_id)?;
        let now = Utc::now();
        tables
            .read_markers
            .insert((room_id.to_string(), viewer_id.to_string()), now);
        self.backend.publish(
            EventKind::Insert,
            Table::ReadMarkers,
            json!({ "room_id": room_id, "user_id": viewer_id, "last_read_at": now }),
        );
        Ok(())
    }

    async fn set_typing(
        &self,
        room_id: &str,
        viewer_id: &str,
        is_typing: bool,
    ) -> Result<(), anyhow::Error> {
        self.ensure_self(viewer_id)?;
        let mut tables = self.backend.tables();
        tables.member_kind(room_id, viewer_id)?;
        let key = (room_id.to_string(), viewer_id.to_string());
        if is_typing {
            let now = Utc::now();
            let kind = match tables.typing.insert(key, now) {
                Some(_) => EventKind::Update,
                None => EventKind::Insert,
            };
            self.backend.publish(
                kind,
                Table::TypingIndicators,
                json!({ "room_id": room_id, "user_id": viewer_id, "started_at": now }),
            );
        } else if tables.typing.remove(&key).is_some() {
            self.backend.publish(
                EventKind::Delete,
                Table::TypingIndicators,
                json!({ "room_id": room_id, "user_id": viewer_id }),
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ProfileLookup for BackendSession {
    async fn resolve_sender_profile(
        &self,
        sender_id: &str,
        _kind: SenderKind,
    ) -> Result<SenderProfile, anyhow::Error> {
        self.backend
            .tables()
            .profiles
            .get(sender_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no profile for {sender_id}"))
    }
}

#[async_trait]
impl PushTransport for BackendSession {
    async fn subscribe(
        &self,
        channel: Channel,
        mask: EventMask,
    ) -> Result<Subscription, anyhow::Error> {
        Ok(self.backend.register(channel, mask))
    }
}

fn new_id(prefix: &str) -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    format!("{prefix}_{}", hex::encode(bytes))
}

// Push rows carry the bare table columns, never joined data.
fn to_row<T: Serialize>(value: &T) -> Value {
    let mut row = serde_json::to_value(value).unwrap_or_else(|e| {
        warn!(target: "Backend", "Failed to encode row: {e}");
        Value::Null
    });
    if let Some(fields) = row.as_object_mut() {
        fields.remove("sender_profile");
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use synccore::types::MessageKind;

    fn viewer(id: &str, kind: SenderKind) -> Viewer {
        Viewer::new(SenderProfile::new(id, id, "Test"), kind)
    }

    fn text(room_id: &str, body: &str) -> NewMessage {
        NewMessage {
            room_id: room_id.to_string(),
            body: body.to_string(),
            kind: MessageKind::Text,
        }
    }

    fn seeded() -> (Arc<MemoryBackend>, Room, Arc<BackendSession>, Arc<BackendSession>) {
        let backend = MemoryBackend::new();
        let alice = backend.session(&viewer("alice", SenderKind::Manager));
        let bob = backend.session(&viewer("bob", SenderKind::Tenant));
        let room = backend.create_room("Lobby", None);
        backend.add_member(&room.id, "alice", SenderKind::Manager).unwrap();
        backend.add_member(&room.id, "bob", SenderKind::Tenant).unwrap();
        (backend, room, alice, bob)
    }

    #[tokio::test]
    async fn test_pages_are_newest_last_and_skip_deleted() {
        let (backend, room, alice, _bob) = seeded();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(alice.send_message(text(&room.id, &format!("#{i}"))).await.unwrap().id);
        }
        backend.delete_message(&ids[3]).unwrap();

        let newest = alice.list_messages(&room.id, 2, 0).await.unwrap();
        let bodies: Vec<&str> = newest.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["#2", "#4"]);
        assert!(newest.iter().all(|m| m.sender_profile.is_some()));

        let older = alice.list_messages(&room.id, 2, 2).await.unwrap();
        let bodies: Vec<&str> = older.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["#0", "#1"]);
        assert!(alice.list_messages(&room.id, 2, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_members_cannot_post_or_read() {
        let (backend, room, _alice, _bob) = seeded();
        let carol = backend.session(&viewer("carol", SenderKind::Staff));
        assert!(carol.send_message(text(&room.id, "hi")).await.is_err());
        assert!(carol.list_messages(&room.id, 20, 0).await.is_err());
        assert!(carol.list_rooms("carol").await.unwrap().is_empty());
        assert!(carol.list_rooms("alice").await.is_err());
    }

    #[tokio::test]
    async fn test_unread_follows_read_markers() {
        let (_backend, room, alice, bob) = seeded();
        alice.send_message(text(&room.id, "one")).await.unwrap();
        alice.send_message(text(&room.id, "two")).await.unwrap();
        bob.send_message(text(&room.id, "mine")).await.unwrap();

        assert_eq!(bob.unread_count("bob").await.unwrap(), 2);
        assert_eq!(alice.unread_count("alice").await.unwrap(), 1);

        bob.mark_read(&room.id, "bob").await.unwrap();
        assert_eq!(bob.unread_count("bob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_room_summary_tracks_edits_and_deletes() {
        let (backend, room, alice, _bob) = seeded();
        let first = alice.send_message(text(&room.id, "first")).await.unwrap();
        let second = alice.send_message(text(&room.id, "second")).await.unwrap();

        let summary = |s: &Arc<BackendSession>| {
            let tables = s.backend().tables();
            tables.rooms[&room.id].last_message.clone().map(|p| p.text)
        };
        assert_eq!(summary(&alice).as_deref(), Some("second"));

        backend.edit_message(&second.id, "second!").unwrap();
        assert_eq!(summary(&alice).as_deref(), Some("second!"));

        backend.delete_message(&second.id).unwrap();
        assert_eq!(summary(&alice).as_deref(), Some("first"));
        assert!(backend.edit_message(&second.id, "again").is_err());

        let reacted = backend.react(&first.id, "+1").unwrap();
        assert_eq!(reacted.reactions.get("+1"), Some(&1));
    }

    #[tokio::test]
    async fn test_events_reach_matching_subscribers_only() {
        let (backend, room, alice, bob) = seeded();
        let mut room_feed = alice
            .subscribe(
                Channel::Messages {
                    room_id: Some(room.id.clone()),
                },
                EventMask::ALL,
            )
            .await
            .unwrap();
        let mut inserts_elsewhere = alice
            .subscribe(
                Channel::Messages {
                    room_id: Some("other".into()),
                },
                EventMask::INSERT,
            )
            .await
            .unwrap();

        let sent = bob.send_message(text(&room.id, "hey")).await.unwrap();
        backend.delete_message(&sent.id).unwrap();

        let insert = room_feed.recv().await.unwrap();
        assert_eq!(insert.kind, EventKind::Insert);
        assert_eq!(insert.str_field("id"), Some(sent.id.as_str()));
        assert!(insert.row.get("sender_profile").is_none());
        let delete = room_feed.recv().await.unwrap();
        assert_eq!(delete.kind, EventKind::Delete);

        drop(room_feed);
        assert_eq!(backend.subscriber_count(), 1);
        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(20), inserts_elsewhere.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_typing_rows_are_upserted() {
        let (backend, room, alice, _bob) = seeded();
        let mut feed = alice
            .subscribe(
                Channel::Typing {
                    room_id: room.id.clone(),
                },
                EventMask::ALL,
            )
            .await
            .unwrap();

        alice.set_typing(&room.id, "alice", true).await.unwrap();
        alice.set_typing(&room.id, "alice", true).await.unwrap();
        alice.set_typing(&room.id, "alice", false).await.unwrap();
        alice.set_typing(&room.id, "alice", false).await.unwrap();

        let kinds = [
            feed.recv().await.unwrap().kind,
            feed.recv().await.unwrap().kind,
            feed.recv().await.unwrap().kind,
        ];
        assert_eq!(kinds, [EventKind::Insert, EventKind::Update, EventKind::Delete]);
        assert!(alice.set_typing(&room.id, "bob", true).await.is_err());
        drop(backend);
    }
}
