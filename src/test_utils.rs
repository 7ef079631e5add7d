use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use synccore::events::{ChangeEvent, Channel, EventMask};
use synccore::net::{MutationApi, ProfileLookup, QueryApi};
use synccore::types::{
    Message, MessageKind, NewMessage, Room, RoomMember, SenderKind, SenderProfile, Viewer,
};
use tokio::sync::{Semaphore, oneshot};

use crate::client::Client;
use crate::config::SyncConfig;
use crate::store::{CacheBackend, MemoryCacheBackend};
use crate::transport::mock::MockTransport;
use crate::transport::{PushTransport, Subscription};

pub const VIEWER_ID: &str = "viewer";

pub fn viewer() -> Viewer {
    Viewer::new(
        SenderProfile::new(VIEWER_ID, "Vera", "Viewer").with_email("vera@example.com"),
        SenderKind::Manager,
    )
}

pub fn room(id: &str) -> Room {
    Room {
        id: id.to_string(),
        name: format!("Room {id}"),
        description: None,
        avatar_url: None,
        members: vec![RoomMember {
            user_id: VIEWER_ID.to_string(),
            kind: SenderKind::Manager,
            joined_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }],
        last_message: None,
        last_activity_at: None,
    }
}

/// A confirmed message whose `created_at` grows with `seq`.
pub fn message(id: &str, room_id: &str, sender_id: &str, seq: i64) -> Message {
    Message {
        id: id.to_string(),
        room_id: room_id.to_string(),
        sender_id: sender_id.to_string(),
        sender_kind: SenderKind::Tenant,
        body: format!("body of {id}"),
        kind: MessageKind::Text,
        created_at: Utc.timestamp_opt(1_700_000_000 + seq, 0).unwrap(),
        edited: false,
        edited_at: None,
        deleted_at: None,
        reply_to: None,
        file: None,
        reactions: Default::default(),
        sender_profile: None,
        pending: false,
    }
}

pub fn history(room_id: &str, count: usize) -> Vec<Message> {
    (0..count)
        .map(|i| message(&format!("m{i:03}"), room_id, "tenant-1", i as i64))
        .collect()
}

pub fn ids(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.id.clone()).collect()
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `cond` until it holds, yielding to spawned tasks in between.
pub async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

pub fn test_client(backend: &Arc<ScriptedBackend>) -> Arc<Client> {
    test_client_with_cache(backend, Arc::new(MemoryCacheBackend::new()))
}

pub fn test_client_with_cache(
    backend: &Arc<ScriptedBackend>,
    cache: Arc<dyn CacheBackend>,
) -> Arc<Client> {
    build_client(backend, cache, SyncConfig::default())
}

pub fn test_client_with_config(backend: &Arc<ScriptedBackend>, config: SyncConfig) -> Arc<Client> {
    build_client(backend, Arc::new(MemoryCacheBackend::new()), config)
}

fn build_client(
    backend: &Arc<ScriptedBackend>,
    cache: Arc<dyn CacheBackend>,
    config: SyncConfig,
) -> Arc<Client> {
    init_logging();
    Client::builder(viewer())
        .with_backend(backend.clone())
        .with_cache_backend(cache)
        .with_config(config)
        .build()
        .expect("test client should build")
}

/// Backend whose answers, failures and timing tests control directly.
#[derive(Default)]
pub struct ScriptedBackend {
    transport: MockTransport,
    rooms: Mutex<Vec<Room>>,
    history: Mutex<HashMap<String, Vec<Message>>>,
    profiles: Mutex<HashMap<String, SenderProfile>>,
    unread: AtomicU64,
    fail_fetches: AtomicBool,
    fail_sends: AtomicBool,
    fail_profiles: AtomicBool,
    fail_subscribes: AtomicBool,
    list_rooms_calls: AtomicUsize,
    list_messages_calls: AtomicUsize,
    unread_calls: AtomicUsize,
    send_seq: AtomicUsize,
    mark_read_calls: Mutex<Vec<String>>,
    typing_calls: Mutex<Vec<bool>>,
    holding_fetches: AtomicBool,
    held_fetches: Mutex<Vec<Option<oneshot::Sender<()>>>>,
    send_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn emit(&self, event: ChangeEvent) {
        self.transport.emit(event).await;
    }

    pub fn subscriber_count(&self) -> usize {
        self.transport.subscriber_count()
    }

    pub fn set_rooms(&self, rooms: Vec<Room>) {
        *self.rooms.lock().unwrap() = rooms;
    }

    /// Full history of a room, oldest first.
    pub fn set_history(&self, room_id: &str, messages: Vec<Message>) {
        self.history
            .lock()
            .unwrap()
            .insert(room_id.to_string(), messages);
    }

    pub fn push_history(&self, message: Message) {
        self.history
            .lock()
            .unwrap()
            .entry(message.room_id.clone())
            .or_default()
            .push(message);
    }

    pub fn remove_history(&self, room_id: &str, message_id: &str) {
        if let Some(list) = self.history.lock().unwrap().get_mut(room_id) {
            list.retain(|m| m.id != message_id);
        }
    }

    pub fn set_profile(&self, profile: SenderProfile) {
        self.profiles
            .lock()
            .unwrap()
            .insert(profile.id.clone(), profile);
    }

    pub fn set_unread(&self, count: u64) {
        self.unread.store(count, Ordering::SeqCst);
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_profiles(&self, fail: bool) {
        self.fail_profiles.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscribes(&self, fail: bool) {
        self.fail_subscribes.store(fail, Ordering::SeqCst);
    }

    /// Parks every query after it has read its answer, so each parked call
    /// returns data as of its start. Calls are released individually by the
    /// order in which they were parked.
    pub fn hold_fetches(&self) {
        self.holding_fetches.store(true, Ordering::SeqCst);
    }

    pub fn held_fetches(&self) -> usize {
        self.held_fetches.lock().unwrap().len()
    }

    pub fn release_fetch(&self, index: usize) {
        let slot = self.held_fetches.lock().unwrap()[index].take();
        if let Some(tx) = slot {
            let _ = tx.send(());
        }
    }

    pub fn release_all_fetches(&self) {
        self.holding_fetches.store(false, Ordering::SeqCst);
        for slot in self.held_fetches.lock().unwrap().iter_mut() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(());
            }
        }
    }

    pub fn hold_sends(&self) {
        *self.send_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_sends(&self, n: usize) {
        if let Some(gate) = self.send_gate.lock().unwrap().as_ref() {
            gate.add_permits(n);
        }
    }

    pub fn list_rooms_calls(&self) -> usize {
        self.list_rooms_calls.load(Ordering::SeqCst)
    }

    pub fn list_messages_calls(&self) -> usize {
        self.list_messages_calls.load(Ordering::SeqCst)
    }

    pub fn unread_calls(&self) -> usize {
        self.unread_calls.load(Ordering::SeqCst)
    }

    pub fn mark_read_calls(&self) -> Vec<String> {
        self.mark_read_calls.lock().unwrap().clone()
    }

    pub fn typing_calls(&self) -> Vec<bool> {
        self.typing_calls.lock().unwrap().clone()
    }

    async fn park_fetch(&self) {
        if !self.holding_fetches.load(Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        self.held_fetches.lock().unwrap().push(Some(tx));
        let _ = rx.await;
    }

    async fn pass(gate: &Mutex<Option<Arc<Semaphore>>>) {
        let gate = gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }
    }
}

#[async_trait]
impl QueryApi for ScriptedBackend {
    async fn list_rooms(&self, _viewer_id: &str) -> Result<Vec<Room>, anyhow::Error> {
        self.list_rooms_calls.fetch_add(1, Ordering::SeqCst);
        let rooms = self.rooms.lock().unwrap().clone();
        self.park_fetch().await;
        if self.fail_fetches.load(Ordering::SeqCst) {
            anyhow::bail!("rooms query failed");
        }
        Ok(rooms)
    }

    async fn list_messages(
        &self,
        room_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, anyhow::Error> {
        self.list_messages_calls.fetch_add(1, Ordering::SeqCst);
        let page = {
            let history = self.history.lock().unwrap();
            let all = history.get(room_id).map(Vec::as_slice).unwrap_or_default();
            let end = all.len().saturating_sub(offset);
            let start = end.saturating_sub(limit);
            all[start..end].to_vec()
        };
        self.park_fetch().await;
        if self.fail_fetches.load(Ordering::SeqCst) {
            anyhow::bail!("messages query failed");
        }
        Ok(page)
    }

    async fn unread_count(&self, _viewer_id: &str) -> Result<u64, anyhow::Error> {
        self.unread_calls.fetch_add(1, Ordering::SeqCst);
        let count = self.unread.load(Ordering::SeqCst);
        self.park_fetch().await;
        if self.fail_fetches.load(Ordering::SeqCst) {
            anyhow::bail!("unread query failed");
        }
        Ok(count)
    }
}

#[async_trait]
impl MutationApi for ScriptedBackend {
    async fn send_message(&self, new: NewMessage) -> Result<Message, anyhow::Error> {
        Self::pass(&self.send_gate).await;
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("insert rejected");
        }
        let n = self.send_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut confirmed = message(&format!("s{n}"), &new.room_id, VIEWER_ID, 10_000 + n as i64);
        confirmed.body = new.body;
        confirmed.kind = new.kind;
        confirmed.sender_kind = SenderKind::Manager;
        self.push_history(confirmed.clone());
        Ok(confirmed)
    }

    async fn mark_read(&self, room_id: &str, _viewer_id: &str) -> Result<(), anyhow::Error> {
        self.mark_read_calls.lock().unwrap().push(room_id.to_string());
        Ok(())
    }

    async fn set_typing(
        &self,
        _room_id: &str,
        _viewer_id: &str,
        is_typing: bool,
    ) -> Result<(), anyhow::Error> {
        self.typing_calls.lock().unwrap().push(is_typing);
        Ok(())
    }
}

#[async_trait]
impl ProfileLookup for ScriptedBackend {
    async fn resolve_sender_profile(
        &self,
        sender_id: &str,
        _kind: SenderKind,
    ) -> Result<SenderProfile, anyhow::Error> {
        if self.fail_profiles.load(Ordering::SeqCst) {
            anyhow::bail!("profile service unavailable");
        }
        self.profiles
            .lock()
            .unwrap()
            .get(sender_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no profile for {sender_id}"))
    }
}

#[async_trait]
impl PushTransport for ScriptedBackend {
    async fn subscribe(
        &self,
        channel: Channel,
        mask: EventMask,
    ) -> Result<Subscription, anyhow::Error> {
        if self.fail_subscribes.load(Ordering::SeqCst) {
            anyhow::bail!("push channel {channel} refused");
        }
        self.transport.subscribe(channel, mask).await
    }
}
