//! Message timeline of the open room.
//!
//! Three independently timed inputs feed the list: page fetches, optimistic
//! sends awaiting confirmation, and push notifications from other clients.
//! Every mutation is applied to the state as it is at that moment (never to
//! a snapshot taken before an await) and is followed by deduplication and a
//! full-entry write to the cache.
//!
//! Page-0 reloads are ticketed. A reload that completes after a newer one was
//! issued is dropped, and inserts that landed while the newest reload was in
//! flight are carried over its result together with in-flight placeholders.

use log::{debug, warn};
use scopeguard::ScopeGuard;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use synccore::dedupe::dedupe_in_place;
use synccore::events::{ChangeEvent, Channel, EventKind, EventMask, Table};
use synccore::store::CacheScope;
use synccore::types::{Message, MessageKind, NewMessage, SenderProfile};
use tokio::sync::watch;

use crate::client::Client;
use crate::dispatch::Dispatcher;
use crate::error::{Result, SyncError};
use crate::store::PersistentCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineStatus {
    Closed,
    Loading,
    Ready,
    LoadingMore,
}

#[derive(Debug, Clone)]
pub struct TimelineSnapshot {
    pub room_id: Option<String>,
    pub status: TimelineStatus,
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub pending_sends: usize,
    pub last_error: Option<String>,
}

struct TimelineState {
    room_id: Option<String>,
    // Bumped on every open/close; async results carry the generation they
    // started under and are dropped on mismatch.
    generation: u64,
    messages: Vec<Message>,
    has_more: bool,
    last_error: Option<String>,
    reload_seq: u64,
    reload_pending: bool,
    arrived_during_reload: Vec<String>,
    loading_more: bool,
    in_flight_sends: HashSet<String>,
    last_marked: Option<(String, usize)>,
    dispatcher: Option<Dispatcher>,
}

impl TimelineState {
    fn status(&self) -> TimelineStatus {
        if self.room_id.is_none() {
            TimelineStatus::Closed
        } else if self.reload_pending {
            TimelineStatus::Loading
        } else if self.loading_more {
            TimelineStatus::LoadingMore
        } else {
            TimelineStatus::Ready
        }
    }

    fn snapshot(&self) -> TimelineSnapshot {
        TimelineSnapshot {
            room_id: self.room_id.clone(),
            status: self.status(),
            messages: self.messages.clone(),
            has_more: self.has_more,
            pending_sends: self.in_flight_sends.len(),
            last_error: self.last_error.clone(),
        }
    }

    fn reset(&mut self, room_id: Option<String>) {
        self.room_id = room_id;
        self.generation += 1;
        self.messages.clear();
        self.has_more = true;
        self.last_error = None;
        self.reload_pending = false;
        self.arrived_during_reload.clear();
        self.loading_more = false;
        self.in_flight_sends.clear();
        self.dispatcher = None;
    }

    fn current(&self, generation: u64) -> bool {
        self.generation == generation && self.room_id.is_some()
    }
}

/// Captured identity of an operation in flight.
struct OpScope {
    room_id: String,
    generation: u64,
}

enum PageKind {
    Reload { ticket: u64 },
    Older,
}

pub struct MessageTimeline {
    client: Arc<Client>,
    state: Mutex<TimelineState>,
    updates: watch::Sender<TimelineSnapshot>,
}

impl MessageTimeline {
    pub(crate) fn new(client: Arc<Client>) -> Arc<Self> {
        let state = TimelineState {
            room_id: None,
            generation: 0,
            messages: Vec::new(),
            has_more: true,
            last_error: None,
            reload_seq: 0,
            reload_pending: false,
            arrived_during_reload: Vec::new(),
            loading_more: false,
            in_flight_sends: HashSet::new(),
            last_marked: None,
            dispatcher: None,
        };
        let (updates, _) = watch::channel(state.snapshot());
        Arc::new(Self {
            client,
            state: Mutex::new(state),
            updates,
        })
    }

    fn state(&self) -> MutexGuard<'_, TimelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &TimelineState) {
        self.updates.send_replace(state.snapshot());
    }

    pub fn snapshot(&self) -> TimelineSnapshot {
        self.state().snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<TimelineSnapshot> {
        self.updates.subscribe()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state().messages.clone()
    }

    pub fn room_id(&self) -> Option<String> {
        self.state().room_id.clone()
    }

    pub fn status(&self) -> TimelineStatus {
        self.state().status()
    }

    pub fn has_more(&self) -> bool {
        self.state().has_more
    }

    /// Switches the timeline to `room_id`: resets the list, shows the cached
    /// messages, subscribes to the room's message feed and loads the newest
    /// page. Results still in flight for the previous room are discarded.
    pub async fn open(self: &Arc<Self>, room_id: impl Into<String>) -> Result<()> {
        let room_id = room_id.into();
        let generation = {
            let mut state = self.state();
            state.reset(Some(room_id.clone()));
            self.publish(&state);
            state.generation
        };
        debug!(target: "Timeline", "Opening room {room_id}");

        let scope = CacheScope::Messages(room_id.clone());
        if let Some(cached) = self.client.cache.load::<Vec<Message>>(&scope).await {
            let mut state = self.state();
            if state.current(generation) {
                debug!(target: "Timeline", "Hydrated {} messages for {room_id}", cached.len());
                let local = std::mem::replace(&mut state.messages, cached);
                state.messages.extend(local);
                dedupe_in_place(&mut state.messages);
                self.publish(&state);
            }
        }

        let subscribed = self.attach(&room_id, generation).await;

        self.load_page(0, self.client.config().page_size).await?;
        subscribed
    }

    async fn attach(self: &Arc<Self>, room_id: &str, generation: u64) -> Result<()> {
        let channel = Channel::Messages {
            room_id: Some(room_id.to_string()),
        };
        let subscription = match self.client.subscribe(channel, EventMask::ALL).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(target: "Timeline", "Live updates unavailable for {room_id}: {e}");
                return Err(e);
            }
        };
        let weak = Arc::downgrade(self);
        let dispatcher = Dispatcher::spawn(subscription, move |event| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(timeline) => timeline.handle_event(event).await,
                    None => Ok(()),
                }
            }
        });
        let mut state = self.state();
        if state.current(generation) {
            state.dispatcher = Some(dispatcher);
        }
        Ok(())
    }

    /// Closes the room. Late results for it are discarded.
    pub fn close(&self) {
        let mut state = self.state();
        if let Some(room) = state.room_id.as_deref() {
            debug!(target: "Timeline", "Closing room {room}");
        }
        state.reset(None);
        self.publish(&state);
    }

    /// Fetches one page. Offset 0 replaces the list; a larger offset prepends
    /// older history. Returns the number of fetched messages.
    pub async fn load_page(&self, offset: usize, limit: usize) -> Result<usize> {
        let (op, kind) = {
            let mut state = self.state();
            let op = Self::op_scope(&state)?;
            let kind = Self::begin_page(&mut state, offset);
            self.publish(&state);
            (op, kind)
        };
        self.finish_page(op, kind, offset, limit).await
    }

    /// Loads the next page of older history unless there is none or a load
    /// is already running. The offset is the number of confirmed messages
    /// held, which stays exact because the check and the start of the load
    /// happen under one lock.
    pub async fn load_more(&self) -> Result<usize> {
        let limit = self.client.config().page_size;
        let (op, kind, offset) = {
            let mut state = self.state();
            let op = Self::op_scope(&state)?;
            if !state.has_more || state.loading_more || state.reload_pending {
                return Ok(0);
            }
            let offset = state.messages.iter().filter(|m| !m.pending).count();
            let kind = Self::begin_page(&mut state, offset);
            self.publish(&state);
            (op, kind, offset)
        };
        self.finish_page(op, kind, offset, limit).await
    }

    fn op_scope(state: &TimelineState) -> Result<OpScope> {
        let room_id = state.room_id.clone().ok_or(SyncError::NoRoomOpen)?;
        Ok(OpScope {
            room_id,
            generation: state.generation,
        })
    }

    fn begin_page(state: &mut TimelineState, offset: usize) -> PageKind {
        if offset == 0 {
            state.reload_seq += 1;
            state.reload_pending = true;
            state.arrived_during_reload.clear();
            PageKind::Reload {
                ticket: state.reload_seq,
            }
        } else {
            state.loading_more = true;
            PageKind::Older
        }
    }

    async fn finish_page(
        &self,
        op: OpScope,
        kind: PageKind,
        offset: usize,
        limit: usize,
    ) -> Result<usize> {
        let result = self
            .client
            .query
            .list_messages(&op.room_id, limit, offset)
            .await;

        let (persisted, fetched) = {
            let mut state = self.state();
            if !state.current(op.generation) {
                debug!(target: "Timeline", "Dropping page for closed room {}", op.room_id);
                return Err(SyncError::RoomClosed(op.room_id));
            }

            match kind {
                PageKind::Reload { ticket } if ticket != state.reload_seq => {
                    debug!(target: "Timeline", "Reload {ticket} superseded in {}", op.room_id);
                    return result.map(|page| page.len()).map_err(SyncError::Fetch);
                }
                PageKind::Reload { .. } => state.reload_pending = false,
                PageKind::Older => state.loading_more = false,
            }

            let page = match result {
                Ok(page) => page,
                Err(e) => {
                    warn!(target: "Timeline", "Failed to load page at {offset} for {}: {e}", op.room_id);
                    state.last_error = Some(e.to_string());
                    self.publish(&state);
                    return Err(SyncError::Fetch(e));
                }
            };
            let fetched = page.len();

            let merged = match kind {
                PageKind::Reload { .. } => {
                    let arrived: HashSet<String> =
                        std::mem::take(&mut state.arrived_during_reload)
                            .into_iter()
                            .collect();
                    let carried = state
                        .messages
                        .iter()
                        .filter(|m| {
                            arrived.contains(&m.id)
                                || (m.pending && state.in_flight_sends.contains(&m.id))
                        })
                        .cloned()
                        .collect::<Vec<_>>();
                    let mut list = page;
                    list.extend(carried);
                    list
                }
                PageKind::Older => {
                    let mut list = page;
                    list.append(&mut state.messages);
                    list
                }
            };
            state.messages = merged;
            dedupe_in_place(&mut state.messages);
            state.has_more = fetched == limit;
            state.last_error = None;
            self.publish(&state);
            (state.messages.clone(), fetched)
        };

        self.persist(&op.room_id, &persisted).await;
        self.maybe_mark_read();
        Ok(fetched)
    }

    /// Sends a message optimistically.
    ///
    /// A pending placeholder is shown and persisted immediately. On success it
    /// is replaced in place by the confirmed message, on failure it is
    /// removed and the error returned. If this future is dropped before the
    /// backend answers, the placeholder is removed as well.
    pub async fn send(&self, body: &str, kind: MessageKind) -> Result<Message> {
        let (op, placeholder, snapshot) = {
            let mut state = self.state();
            let op = Self::op_scope(&state)?;
            let placeholder = Message::optimistic(self.client.viewer(), &op.room_id, body, kind);
            state.messages.push(placeholder.clone());
            state.in_flight_sends.insert(placeholder.id.clone());
            self.publish(&state);
            (op, placeholder, state.messages.clone())
        };
        debug!(target: "Timeline", "Sending {} to {}", placeholder.id, op.room_id);

        let guard = scopeguard::guard(placeholder.id.clone(), |id| {
            self.abandon_send(&op, &id);
        });

        self.persist(&op.room_id, &snapshot).await;

        let result = self
            .client
            .mutation
            .send_message(NewMessage {
                room_id: op.room_id.clone(),
                body: body.to_string(),
                kind,
            })
            .await;
        let placeholder_id = ScopeGuard::into_inner(guard);

        match result {
            Ok(mut confirmed) => {
                confirmed.pending = false;
                if confirmed.sender_profile.is_none() {
                    confirmed.sender_profile = placeholder.sender_profile.clone();
                }
                self.resolve_send(&op, &placeholder_id, Some(confirmed.clone()))
                    .await;
                Ok(confirmed)
            }
            Err(e) => {
                warn!(target: "Timeline", "Send to {} failed, rolling back {placeholder_id}: {e}", op.room_id);
                self.resolve_send(&op, &placeholder_id, None).await;
                Err(SyncError::Send(e))
            }
        }
    }

    async fn resolve_send(&self, op: &OpScope, placeholder_id: &str, confirmed: Option<Message>) {
        let snapshot = {
            let mut state = self.state();
            if state.current(op.generation) {
                state.in_flight_sends.remove(placeholder_id);
                // The reload in flight predates this message and would drop it.
                if let Some(message) = confirmed.as_ref().filter(|_| state.reload_pending) {
                    state.arrived_during_reload.push(message.id.clone());
                }
                reconcile(&mut state.messages, placeholder_id, confirmed.clone());
                self.publish(&state);
                Some(state.messages.clone())
            } else {
                None
            }
        };
        match snapshot {
            Some(list) => {
                self.persist(&op.room_id, &list).await;
                self.maybe_mark_read();
            }
            None => {
                reconcile_cached(&self.client.cache, &op.room_id, placeholder_id, confirmed).await
            }
        }
    }

    // Runs when a send is dropped mid-flight: the placeholder must not outlive it.
    fn abandon_send(&self, op: &OpScope, placeholder_id: &str) {
        debug!(target: "Timeline", "Send {placeholder_id} abandoned, removing placeholder");
        let snapshot = {
            let mut state = self.state();
            if state.current(op.generation) {
                state.in_flight_sends.remove(placeholder_id);
                reconcile(&mut state.messages, placeholder_id, None);
                self.publish(&state);
                Some(state.messages.clone())
            } else {
                None
            }
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let cache = self.client.cache.clone();
        let room_id = op.room_id.clone();
        let placeholder_id = placeholder_id.to_string();
        handle.spawn(async move {
            match snapshot {
                Some(list) => {
                    cache
                        .save(&CacheScope::Messages(room_id), &list)
                        .await
                }
                None => reconcile_cached(&cache, &room_id, &placeholder_id, None).await,
            }
        });
    }

    async fn handle_event(self: Arc<Self>, event: ChangeEvent) -> Result<()> {
        let Some(op) = Self::op_scope(&self.state()).ok() else {
            return Ok(());
        };
        if event.room_id() != Some(op.room_id.as_str()) {
            return Ok(());
        }

        match event.kind {
            EventKind::Insert => self.apply_insert(op, &event).await,
            EventKind::Update | EventKind::Delete => {
                debug!(target: "Timeline", "{:?} in {} -> reloading", event.kind, op.room_id);
                let limit = self.client.config().page_size;
                tokio::spawn(async move {
                    if let Err(e) = self.load_page(0, limit).await {
                        warn!(target: "Timeline", "Reload after change failed: {e}");
                    }
                });
                Ok(())
            }
        }
    }

    async fn apply_insert(&self, op: OpScope, event: &ChangeEvent) -> Result<()> {
        let mut message: Message = event.decode(Table::Messages)?;
        if message.sender_id == self.client.viewer_id() {
            // Own sends are reconciled by `send`.
            debug!(target: "Timeline", "Ignoring echo of own message {}", message.id);
            return Ok(());
        }

        if message.sender_profile.is_none() {
            let profile = match self
                .client
                .profiles
                .resolve_sender_profile(&message.sender_id, message.sender_kind)
                .await
            {
                Ok(profile) => profile,
                Err(e) => {
                    warn!(target: "Timeline", "Profile lookup for {} failed: {e}", message.sender_id);
                    SenderProfile::placeholder(&message.sender_id)
                }
            };
            message.sender_profile = Some(profile);
        }
        message.pending = false;

        let snapshot = {
            let mut state = self.state();
            if !state.current(op.generation) {
                return Ok(());
            }
            if state.reload_pending {
                state.arrived_during_reload.push(message.id.clone());
            }
            state.messages.push(message);
            dedupe_in_place(&mut state.messages);
            self.publish(&state);
            state.messages.clone()
        };
        self.persist(&op.room_id, &snapshot).await;
        self.maybe_mark_read();
        Ok(())
    }

    /// Marks the open room read. Fire-and-forget: failures are only logged.
    pub fn mark_read(&self) {
        let room_id = {
            let mut state = self.state();
            let Some(room_id) = state.room_id.clone() else {
                return;
            };
            state.last_marked = Some((room_id.clone(), state.messages.len()));
            room_id
        };
        self.spawn_mark_read(room_id);
    }

    // Marks read only when the room or its message count changed since the
    // last call.
    fn maybe_mark_read(&self) {
        let room_id = {
            let mut state = self.state();
            let Some(room_id) = state.room_id.clone() else {
                return;
            };
            let current = (room_id.clone(), state.messages.len());
            if state.last_marked.as_ref() == Some(&current) {
                return;
            }
            state.last_marked = Some(current);
            room_id
        };
        self.spawn_mark_read(room_id);
    }

    fn spawn_mark_read(&self, room_id: String) {
        let mutation = self.client.mutation.clone();
        let viewer_id = self.client.viewer_id().to_string();
        tokio::spawn(async move {
            if let Err(e) = mutation.mark_read(&room_id, &viewer_id).await {
                warn!(target: "Timeline", "Failed to mark {room_id} read: {e}");
            }
        });
    }

    async fn persist(&self, room_id: &str, messages: &[Message]) {
        self.client
            .cache
            .save(&CacheScope::Messages(room_id.to_string()), messages)
            .await;
    }
}

/// Replaces (or, with `None`, removes) the entry keyed by `placeholder_id`.
/// A confirmation whose placeholder is gone is appended; deduplication keeps
/// any copy of it already present.
fn reconcile(messages: &mut Vec<Message>, placeholder_id: &str, confirmed: Option<Message>) {
    match (messages.iter().position(|m| m.id == placeholder_id), confirmed) {
        (Some(i), Some(confirmed)) => messages[i] = confirmed,
        (Some(i), None) => {
            messages.remove(i);
        }
        (None, Some(confirmed)) => messages.push(confirmed),
        (None, None) => {}
    }
    dedupe_in_place(messages);
}

// Resolution of a send whose room is no longer open: fix its cache entry.
async fn reconcile_cached(
    cache: &PersistentCache,
    room_id: &str,
    placeholder_id: &str,
    confirmed: Option<Message>,
) {
    let scope = CacheScope::Messages(room_id.to_string());
    let Some(mut cached) = cache.load::<Vec<Message>>(&scope).await else {
        return;
    };
    reconcile(&mut cached, placeholder_id, confirmed);
    cache.save(&scope, &cached).await;
}
