//! The list of rooms the viewer belongs to.
//!
//! Rooms are never patched: room changes, membership changes and new
//! messages anywhere all trigger a full refetch, because a new message alters
//! the room's last-message summary and rebuilding that from a partial payload
//! costs more than refetching.

use log::{debug, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use synccore::events::{ChangeEvent, Channel, EventMask};
use synccore::store::CacheScope;
use synccore::types::Room;
use tokio::sync::watch;

use crate::client::Client;
use crate::dispatch::Dispatcher;
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryStatus {
    Idle,
    Loading,
    Ready,
    Error,
}

#[derive(Debug, Clone)]
pub struct DirectorySnapshot {
    pub status: DirectoryStatus,
    pub rooms: Vec<Room>,
    pub last_error: Option<String>,
}

struct DirectoryState {
    rooms: Vec<Room>,
    status: DirectoryStatus,
    last_error: Option<String>,
    // Only the most recently issued refresh may apply its result.
    refresh_seq: u64,
    dispatchers: Vec<Dispatcher>,
}

impl DirectoryState {
    fn snapshot(&self) -> DirectorySnapshot {
        DirectorySnapshot {
            status: self.status,
            rooms: self.rooms.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

pub struct RoomDirectory {
    client: Arc<Client>,
    state: Mutex<DirectoryState>,
    updates: watch::Sender<DirectorySnapshot>,
}

impl RoomDirectory {
    pub(crate) fn new(client: Arc<Client>) -> Arc<Self> {
        let state = DirectoryState {
            rooms: Vec::new(),
            status: DirectoryStatus::Idle,
            last_error: None,
            refresh_seq: 0,
            dispatchers: Vec::new(),
        };
        let (updates, _) = watch::channel(state.snapshot());
        Arc::new(Self {
            client,
            state: Mutex::new(state),
            updates,
        })
    }

    fn state(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &DirectoryState) {
        self.updates.send_replace(state.snapshot());
    }

    pub fn snapshot(&self) -> DirectorySnapshot {
        self.state().snapshot()
    }

    /// Receives a new snapshot after every state transition.
    pub fn watch(&self) -> watch::Receiver<DirectorySnapshot> {
        self.updates.subscribe()
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.state().rooms.clone()
    }

    pub fn status(&self) -> DirectoryStatus {
        self.state().status
    }

    /// Loads the cached room list. Returns whether the cache had one.
    ///
    /// A cached list only fills an untouched directory; it never overrides
    /// data that already came from the network.
    pub async fn hydrate(&self) -> bool {
        let Some(rooms) = self
            .client
            .cache
            .load::<Vec<Room>>(&CacheScope::Rooms)
            .await
        else {
            return false;
        };
        let mut state = self.state();
        if state.status != DirectoryStatus::Idle || state.refresh_seq != 0 {
            return false;
        }
        debug!(target: "Rooms", "Hydrated {} rooms from cache", rooms.len());
        state.rooms = rooms;
        state.status = DirectoryStatus::Ready;
        self.publish(&state);
        true
    }

    /// Refetches every room of the viewer and replaces the list wholesale.
    ///
    /// On failure the previous rooms stay in place and the error flag is set.
    pub async fn refresh(&self) -> Result<()> {
        let ticket = {
            let mut state = self.state();
            state.refresh_seq += 1;
            state.status = DirectoryStatus::Loading;
            self.publish(&state);
            state.refresh_seq
        };

        let result = self.client.query.list_rooms(self.client.viewer_id()).await;

        let rooms = {
            let mut state = self.state();
            if state.refresh_seq != ticket {
                debug!(target: "Rooms", "Refresh {ticket} superseded, dropping its result");
                return result.map(|_| ()).map_err(SyncError::Fetch);
            }
            match result {
                Ok(rooms) => {
                    state.rooms = rooms;
                    state.status = DirectoryStatus::Ready;
                    state.last_error = None;
                    self.publish(&state);
                    state.rooms.clone()
                }
                Err(e) => {
                    warn!(target: "Rooms", "Failed to refresh rooms: {e}");
                    state.status = DirectoryStatus::Error;
                    state.last_error = Some(e.to_string());
                    self.publish(&state);
                    return Err(SyncError::Fetch(e));
                }
            }
        };

        self.client.cache.save(&CacheScope::Rooms, &rooms).await;
        Ok(())
    }

    /// Hydrates, subscribes to every channel that can change the room list,
    /// then refreshes. The refresh runs even when subscribing fails; that
    /// error is returned afterwards.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.hydrate().await;
        let subscribed = self.attach().await;
        self.refresh().await?;
        subscribed
    }

    async fn attach(self: &Arc<Self>) -> Result<()> {
        let channels = [
            (Channel::Rooms, EventMask::ALL),
            (Channel::Memberships, EventMask::ALL),
            (Channel::Messages { room_id: None }, EventMask::INSERT),
        ];
        let mut dispatchers = Vec::with_capacity(channels.len());
        let mut subscribed = Ok(());
        for (channel, mask) in channels {
            let subscription = match self.client.subscribe(channel, mask).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!(target: "Rooms", "Live room updates unavailable: {e}");
                    subscribed = Err(e);
                    break;
                }
            };
            let weak = Arc::downgrade(self);
            dispatchers.push(Dispatcher::spawn(subscription, move |event| {
                let weak: Weak<Self> = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(directory) => directory.handle_event(event).await,
                        None => Ok(()),
                    }
                }
            }));
        }
        self.state().dispatchers = dispatchers;
        subscribed
    }

    /// Drops every subscription. The room list stays readable.
    pub fn stop(&self) {
        let dispatchers = std::mem::take(&mut self.state().dispatchers);
        drop(dispatchers);
    }

    async fn handle_event(&self, event: ChangeEvent) -> Result<()> {
        debug!(target: "Rooms", "{:?} on {} -> refreshing", event.kind, event.table);
        self.refresh().await
    }
}
