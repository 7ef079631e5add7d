use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Deserialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use synccore::events::{ChangeEvent, Channel, EventKind, EventMask, Table};
use synccore::presence::TypingPresence;
use synccore::types::TypingSignal;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::Client;
use crate::dispatch::Dispatcher;
use crate::error::Result;

// Wire shape of a typing row. Rows without a start time count from arrival.
#[derive(Deserialize)]
struct TypingRow {
    room_id: String,
    user_id: String,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
}

struct TypingState {
    presence: TypingPresence,
    dispatcher: Option<Dispatcher>,
    sweeper: Option<JoinHandle<()>>,
}

/// Tracks who is typing in one room.
///
/// Signals are kept last-write-wins per user in arrival order and expire
/// after the configured liveness window; a periodic sweep drops them even
/// when no further event arrives.
pub struct TypingTracker {
    client: Arc<Client>,
    room_id: String,
    state: Mutex<TypingState>,
    updates: watch::Sender<Vec<TypingSignal>>,
}

impl TypingTracker {
    pub(crate) fn new(client: Arc<Client>, room_id: String) -> Arc<Self> {
        let presence = TypingPresence::new(client.config().typing_liveness);
        let (updates, _) = watch::channel(Vec::new());
        Arc::new(Self {
            client,
            room_id,
            state: Mutex::new(TypingState {
                presence,
                dispatcher: None,
                sweeper: None,
            }),
            updates,
        })
    }

    fn state(&self) -> MutexGuard<'_, TypingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &TypingState) {
        let active = state.presence.active(Utc::now(), self.client.viewer_id());
        self.updates.send_if_modified(|current| {
            if *current == active {
                false
            } else {
                *current = active;
                true
            }
        });
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Live signals of everyone but the viewer, oldest first, ties broken by user id.
    pub fn typing_users(&self) -> Vec<TypingSignal> {
        self.state()
            .presence
            .active(Utc::now(), self.client.viewer_id())
    }

    pub fn watch(&self) -> watch::Receiver<Vec<TypingSignal>> {
        self.updates.subscribe()
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let channel = Channel::Typing {
            room_id: self.room_id.clone(),
        };
        let subscription = self.client.subscribe(channel, EventMask::ALL).await?;
        let weak = Arc::downgrade(self);
        let dispatcher = Dispatcher::spawn(subscription, move |event| {
            let weak: Weak<Self> = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(tracker) => tracker.handle_event(&event),
                    None => Ok(()),
                }
            }
        });
        let sweeper = tokio::spawn(Self::sweep_loop(
            Arc::downgrade(self),
            self.client.config().typing_sweep_interval,
        ));

        let mut state = self.state();
        state.dispatcher = Some(dispatcher);
        if let Some(previous) = state.sweeper.replace(sweeper) {
            previous.abort();
        }
        debug!(target: "Typing", "Tracking typing in {}", self.room_id);
        Ok(())
    }

    /// Releases the subscription, stops the sweep and forgets every signal.
    pub fn stop(&self) {
        let mut state = self.state();
        state.dispatcher = None;
        if let Some(sweeper) = state.sweeper.take() {
            sweeper.abort();
        }
        state.presence.clear();
        self.publish(&state);
    }

    /// Broadcasts the viewer's own typing state. Fire-and-forget.
    pub fn set_typing(&self, is_typing: bool) {
        let mutation = self.client.mutation.clone();
        let room_id = self.room_id.clone();
        let viewer_id = self.client.viewer_id().to_string();
        tokio::spawn(async move {
            if let Err(e) = mutation.set_typing(&room_id, &viewer_id, is_typing).await {
                warn!(target: "Typing", "Failed to publish typing={is_typing} in {room_id}: {e}");
            }
        });
    }

    fn handle_event(&self, event: &ChangeEvent) -> Result<()> {
        match event.kind {
            EventKind::Insert | EventKind::Update => {
                let row: TypingRow = event.decode(Table::TypingIndicators)?;
                if row.room_id != self.room_id {
                    return Ok(());
                }
                let signal = TypingSignal {
                    room_id: row.room_id,
                    user_id: row.user_id,
                    started_at: row.started_at.unwrap_or_else(Utc::now),
                };
                let mut state = self.state();
                state.presence.upsert(signal);
                self.publish(&state);
            }
            EventKind::Delete => {
                let user_id = event.require_str("user_id")?;
                let mut state = self.state();
                if state.presence.remove(user_id) {
                    self.publish(&state);
                }
            }
        }
        Ok(())
    }

    async fn sweep_loop(tracker: Weak<Self>, period: std::time::Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(tracker) = tracker.upgrade() else {
                return;
            };
            {
                let mut state = tracker.state();
                if state.presence.expire(Utc::now()) {
                    debug!(target: "Typing", "Expired stale typing signals in {}", tracker.room_id);
                    tracker.publish(&state);
                }
            }
        }
    }
}

impl Drop for TypingTracker {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(sweeper) = state.sweeper.take() {
            sweeper.abort();
        }
    }
}
