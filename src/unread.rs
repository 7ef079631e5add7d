//! Viewer-wide unread message count.

use log::{debug, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use synccore::events::{ChangeEvent, Channel, EventMask};
use tokio::sync::watch;

use crate::client::Client;
use crate::dispatch::Dispatcher;
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadSnapshot {
    pub count: u64,
    pub last_error: Option<String>,
}

struct UnreadState {
    count: u64,
    last_error: Option<String>,
    refresh_seq: u64,
    dispatchers: Vec<Dispatcher>,
}

/// Recomputes the unread total from the backend whenever a message is
/// inserted anywhere or a read marker moves. A failed refresh keeps the last
/// known count.
pub struct UnreadCounter {
    client: Arc<Client>,
    state: Mutex<UnreadState>,
    updates: watch::Sender<UnreadSnapshot>,
}

impl UnreadCounter {
    pub(crate) fn new(client: Arc<Client>) -> Arc<Self> {
        let (updates, _) = watch::channel(UnreadSnapshot::default());
        Arc::new(Self {
            client,
            state: Mutex::new(UnreadState {
                count: 0,
                last_error: None,
                refresh_seq: 0,
                dispatchers: Vec::new(),
            }),
            updates,
        })
    }

    fn state(&self) -> MutexGuard<'_, UnreadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &UnreadState) {
        self.updates.send_replace(UnreadSnapshot {
            count: state.count,
            last_error: state.last_error.clone(),
        });
    }

    pub fn count(&self) -> u64 {
        self.state().count
    }

    pub fn snapshot(&self) -> UnreadSnapshot {
        self.updates.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<UnreadSnapshot> {
        self.updates.subscribe()
    }

    pub async fn refresh(&self) -> Result<u64> {
        let ticket = {
            let mut state = self.state();
            state.refresh_seq += 1;
            state.refresh_seq
        };

        let result = self.client.query.unread_count(self.client.viewer_id()).await;

        let mut state = self.state();
        if state.refresh_seq != ticket {
            debug!(target: "Unread", "Unread refresh {ticket} superseded");
            return result.map_err(SyncError::Fetch);
        }
        match result {
            Ok(count) => {
                state.count = count;
                state.last_error = None;
                self.publish(&state);
                Ok(count)
            }
            Err(e) => {
                warn!(target: "Unread", "Failed to refresh unread count, keeping {}: {e}", state.count);
                state.last_error = Some(e.to_string());
                self.publish(&state);
                Err(SyncError::Fetch(e))
            }
        }
    }

    /// Subscribes to message and read-marker inserts, then refreshes. The
    /// refresh runs even when subscribing fails; that error is returned
    /// afterwards.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let subscribed = self.attach().await;
        self.refresh().await?;
        subscribed
    }

    async fn attach(self: &Arc<Self>) -> Result<()> {
        let channels = [
            Channel::Messages { room_id: None },
            Channel::ReadMarkers,
        ];
        let mut dispatchers = Vec::with_capacity(channels.len());
        let mut subscribed = Ok(());
        for channel in channels {
            let subscription = match self.client.subscribe(channel, EventMask::INSERT).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!(target: "Unread", "Live unread updates unavailable: {e}");
                    subscribed = Err(e);
                    break;
                }
            };
            let weak = Arc::downgrade(self);
            dispatchers.push(Dispatcher::spawn(subscription, move |event| {
                let weak: Weak<Self> = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(counter) => counter.handle_event(event).await,
                        None => Ok(()),
                    }
                }
            }));
        }
        self.state().dispatchers = dispatchers;
        subscribed
    }

    pub fn stop(&self) {
        let dispatchers = std::mem::take(&mut self.state().dispatchers);
        drop(dispatchers);
    }

    async fn handle_event(&self, event: ChangeEvent) -> Result<()> {
        debug!(target: "Unread", "{} insert, recounting", event.table);
        self.refresh().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ScriptedBackend, VIEWER_ID, message, test_client, wait_until};
    use serde_json::json;
    use synccore::events::{EventKind, Table};

    #[tokio::test]
    async fn test_start_fetches_and_follows_events() {
        let backend = ScriptedBackend::new();
        backend.set_unread(3);
        let client = test_client(&backend);
        let unread = client.unread();
        unread.start().await.unwrap();
        assert_eq!(unread.count(), 3);
        assert_eq!(backend.subscriber_count(), 2);

        backend.set_unread(4);
        let row = serde_json::to_value(message("x1", "r1", "tenant-1", 1)).unwrap();
        backend
            .emit(ChangeEvent::new(EventKind::Insert, Table::Messages, row))
            .await;
        wait_until(|| unread.count() == 4).await;

        backend.set_unread(0);
        backend
            .emit(ChangeEvent::new(
                EventKind::Insert,
                Table::ReadMarkers,
                json!({ "room_id": "r1", "user_id": VIEWER_ID }),
            ))
            .await;
        wait_until(|| unread.count() == 0).await;
        assert_eq!(backend.unread_calls(), 3);
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_count() {
        let backend = ScriptedBackend::new();
        backend.set_unread(7);
        let client = test_client(&backend);
        let unread = client.unread();
        unread.refresh().await.unwrap();

        backend.fail_fetches(true);
        backend.set_unread(1);
        assert!(matches!(unread.refresh().await, Err(SyncError::Fetch(_))));
        let snapshot = unread.snapshot();
        assert_eq!(snapshot.count, 7);
        assert!(snapshot.last_error.is_some());

        backend.fail_fetches(false);
        assert_eq!(unread.refresh().await.unwrap(), 1);
        assert_eq!(unread.snapshot().last_error, None);
    }

    #[tokio::test]
    async fn test_older_refresh_cannot_overwrite_newer() {
        let backend = ScriptedBackend::new();
        backend.set_unread(5);
        let client = test_client(&backend);
        let unread = client.unread();
        backend.hold_fetches();

        let first = unread.clone();
        let stale = tokio::spawn(async move { first.refresh().await });
        wait_until(|| backend.held_fetches() == 1).await;

        backend.set_unread(2);
        let second = unread.clone();
        let fresh = tokio::spawn(async move { second.refresh().await });
        wait_until(|| backend.held_fetches() == 2).await;

        backend.release_fetch(1);
        assert_eq!(fresh.await.unwrap().unwrap(), 2);
        backend.release_fetch(0);
        assert_eq!(stale.await.unwrap().unwrap(), 5);
        assert_eq!(unread.count(), 2);
    }

    #[tokio::test]
    async fn test_start_counts_when_push_is_unavailable() {
        let backend = ScriptedBackend::new();
        backend.set_unread(4);
        backend.fail_subscribes(true);
        let client = test_client(&backend);
        let unread = client.unread();

        let err = unread.start().await.unwrap_err();
        assert!(matches!(err, SyncError::Subscribe { .. }));
        assert_eq!(backend.unread_calls(), 1);
        assert_eq!(unread.count(), 4);
    }

    #[tokio::test]
    async fn test_stop_releases_subscriptions() {
        let backend = ScriptedBackend::new();
        let client = test_client(&backend);
        let unread = client.unread();
        unread.start().await.unwrap();
        unread.stop();
        wait_until(|| backend.subscriber_count() == 0).await;
    }
}
