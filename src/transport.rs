use async_trait::async_trait;
use synccore::events::{ChangeEvent, Channel, EventMask};
use tokio::sync::mpsc;

/// Push feed of row-change notifications.
///
/// One subscription is opened per (room, concern) pair. Dropping the returned
/// [`Subscription`] releases the channel.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn subscribe(
        &self,
        channel: Channel,
        mask: EventMask,
    ) -> Result<Subscription, anyhow::Error>;
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// A live subscription to one channel.
pub struct Subscription {
    channel: Channel,
    events: mpsc::Receiver<ChangeEvent>,
    release: Option<ReleaseFn>,
}

impl Subscription {
    pub fn new(channel: Channel, events: mpsc::Receiver<ChangeEvent>) -> Self {
        Self {
            channel,
            events,
            release: None,
        }
    }

    /// Registers the transport-side cleanup run when the subscription drops.
    pub fn on_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Next event, or `None` once the transport closed the channel.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
