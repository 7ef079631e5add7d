use log::{debug, warn};
use std::future::Future;
use synccore::events::{ChangeEvent, Channel};
use tokio::task::JoinHandle;

use crate::error::SyncError;
use crate::transport::Subscription;

/// Owns one subscription and feeds its events, in arrival order, to a handler.
///
/// A failing handler only loses the event that failed. Dropping the
/// dispatcher aborts the task, which drops and thereby releases the
/// subscription.
pub struct Dispatcher {
    channel: Channel,
    task: JoinHandle<()>,
}

impl Dispatcher {
    pub fn spawn<F, Fut>(mut subscription: Subscription, handler: F) -> Self
    where
        F: Fn(ChangeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        let channel = subscription.channel().clone();
        let label = channel.to_string();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let kind = event.kind;
                if let Err(e) = handler(event).await {
                    warn!(target: "Dispatch", "Handler for {label} failed on {kind:?} event: {e}");
                }
            }
            debug!(target: "Dispatch", "Channel {label} closed by transport");
        });
        Self { channel, task }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
