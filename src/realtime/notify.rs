//! Process-wide notification fan-out, independent of open rooms

use tokio::sync::broadcast;

use super::pubsub::{Subscription, Topics};
use crate::models::NotificationEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Republishes global events to every listener.
///
/// Synchronous handlers run on the delivery task; async consumers read the
/// broadcast channel from `listen`. The relay only carries the delivery hint,
/// it never schedules dismissal.
#[derive(Clone)]
pub struct NotificationRelay {
    handlers: Topics<(), NotificationEvent>,
    channel: broadcast::Sender<NotificationEvent>,
}

impl Default for NotificationRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationRelay {
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            handlers: Topics::new(),
            channel,
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&NotificationEvent) + Send + Sync + 'static,
    {
        self.handlers.subscribe((), handler)
    }

    pub fn listen(&self) -> broadcast::Receiver<NotificationEvent> {
        self.channel.subscribe()
    }

    /// Dispatch to handlers, then to channel listeners. Returns how many
    /// listeners of either kind received it.
    pub fn publish(&self, event: NotificationEvent) -> usize {
        tracing::debug!("Notification {}: {}", event.kind, event.title);
        let handled = self.handlers.publish(&(), &event);
        let listened = self.channel.send(event).unwrap_or(0);
        handled + listened
    }
}
