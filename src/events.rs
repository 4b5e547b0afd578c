//! Pane events and their fan-out to subscribers.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::session::PaneId;

/// Events published for panes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PaneEvent {
    /// A chunk of process output, in arrival order.
    Data { pane_id: PaneId, data: Vec<u8> },

    /// The pane's process terminated. Always the last event of a session.
    Exit { pane_id: PaneId, code: i32 },
}

impl PaneEvent {
    /// Pane the event belongs to.
    #[must_use]
    pub fn pane_id(&self) -> &PaneId {
        match self {
            Self::Data { pane_id, .. } | Self::Exit { pane_id, .. } => pane_id,
        }
    }

    /// Output as text, replacing invalid UTF-8. `None` for exit events.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        match self {
            Self::Data { data, .. } => Some(String::from_utf8_lossy(data).into_owned()),
            Self::Exit { .. } => None,
        }
    }
}

/// Receiving end handed to a subscriber.
pub type EventStream = mpsc::UnboundedReceiver<PaneEvent>;

/// Delivers every event to every live subscriber.
///
/// Each subscriber owns its queue, so a busy pane can never evict another
/// pane's events and publishing never waits on a slow reader. Dropped
/// subscribers are pruned on the next publish.
#[derive(Clone, Debug, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<PaneEvent>>>>,
}

impl EventBus {
    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber that sees every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Send `event` to all subscribers.
    pub fn publish(&self, event: &PaneEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}
