//! Pub/sub fan-out of events and approvals to live subscribers.
//!
//! Built on [`tokio::sync::broadcast`]: every subscriber gets its own
//! cursor over a shared ring of [`SUBSCRIBER_BUFFER`] items. Delivery never
//! blocks the publisher — a subscriber that falls more than a full ring
//! behind loses the oldest items and observes a [`StreamMessage::Lagged`]
//! marker on its next read, at which point it can resync from the event
//! log tail. One slow subscriber never affects another.
//!
//! Ordering: strict per-session order within one subscriber; no ordering
//! guarantee across subscribers or across sessions.

use tokio::sync::broadcast;

use crate::models::approval::ApprovalRequest;
use crate::models::event::AgentEvent;

/// Ring capacity per subscriber.
pub const SUBSCRIBER_BUFFER: usize = 256;

/// One record delivered to subscribers.
#[derive(Debug, Clone)]
pub enum StreamItem {
    /// A normalized agent event.
    Event(AgentEvent),
    /// A newly created approval request.
    Approval(ApprovalRequest),
}

impl StreamItem {
    /// Session this item belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::Event(e) => &e.session_id,
            Self::Approval(a) => &a.session_id,
        }
    }
}

/// What a subscriber sees on each read.
#[derive(Debug, Clone)]
pub enum StreamMessage {
    /// The next item in per-session order.
    Item(StreamItem),
    /// The subscriber lagged and this many items were dropped for it.
    Lagged(u64),
}

/// Fan-out hub; cheap to clone, all clones publish into the same ring.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<StreamItem>,
}

impl EventHub {
    /// Create a hub with the default ring capacity.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self { tx }
    }

    /// Publish one item to all current subscribers.
    ///
    /// A hub with no subscribers silently drops the item; persistence is
    /// the event log's job, not the hub's.
    pub fn publish(&self, item: StreamItem) {
        let receivers = self.tx.send(item).unwrap_or(0);
        let _ = receivers;
    }

    /// Subscribe to the stream, optionally filtered to one session.
    ///
    /// The subscription starts at the current stream position; history is
    /// available through the event log tail.
    #[must_use]
    pub fn subscribe(&self, session_id: Option<String>) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            filter: session_id,
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's cursor over the stream.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<StreamItem>,
    filter: Option<String>,
}

impl Subscription {
    /// Wait for the next matching item.
    ///
    /// Returns `None` once the hub is gone and the ring is drained. Items
    /// for other sessions are skipped without being surfaced when a
    /// session filter is set; a lag marker is always surfaced because the
    /// dropped items may have matched the filter.
    pub async fn next(&mut self) -> Option<StreamMessage> {
        loop {
            match self.rx.recv().await {
                Ok(item) => {
                    if self
                        .filter
                        .as_deref()
                        .map_or(true, |want| want == item.session_id())
                    {
                        return Some(StreamMessage::Item(item));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Some(StreamMessage::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
