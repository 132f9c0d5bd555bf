//! Headless, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.  Delivery is ordered and at-most-once per subscriber: a slow
//! subscriber observes `Lagged` and skips ahead, it never sees duplicates.
//!
//! # Topics
//!
//! Every [`Event`] is published on the global channel and on the lane of its
//! payload's [`Topic`]:
//!
//! | Topic | Traffic |
//! |---|---|
//! | [`Topic::SafetyState`] | State transitions and interlock changes |
//! | [`Topic::Protocol`] | Run progress and terminal outcomes |
//! | [`Topic::SafetyEvents`] | Severity-tagged safety events |

use lumos_types::{Event, EventPayload};
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
pub const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Safety state transitions and interlock changes.
    SafetyState,
    /// Protocol progress and terminal outcomes.
    Protocol,
    /// Safety events (audit-relevant messages with a severity).
    SafetyEvents,
}

impl Topic {
    /// Lane a payload is routed to.
    pub fn of(payload: &EventPayload) -> Self {
        match payload {
            EventPayload::StateChanged { .. } | EventPayload::InterlockChanged { .. } => {
                Topic::SafetyState
            }
            EventPayload::ProtocolProgress { .. } | EventPayload::ProtocolTerminal { .. } => {
                Topic::Protocol
            }
            EventPayload::SafetyEvent { .. } => Topic::SafetyEvents,
        }
    }
}

/// Shared event bus.  Clone it cheaply: all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    all: broadcast::Sender<Event>,
    safety_state: broadcast::Sender<Event>,
    protocol: broadcast::Sender<Event>,
    safety_events: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity, applied to every
    /// channel independently.
    pub fn new(capacity: usize) -> Self {
        let (all, _) = broadcast::channel(capacity);
        let (safety_state, _) = broadcast::channel(capacity);
        let (protocol, _) = broadcast::channel(capacity);
        let (safety_events, _) = broadcast::channel(capacity);
        Self {
            all,
            safety_state,
            protocol,
            safety_events,
        }
    }

    /// Publish `event` to the global channel and to its topic lane.
    ///
    /// Returns the number of receivers handed the event across both.  Zero
    /// subscribers is a normal condition, not an error.
    pub fn publish(&self, event: Event) -> usize {
        let topic = Topic::of(&event.payload);
        trace!(?topic, source = %event.source, "publish");
        let lane = self.topic_sender(topic).send(event.clone()).unwrap_or(0);
        lane + self.all.send(event).unwrap_or(0)
    }

    /// Subscribe to every event.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.all.subscribe()
    }

    /// Subscribe to one [`Topic`] lane.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::SafetyState => &self.safety_state,
            Topic::Protocol => &self.protocol,
            Topic::SafetyEvents => &self.safety_events,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`] lane.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// `Err(Lagged(n))` means the subscriber fell behind and `n` events were
    /// skipped; `Err(Closed)` means the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }
}
