//! Engine Event Bus
//!
//! Components publish typed events to a broadcast bus instead of invoking
//! callbacks, making ordering and backpressure explicit. Subscribers that
//! lag simply drop events; the bus never blocks a publisher.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::presence::PresenceUpdate;
use crate::shared::{ConnectionId, UserId};

const BUS_CAPACITY: usize = 10_000;

/// Events the engine emits to interested observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "t", content = "d")]
pub enum RealtimeEvent {
    #[serde(rename = "PRESENCE_CHANGED")]
    PresenceChanged(PresenceUpdate),

    #[serde(rename = "TYPING_CHANGED")]
    TypingChanged { user_id: UserId, is_typing: bool },

    #[serde(rename = "DELIVERY_RESULT")]
    DeliveryResult {
        payload_ref: Option<String>,
        delivered: bool,
    },

    #[serde(rename = "CONNECTION_FORCE_CLOSED")]
    ConnectionForceClosed {
        connection_id: ConnectionId,
        reason: String,
    },
}

/// Broadcast bus for engine events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RealtimeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A bus with no subscribers is not an error.
    pub fn publish(&self, event: RealtimeEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Event published with no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(RealtimeEvent::TypingChanged {
            user_id: 1,
            is_typing: true,
        });

        match rx.recv().await.unwrap() {
            RealtimeEvent::TypingChanged { user_id, is_typing } => {
                assert_eq!(user_id, 1);
                assert!(is_typing);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.publish(RealtimeEvent::DeliveryResult {
            payload_ref: None,
            delivered: false,
        });
    }
}
