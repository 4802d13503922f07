//! Ephemeral Interaction Channels
//!
//! Typing indicators: self-expiring state keyed by the ordered
//! (sender, recipient) pair. At most one outstanding signal exists per
//! pair; a new start replaces the pair's timer, so the recipient never
//! sees an event for a cancelled intermediate state. Timers live in a map
//! the component owns, and cancellation is a lookup-and-abort.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::events::{EventBus, RealtimeEvent};
use crate::protocol::Frame;
use crate::registry::ConnectionRegistry;
use crate::shared::UserId;

type PairKey = (UserId, UserId);

struct Inner {
    timers: DashMap<PairKey, JoinHandle<()>>,
    registry: Arc<ConnectionRegistry>,
    bus: EventBus,
    expiry: Duration,
}

impl Inner {
    /// Publish and write the indicator to the recipient's connections.
    /// Write failures are swallowed; typing is best-effort by nature.
    async fn emit(&self, from: UserId, to: UserId, is_typing: bool) {
        self.bus.publish(RealtimeEvent::TypingChanged {
            user_id: from,
            is_typing,
        });
        for connection in self.registry.connections_for(to) {
            if let Err(e) = connection
                .handle
                .write(Frame::Typing {
                    user_id: from,
                    is_typing,
                })
                .await
            {
                tracing::debug!(
                    connection_id = %connection.id,
                    error = %e,
                    "Typing write failed"
                );
            }
        }
    }
}

/// Typing-signal timers per (sender, recipient) pair.
pub struct TypingChannels {
    inner: Arc<Inner>,
}

impl TypingChannels {
    pub fn new(registry: Arc<ConnectionRegistry>, bus: EventBus, expiry: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                timers: DashMap::new(),
                registry,
                bus,
                expiry,
            }),
        }
    }

    /// Signal that `from` started typing to `to`. Replaces and re-arms any
    /// existing timer for the pair.
    pub async fn start_typing(&self, from: UserId, to: UserId) {
        if let Some((_, old)) = self.inner.timers.remove(&(from, to)) {
            old.abort();
        }
        self.inner.emit(from, to, true).await;

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            sleep(inner.expiry).await;
            // Only emit if the timer is still ours to consume; a concurrent
            // stop or restart already took it.
            if inner.timers.remove(&(from, to)).is_some() {
                inner.emit(from, to, false).await;
            }
        });
        self.inner.timers.insert((from, to), task);
    }

    /// Explicit stop: cancels the pair's timer and emits "stopped"
    /// synchronously. A stop with no outstanding signal is a no-op.
    pub async fn stop_typing(&self, from: UserId, to: UserId) {
        if let Some((_, old)) = self.inner.timers.remove(&(from, to)) {
            old.abort();
            self.inner.emit(from, to, false).await;
        }
    }

    /// Cancel every typing signal `from` currently has outstanding, used
    /// when they fully disconnect or log out.
    pub async fn cancel_all_from(&self, from: UserId) {
        let pairs: Vec<PairKey> = self
            .inner
            .timers
            .iter()
            .filter(|entry| entry.key().0 == from)
            .map(|entry| *entry.key())
            .collect();
        for (f, t) in pairs {
            self.stop_typing(f, t).await;
        }
    }

    pub fn is_typing(&self, from: UserId, to: UserId) -> bool {
        self.inner.timers.contains_key(&(from, to))
    }

    pub fn active_signals(&self) -> usize {
        self.inner.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelHandle;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc::Receiver;
    use tokio::time::timeout;

    fn setup(expiry_ms: u64) -> (TypingChannels, Receiver<Frame>) {
        let bus = EventBus::new();
        let registry = Arc::new(ConnectionRegistry::new(5, bus.clone()));
        let (handle, rx) = ChannelHandle::pair(32);
        registry.admit(2, None, handle); // recipient
        let typing = TypingChannels::new(registry, bus, Duration::from_millis(expiry_ms));
        (typing, rx)
    }

    async fn next_typing(rx: &mut Receiver<Frame>) -> (UserId, bool) {
        loop {
            match timeout(Duration::from_millis(500), rx.recv())
                .await
                .expect("expected a typing frame")
                .unwrap()
            {
                Frame::Typing { user_id, is_typing } => return (user_id, is_typing),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn start_then_stop_yields_exactly_two_events_in_order() {
        let (typing, mut rx) = setup(5_000);

        typing.start_typing(1, 2).await;
        typing.stop_typing(1, 2).await;

        assert_eq!(next_typing(&mut rx).await, (1, true));
        assert_eq!(next_typing(&mut rx).await, (1, false));
        assert!(!typing.is_typing(1, 2));
        assert_eq!(typing.active_signals(), 0);
    }

    #[tokio::test]
    async fn unanswered_signal_expires_on_its_own() {
        let (typing, mut rx) = setup(30);

        typing.start_typing(1, 2).await;
        assert_eq!(next_typing(&mut rx).await, (1, true));
        assert_eq!(next_typing(&mut rx).await, (1, false));
        assert!(!typing.is_typing(1, 2));
    }

    #[tokio::test]
    async fn restart_resets_the_timer_without_an_intermediate_stop() {
        let (typing, mut rx) = setup(300);

        typing.start_typing(1, 2).await;
        sleep(Duration::from_millis(200)).await;
        typing.start_typing(1, 2).await;
        sleep(Duration::from_millis(200)).await;
        // The first timer would have fired by now; it was replaced, so the
        // recipient has seen two starts and zero stops.
        assert_eq!(next_typing(&mut rx).await, (1, true));
        assert_eq!(next_typing(&mut rx).await, (1, true));
        assert!(typing.is_typing(1, 2));

        typing.stop_typing(1, 2).await;
        assert_eq!(next_typing(&mut rx).await, (1, false));
    }

    #[tokio::test]
    async fn stale_stop_is_a_no_op() {
        let (typing, mut rx) = setup(5_000);
        typing.stop_typing(1, 2).await;
        let got = timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(got.is_err(), "no event expected for a stale stop");
    }

    #[tokio::test]
    async fn cancel_all_from_clears_every_pair_for_the_sender() {
        let (typing, mut rx) = setup(5_000);
        typing.start_typing(1, 2).await;
        typing.start_typing(3, 2).await;
        assert_eq!(typing.active_signals(), 2);

        typing.cancel_all_from(1).await;
        assert_eq!(typing.active_signals(), 1);
        assert!(!typing.is_typing(1, 2));
        assert!(typing.is_typing(3, 2));

        // Recipient saw: start(1), start(3), stop(1).
        assert_eq!(next_typing(&mut rx).await, (1, true));
        assert_eq!(next_typing(&mut rx).await, (3, true));
        assert_eq!(next_typing(&mut rx).await, (1, false));
    }
}
