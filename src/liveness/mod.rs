//! Liveness Monitor
//!
//! Per-connection heartbeat: `ALIVE -> AWAITING_PONG -> (ALIVE on pong |
//! TERMINATED on timeout)`. Each watch is a cancellable task keyed by
//! connection id, so cancellation on removal is a deliberate lookup, never
//! a closure left to fire against removed state. Timed-out connections are
//! funneled into the same disconnect path as any other close.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::protocol::Frame;
use crate::registry::RegisteredConnection;
use crate::shared::ConnectionId;

/// Heartbeat state for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Alive,
    AwaitingPong,
}

struct Watch {
    task: JoinHandle<()>,
    last_pong: Arc<Mutex<Instant>>,
    state: Arc<Mutex<LivenessState>>,
}

/// Runs a ping/pong cycle per watched connection; reports expirations on a
/// channel the engine drains into its disconnect path.
pub struct LivenessMonitor {
    watches: DashMap<ConnectionId, Watch>,
    interval: Duration,
    grace: Duration,
    expired_tx: mpsc::UnboundedSender<ConnectionId>,
}

impl LivenessMonitor {
    pub fn new(
        interval: Duration,
        grace: Duration,
        expired_tx: mpsc::UnboundedSender<ConnectionId>,
    ) -> Self {
        Self {
            watches: DashMap::new(),
            interval,
            grace,
            expired_tx,
        }
    }

    /// Start the heartbeat cycle for an admitted connection. Re-attaching
    /// the same id replaces (and cancels) the previous watch.
    pub fn attach(&self, connection: Arc<RegisteredConnection>) {
        let last_pong = Arc::new(Mutex::new(Instant::now()));
        let state = Arc::new(Mutex::new(LivenessState::Alive));
        let task = tokio::spawn(ping_cycle(
            connection.clone(),
            self.interval,
            self.grace,
            last_pong.clone(),
            state.clone(),
            self.expired_tx.clone(),
        ));
        if let Some(old) = self.watches.insert(
            connection.id,
            Watch {
                task,
                last_pong,
                state,
            },
        ) {
            old.task.abort();
        }
        tracing::debug!(connection_id = %connection.id, "Heartbeat attached");
    }

    /// Record a pong. A pong for an unwatched (already removed) connection
    /// is a no-op.
    pub fn on_pong(&self, connection_id: ConnectionId) {
        if let Some(watch) = self.watches.get(&connection_id) {
            *watch.last_pong.lock() = Instant::now();
            *watch.state.lock() = LivenessState::Alive;
            tracing::trace!(connection_id = %connection_id, "Pong received");
        }
    }

    /// Cancel the watch for a connection. Idempotent; every armed timer is
    /// cancelled here regardless of why the connection went away.
    pub fn detach(&self, connection_id: ConnectionId) {
        if let Some((_, watch)) = self.watches.remove(&connection_id) {
            watch.task.abort();
            tracing::debug!(connection_id = %connection_id, "Heartbeat detached");
        }
    }

    pub fn detach_all(&self) {
        let ids: Vec<ConnectionId> = self.watches.iter().map(|w| *w.key()).collect();
        for id in ids {
            self.detach(id);
        }
    }

    pub fn state_of(&self, connection_id: ConnectionId) -> Option<LivenessState> {
        self.watches.get(&connection_id).map(|w| *w.state.lock())
    }

    pub fn watched(&self) -> usize {
        self.watches.len()
    }
}

async fn ping_cycle(
    connection: Arc<RegisteredConnection>,
    interval: Duration,
    grace: Duration,
    last_pong: Arc<Mutex<Instant>>,
    state: Arc<Mutex<LivenessState>>,
    expired_tx: mpsc::UnboundedSender<ConnectionId>,
) {
    let deadline = interval + grace;
    loop {
        sleep(interval).await;

        if connection.handle.write(Frame::Ping).await.is_err() {
            tracing::debug!(connection_id = %connection.id, "Ping write failed");
            let _ = expired_tx.send(connection.id);
            return;
        }
        *state.lock() = LivenessState::AwaitingPong;

        sleep(grace).await;
        if last_pong.lock().elapsed() > deadline {
            tracing::info!(
                connection_id = %connection.id,
                user_id = connection.user_id,
                "Heartbeat deadline missed"
            );
            let _ = expired_tx.send(connection.id);
            return;
        }
        *state.lock() = LivenessState::Alive;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::registry::ConnectionRegistry;
    use crate::transport::ChannelHandle;
    use tokio::time::timeout;

    fn watched_connection(
        registry: &ConnectionRegistry,
    ) -> (Arc<RegisteredConnection>, tokio::sync::mpsc::Receiver<Frame>) {
        let (handle, rx) = ChannelHandle::pair(8);
        let outcome = registry.admit(1, None, handle);
        (outcome.connection, rx)
    }

    #[tokio::test]
    async fn silent_connection_expires_after_deadline() {
        let registry = ConnectionRegistry::new(5, EventBus::new());
        let (connection, _rx) = watched_connection(&registry);
        let (tx, mut expired) = mpsc::unbounded_channel();
        let monitor =
            LivenessMonitor::new(Duration::from_millis(20), Duration::from_millis(10), tx);

        monitor.attach(connection.clone());
        let id = timeout(Duration::from_millis(500), expired.recv())
            .await
            .expect("expiry should fire")
            .unwrap();
        assert_eq!(id, connection.id);
    }

    #[tokio::test]
    async fn answered_pings_keep_the_connection_alive() {
        let registry = ConnectionRegistry::new(5, EventBus::new());
        let (connection, mut rx) = watched_connection(&registry);
        let (tx, mut expired) = mpsc::unbounded_channel();
        let monitor = Arc::new(LivenessMonitor::new(
            Duration::from_millis(20),
            Duration::from_millis(10),
            tx,
        ));

        monitor.attach(connection.clone());

        // Echo every ping back as a pong, like a healthy client.
        let responder = {
            let monitor = monitor.clone();
            let id = connection.id;
            tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    if matches!(frame, Frame::Ping) {
                        monitor.on_pong(id);
                    }
                }
            })
        };

        let expiry = timeout(Duration::from_millis(150), expired.recv()).await;
        assert!(expiry.is_err(), "healthy connection must not expire");
        responder.abort();
        monitor.detach(connection.id);
    }

    #[tokio::test]
    async fn detach_cancels_the_armed_timer() {
        let registry = ConnectionRegistry::new(5, EventBus::new());
        let (connection, _rx) = watched_connection(&registry);
        let (tx, mut expired) = mpsc::unbounded_channel();
        let monitor =
            LivenessMonitor::new(Duration::from_millis(20), Duration::from_millis(10), tx);

        monitor.attach(connection.clone());
        monitor.detach(connection.id);
        monitor.detach(connection.id); // idempotent

        assert_eq!(monitor.watched(), 0);
        let expiry = timeout(Duration::from_millis(100), expired.recv()).await;
        assert!(expiry.is_err(), "detached watch must not fire");
    }

    #[tokio::test]
    async fn pong_for_unwatched_connection_is_a_no_op() {
        let registry = ConnectionRegistry::new(5, EventBus::new());
        let (connection, _rx) = watched_connection(&registry);
        let (tx, _expired) = mpsc::unbounded_channel();
        let monitor =
            LivenessMonitor::new(Duration::from_millis(20), Duration::from_millis(10), tx);

        monitor.on_pong(connection.id);
        assert_eq!(monitor.state_of(connection.id), None);
    }
}
