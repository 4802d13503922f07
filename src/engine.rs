//! Realtime Engine
//!
//! Wires the components into the connection lifecycle: a verified
//! connection is admitted (evicting stale logins), presence is updated and
//! broadcast, a heartbeat cycle attaches, the presence snapshot seeds the
//! client, and any offline backlog flushes. Every disconnect cause —
//! transport close, heartbeat timeout, eviction, explicit logout — funnels
//! into one idempotent removal path, so racing paths collapse to a single
//! effective remove.
//!
//! The engine is an explicitly owned instance: constructed once at process
//! start by whatever owns the transport-accept loop, torn down with
//! [`RealtimeEngine::shutdown`].

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::delivery::{DeliveryEngine, DeliveryOutcome};
use crate::events::{EventBus, RealtimeEvent};
use crate::liveness::LivenessMonitor;
use crate::metrics;
use crate::offline::OfflineQueue;
use crate::presence::{PresenceStatus, PresenceTracker};
use crate::protocol::{parse_command, ClientCommand, Frame};
use crate::registry::ConnectionRegistry;
use crate::shared::{ConnectionId, Result, UserId};
use crate::transport::{CloseReason, ConnectionHandle};
use crate::typing::TypingChannels;

/// The connection and delivery engine.
pub struct RealtimeEngine {
    settings: Settings,
    bus: EventBus,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceTracker>,
    delivery: DeliveryEngine,
    offline: Arc<OfflineQueue>,
    liveness: Arc<LivenessMonitor>,
    typing: TypingChannels,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl RealtimeEngine {
    /// Build the engine and start its background tasks (heartbeat expiry
    /// drain and the periodic reaper). Must be called within a Tokio
    /// runtime.
    pub fn new(settings: Settings) -> Arc<Self> {
        let bus = EventBus::new();
        let registry = Arc::new(ConnectionRegistry::new(
            settings.connection.max_per_user,
            bus.clone(),
        ));
        let presence = Arc::new(PresenceTracker::new(
            registry.clone(),
            bus.clone(),
            settings.presence.offline_retention(),
        ));
        let delivery = DeliveryEngine::new(
            registry.clone(),
            bus.clone(),
            settings.delivery.clone(),
            settings.connection.write_timeout(),
        );
        let offline = Arc::new(OfflineQueue::new(settings.offline_queue.clone()));
        let (expired_tx, mut expired_rx) = mpsc::unbounded_channel();
        let liveness = Arc::new(LivenessMonitor::new(
            settings.heartbeat.interval(),
            std::time::Duration::from_secs(settings.heartbeat.timeout_secs),
            expired_tx,
        ));
        let typing = TypingChannels::new(registry.clone(), bus.clone(), settings.typing.expiry());

        let engine = Arc::new(Self {
            settings,
            bus,
            registry,
            presence,
            delivery,
            offline,
            liveness,
            typing,
            background: Mutex::new(Vec::new()),
        });

        // Heartbeat timeouts re-enter through the shared disconnect path.
        let drain = {
            let engine = engine.clone();
            tokio::spawn(async move {
                while let Some(connection_id) = expired_rx.recv().await {
                    engine
                        .disconnect(connection_id, CloseReason::HeartbeatTimeout)
                        .await;
                }
            })
        };

        let reaper = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut tick =
                    tokio::time::interval(engine.settings.offline_queue.reaper_interval());
                tick.tick().await; // skip the immediate first tick
                loop {
                    tick.tick().await;
                    engine.offline.purge_expired();
                    engine.presence.purge_stale();
                }
            })
        };

        engine.background.lock().extend([drain, reaper]);
        tracing::info!(
            environment = %engine.settings.environment,
            "Realtime engine started"
        );
        engine
    }

    /// Admit a connection the transport layer has already authenticated.
    ///
    /// Runs the full connect flow: registry admission (with duplicate
    /// login eviction), presence update, heartbeat attach, presence
    /// snapshot seed, offline backlog flush.
    pub async fn connect(
        &self,
        user_id: UserId,
        device_id: Option<String>,
        handle: Arc<dyn ConnectionHandle>,
    ) -> ConnectionId {
        let outcome = self.registry.admit(user_id, device_id, handle);

        for evicted in &outcome.evicted {
            self.liveness.detach(evicted.id);
        }

        // New connection counts up before the evicted ones count down, so
        // the user's presence never dips through offline during a reconnect.
        self.presence.on_connect(user_id).await;
        for evicted in &outcome.evicted {
            self.presence.on_disconnect(evicted.user_id).await;
        }

        self.liveness.attach(outcome.connection.clone());

        let entries = self.presence.snapshot_excluding(user_id);
        if !entries.is_empty() {
            if let Err(e) = outcome
                .connection
                .handle
                .write(Frame::PresenceSnapshot { entries })
                .await
            {
                tracing::debug!(
                    connection_id = %outcome.connection.id,
                    error = %e,
                    "Snapshot seed write failed"
                );
            }
        }

        let handle: Arc<dyn ConnectionHandle> = outcome.connection.handle.clone();
        self.offline.flush(user_id, &handle).await;

        outcome.connection_id()
    }

    /// Tear down a connection, whatever the cause. A second call (or a
    /// racing heartbeat-timeout / logout / transport-close) finds the id
    /// already gone and is a silent no-op.
    pub async fn disconnect(&self, connection_id: ConnectionId, reason: CloseReason) {
        let connection = match self.registry.remove(connection_id) {
            Some(connection) => connection,
            None => return,
        };
        self.liveness.detach(connection_id);
        self.presence.on_disconnect(connection.user_id).await;

        if !self.registry.is_online(connection.user_id) {
            self.typing.cancel_all_from(connection.user_id).await;
        }

        if reason == CloseReason::HeartbeatTimeout {
            metrics::FORCED_CLOSES_TOTAL
                .with_label_values(&[reason.as_str()])
                .inc();
            self.bus.publish(RealtimeEvent::ConnectionForceClosed {
                connection_id,
                reason: reason.to_string(),
            });
        }

        // Best-effort transport close off the caller's path.
        let handle = connection.handle.clone();
        tokio::spawn(async move {
            handle.close(reason).await;
        });
    }

    /// Explicit, client-initiated disconnect. The acknowledgment frame is
    /// written before the transport closure completes, so the client can
    /// confirm clean termination. A stale connection id is a no-op.
    pub async fn logout(&self, user_id: UserId, connection_id: ConnectionId) {
        let connection = match self.registry.get(connection_id) {
            Some(connection) => connection,
            None => return,
        };
        if connection.user_id != user_id {
            tracing::warn!(
                user_id = user_id,
                connection_id = %connection_id,
                "Logout for a connection owned by another user ignored"
            );
            return;
        }

        if let Err(e) = connection.handle.write(Frame::LogoutAck).await {
            tracing::debug!(connection_id = %connection_id, error = %e, "Logout ack write failed");
        }
        self.typing.cancel_all_from(user_id).await;
        self.disconnect(connection_id, CloseReason::Logout).await;
    }

    /// Deliver a persisted payload, queueing it if the recipient is
    /// offline. Returns whether live delivery happened; the caller reports
    /// "accepted" to the sender either way, so queue-versus-delivered never
    /// leaks presence.
    pub async fn dispatch_message(&self, target: UserId, payload: Value) -> bool {
        match self.delivery.deliver(target, payload.clone()).await {
            DeliveryOutcome::Delivered => true,
            DeliveryOutcome::RecipientOffline => {
                self.offline.enqueue(target, payload);
                false
            }
            // Reachable but refusing writes: the caller decides whether a
            // push-notification fallback is warranted.
            DeliveryOutcome::WritesFailed => false,
        }
    }

    /// Handle one raw inbound frame from a connection.
    ///
    /// Malformed payloads are rejected here, at the boundary, with no state
    /// touched. A command for an already-removed connection is a silent
    /// no-op.
    pub async fn handle_command(&self, connection_id: ConnectionId, raw: &str) -> Result<()> {
        let command = parse_command(raw)?;
        let connection = match self.registry.get(connection_id) {
            Some(connection) => connection,
            None => return Ok(()),
        };

        match command {
            ClientCommand::Pong => self.liveness.on_pong(connection_id),
            ClientCommand::SetStatus(cmd) => {
                let status: PresenceStatus = cmd.status.parse()?;
                self.presence.set_status(connection.user_id, status).await;
            }
            ClientCommand::TypingStart(cmd) => {
                self.typing
                    .start_typing(connection.user_id, cmd.receiver_id)
                    .await;
            }
            ClientCommand::TypingStop(cmd) => {
                self.typing
                    .stop_typing(connection.user_id, cmd.receiver_id)
                    .await;
            }
            ClientCommand::Logout => self.logout(connection.user_id, connection_id).await,
        }
        Ok(())
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.bus.subscribe()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.registry.is_online(user_id)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn offline_queue(&self) -> &OfflineQueue {
        &self.offline
    }

    pub fn typing(&self) -> &TypingChannels {
        &self.typing
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Stop background tasks, cancel every timer, and close every live
    /// connection.
    pub async fn shutdown(&self) {
        for task in self.background.lock().drain(..) {
            task.abort();
        }
        self.liveness.detach_all();
        for connection in self.registry.drain_all() {
            self.presence.on_disconnect(connection.user_id).await;
            connection.handle.close(CloseReason::Shutdown).await;
        }
        tracing::info!("Realtime engine shut down");
    }
}
