//! Connection Registry
//!
//! Maps a user to their set of live transport connections and each
//! connection to its metadata. Admission enforces the duplicate-login
//! policy: a new connection first replaces any prior session from the same
//! device, then the per-user cap evicts oldest-first. Eviction is
//! best-effort and asynchronous; admitting never waits on I/O to the
//! evicted peer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::events::{EventBus, RealtimeEvent};
use crate::metrics;
use crate::protocol::Frame;
use crate::shared::{ConnectionId, UserId, DEFAULT_DEVICE_ID};
use crate::transport::{CloseReason, ConnectionHandle};

/// One admitted transport session. Exclusively owned by the registry; other
/// components only hold it for the scope of a single operation.
pub struct RegisteredConnection {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub device_id: String,
    pub connected_at: DateTime<Utc>,
    pub handle: Arc<dyn ConnectionHandle>,
}

impl std::fmt::Debug for RegisteredConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredConnection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

/// Result of admitting a connection.
pub struct AdmitOutcome {
    /// The newly admitted connection
    pub connection: Arc<RegisteredConnection>,
    /// Connections force-closed to make room (same device, then oldest)
    pub evicted: Vec<Arc<RegisteredConnection>>,
}

impl AdmitOutcome {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id
    }
}

/// Registry of all live connections, sharded by DashMap so unrelated users
/// never contend.
pub struct ConnectionRegistry {
    /// Active connections by connection id
    connections: DashMap<ConnectionId, Arc<RegisteredConnection>>,
    /// User id to connection ids, in admission order (oldest first)
    user_connections: DashMap<UserId, Vec<ConnectionId>>,
    max_per_user: usize,
    bus: EventBus,
}

impl ConnectionRegistry {
    pub fn new(max_per_user: usize, bus: EventBus) -> Self {
        Self {
            connections: DashMap::new(),
            user_connections: DashMap::new(),
            max_per_user,
            bus,
        }
    }

    /// Admit a new connection for `user_id`.
    ///
    /// Any prior connection from the same device is evicted (last login
    /// wins), then the per-user cap is enforced oldest-first. Evicted peers
    /// are notified and closed on a spawned task.
    pub fn admit(
        &self,
        user_id: UserId,
        device_id: Option<String>,
        handle: Arc<dyn ConnectionHandle>,
    ) -> AdmitOutcome {
        let device_id = device_id.unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string());
        let connection = Arc::new(RegisteredConnection {
            id: ConnectionId::new(),
            user_id,
            device_id: device_id.clone(),
            connected_at: Utc::now(),
            handle,
        });

        // Record goes in first so a snapshot never sees an id without one.
        self.connections.insert(connection.id, connection.clone());

        let mut evicted_ids = Vec::new();
        {
            let mut ids = self.user_connections.entry(user_id).or_default();

            let same_device: Vec<ConnectionId> = ids
                .iter()
                .filter(|id| {
                    self.connections
                        .get(id)
                        .map(|c| c.device_id == device_id)
                        .unwrap_or(false)
                })
                .copied()
                .collect();
            for id in same_device {
                ids.retain(|x| *x != id);
                evicted_ids.push(id);
            }

            while ids.len() >= self.max_per_user {
                evicted_ids.push(ids.remove(0));
            }

            ids.push(connection.id);
        }

        let mut evicted = Vec::new();
        for id in evicted_ids {
            if let Some((_, old)) = self.connections.remove(&id) {
                metrics::CONNECTIONS_ACTIVE.dec();
                self.force_close(old.clone(), CloseReason::Evicted);
                evicted.push(old);
            }
        }

        metrics::CONNECTIONS_ACTIVE.inc();
        tracing::info!(
            user_id = user_id,
            connection_id = %connection.id,
            device_id = %device_id,
            evicted = evicted.len(),
            "Connection admitted"
        );

        AdmitOutcome { connection, evicted }
    }

    /// Deregister a connection. Removing an absent id is a no-op, which the
    /// concurrent disconnect paths (heartbeat timeout, logout, transport
    /// close) rely on.
    pub fn remove(&self, connection_id: ConnectionId) -> Option<Arc<RegisteredConnection>> {
        let (_, connection) = self.connections.remove(&connection_id)?;

        {
            if let Some(mut ids) = self.user_connections.get_mut(&connection.user_id) {
                ids.retain(|x| *x != connection_id);
            }
        }
        self.user_connections
            .remove_if(&connection.user_id, |_, ids| ids.is_empty());

        metrics::CONNECTIONS_ACTIVE.dec();
        tracing::info!(
            user_id = connection.user_id,
            connection_id = %connection_id,
            "Connection removed"
        );
        Some(connection)
    }

    /// Point-in-time snapshot of a user's connection ids, oldest first.
    pub fn connection_ids_for(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.user_connections
            .get(&user_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default()
    }

    /// Point-in-time snapshot of a user's connections, oldest first.
    pub fn connections_for(&self, user_id: UserId) -> Vec<Arc<RegisteredConnection>> {
        self.connection_ids_for(user_id)
            .into_iter()
            .filter_map(|id| self.connections.get(&id).map(|c| Arc::clone(c.value())))
            .collect()
    }

    /// True iff the user has at least one live connection.
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.user_connections
            .get(&user_id)
            .map(|ids| !ids.is_empty())
            .unwrap_or(false)
    }

    pub fn connection_count(&self, user_id: UserId) -> usize {
        self.user_connections
            .get(&user_id)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<Arc<RegisteredConnection>> {
        self.connections
            .get(&connection_id)
            .map(|c| Arc::clone(c.value()))
    }

    /// Snapshot of every live connection across all users.
    pub fn all_connections(&self) -> Vec<Arc<RegisteredConnection>> {
        self.connections
            .iter()
            .map(|c| Arc::clone(c.value()))
            .collect()
    }

    pub fn total_connections(&self) -> usize {
        self.connections.len()
    }

    /// Remove and return every connection; used during shutdown.
    pub fn drain_all(&self) -> Vec<Arc<RegisteredConnection>> {
        let all: Vec<_> = self
            .connections
            .iter()
            .map(|c| *c.key())
            .collect();
        all.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Notify and close an evicted peer without blocking the caller.
    fn force_close(&self, connection: Arc<RegisteredConnection>, reason: CloseReason) {
        metrics::FORCED_CLOSES_TOTAL
            .with_label_values(&[reason.as_str()])
            .inc();
        self.bus.publish(RealtimeEvent::ConnectionForceClosed {
            connection_id: connection.id,
            reason: reason.to_string(),
        });
        tracing::info!(
            user_id = connection.user_id,
            connection_id = %connection.id,
            reason = %reason,
            "Connection force-closed"
        );
        tokio::spawn(async move {
            let _ = connection
                .handle
                .write(Frame::ForceDisconnect {
                    reason: reason.to_string(),
                })
                .await;
            connection.handle.close(reason).await;
        });
    }
}
