//! Presence Tracker
//!
//! Derives online/away/busy/offline per user from the connection registry,
//! caches last-seen timestamps, and broadcasts changes. Presence is
//! best-effort: broadcast failures to individual recipients are logged and
//! swallowed, never retried.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::events::{EventBus, RealtimeEvent};
use crate::protocol::Frame;
use crate::registry::ConnectionRegistry;
use crate::shared::{RealtimeError, UserId};

/// User presence classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Busy => "busy",
            PresenceStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceStatus {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(PresenceStatus::Online),
            "away" => Ok(PresenceStatus::Away),
            "busy" => Ok(PresenceStatus::Busy),
            "offline" => Ok(PresenceStatus::Offline),
            other => Err(RealtimeError::InvalidStatus(other.to_string())),
        }
    }
}

/// One user's presence as seen by other clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub status: PresenceStatus,
    /// None while the user is online
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Derived presence record. Status is offline iff the count is zero; an
/// explicit away/busy survives partial disconnects and resets when the user
/// goes fully offline.
#[derive(Debug, Clone)]
struct PresenceRecord {
    status: PresenceStatus,
    explicit: Option<PresenceStatus>,
    last_seen: Option<DateTime<Utc>>,
    connection_count: usize,
}

/// Tracks presence for every user the registry has seen recently.
pub struct PresenceTracker {
    records: DashMap<UserId, PresenceRecord>,
    registry: Arc<ConnectionRegistry>,
    bus: EventBus,
    offline_retention: chrono::Duration,
}

impl PresenceTracker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        bus: EventBus,
        offline_retention: chrono::Duration,
    ) -> Self {
        Self {
            records: DashMap::new(),
            registry,
            bus,
            offline_retention,
        }
    }

    /// Registry transition hook: a connection for `user_id` was admitted.
    pub async fn on_connect(&self, user_id: UserId) {
        let update = {
            let mut record = self.records.entry(user_id).or_insert(PresenceRecord {
                status: PresenceStatus::Offline,
                explicit: None,
                last_seen: None,
                connection_count: 0,
            });
            record.connection_count += 1;
            record.last_seen = None;
            let new_status = record.explicit.unwrap_or(PresenceStatus::Online);
            let changed = record.status != new_status;
            record.status = new_status;
            changed.then(|| PresenceUpdate {
                user_id,
                status: new_status,
                last_seen: None,
            })
        };
        if let Some(update) = update {
            self.broadcast(update).await;
        }
    }

    /// Registry transition hook: a connection for `user_id` went away.
    pub async fn on_disconnect(&self, user_id: UserId) {
        let update = {
            let mut record = match self.records.get_mut(&user_id) {
                Some(r) => r,
                // Disconnect for a user we never saw connect: stale, no-op.
                None => return,
            };
            record.connection_count = record.connection_count.saturating_sub(1);
            if record.connection_count > 0 {
                return;
            }
            record.explicit = None;
            record.last_seen = Some(Utc::now());
            let changed = record.status != PresenceStatus::Offline;
            record.status = PresenceStatus::Offline;
            changed.then(|| PresenceUpdate {
                user_id,
                status: PresenceStatus::Offline,
                last_seen: record.last_seen,
            })
        };
        if let Some(update) = update {
            self.broadcast(update).await;
        }
    }

    /// Explicit status change from the user.
    ///
    /// Offline cannot be set explicitly (it is derived from the connection
    /// count), and a status for a user with no connections is ignored. Both
    /// are silent no-ops per the stale-operation policy.
    pub async fn set_status(&self, user_id: UserId, status: PresenceStatus) {
        if status == PresenceStatus::Offline {
            tracing::debug!(user_id = user_id, "Ignoring explicit offline status");
            return;
        }
        let update = {
            let mut record = match self.records.get_mut(&user_id) {
                Some(r) => r,
                None => return,
            };
            if record.connection_count == 0 {
                return;
            }
            record.explicit = Some(status);
            let changed = record.status != status;
            record.status = status;
            changed.then(|| PresenceUpdate {
                user_id,
                status,
                last_seen: None,
            })
        };
        if let Some(update) = update {
            self.broadcast(update).await;
        }
    }

    /// Current presence for one user; unknown users read as offline.
    pub fn status_of(&self, user_id: UserId) -> PresenceStatus {
        self.records
            .get(&user_id)
            .map(|r| r.status)
            .unwrap_or(PresenceStatus::Offline)
    }

    /// Everyone's current presence; seeds a newly connected client.
    pub fn snapshot(&self) -> Vec<PresenceUpdate> {
        self.records
            .iter()
            .map(|r| PresenceUpdate {
                user_id: *r.key(),
                status: r.status,
                last_seen: r.last_seen,
            })
            .collect()
    }

    /// Snapshot without the given user's own entry.
    pub fn snapshot_excluding(&self, user_id: UserId) -> Vec<PresenceUpdate> {
        self.snapshot()
            .into_iter()
            .filter(|u| u.user_id != user_id)
            .collect()
    }

    /// Presence for a specific contact list. Users never seen (or already
    /// reaped) read as offline with no last-seen.
    pub fn bulk_lookup(&self, user_ids: &[UserId]) -> HashMap<UserId, PresenceUpdate> {
        user_ids
            .iter()
            .map(|&user_id| {
                let update = self
                    .records
                    .get(&user_id)
                    .map(|r| PresenceUpdate {
                        user_id,
                        status: r.status,
                        last_seen: r.last_seen,
                    })
                    .unwrap_or(PresenceUpdate {
                        user_id,
                        status: PresenceStatus::Offline,
                        last_seen: None,
                    });
                (user_id, update)
            })
            .collect()
    }

    /// Drop offline records older than the retention window. Called by the
    /// background reaper; iterates a marked set rather than mutating the
    /// map mid-scan.
    pub fn purge_stale(&self) -> usize {
        let cutoff = Utc::now() - self.offline_retention;
        let stale: Vec<UserId> = self
            .records
            .iter()
            .filter(|r| {
                r.connection_count == 0
                    && r.last_seen.map(|seen| seen < cutoff).unwrap_or(false)
            })
            .map(|r| *r.key())
            .collect();

        let mut purged = 0;
        for user_id in stale {
            // Re-check under the entry lock; the user may have reconnected.
            if self
                .records
                .remove_if(&user_id, |_, r| {
                    r.connection_count == 0
                        && r.last_seen.map(|seen| seen < cutoff).unwrap_or(false)
                })
                .is_some()
            {
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::debug!(purged = purged, "Purged stale presence records");
        }
        purged
    }

    /// Publish the change and fan it out to every other connected user.
    /// Individual write failures are swallowed; presence is best-effort.
    async fn broadcast(&self, update: PresenceUpdate) {
        tracing::debug!(
            user_id = update.user_id,
            status = %update.status,
            "Presence changed"
        );
        self.bus
            .publish(RealtimeEvent::PresenceChanged(update.clone()));

        for connection in self.registry.all_connections() {
            if connection.user_id == update.user_id {
                continue;
            }
            if let Err(e) = connection
                .handle
                .write(Frame::Presence(update.clone()))
                .await
            {
                tracing::debug!(
                    connection_id = %connection.id,
                    error = %e,
                    "Presence broadcast write failed"
                );
            }
        }
    }
}
