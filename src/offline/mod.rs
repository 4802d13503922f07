//! Offline Queue
//!
//! Per-user bounded buffer of payloads that could not be delivered live.
//! Queues are sharded by user id, so operations on different users never
//! contend. A background reaper (driven by the engine) purges entries older
//! than the retention horizon so memory stays bounded even for users who
//! never reconnect.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::sleep;

use crate::config::OfflineQueueSettings;
use crate::metrics;
use crate::protocol::Frame;
use crate::shared::UserId;
use crate::transport::ConnectionHandle;

#[derive(Debug, Clone)]
struct QueuedPayload {
    body: Value,
    enqueued_at: DateTime<Utc>,
}

/// Per-user FIFO of undelivered payloads, capped with oldest-first drop.
pub struct OfflineQueue {
    queues: DashMap<UserId, VecDeque<QueuedPayload>>,
    settings: OfflineQueueSettings,
}

impl OfflineQueue {
    pub fn new(settings: OfflineQueueSettings) -> Self {
        Self {
            queues: DashMap::new(),
            settings,
        }
    }

    /// Append a payload to the user's buffer. If the buffer is at capacity
    /// the oldest entry is dropped first; the triggering enqueue is never
    /// rejected.
    pub fn enqueue(&self, user_id: UserId, payload: Value) {
        let mut queue = self.queues.entry(user_id).or_default();
        while queue.len() >= self.settings.cap_per_user {
            queue.pop_front();
            metrics::OFFLINE_QUEUE_DEPTH.dec();
            tracing::warn!(user_id = user_id, "Offline queue full, dropped oldest entry");
        }
        queue.push_back(QueuedPayload {
            body: payload,
            enqueued_at: Utc::now(),
        });
        metrics::OFFLINE_QUEUE_DEPTH.inc();
        tracing::debug!(
            user_id = user_id,
            depth = queue.len(),
            "Payload queued for offline user"
        );
    }

    pub fn len(&self, user_id: UserId) -> usize {
        self.queues.get(&user_id).map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, user_id: UserId) -> bool {
        self.len(user_id) == 0
    }

    /// Deliver the user's queued payloads to a freshly admitted connection,
    /// in original enqueue order, with a small inter-item delay so a
    /// just-reconnected client is not overwhelmed. Entries past the
    /// retention horizon are skipped. Returns the number delivered.
    ///
    /// If a write fails mid-flush, the failed payload and everything behind
    /// it go back to the front of the queue in order, to be retried on the
    /// next connection.
    pub async fn flush(&self, user_id: UserId, handle: &Arc<dyn ConnectionHandle>) -> usize {
        let drained: Vec<QueuedPayload> = match self.queues.remove(&user_id) {
            Some((_, queue)) => queue.into_iter().collect(),
            None => return 0,
        };
        metrics::OFFLINE_QUEUE_DEPTH.sub(drained.len() as i64);

        let cutoff = Utc::now() - self.settings.retention();
        let mut delivered = 0;
        let mut items = drained.into_iter().peekable();
        while let Some(item) = items.next() {
            if item.enqueued_at < cutoff {
                continue;
            }
            if let Err(e) = handle
                .write(Frame::Message {
                    payload: item.body.clone(),
                })
                .await
            {
                tracing::debug!(
                    user_id = user_id,
                    error = %e,
                    "Flush write failed, requeueing remainder"
                );
                let mut remainder: Vec<QueuedPayload> = vec![item];
                remainder.extend(items);
                let mut queue = self.queues.entry(user_id).or_default();
                for entry in remainder.into_iter().rev() {
                    queue.push_front(entry);
                    metrics::OFFLINE_QUEUE_DEPTH.inc();
                }
                return delivered;
            }
            delivered += 1;
            if items.peek().is_some() {
                sleep(self.settings.flush_delay()).await;
            }
        }

        if delivered > 0 {
            tracing::info!(
                user_id = user_id,
                delivered = delivered,
                "Offline queue flushed"
            );
        }
        delivered
    }

    /// Drop entries older than the retention horizon across all users.
    /// Collects the key set first and re-checks per entry, tolerating
    /// concurrent mutation while it runs.
    pub fn purge_expired(&self) -> usize {
        let cutoff = Utc::now() - self.settings.retention();
        let users: Vec<UserId> = self.queues.iter().map(|q| *q.key()).collect();

        let mut purged = 0;
        for user_id in users {
            if let Some(mut queue) = self.queues.get_mut(&user_id) {
                let before = queue.len();
                queue.retain(|item| item.enqueued_at >= cutoff);
                let dropped = before - queue.len();
                purged += dropped;
                metrics::OFFLINE_QUEUE_DEPTH.sub(dropped as i64);
            }
            self.queues.remove_if(&user_id, |_, queue| queue.is_empty());
        }
        if purged > 0 {
            tracing::info!(purged = purged, "Reaped expired offline payloads");
        }
        purged
    }
}
