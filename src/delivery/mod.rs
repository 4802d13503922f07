//! Delivery Engine
//!
//! Pushes an opaque payload to every live connection of a target user.
//! One attempt is a fan-out write to all connections; success is at least
//! one accepted write. Transient failures retry with linear backoff. The
//! backoff sleeps are the engine's only intentional blocking delays, and
//! each write carries its own timeout so a stalled peer cannot stall the
//! fan-out for others.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::time::{sleep, timeout};

use crate::config::DeliverySettings;
use crate::events::{EventBus, RealtimeEvent};
use crate::metrics;
use crate::protocol::Frame;
use crate::registry::{ConnectionRegistry, RegisteredConnection};
use crate::shared::UserId;
use crate::transport::WriteError;

/// What happened to a delivery after retries were exhausted.
///
/// `RecipientOffline` is the caller's cue to enqueue for later flush;
/// `WritesFailed` means the recipient's process was reachable but every
/// write failed, so a push-notification fallback is the caller's call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    RecipientOffline,
    WritesFailed,
}

impl DeliveryOutcome {
    pub fn delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

/// Retrying fan-out dispatcher over the connection registry.
pub struct DeliveryEngine {
    registry: Arc<ConnectionRegistry>,
    bus: EventBus,
    settings: DeliverySettings,
    write_timeout: std::time::Duration,
}

impl DeliveryEngine {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        bus: EventBus,
        settings: DeliverySettings,
        write_timeout: std::time::Duration,
    ) -> Self {
        Self {
            registry,
            bus,
            settings,
            write_timeout,
        }
    }

    /// Attempt delivery to every live connection of `target`, retrying up
    /// to the configured attempt count with backoff `base * attempt`.
    ///
    /// A target with zero connections returns immediately; no retries, no
    /// sleeping. Cross-message ordering is not guaranteed once multiple
    /// payloads are in flight; the persistence layer's timestamps are
    /// authoritative for read-side ordering.
    pub async fn deliver(&self, target: UserId, payload: Value) -> DeliveryOutcome {
        let payload_ref = payload_ref(&payload);

        for attempt in 1..=self.settings.max_attempts {
            let connections = self.registry.connections_for(target);
            if connections.is_empty() {
                break;
            }

            let writes = connections
                .iter()
                .map(|connection| self.write_one(connection, payload.clone()));
            let accepted = join_all(writes)
                .await
                .into_iter()
                .filter(|r| r.is_ok())
                .count();

            if accepted > 0 {
                tracing::debug!(
                    target = target,
                    attempt = attempt,
                    accepted = accepted,
                    "Payload delivered"
                );
                metrics::DELIVERIES_TOTAL
                    .with_label_values(&["delivered"])
                    .inc();
                self.bus.publish(RealtimeEvent::DeliveryResult {
                    payload_ref,
                    delivered: true,
                });
                return DeliveryOutcome::Delivered;
            }

            tracing::debug!(
                target = target,
                attempt = attempt,
                connections = connections.len(),
                "All writes failed"
            );
            if attempt < self.settings.max_attempts {
                sleep(self.settings.backoff_for(attempt)).await;
            }
        }

        self.bus.publish(RealtimeEvent::DeliveryResult {
            payload_ref,
            delivered: false,
        });

        // The recipient may have disconnected mid-retry; the final registry
        // state decides whether the caller should queue or fall back.
        if self.registry.is_online(target) {
            metrics::DELIVERIES_TOTAL.with_label_values(&["failed"]).inc();
            DeliveryOutcome::WritesFailed
        } else {
            metrics::DELIVERIES_TOTAL
                .with_label_values(&["offline"])
                .inc();
            DeliveryOutcome::RecipientOffline
        }
    }

    async fn write_one(
        &self,
        connection: &Arc<RegisteredConnection>,
        payload: Value,
    ) -> Result<(), WriteError> {
        let result = match timeout(
            self.write_timeout,
            connection.handle.write(Frame::Message { payload }),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(WriteError::Timeout),
        };
        if let Err(e) = &result {
            tracing::debug!(
                connection_id = %connection.id,
                error = %e,
                "Write failed"
            );
        }
        result
    }
}

/// Best-effort reference for delivery events, taken from the payload's own
/// id field when the persistence layer put one there.
fn payload_ref(payload: &Value) -> Option<String> {
    let id = payload.get("id")?;
    id.as_str()
        .map(str::to_string)
        .or_else(|| id.as_i64().map(|n| n.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelHandle;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn engine(registry: Arc<ConnectionRegistry>, bus: EventBus) -> DeliveryEngine {
        DeliveryEngine::new(
            registry,
            bus,
            DeliverySettings {
                max_attempts: 3,
                base_backoff_ms: 1,
            },
            Duration::from_millis(50),
        )
    }

    fn setup() -> (Arc<ConnectionRegistry>, DeliveryEngine, EventBus) {
        let bus = EventBus::new();
        let registry = Arc::new(ConnectionRegistry::new(5, bus.clone()));
        let engine = engine(registry.clone(), bus.clone());
        (registry, engine, bus)
    }

    #[tokio::test]
    async fn offline_target_fails_fast() {
        let (_registry, engine, bus) = setup();
        let mut rx = bus.subscribe();

        let started = std::time::Instant::now();
        let outcome = engine.deliver(1, json!({"id": "m1", "body": "hi"})).await;
        assert_eq!(outcome, DeliveryOutcome::RecipientOffline);
        assert!(!outcome.delivered());
        // Immediate zero-connection check: no backoff sleeps happened.
        assert!(started.elapsed() < Duration::from_millis(50));

        match rx.recv().await.unwrap() {
            RealtimeEvent::DeliveryResult {
                payload_ref,
                delivered,
            } => {
                assert_eq!(payload_ref.as_deref(), Some("m1"));
                assert!(!delivered);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn one_accepting_connection_is_success() {
        let (registry, engine, _bus) = setup();

        // One dead connection (receiver dropped) and one live one.
        let (dead, dead_rx) = ChannelHandle::pair(8);
        drop(dead_rx);
        registry.admit(1, Some("stale".into()), dead);
        let (live, mut live_rx) = ChannelHandle::pair(8);
        registry.admit(1, Some("phone".into()), live);

        let outcome = engine.deliver(1, json!({"id": 7, "body": "hi"})).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered);

        let frame = live_rx.recv().await.unwrap();
        match frame {
            Frame::Message { payload } => assert_eq!(payload["id"], 7),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn all_writes_failing_reports_unreachable() {
        let (registry, engine, _bus) = setup();
        let (handle, rx) = ChannelHandle::pair(8);
        drop(rx);
        registry.admit(1, None, handle);

        let outcome = engine.deliver(1, json!({"body": "hi"})).await;
        // Still online, so the caller gets the push-fallback signal rather
        // than an instruction to queue.
        assert_eq!(outcome, DeliveryOutcome::WritesFailed);
    }

    #[tokio::test]
    async fn recipient_vanishing_mid_retry_reads_as_offline() {
        let bus = EventBus::new();
        let registry = Arc::new(ConnectionRegistry::new(5, bus.clone()));
        let engine = DeliveryEngine::new(
            registry.clone(),
            bus,
            DeliverySettings {
                max_attempts: 3,
                base_backoff_ms: 30,
            },
            Duration::from_millis(50),
        );
        let (handle, rx) = ChannelHandle::pair(8);
        drop(rx);
        let outcome_admit = registry.admit(1, None, handle);

        let registry2 = registry.clone();
        let conn_id = outcome_admit.connection_id();
        let remover = tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            registry2.remove(conn_id);
        });

        let outcome = engine.deliver(1, json!({"body": "hi"})).await;
        remover.await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::RecipientOffline);
    }

    #[test]
    fn payload_ref_reads_string_or_numeric_ids() {
        assert_eq!(payload_ref(&json!({"id": "abc"})).as_deref(), Some("abc"));
        assert_eq!(payload_ref(&json!({"id": 42})).as_deref(), Some("42"));
        assert_eq!(payload_ref(&json!({"body": "x"})), None);
    }
}
