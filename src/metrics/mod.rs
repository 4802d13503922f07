//! Prometheus Metrics Module
//!
//! Engine-wide metrics collection using Prometheus.
//!
//! # Metrics Collected
//! - Active connection gauge
//! - Delivery outcomes by result
//! - Offline queue depth
//! - Forced connection closes by reason

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

/// Active connection gauge
pub static CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::with_opts(
        Opts::new("connections_active", "Number of active connections").namespace("realtime"),
    )
    .expect("Failed to create CONNECTIONS_ACTIVE metric")
});

/// Delivery outcome counter - "delivered", "offline", "failed"
pub static DELIVERIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("deliveries_total", "Delivery attempts by outcome").namespace("realtime"),
        &["outcome"],
    )
    .expect("Failed to create DELIVERIES_TOTAL metric")
});

/// Total payloads currently held in offline queues
pub static OFFLINE_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::with_opts(
        Opts::new("offline_queue_depth", "Payloads held across all offline queues")
            .namespace("realtime"),
    )
    .expect("Failed to create OFFLINE_QUEUE_DEPTH metric")
});

/// Forced close counter - "evicted", "heartbeat_timeout", "shutdown"
pub static FORCED_CLOSES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("forced_closes_total", "Forced connection closes by reason")
            .namespace("realtime"),
        &["reason"],
    )
    .expect("Failed to create FORCED_CLOSES_TOTAL metric")
});

fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(CONNECTIONS_ACTIVE.clone()))
        .expect("Failed to register CONNECTIONS_ACTIVE");
    registry
        .register(Box::new(DELIVERIES_TOTAL.clone()))
        .expect("Failed to register DELIVERIES_TOTAL");
    registry
        .register(Box::new(OFFLINE_QUEUE_DEPTH.clone()))
        .expect("Failed to register OFFLINE_QUEUE_DEPTH");
    registry
        .register(Box::new(FORCED_CLOSES_TOTAL.clone()))
        .expect("Failed to register FORCED_CLOSES_TOTAL");
}

/// Encode all registered metrics in Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
