//! Common Test Utilities
//!
//! Engine fixtures with fast timings and helpers for driving
//! channel-backed connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::Receiver;
use tokio::time::timeout;

use chat_realtime::config::Settings;
use chat_realtime::engine::RealtimeEngine;
use chat_realtime::protocol::Frame;
use chat_realtime::shared::{ConnectionId, UserId};
use chat_realtime::transport::ChannelHandle;

/// Settings scaled down so scenarios complete in milliseconds.
pub fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.connection.write_timeout_ms = 100;
    settings.delivery.max_attempts = 2;
    settings.delivery.base_backoff_ms = 10;
    settings.offline_queue.flush_delay_ms = 1;
    settings.typing.expiry_secs = 1;
    settings
}

pub fn test_engine() -> Arc<RealtimeEngine> {
    RealtimeEngine::new(fast_settings())
}

/// Connect a user through the engine with a channel-backed handle.
pub async fn connect_user(
    engine: &RealtimeEngine,
    user_id: UserId,
    device_id: &str,
) -> (ConnectionId, Receiver<Frame>) {
    let (handle, rx) = ChannelHandle::pair(64);
    let connection_id = engine
        .connect(user_id, Some(device_id.to_string()), handle)
        .await;
    (connection_id, rx)
}

/// Receive the next frame or panic after a generous deadline.
pub async fn recv_frame(rx: &mut Receiver<Frame>) -> Frame {
    timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection channel closed")
}

/// Receive frames until one matches the predicate, skipping others
/// (presence noise, snapshots).
pub async fn recv_matching(
    rx: &mut Receiver<Frame>,
    mut predicate: impl FnMut(&Frame) -> bool,
) -> Frame {
    loop {
        let frame = recv_frame(rx).await;
        if predicate(&frame) {
            return frame;
        }
    }
}
