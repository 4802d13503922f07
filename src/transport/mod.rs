//! Transport Seam
//!
//! The engine never owns a socket. The transport layer hands it a
//! `(user_id, device_id, handle)` triple after the handshake and identity
//! check, and the engine calls back through [`ConnectionHandle`] to write
//! outbound frames or force a close.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::protocol::Frame;

/// Why a write to a connection handle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    #[error("connection closed")]
    Closed,

    #[error("write timed out")]
    Timeout,

    #[error("send buffer full")]
    Backpressure,
}

/// Why the engine is closing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Evicted to make room for a newer login
    Evicted,
    /// Missed its heartbeat deadline
    HeartbeatTimeout,
    /// Client-initiated logout
    Logout,
    /// Engine shutting down
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Evicted => "evicted",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::Logout => "logout",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine-side view of one live transport session.
///
/// Implementations must be cheap to clone behind an `Arc` and must not
/// block indefinitely in `write`; the engine additionally wraps writes in
/// its own timeout so one stalled peer cannot stall a dispatch fan-out.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// Push one outbound frame to the peer.
    async fn write(&self, frame: Frame) -> Result<(), WriteError>;

    /// Force-close the underlying transport. Idempotent.
    async fn close(&self, reason: CloseReason);
}

/// Channel-backed handle: frames written by the engine come out of an
/// `mpsc::Receiver` the transport task (or a test) drains.
pub struct ChannelHandle {
    tx: Mutex<Option<mpsc::Sender<Frame>>>,
}

impl ChannelHandle {
    /// Create a handle plus the receiver side the transport drains.
    pub fn pair(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

#[async_trait]
impl ConnectionHandle for ChannelHandle {
    async fn write(&self, frame: Frame) -> Result<(), WriteError> {
        // Clone the sender out so the lock is not held across the send.
        let tx = self.tx.lock().clone();
        match tx {
            None => Err(WriteError::Closed),
            Some(tx) => tx.try_send(frame).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => WriteError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => WriteError::Closed,
            }),
        }
    }

    async fn close(&self, reason: CloseReason) {
        if self.tx.lock().take().is_some() {
            tracing::debug!(reason = %reason, "Channel handle closed");
        }
    }
}
