//! Engine Identifiers

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical user identity, assigned by the persistence layer upstream.
pub type UserId = i64;

/// Device id used when the client did not supply one.
pub const DEFAULT_DEVICE_ID: &str = "unknown";

/// Opaque connection identifier, assigned when a connection is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
