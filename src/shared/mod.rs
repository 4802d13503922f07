//! Shared Utilities
//!
//! Common types used across the engine: errors and identifiers.

pub mod error;
pub mod ids;

pub use error::{RealtimeError, Result};
pub use ids::{ConnectionId, UserId, DEFAULT_DEVICE_ID};
