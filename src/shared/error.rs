//! Engine Error Types
//!
//! Only malformed requests surface to callers as errors. Concurrency races
//! (double remove, cancel of an already-fired timer) are absorbed as no-ops,
//! and transient delivery failures are reflected through outcomes and
//! emitted events rather than thrown upward.

/// Realtime engine error type
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid presence status: {0}")]
    InvalidStatus(String),
}

pub type Result<T> = std::result::Result<T, RealtimeError>;
