//! # Chat Realtime Library
//!
//! The connection and delivery engine behind the chat platform:
//! - Connection registry with duplicate-login eviction
//! - Derived presence tracking with best-effort broadcast
//! - Retrying fan-out delivery with an offline queue fallback
//! - Heartbeat liveness monitoring
//! - Self-expiring typing indicators and explicit logout
//!
//! The transport layer (socket ownership, handshake, authentication) and
//! the persistence layer (durable messages, users, conversations) are
//! external collaborators: the transport hands the engine an
//! already-verified `(user_id, device_id, handle)` triple, and delivery
//! operates on opaque, already-persisted payloads.
//!
//! ## Module Structure
//!
//! ```text
//! chat_realtime/
//! +-- config/      Configuration management
//! +-- shared/      Common types (errors, identifiers)
//! +-- protocol/    Strict inbound commands and outbound frames
//! +-- transport/   Connection handle seam to the transport layer
//! +-- events/      Typed engine event bus
//! +-- registry/    Connection registry
//! +-- presence/    Presence tracker
//! +-- delivery/    Delivery engine
//! +-- offline/     Offline queue
//! +-- liveness/    Heartbeat monitor
//! +-- typing/      Typing indicator channels
//! +-- engine       Orchestrator tying the lifecycle together
//! ```

// Configuration module
pub mod config;

// Shared utilities
pub mod shared;

// Boundary shapes and the transport seam
pub mod protocol;
pub mod transport;

// Engine components
pub mod delivery;
pub mod events;
pub mod liveness;
pub mod offline;
pub mod presence;
pub mod registry;
pub mod typing;

// Orchestrator
pub mod engine;

// Observability
pub mod metrics;
pub mod telemetry;

pub use engine::RealtimeEngine;
pub use shared::{ConnectionId, RealtimeError, UserId};
