//! Engine settings and configuration structures.

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Root configuration structure containing all engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Connection registry configuration
    pub connection: ConnectionSettings,

    /// Heartbeat / liveness configuration
    pub heartbeat: HeartbeatSettings,

    /// Typing indicator configuration
    pub typing: TypingSettings,

    /// Delivery retry configuration
    pub delivery: DeliverySettings,

    /// Offline queue configuration
    pub offline_queue: OfflineQueueSettings,

    /// Presence cache configuration
    pub presence: PresenceSettings,

    /// Current environment (development, staging, production)
    pub environment: String,
}

/// Connection registry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    /// Maximum simultaneous connections per user; the oldest is evicted
    /// when a new connection would exceed this (default: 5)
    pub max_per_user: usize,

    /// Per-frame write timeout in milliseconds, so one stalled peer cannot
    /// stall dispatch for others (default: 5000)
    pub write_timeout_ms: u64,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatSettings {
    /// Ping interval in seconds (default: 25)
    pub interval_secs: u64,

    /// Grace period beyond the interval before a connection is declared
    /// dead (default: 5)
    pub timeout_secs: u64,
}

/// Typing indicator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TypingSettings {
    /// Auto-expiry window for a typing signal in seconds (default: 5)
    pub expiry_secs: u64,
}

/// Delivery retry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliverySettings {
    /// Maximum delivery attempts before giving up (default: 3)
    pub max_attempts: u32,

    /// Base backoff in milliseconds; attempt N sleeps base * N (default: 1000)
    pub base_backoff_ms: u64,
}

/// Offline queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OfflineQueueSettings {
    /// Maximum queued payloads per user; oldest dropped first (default: 50)
    pub cap_per_user: usize,

    /// Retention horizon in hours for queued payloads (default: 24)
    pub retention_hours: i64,

    /// Inter-item delay in milliseconds when flushing to a freshly
    /// reconnected client (default: 25)
    pub flush_delay_ms: u64,

    /// Background reaper interval in seconds (default: 60)
    pub reaper_interval_secs: u64,
}

/// Presence cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceSettings {
    /// How long an offline user's presence record is retained before the
    /// reaper drops it, in seconds (default: 300)
    pub offline_retention_secs: u64,
}

impl Settings {
    /// Load settings from environment variables and configuration files.
    ///
    /// The loading order is:
    /// 1. built-in defaults
    /// 2. config/default.toml (base configuration)
    /// 3. config/{RUN_ENV}.toml (environment-specific overrides)
    /// 4. Environment variables (highest priority)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        // Determine the running environment
        let environment = std::env::var("RUN_ENV").unwrap_or_else(|_| "development".into());

        Config::builder()
            .set_default("environment", environment.clone())?
            .set_default("connection.max_per_user", 5)?
            .set_default("connection.write_timeout_ms", 5000)?
            .set_default("heartbeat.interval_secs", 25)?
            .set_default("heartbeat.timeout_secs", 5)?
            .set_default("typing.expiry_secs", 5)?
            .set_default("delivery.max_attempts", 3)?
            .set_default("delivery.base_backoff_ms", 1000)?
            .set_default("offline_queue.cap_per_user", 50)?
            .set_default("offline_queue.retention_hours", 24)?
            .set_default("offline_queue.flush_delay_ms", 25)?
            .set_default("offline_queue.reaper_interval_secs", 60)?
            .set_default("presence.offline_retention_secs", 300)?
            // Load from config files
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            // Load from environment variables
            // APP__HEARTBEAT__INTERVAL_SECS=25 -> heartbeat.interval_secs = 25
            .add_source(
                Environment::default()
                    .prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

impl Default for Settings {
    /// Built-in defaults, for embedding the engine without config files.
    fn default() -> Self {
        Self {
            connection: ConnectionSettings {
                max_per_user: 5,
                write_timeout_ms: 5000,
            },
            heartbeat: HeartbeatSettings {
                interval_secs: 25,
                timeout_secs: 5,
            },
            typing: TypingSettings { expiry_secs: 5 },
            delivery: DeliverySettings {
                max_attempts: 3,
                base_backoff_ms: 1000,
            },
            offline_queue: OfflineQueueSettings {
                cap_per_user: 50,
                retention_hours: 24,
                flush_delay_ms: 25,
                reaper_interval_secs: 60,
            },
            presence: PresenceSettings {
                offline_retention_secs: 300,
            },
            environment: "development".into(),
        }
    }
}

impl ConnectionSettings {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl HeartbeatSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Full deadline after which an unanswered ping kills the connection.
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.interval_secs + self.timeout_secs)
    }
}

impl TypingSettings {
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }
}

impl DeliverySettings {
    /// Backoff before retrying after the given (1-based) attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_backoff_ms * attempt as u64)
    }
}

impl OfflineQueueSettings {
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

impl PresenceSettings {
    pub fn offline_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.offline_retention_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.connection.max_per_user, 5);
        assert_eq!(settings.heartbeat.interval_secs, 25);
        assert_eq!(settings.heartbeat.timeout_secs, 5);
        assert_eq!(settings.typing.expiry_secs, 5);
        assert_eq!(settings.delivery.max_attempts, 3);
        assert_eq!(settings.delivery.base_backoff_ms, 1000);
        assert_eq!(settings.offline_queue.cap_per_user, 50);
        assert_eq!(settings.offline_queue.retention_hours, 24);
        assert_eq!(settings.offline_queue.reaper_interval_secs, 60);
    }

    #[test]
    fn heartbeat_deadline_includes_grace() {
        let settings = Settings::default();
        assert_eq!(
            settings.heartbeat.deadline(),
            Duration::from_secs(30),
        );
    }

    #[test]
    fn backoff_scales_linearly() {
        let delivery = Settings::default().delivery;
        assert_eq!(delivery.backoff_for(1), Duration::from_millis(1000));
        assert_eq!(delivery.backoff_for(3), Duration::from_millis(3000));
    }
}
