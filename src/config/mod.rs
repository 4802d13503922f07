//! Configuration Management

mod settings;

pub use settings::{
    ConnectionSettings, DeliverySettings, HeartbeatSettings, OfflineQueueSettings,
    PresenceSettings, Settings, TypingSettings,
};
