//! Configuration for a sync session.
//!
//! Every field has a default, so a partial JSON document (or none at all) is
//! enough. Durations are milliseconds.

use std::time::Duration;

use serde::Deserialize;

/// Top-level session configuration
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub connection: ConnectionConfig,
    pub presence: PresenceConfig,
    pub messaging: MessagingConfig,
    pub typing: TypingConfig,
}

impl SyncConfig {
    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Socket and reconnection policy
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub url: String,
    pub connect_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Fraction of each delay that is randomized, in `0.0..=1.0`.
    pub backoff_jitter: f64,
    /// Attempts after an unexpected disconnect before reporting persistent failure.
    pub max_reconnect_attempts: u32,
    /// Outbound events held while not connected; the oldest is dropped on overflow.
    pub outbound_queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            connect_timeout_ms: 15_000,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            backoff_jitter: 0.5,
            max_reconnect_attempts: 10,
            outbound_queue_capacity: 256,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Presence heartbeat and away detection
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PresenceConfig {
    pub heartbeat_interval_ms: u64,
    /// Inactivity after which the heartbeat announces AWAY.
    pub away_timeout_ms: u64,
    /// Minimum spacing between recorded activity timestamps.
    pub activity_throttle_ms: u64,
    pub persistence_outbox_capacity: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            away_timeout_ms: 120_000,
            activity_throttle_ms: 1_000,
            persistence_outbox_capacity: 64,
        }
    }
}

impl PresenceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Message delivery timing
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MessagingConfig {
    /// Time to wait for `message:sent` before retrying (once) or failing.
    pub ack_timeout_ms: u64,
    /// How long an edit/delete/reaction for an unknown message is kept.
    pub mutation_grace_ms: u64,
    pub history_page_size: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 10_000,
            mutation_grace_ms: 10_000,
            history_page_size: 50,
        }
    }
}

impl MessagingConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn mutation_grace(&self) -> Duration {
        Duration::from_millis(self.mutation_grace_ms)
    }
}

/// Typing indicator timing
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TypingConfig {
    /// Minimum spacing between outbound `typing:start` events.
    pub debounce_ms: u64,
    /// Local inactivity after which `typing:stop` is emitted.
    pub idle_stop_ms: u64,
    /// Lifetime of a remote typing indicator without a refresh.
    pub remote_ttl_ms: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            idle_stop_ms: 2_000,
            remote_ttl_ms: 5_000,
        }
    }
}
