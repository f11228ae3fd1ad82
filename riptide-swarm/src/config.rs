//! Centralized configuration for the connection engine.
//!
//! All tunable limits and timeouts are defined here to avoid hard-coded
//! values scattered throughout the engine.

use std::time::Duration;

use crate::network::EncryptionTypes;

/// Central configuration for the swarm engine.
///
/// Groups related settings into logical sections. Supports environment
/// variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct SwarmConfig {
    pub connection: ConnectionConfig,
    pub encryption: EncryptionConfig,
    pub bandwidth: BandwidthConfig,
}

/// Connection limits and scheduling parameters.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum open connections across all torrents
    pub max_open_connections: usize,
    /// Maximum outbound connects in flight across all torrents
    pub max_half_open_connections: usize,
    /// Timeout applied by the TCP connector
    pub connect_timeout: Duration,
    /// Period of the scheduler tick that fills free connection slots
    pub connect_interval: Duration,
    /// Largest accepted message body, length prefix excluded
    pub max_message_length: usize,
    /// A peer cleaned up this many times is not reused
    pub max_cleanups: u32,
    /// Capacity of the actor command channel
    pub command_channel_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_open_connections: 200,
            max_half_open_connections: 8,
            connect_timeout: Duration::from_secs(10),
            connect_interval: Duration::from_secs(1),
            max_message_length: 1024 * 1024, // 1 MiB
            max_cleanups: 5,
            command_channel_capacity: 100,
        }
    }
}

/// Engine-wide encryption policy.
#[derive(Debug, Clone, Default)]
pub struct EncryptionConfig {
    /// Encryption kinds any connection may negotiate
    pub allowed: EncryptionTypes,
}

/// Engine-wide bandwidth limits in bytes per second (None = unlimited).
#[derive(Debug, Clone, Default)]
pub struct BandwidthConfig {
    pub upload_limit: Option<u64>,
    pub download_limit: Option<u64>,
}

impl SwarmConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(max) = env_parse::<usize>("RIPTIDE_MAX_OPEN_CONNECTIONS") {
            config.connection.max_open_connections = max;
        }

        if let Some(max) = env_parse::<usize>("RIPTIDE_MAX_HALF_OPEN") {
            config.connection.max_half_open_connections = max;
        }

        if let Some(seconds) = env_parse::<u64>("RIPTIDE_CONNECT_TIMEOUT") {
            config.connection.connect_timeout = Duration::from_secs(seconds);
        }

        if let Some(millis) = env_parse::<u64>("RIPTIDE_CONNECT_INTERVAL_MS") {
            config.connection.connect_interval = Duration::from_millis(millis);
        }

        if let Some(length) = env_parse::<usize>("RIPTIDE_MAX_MESSAGE_LENGTH") {
            config.connection.max_message_length = length;
        }

        if let Some(allowed) = env_parse::<EncryptionTypes>("RIPTIDE_ENCRYPTION") {
            config.encryption.allowed = allowed;
        }

        if let Some(limit) = env_parse::<u64>("RIPTIDE_UPLOAD_LIMIT") {
            config.bandwidth.upload_limit = Some(limit);
        }

        if let Some(limit) = env_parse::<u64>("RIPTIDE_DOWNLOAD_LIMIT") {
            config.bandwidth.download_limit = Some(limit);
        }

        config
    }

    /// Creates a configuration tuned for tests: short timeouts, small limits.
    pub fn for_testing() -> Self {
        Self {
            connection: ConnectionConfig {
                max_open_connections: 10,
                max_half_open_connections: 4,
                connect_timeout: Duration::from_millis(500),
                connect_interval: Duration::from_millis(50),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("Ignoring invalid value '{}' for {}", value, name);
            None
        }
    }
}
