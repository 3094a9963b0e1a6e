//! Core configuration.
//!
//! Every tunable the core uses lives here with its production default, so the
//! CLI (or a host app) can persist one JSON document and tests can shrink
//! timeouts without touching code.

use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Identity used as the rate-limit key for local discovery/advertising
    pub local_device_id: String,
    pub discovery: DiscoveryConfig,
    pub session: SessionConfig,
    pub transfer: TransferConfig,
    pub rate_limits: RateLimitConfig,
    pub checksum: ChecksumConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Primary transports, tried in order
    pub transport_priority: Vec<TransportKind>,
    /// Try the relay transport once every primary transport failed
    pub relay_fallback: bool,
    /// Wait for a connection-ready event, seconds
    pub connect_timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            transport_priority: vec![
                TransportKind::WifiAware,
                TransportKind::Multipeer,
                TransportKind::Ble,
                TransportKind::Hotspot,
            ],
            relay_fallback: true,
            connect_timeout_secs: 30,
        }
    }
}

impl DiscoveryConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub handshake_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    /// Initial chunk size with no throughput history
    pub default_chunk_size: usize,
    /// Initial chunk size when the last measured throughput was high
    pub fast_chunk_size: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// No progress for this long while transferring counts as a stall
    pub stall_timeout_secs: u64,
    pub health_check_interval_ms: u64,
    /// Errors beyond this count fail the transfer
    pub max_errors: u32,
    /// Completed and cancelled sessions are purged after this long
    pub retention_secs: u64,
    /// Snapshot progress every this many percent...
    pub snapshot_percent_step: f64,
    /// ...or every this many bytes, whichever comes first
    pub snapshot_byte_step: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: 1024,
            max_chunk_size: 1024 * 1024,
            default_chunk_size: 64 * 1024,
            fast_chunk_size: 256 * 1024,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            stall_timeout_secs: 30,
            health_check_interval_ms: 5000,
            max_errors: 10,
            retention_secs: 24 * 3600,
            snapshot_percent_step: 5.0,
            snapshot_byte_step: 10 * 1024 * 1024,
        }
    }
}

impl TransferConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// Ceiling and window for one rate-limit category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateRule {
    pub max_requests: usize,
    pub window_secs: u64,
}

impl RateRule {
    pub const fn new(max_requests: usize, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub discovery: RateRule,
    pub connection: RateRule,
    pub transfer: RateRule,
    pub invalid_frame: RateRule,
    /// Transfers across all devices
    pub global_transfer: RateRule,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            discovery: RateRule::new(10, 60),
            connection: RateRule::new(3, 60),
            transfer: RateRule::new(5, 60),
            invalid_frame: RateRule::new(10, 300),
            global_transfer: RateRule::new(50, 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksumConfig {
    /// Files at or above this size are hashed in windows
    pub chunked_threshold: u64,
    pub window_size: usize,
}

impl Default for ChecksumConfig {
    fn default() -> Self {
        Self {
            chunked_threshold: 10 * 1024 * 1024,
            window_size: 64 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_limits() {
        let config = CoreConfig::default();
        assert_eq!(config.discovery.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.rate_limits.connection, RateRule::new(3, 60));
        assert_eq!(config.rate_limits.invalid_frame.window(), Duration::from_secs(300));
        assert_eq!(config.transfer.max_chunk_size, 1024 * 1024);
        assert_eq!(config.checksum.window_size, 64 * 1024);
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let json = r#"{ "transfer": { "max_retries": 5 } }"#;
        let config: CoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.transfer.max_retries, 5);
        assert_eq!(config.transfer.min_chunk_size, 1024);
        assert!(config.discovery.relay_fallback);
    }
}
