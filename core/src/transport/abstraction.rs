//! Transport abstraction layer for Beamdrop
//!
//! Defines the transport kinds the core can drive and the transient error type
//! every gateway call is converted into.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Local-networking technologies the gateway can drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    /// WiFi Aware (Neighbor Awareness Networking) data paths
    WifiAware,
    /// Bluetooth Low Energy with token exchange
    Ble,
    /// Multipeer-style peer sessions
    Multipeer,
    /// Local hotspot / plain LAN socket
    Hotspot,
    /// Cloud relay, last-resort fallback
    Relay,
}

impl TransportKind {
    /// Transports whose connection info is a routable host and port
    pub fn is_wifi_based(self) -> bool {
        matches!(
            self,
            TransportKind::WifiAware | TransportKind::Hotspot | TransportKind::Multipeer
        )
    }

    /// Transports identified by an opaque token or device address
    pub fn is_token_based(self) -> bool {
        matches!(self, TransportKind::Ble)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::WifiAware => "wifiAware",
            TransportKind::Ble => "ble",
            TransportKind::Multipeer => "multipeer",
            TransportKind::Hotspot => "hotspot",
            TransportKind::Relay => "relay",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wifiaware" | "wifi_aware" | "wifi-aware" => Ok(TransportKind::WifiAware),
            "ble" | "bluetooth" => Ok(TransportKind::Ble),
            "multipeer" => Ok(TransportKind::Multipeer),
            "hotspot" | "wifi" => Ok(TransportKind::Hotspot),
            "relay" | "cloud" => Ok(TransportKind::Relay),
            other => Err(TransportError::TransportNotAvailable(other.to_string())),
        }
    }
}

/// Errors from the transport gateway. All of them are per-attempt: the
/// orchestrator falls back to the next transport, the transfer engine retries.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportError {
    #[error("Transport not available: {0}")]
    TransportNotAvailable(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Key rejected: {0}")]
    KeyRejected(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
