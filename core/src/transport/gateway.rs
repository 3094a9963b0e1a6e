//! Transport gateway: the narrow boundary to platform radio code.
//!
//! Implementers wrap the actual Wi-Fi Aware / BLE / Multipeer / hotspot / relay
//! APIs (typically Kotlin or Swift behind FFI). The core only ever talks to
//! this trait plus the event stream described in [`crate::transport::events`].

use super::abstraction::{TransportError, TransportKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Endpoint information returned when a data path is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub connection_token: Option<String>,
}

#[async_trait]
pub trait TransportGateway: Send + Sync {
    async fn start_discovery(&self, kind: TransportKind) -> Result<(), TransportError>;

    async fn stop_discovery(&self, kind: TransportKind) -> Result<(), TransportError>;

    async fn start_advertising(&self, kind: TransportKind) -> Result<(), TransportError>;

    async fn stop_advertising(&self, kind: TransportKind) -> Result<(), TransportError>;

    /// Connect to a peer by id or address, returning the connection token
    async fn connect(&self, kind: TransportKind, address: &str) -> Result<String, TransportError>;

    /// Create a data path (Wi-Fi Aware style) to a discovered peer
    async fn create_datapath(
        &self,
        kind: TransportKind,
        peer_id: &str,
    ) -> Result<Endpoint, TransportError>;

    /// Send one chunk frame. `Ok(false)` means the peer did not acknowledge.
    async fn send_chunk(
        &self,
        connection_token: &str,
        bytes: &[u8],
        index: u64,
        total: u64,
    ) -> Result<bool, TransportError>;

    /// Install a link-layer key. Gateways must refuse keys that fail
    /// [`crate::crypto::is_weak_key`].
    async fn set_encryption_key(
        &self,
        connection_token: &str,
        key: &[u8],
    ) -> Result<bool, TransportError>;
}
