// Beamdrop core: peer discovery, secure sessions and chunked file transfer
//
// Platform radio code (Wi-Fi Aware, Multipeer, BLE, hotspot, relay) lives
// behind `TransportGateway`. Everything above that boundary is here.

pub mod checksum;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod ratelimit;
pub mod registry;
pub mod store;
pub mod transfer;
pub mod transport;

use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use checksum::{ChecksumError, ChecksumRecord, ChecksumService};
pub use config::CoreConfig;
pub use crypto::{SessionEngine, SessionError};
pub use discovery::{ConnectionState, DeviceRecord, DiscoveryError, DiscoveryOrchestrator};
pub use ratelimit::{RateLimitError, RateLimiter};
pub use registry::{ConnectionInfo, ConnectionRegistry, ValidationError};
pub use store::{MemoryStorage, SealedStorage, SledStorage, StorageBackend, StorageError, StorageKey};
pub use transfer::{TransferEngine, TransferError, TransferProgress, TransferRequest, TransferStatus};
pub use transport::{EventDecodeError, GatewayEvent, LocalGateway, TransportError, TransportGateway, TransportKind};

/// Milliseconds since the Unix epoch; a clock before 1970 reads as 0
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Any failure surfaced by the core, for callers that do not care which
/// subsystem produced it
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Checksum(#[from] ChecksumError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Event(#[from] EventDecodeError),
}

// ============================================================================
// CORE CONTEXT
// ============================================================================

/// Counts from one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub rate_limit_keys: usize,
    pub transfers: usize,
    pub checksums: usize,
}

/// Every subsystem wired to one gateway and one storage backend
pub struct CoreContext {
    pub config: CoreConfig,
    pub limiter: Arc<RateLimiter>,
    pub registry: Arc<ConnectionRegistry>,
    pub sessions: Arc<SessionEngine>,
    pub checksums: Arc<ChecksumService>,
    pub discovery: Arc<DiscoveryOrchestrator>,
    pub transfers: Arc<TransferEngine>,
}

impl CoreContext {
    /// `key` seals the connection registry at rest
    pub fn new(
        config: CoreConfig,
        gateway: Arc<dyn TransportGateway>,
        backend: Arc<dyn StorageBackend>,
        key: StorageKey,
    ) -> Self {
        let device_id = config.local_device_id.clone();
        let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));
        let registry = Arc::new(ConnectionRegistry::open(SealedStorage::new(backend.clone(), key)));
        let sessions = Arc::new(SessionEngine::new(device_id.clone(), config.session.clone()));
        let checksums = Arc::new(ChecksumService::new(backend.clone(), config.checksum.clone()));
        let discovery = Arc::new(DiscoveryOrchestrator::new(
            gateway.clone(),
            registry.clone(),
            limiter.clone(),
            config.discovery.clone(),
            device_id.clone(),
        ));
        let transfers = Arc::new(TransferEngine::new(
            gateway,
            sessions.clone(),
            checksums.clone(),
            limiter.clone(),
            backend,
            config.transfer.clone(),
            device_id.clone(),
        ));

        let restored = transfers.restore_from_snapshot();
        info!(device_id = %device_id, restored, "Core initialized");

        Self {
            config,
            limiter,
            registry,
            sessions,
            checksums,
            discovery,
            transfers,
        }
    }

    /// Route one gateway event to the subsystem that owns it
    pub async fn dispatch(&self, event: GatewayEvent) {
        if let Err(e) = event.validate() {
            warn!("Dropping gateway event: {}", e);
            return;
        }
        match event {
            GatewayEvent::ChunkReceived(chunk) => {
                if let Err(e) = self.transfers.receive_chunk(&chunk.connection_id, &chunk.bytes).await {
                    debug!(connection_id = %chunk.connection_id, "Chunk not applied: {}", e);
                }
            }
            GatewayEvent::ChunkSent(sent) => self.transfers.note_chunk_sent(&sent.transfer_id, sent.index),
            other => self.discovery.handle_event(&other),
        }
    }

    /// Decode a raw `{type, data}` map and dispatch it
    pub async fn dispatch_raw(&self, raw: &Value) -> Result<(), EventDecodeError> {
        let event = GatewayEvent::decode(raw)?;
        self.dispatch(event).await;
        Ok(())
    }

    /// Consume gateway events in arrival order until the sender closes
    pub async fn run_events(&self, mut rx: mpsc::UnboundedReceiver<GatewayEvent>) {
        while let Some(event) = rx.recv().await {
            self.dispatch(event).await;
        }
        debug!("Gateway event stream closed");
    }

    /// Drop idle rate-limit keys and expired transfer and checksum records
    pub fn maintenance(&self) -> MaintenanceReport {
        let retention = Duration::from_secs(self.config.transfer.retention_secs);
        let report = MaintenanceReport {
            rate_limit_keys: self.limiter.cleanup(),
            transfers: self.transfers.purge_expired(),
            checksums: self.checksums.purge_older_than(retention),
        };
        debug!(?report, "Maintenance pass");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChunkSent, ConnectionLost, DiscoveryUpdate};
    use serde_json::json;

    fn context() -> (Arc<LocalGateway>, CoreContext) {
        let gateway = Arc::new(LocalGateway::new());
        let config = CoreConfig {
            local_device_id: "local".to_string(),
            ..CoreConfig::default()
        };
        let ctx = CoreContext::new(
            config,
            gateway.clone(),
            Arc::new(MemoryStorage::new()),
            StorageKey::random(),
        );
        (gateway, ctx)
    }

    #[test]
    fn test_now_millis_is_after_2020() {
        assert!(now_millis() > 1_577_836_800_000);
    }

    #[tokio::test]
    async fn test_dispatch_routes_discovery_events() {
        let (_gateway, ctx) = context();
        ctx.dispatch(GatewayEvent::DiscoveryUpdate(DiscoveryUpdate {
            device_id: "peer".to_string(),
            device_name: "Peer".to_string(),
            connection_method: Some(TransportKind::Ble),
            peer_id: None,
            device_address: Some("AA:BB".to_string()),
            host: None,
            port: None,
            connection_token: None,
            rssi: Some(-60),
            extra: Default::default(),
        }))
        .await;
        assert_eq!(ctx.discovery.devices().len(), 1);

        ctx.dispatch(GatewayEvent::ConnectionLost(ConnectionLost {
            device_id: "peer".to_string(),
            reason: None,
        }))
        .await;
        assert!(!ctx.discovery.device("peer").unwrap().is_connected);

        // Unknown transfers are ignored
        ctx.dispatch(GatewayEvent::ChunkSent(ChunkSent {
            transfer_id: "nope".to_string(),
            index: 0,
        }))
        .await;
    }

    #[tokio::test]
    async fn test_dispatch_raw_rejects_malformed_events() {
        let (_gateway, ctx) = context();
        assert!(ctx
            .dispatch_raw(&json!({ "type": "discoveryUpdate", "data": { "deviceId": "x" } }))
            .await
            .is_err());
        assert!(ctx.dispatch_raw(&json!({ "type": "bogus" })).await.is_err());
        assert!(ctx.discovery.devices().is_empty());
    }

    #[test]
    fn test_maintenance_on_empty_core() {
        let (_gateway, ctx) = context();
        assert_eq!(ctx.maintenance(), MaintenanceReport::default());
    }
}
