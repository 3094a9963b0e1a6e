// Connection registry: latest connection info per device, encrypted at rest
//
// The whole table is one JSON map sealed under a single storage key. Rows are
// never deleted implicitly; a failed validation is stored with `invalid: true`
// in the metadata so the orchestrator can refuse to dial it.

use crate::store::SealedStorage;
use crate::transport::{is_valid_address, is_valid_port, TransportKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, error, warn};

const TABLE_KEY: &[u8] = b"registry/connections";

pub const INVALID_FLAG: &str = "invalid";
pub const INVALID_REASON: &str = "invalidReason";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("connection has no transport kind")]
    MissingTransport,
    #[error("{0} connection needs a host and port or a connection token")]
    MissingEndpoint(TransportKind),
    #[error("invalid host address: {0}")]
    InvalidAddress(String),
    #[error("invalid port: {0}")]
    InvalidPort(u32),
    #[error("{0} connection needs a connection token or device address")]
    MissingToken(TransportKind),
    #[error("{0} connection needs a peer id")]
    MissingPeerId(TransportKind),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub device_id: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub transport_kind: Option<TransportKind>,
    pub is_connected: bool,
    pub last_connected_at: u64,
    pub connection_token: Option<String>,
    pub peer_id: Option<String>,
    pub device_address: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ConnectionInfo {
    pub fn new(device_id: impl Into<String>, transport_kind: Option<TransportKind>) -> Self {
        Self {
            device_id: device_id.into(),
            host: None,
            port: None,
            transport_kind,
            is_connected: false,
            last_connected_at: 0,
            connection_token: None,
            peer_id: None,
            device_address: None,
            metadata: Map::new(),
        }
    }

    fn has_token(&self) -> bool {
        self.connection_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Check that the payload carries what its transport needs to be dialed
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.device_id.is_empty() {
            return Err(ValidationError::MissingField("deviceId"));
        }
        let kind = self.transport_kind.ok_or(ValidationError::MissingTransport)?;

        if kind.is_wifi_based() {
            if self.has_token() {
                return Ok(());
            }
            match (&self.host, self.port) {
                (Some(host), Some(port)) => {
                    if !is_valid_address(host) {
                        return Err(ValidationError::InvalidAddress(host.clone()));
                    }
                    if !is_valid_port(u32::from(port)) {
                        return Err(ValidationError::InvalidPort(u32::from(port)));
                    }
                    Ok(())
                }
                _ => Err(ValidationError::MissingEndpoint(kind)),
            }
        } else if kind.is_token_based() {
            let has_address = self.device_address.as_deref().is_some_and(|a| !a.is_empty());
            if self.has_token() || has_address {
                Ok(())
            } else {
                Err(ValidationError::MissingToken(kind))
            }
        } else {
            Ok(())
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self.metadata.get(INVALID_FLAG), Some(Value::Bool(true)))
    }

    pub fn mark_invalid(&mut self, reason: &str) {
        self.metadata.insert(INVALID_FLAG.to_string(), Value::Bool(true));
        self.metadata
            .insert(INVALID_REASON.to_string(), Value::String(reason.to_string()));
    }

    fn clear_invalid(&mut self) {
        self.metadata.remove(INVALID_FLAG);
        self.metadata.remove(INVALID_REASON);
    }
}

/// Encrypted device → ConnectionInfo table
pub struct ConnectionRegistry {
    storage: SealedStorage,
    table: Mutex<BTreeMap<String, ConnectionInfo>>,
}

impl ConnectionRegistry {
    /// Load the persisted table; an unreadable table starts empty
    pub fn open(storage: SealedStorage) -> Self {
        let table = match storage.get(TABLE_KEY) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                error!("Connection table is corrupt, starting empty: {}", e);
                BTreeMap::new()
            }),
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                error!("Failed to load connection table: {}", e);
                BTreeMap::new()
            }
        };
        debug!("Loaded {} connection records", table.len());
        Self {
            storage,
            table: Mutex::new(table),
        }
    }

    fn persist(&self, table: &BTreeMap<String, ConnectionInfo>) -> bool {
        let bytes = match serde_json::to_vec(table) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to serialize connection table: {}", e);
                return false;
            }
        };
        match self.storage.put(TABLE_KEY, &bytes) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to persist connection table: {}", e);
                false
            }
        }
    }

    /// Validate and store `info` (latest wins). Returns the row as stored,
    /// flagged invalid when validation failed.
    pub fn store_connection_info(&self, mut info: ConnectionInfo) -> ConnectionInfo {
        match info.validate() {
            Ok(()) => info.clear_invalid(),
            Err(e) => {
                warn!(device_id = %info.device_id, "Storing invalid connection info: {}", e);
                info.mark_invalid(&e.to_string());
            }
        }

        let mut table = self.table.lock();
        table.insert(info.device_id.clone(), info.clone());
        self.persist(&table);
        info
    }

    pub fn get_connection_info(&self, device_id: &str) -> Option<ConnectionInfo> {
        self.table.lock().get(device_id).cloned()
    }

    pub fn all_connections(&self) -> Vec<ConnectionInfo> {
        self.table.lock().values().cloned().collect()
    }

    /// Flip the connected flag on an existing row
    pub fn set_connected(&self, device_id: &str, connected: bool) -> bool {
        let mut table = self.table.lock();
        let Some(info) = table.get_mut(device_id) else {
            return false;
        };
        info.is_connected = connected;
        if connected {
            info.last_connected_at = crate::now_millis();
        }
        self.persist(&table)
    }

    /// Explicit removal; nothing in the core calls this on its own
    pub fn forget(&self, device_id: &str) -> bool {
        let mut table = self.table.lock();
        if table.remove(device_id).is_none() {
            return false;
        }
        self.persist(&table)
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStorage, StorageBackend, StorageKey};
    use std::sync::Arc;

    fn registry_over(backend: Arc<MemoryStorage>, key: [u8; 32]) -> ConnectionRegistry {
        ConnectionRegistry::open(SealedStorage::new(backend, StorageKey::from_bytes(key)))
    }

    fn hotspot(device_id: &str) -> ConnectionInfo {
        let mut info = ConnectionInfo::new(device_id, Some(TransportKind::Hotspot));
        info.host = Some("192.168.43.1".to_string());
        info.port = Some(8988);
        info
    }

    #[test]
    fn test_validation_rules() {
        assert!(hotspot("d1").validate().is_ok());

        let mut bad_host = hotspot("d1");
        bad_host.host = Some("300.1.1.1".to_string());
        assert_eq!(
            bad_host.validate(),
            Err(ValidationError::InvalidAddress("300.1.1.1".to_string()))
        );

        let mut bad_port = hotspot("d1");
        bad_port.port = Some(0);
        assert_eq!(bad_port.validate(), Err(ValidationError::InvalidPort(0)));

        let mut token_only = ConnectionInfo::new("d1", Some(TransportKind::WifiAware));
        token_only.connection_token = Some("tok".to_string());
        assert!(token_only.validate().is_ok());

        let ble = ConnectionInfo::new("d2", Some(TransportKind::Ble));
        assert_eq!(ble.validate(), Err(ValidationError::MissingToken(TransportKind::Ble)));

        let mut ble_addr = ble.clone();
        ble_addr.device_address = Some("AA:BB:CC:DD:EE:FF".to_string());
        assert!(ble_addr.validate().is_ok());

        assert_eq!(
            ConnectionInfo::new("d3", None).validate(),
            Err(ValidationError::MissingTransport)
        );
    }

    #[test]
    fn test_invalid_rows_are_stored_flagged() {
        let registry = registry_over(Arc::new(MemoryStorage::new()), [3u8; 32]);
        let stored = registry.store_connection_info(ConnectionInfo::new("d2", Some(TransportKind::Ble)));
        assert!(stored.is_invalid());
        assert!(stored.metadata.contains_key(INVALID_REASON));

        // A later valid payload clears the flag
        let mut fixed = ConnectionInfo::new("d2", Some(TransportKind::Ble));
        fixed.connection_token = Some("tok".to_string());
        assert!(!registry.store_connection_info(fixed).is_invalid());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_table_survives_reopen_and_is_encrypted() {
        let backend = Arc::new(MemoryStorage::new());
        {
            let registry = registry_over(backend.clone(), [7u8; 32]);
            registry.store_connection_info(hotspot("d1"));
            assert!(registry.set_connected("d1", true));
        }

        let raw = backend.get(TABLE_KEY).unwrap().unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("192.168.43.1"));

        let reopened = registry_over(backend.clone(), [7u8; 32]);
        let info = reopened.get_connection_info("d1").unwrap();
        assert!(info.is_connected);
        assert!(info.last_connected_at > 0);

        // Wrong key: table is unreadable, registry starts empty
        assert!(registry_over(backend, [8u8; 32]).is_empty());
    }

    #[test]
    fn test_set_connected_unknown_device() {
        let registry = registry_over(Arc::new(MemoryStorage::new()), [1u8; 32]);
        assert!(!registry.set_connected("ghost", true));
        assert!(!registry.forget("ghost"));
    }
}
