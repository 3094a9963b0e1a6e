// Transfer-state snapshot: one JSON map transferId -> TransferSession

use super::types::TransferSession;
use crate::store::StorageBackend;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error};

const SNAPSHOT_KEY: &[u8] = b"transfer/snapshot";

pub struct TransferStateStore {
    backend: Arc<dyn StorageBackend>,
}

impl TransferStateStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Unreadable snapshots load as empty
    pub fn load(&self) -> BTreeMap<String, TransferSession> {
        match self.backend.get(SNAPSHOT_KEY) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                error!("Transfer snapshot is corrupt: {}", e);
                BTreeMap::new()
            }),
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                error!("Failed to read transfer snapshot: {}", e);
                BTreeMap::new()
            }
        }
    }

    pub fn save(&self, sessions: &BTreeMap<String, TransferSession>) -> bool {
        let bytes = match serde_json::to_vec(sessions) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to serialize transfer snapshot: {}", e);
                return false;
            }
        };
        match self
            .backend
            .put(SNAPSHOT_KEY, &bytes)
            .and_then(|_| self.backend.flush())
        {
            Ok(()) => {
                debug!("Saved transfer snapshot with {} sessions", sessions.len());
                true
            }
            Err(e) => {
                error!("Failed to write transfer snapshot: {}", e);
                false
            }
        }
    }
}
