// One-to-many sends: files are hashed once and shared by every per-receiver transfer

use super::engine::TransferEngine;
use super::types::{TransferError, TransferPriority, TransferRequest, TransferStarted, TransferStatus};
use crate::checksum::ChecksumRecord;
use crate::transport::TransportKind;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct FanoutTarget {
    pub device_id: String,
    pub connection_token: String,
    /// Required when the fan-out is encrypted
    pub session_id: Option<String>,
    pub connection_method: Option<TransportKind>,
}

#[derive(Debug, Clone)]
pub struct FanoutRequest {
    pub targets: Vec<FanoutTarget>,
    pub files: Vec<PathBuf>,
    pub encryption_enabled: bool,
    pub compression_enabled: bool,
    pub priority: TransferPriority,
}

#[derive(Debug)]
pub struct FanoutStarted {
    pub fanout_id: String,
    /// One transfer per target, in request order
    pub transfers: Vec<(String, TransferStarted)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverStatus {
    pub device_id: String,
    pub transfer_id: String,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutStatus {
    pub fanout_id: String,
    pub receivers: Vec<ReceiverStatus>,
    /// Every receiver reached a terminal state
    pub complete: bool,
    pub all_succeeded: bool,
}

impl TransferEngine {
    /// All targets are checked before anything starts; one bad target
    /// rejects the whole fan-out
    pub async fn start_fanout(self: &Arc<Self>, request: FanoutRequest) -> Result<FanoutStarted, TransferError> {
        if request.files.is_empty() || request.targets.is_empty() {
            return Err(TransferError::NoFiles);
        }
        if request.encryption_enabled {
            for target in &request.targets {
                self.ensure_session_ready(target.session_id.as_deref())?;
            }
        }
        let devices: Vec<&str> = request.targets.iter().map(|t| t.device_id.as_str()).collect();
        self.limiter.admit_transfers(&devices)?;

        let fanout_id = Uuid::new_v4().to_string();
        let sources = self.prepare_sources(&fanout_id, &request.files).await?;

        let mut transfers = Vec::with_capacity(request.targets.len());
        for target in &request.targets {
            let transfer_id = Uuid::new_v4().to_string();
            for source in &sources {
                let record = ChecksumRecord::new(&transfer_id, &source.path, source.size, source.checksum.clone());
                self.checksums.store_checksum(&record);
            }
            let per_target = TransferRequest {
                target_device_id: target.device_id.clone(),
                connection_token: target.connection_token.clone(),
                connection_method: target.connection_method,
                files: request.files.clone(),
                priority: request.priority,
                encryption_enabled: request.encryption_enabled,
                compression_enabled: request.compression_enabled,
                resume_enabled: true,
                session_id: target.session_id.clone(),
            };
            let started = self.launch(transfer_id, &per_target, sources.clone(), Some(fanout_id.clone()));
            transfers.push((target.device_id.clone(), started));
        }

        self.fanouts.write().insert(
            fanout_id.clone(),
            transfers.iter().map(|(_, s)| s.transfer_id.clone()).collect(),
        );
        info!(fanout_id = %fanout_id, receivers = transfers.len(), "Fan-out started");
        Ok(FanoutStarted { fanout_id, transfers })
    }

    pub fn fanout_status(&self, fanout_id: &str) -> Option<FanoutStatus> {
        let transfer_ids = self.fanouts.read().get(fanout_id).cloned()?;
        let receivers: Vec<ReceiverStatus> = transfer_ids
            .iter()
            .filter_map(|id| self.get_transfer(id))
            .map(|session| ReceiverStatus {
                device_id: session.target_device_id,
                transfer_id: session.id,
                status: session.status,
                bytes_transferred: session.bytes_transferred,
            })
            .collect();
        Some(FanoutStatus {
            fanout_id: fanout_id.to_string(),
            complete: receivers.iter().all(|r| r.status.is_terminal()),
            all_succeeded: receivers.iter().all(|r| r.status == TransferStatus::Completed),
            receivers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumService;
    use crate::config::{ChecksumConfig, RateLimitConfig, RateRule, SessionConfig, TransferConfig};
    use crate::crypto::SessionEngine;
    use crate::ratelimit::RateLimiter;
    use crate::store::MemoryStorage;
    use crate::transport::LocalGateway;
    use tempfile::TempDir;

    fn target(id: &str) -> FanoutTarget {
        FanoutTarget {
            device_id: id.to_string(),
            connection_token: format!("tok-{}", id),
            session_id: None,
            connection_method: None,
        }
    }

    #[tokio::test]
    async fn test_fanout_shares_sources_and_reports_status() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.bin");
        std::fs::write(&path, vec![9u8; 10_000]).unwrap();

        let backend = Arc::new(MemoryStorage::new());
        let checksums = Arc::new(ChecksumService::new(backend.clone(), ChecksumConfig::default()));
        let engine = Arc::new(TransferEngine::new(
            Arc::new(LocalGateway::new()),
            Arc::new(SessionEngine::new("me", SessionConfig::default())),
            checksums.clone(),
            Arc::new(RateLimiter::new(RateLimitConfig::default())),
            backend,
            TransferConfig::default(),
            "me",
        ));

        let started = engine
            .start_fanout(FanoutRequest {
                targets: vec![target("a"), target("b")],
                files: vec![path.clone()],
                encryption_enabled: false,
                compression_enabled: true,
                priority: TransferPriority::Normal,
            })
            .await
            .unwrap();
        assert_eq!(started.transfers.len(), 2);

        let mut ids = Vec::new();
        for (_, transfer) in started.transfers {
            let mut rx = transfer.progress;
            while rx.recv().await.is_ok() {}
            ids.push(transfer.transfer_id);
        }

        let a = engine.get_transfer(&ids[0]).unwrap();
        let b = engine.get_transfer(&ids[1]).unwrap();
        assert_eq!(a.files[0].id, b.files[0].id);
        assert_eq!(a.fanout_id.as_deref(), Some(started.fanout_id.as_str()));
        assert_eq!(checksums.get_transfer_checksums(&ids[1]).len(), 1);

        let status = engine.fanout_status(&started.fanout_id).unwrap();
        assert!(status.complete);
        assert!(status.all_succeeded);
    }

    #[tokio::test]
    async fn test_encrypted_fanout_rejects_unready_target() {
        let backend = Arc::new(MemoryStorage::new());
        let engine = Arc::new(TransferEngine::new(
            Arc::new(LocalGateway::new()),
            Arc::new(SessionEngine::new("me", SessionConfig::default())),
            Arc::new(ChecksumService::new(backend.clone(), ChecksumConfig::default())),
            Arc::new(RateLimiter::new(RateLimitConfig::default())),
            backend,
            TransferConfig::default(),
            "me",
        ));
        let result = engine
            .start_fanout(FanoutRequest {
                targets: vec![target("a")],
                files: vec![PathBuf::from("/nonexistent")],
                encryption_enabled: true,
                compression_enabled: false,
                priority: TransferPriority::High,
            })
            .await;
        assert!(matches!(result, Err(TransferError::MissingSession)));
        assert!(engine.list_transfers().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_target_charges_no_one() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.bin");
        std::fs::write(&path, vec![1u8; 1000]).unwrap();

        let mut limits = RateLimitConfig::default();
        limits.transfer = RateRule::new(1, 60);
        let limiter = Arc::new(RateLimiter::new(limits));
        limiter.admit_transfer("b").unwrap();

        let backend = Arc::new(MemoryStorage::new());
        let engine = Arc::new(TransferEngine::new(
            Arc::new(LocalGateway::new()),
            Arc::new(SessionEngine::new("me", SessionConfig::default())),
            Arc::new(ChecksumService::new(backend.clone(), ChecksumConfig::default())),
            limiter.clone(),
            backend,
            TransferConfig::default(),
            "me",
        ));
        let request = |targets| FanoutRequest {
            targets,
            files: vec![path.clone()],
            encryption_enabled: false,
            compression_enabled: false,
            priority: TransferPriority::Normal,
        };

        let result = engine.start_fanout(request(vec![target("a"), target("b")])).await;
        assert!(matches!(result, Err(TransferError::RateLimited(_))));
        assert_eq!(limiter.get_rate_limit_status("a").transfer_count, 0);
        assert!(engine.list_transfers().is_empty());

        // "a" still has its whole budget
        let started = engine.start_fanout(request(vec![target("a")])).await.unwrap();
        assert_eq!(started.transfers.len(), 1);
    }
}
