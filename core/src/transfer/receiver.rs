// Receiving side: accept a manifest, write frames at their offsets, verify
//
// Frames for one transfer are applied under an async mutex so offsets are
// checked and written in arrival order. A frame whose offset is past the
// written position is a gap and is refused; a frame entirely behind it is a
// duplicate and is acknowledged without writing.

use super::chunking::decompress_chunk;
use super::engine::TransferEngine;
use super::types::{
    ChunkFrame, TransferDirection, TransferError, TransferFile, TransferPriority, TransferProgress,
    TransferSession, TransferStatus,
};
use crate::checksum::ChecksumRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingFile {
    pub file_id: String,
    pub name: String,
    pub size: u64,
    pub checksum: String,
}

/// Manifest the sender shares before its first chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingTransfer {
    pub transfer_id: String,
    pub source_device_id: String,
    pub session_id: Option<String>,
    pub encryption_enabled: bool,
    pub files: Vec<IncomingFile>,
}

/// Receiver's answer to one frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub transfer_id: String,
    pub file_id: String,
    pub index: u64,
    /// Contiguous bytes written for this file
    pub file_bytes: u64,
    pub file_complete: bool,
    /// Checksum verdict, once the file is complete
    pub verified: Option<bool>,
}

struct IncomingState {
    session: TransferSession,
    expected: HashMap<String, (usize, String)>,
}

pub(super) struct IncomingHandle {
    state: tokio::sync::Mutex<IncomingState>,
    progress_tx: parking_lot::Mutex<Option<broadcast::Sender<TransferProgress>>>,
    finished_at: parking_lot::Mutex<Option<u64>>,
    /// Accept time, then the arrival time of the latest frame
    last_activity: parking_lot::Mutex<u64>,
}

impl IncomingHandle {
    /// Finished transfers age from completion; unfinished ones from their
    /// last frame, so a sender that vanished does not pin the entry
    pub(super) fn expired(&self, now_ms: u64, retention_ms: u64) -> bool {
        let finished = *self.finished_at.lock();
        let since = finished.unwrap_or_else(|| *self.last_activity.lock());
        now_ms.saturating_sub(since) > retention_ms
    }

    fn emit(&self, session: &TransferSession, file_index: usize) {
        let Some(tx) = self.progress_tx.lock().clone() else {
            return;
        };
        let file = &session.files[file_index];
        let _ = tx.send(TransferProgress {
            transfer_id: session.id.clone(),
            file_id: file.id.clone(),
            file_name: file.name.clone(),
            bytes_transferred: session.bytes_transferred,
            total_bytes: session.total_bytes,
            progress: session.progress_percent(),
            speed: 0.0,
            status: session.status,
            estimated_time_remaining: None,
        });
    }
}

/// Only the final path component of a sender-supplied name is used
fn safe_file_name(name: &str, fallback: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty() && n != "..")
        .unwrap_or_else(|| fallback.to_string())
}

impl TransferError {
    /// Errors that count against the sending connection
    fn is_invalid_frame(&self) -> bool {
        matches!(
            self,
            TransferError::Frame(_)
                | TransferError::Session(_)
                | TransferError::NotFound(_)
                | TransferError::Gap { .. }
        )
    }
}

impl TransferEngine {
    /// Register an incoming transfer and pre-create its files under `dest_dir`
    pub async fn accept_incoming(
        &self,
        incoming: IncomingTransfer,
        dest_dir: impl AsRef<Path>,
    ) -> Result<broadcast::Receiver<TransferProgress>, TransferError> {
        if incoming.files.is_empty() {
            return Err(TransferError::NoFiles);
        }
        if incoming.encryption_enabled {
            self.ensure_session_ready(incoming.session_id.as_deref())?;
        }
        if let Some(existing) = self.incoming.read().get(&incoming.transfer_id) {
            let status = existing
                .state
                .try_lock()
                .map(|s| s.session.status)
                .unwrap_or(TransferStatus::Transferring);
            return Err(TransferError::InvalidState {
                id: incoming.transfer_id.clone(),
                status,
            });
        }

        let dest_dir = dest_dir.as_ref();
        tokio::fs::create_dir_all(dest_dir).await?;

        let mut files = Vec::with_capacity(incoming.files.len());
        let mut expected = HashMap::new();
        for (index, file) in incoming.files.iter().enumerate() {
            let path: PathBuf = dest_dir.join(safe_file_name(&file.name, &file.file_id));
            tokio::fs::File::create(&path).await?;
            expected.insert(file.file_id.clone(), (index, file.checksum.clone()));
            files.push(TransferFile {
                id: file.file_id.clone(),
                path,
                name: file.name.clone(),
                size: file.size,
                bytes_transferred: 0,
                status: TransferStatus::Pending,
                checksum: Some(file.checksum.clone()),
                error: None,
                can_retry: false,
            });
        }

        let now = crate::now_millis();
        let session = TransferSession {
            id: incoming.transfer_id.clone(),
            target_device_id: incoming.source_device_id.clone(),
            total_bytes: files.iter().map(|f| f.size).sum(),
            files,
            connection_method: None,
            connection_token: String::new(),
            status: TransferStatus::Transferring,
            bytes_transferred: 0,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
            encryption_enabled: incoming.encryption_enabled,
            compression_enabled: false,
            resume_enabled: false,
            direction: TransferDirection::Incoming,
            priority: TransferPriority::Normal,
            session_id: incoming.session_id.clone(),
            fanout_id: None,
        };

        let (tx, rx) = broadcast::channel(1024);
        let handle = IncomingHandle {
            state: tokio::sync::Mutex::new(IncomingState { session, expected }),
            progress_tx: parking_lot::Mutex::new(Some(tx)),
            finished_at: parking_lot::Mutex::new(None),
            last_activity: parking_lot::Mutex::new(crate::now_millis()),
        };
        self.incoming
            .write()
            .insert(incoming.transfer_id.clone(), std::sync::Arc::new(handle));
        info!(
            transfer_id = %incoming.transfer_id,
            source = %incoming.source_device_id,
            "Accepted incoming transfer"
        );
        Ok(rx)
    }

    /// Apply one frame that arrived on `connection_id`
    pub async fn receive_chunk(&self, connection_id: &str, bytes: &[u8]) -> Result<ChunkAck, TransferError> {
        if !self.limiter.is_invalid_frame_allowed(connection_id) {
            return Err(TransferError::ConnectionBlocked(connection_id.to_string()));
        }
        let result = self.apply_frame(bytes).await;
        if let Err(e) = &result {
            if e.is_invalid_frame() {
                warn!(connection_id, "Rejected chunk: {}", e);
                self.limiter.record_invalid_frame(connection_id);
            }
        }
        result
    }

    async fn apply_frame(&self, bytes: &[u8]) -> Result<ChunkAck, TransferError> {
        let frame = ChunkFrame::decode(bytes)?;
        let handle = self
            .incoming
            .read()
            .get(&frame.transfer_id)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(frame.transfer_id.clone()))?;
        *handle.last_activity.lock() = crate::now_millis();

        let mut state = handle.state.lock().await;
        if state.session.status.is_terminal() {
            return Err(TransferError::InvalidState {
                id: frame.transfer_id.clone(),
                status: state.session.status,
            });
        }
        let (file_index, expected_checksum) = state
            .expected
            .get(&frame.file_id)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(frame.file_id.clone()))?;

        if frame.encrypted != state.session.encryption_enabled {
            return Err(TransferError::Frame(format!(
                "encryption flag {} does not match the transfer",
                frame.encrypted
            )));
        }
        let payload = if frame.encrypted {
            let session_id = state.session.session_id.as_deref().ok_or(TransferError::MissingSession)?;
            self.sessions.open(
                session_id,
                &ChunkFrame::aad(&frame.transfer_id, &frame.file_id, frame.offset),
                &frame.payload,
            )?
        } else {
            frame.payload
        };
        let data = if frame.compressed {
            decompress_chunk(&payload).map_err(|e| TransferError::Frame(e.to_string()))?
        } else {
            payload
        };

        let (path, written, size) = {
            let file = &state.session.files[file_index];
            (file.path.clone(), file.bytes_transferred, file.size)
        };
        if frame.offset > written {
            return Err(TransferError::Gap {
                expected: written,
                got: frame.offset,
            });
        }
        let end = frame.offset + data.len() as u64;
        if end > size {
            return Err(TransferError::Frame(format!(
                "chunk ends at {} past file size {}",
                end, size
            )));
        }

        if end > written {
            // Overlaps only write the unseen tail
            let skip = (written - frame.offset) as usize;
            let mut file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
            file.seek(SeekFrom::Start(written)).await?;
            file.write_all(&data[skip..]).await?;
            file.flush().await?;

            let session = &mut state.session;
            session.files[file_index].bytes_transferred = end;
            session.files[file_index].status = TransferStatus::Transferring;
            session.recompute_bytes();
        } else {
            debug!(index = frame.index, "Duplicate chunk acknowledged");
        }

        let file_complete = state.session.files[file_index].bytes_transferred == size;
        let mut verified = None;
        if file_complete && state.session.files[file_index].status != TransferStatus::Completed
            && state.session.files[file_index].status != TransferStatus::Failed
        {
            let ok = self.checksums.verify_checksum(&path, &expected_checksum).await;
            let file = &mut state.session.files[file_index];
            if ok {
                file.status = TransferStatus::Completed;
                let record = ChecksumRecord::new(&frame.transfer_id, &path, size, expected_checksum.clone());
                self.checksums.store_checksum(&record);
                debug!(file = %file.name, "Received file verified");
            } else {
                file.status = TransferStatus::Failed;
                file.error = Some("checksum mismatch".to_string());
                warn!(file = %file.name, "Received file failed checksum verification");
            }
            verified = Some(ok);
        } else if file_complete {
            verified = Some(state.session.files[file_index].status == TransferStatus::Completed);
        }

        self.finish_incoming_if_done(&handle, &mut state.session);
        handle.emit(&state.session, file_index);
        if state.session.status.is_terminal() {
            handle.progress_tx.lock().take();
        }

        Ok(ChunkAck {
            transfer_id: frame.transfer_id,
            file_id: frame.file_id,
            index: frame.index,
            file_bytes: state.session.files[file_index].bytes_transferred,
            file_complete,
            verified,
        })
    }

    fn finish_incoming_if_done(&self, handle: &IncomingHandle, session: &mut TransferSession) {
        let done = session
            .files
            .iter()
            .all(|f| matches!(f.status, TransferStatus::Completed | TransferStatus::Failed));
        if !done {
            return;
        }
        let failed = session.files.iter().any(|f| f.status == TransferStatus::Failed);
        session.status = if failed {
            TransferStatus::Failed
        } else {
            TransferStatus::Completed
        };
        let now = crate::now_millis();
        session.completed_at = Some(now);
        *handle.finished_at.lock() = Some(now);
        info!(transfer_id = %session.id, status = ?session.status, "Incoming transfer finished");
    }

    pub async fn incoming_transfer(&self, transfer_id: &str) -> Option<TransferSession> {
        let handle = self.incoming.read().get(transfer_id).cloned()?;
        let state = handle.state.lock().await;
        Some(state.session.clone())
    }

    /// Manifest a receiver needs for an outgoing transfer
    pub fn manifest(&self, transfer_id: &str) -> Option<IncomingTransfer> {
        let handle = self.handle(transfer_id).ok()?;
        let session = handle.session.lock();
        Some(IncomingTransfer {
            transfer_id: session.id.clone(),
            source_device_id: self.local_device_id.clone(),
            session_id: session.session_id.clone(),
            encryption_enabled: session.encryption_enabled,
            files: handle
                .sources
                .iter()
                .map(|s| IncomingFile {
                    file_id: s.id.clone(),
                    name: s.name.clone(),
                    size: s.size,
                    checksum: s.checksum.clone(),
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{hash_bytes, ChecksumService};
    use crate::config::{ChecksumConfig, RateLimitConfig, SessionConfig, TransferConfig};
    use crate::crypto::SessionEngine;
    use crate::ratelimit::RateLimiter;
    use crate::store::MemoryStorage;
    use crate::transport::LocalGateway;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine() -> Arc<TransferEngine> {
        let backend = Arc::new(MemoryStorage::new());
        Arc::new(TransferEngine::new(
            Arc::new(LocalGateway::new()),
            Arc::new(SessionEngine::new("rx", SessionConfig::default())),
            Arc::new(ChecksumService::new(backend.clone(), ChecksumConfig::default())),
            Arc::new(RateLimiter::new(RateLimitConfig::default())),
            backend,
            TransferConfig::default(),
            "rx",
        ))
    }

    fn manifest(data: &[u8]) -> IncomingTransfer {
        IncomingTransfer {
            transfer_id: "t1".to_string(),
            source_device_id: "tx".to_string(),
            session_id: None,
            encryption_enabled: false,
            files: vec![IncomingFile {
                file_id: "f1".to_string(),
                name: "../../etc/report.txt".to_string(),
                size: data.len() as u64,
                checksum: hash_bytes(data),
            }],
        }
    }

    fn frame(offset: usize, data: &[u8], index: u64) -> Vec<u8> {
        ChunkFrame {
            transfer_id: "t1".to_string(),
            file_id: "f1".to_string(),
            index,
            total: 2,
            offset: offset as u64,
            compressed: false,
            encrypted: false,
            payload: data.to_vec(),
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn test_file_names_are_sanitized() {
        assert_eq!(safe_file_name("../../etc/passwd", "f"), "passwd");
        assert_eq!(safe_file_name("..", "f"), "f");
        assert_eq!(safe_file_name("", "f"), "f");
    }

    #[tokio::test]
    async fn test_receives_and_verifies() {
        let dir = TempDir::new().unwrap();
        let data = b"hello receiving side".to_vec();
        let engine = engine();
        engine.accept_incoming(manifest(&data), dir.path()).await.unwrap();

        let ack = engine.receive_chunk("conn", &frame(0, &data[..8], 0)).await.unwrap();
        assert!(!ack.file_complete);

        // Duplicate of the first chunk is idempotent
        let ack = engine.receive_chunk("conn", &frame(0, &data[..8], 0)).await.unwrap();
        assert_eq!(ack.file_bytes, 8);

        let ack = engine.receive_chunk("conn", &frame(8, &data[8..], 1)).await.unwrap();
        assert!(ack.file_complete);
        assert_eq!(ack.verified, Some(true));

        let written = std::fs::read(dir.path().join("report.txt")).unwrap();
        assert_eq!(written, data);
        let session = engine.incoming_transfer("t1").await.unwrap();
        assert_eq!(session.status, TransferStatus::Completed);
    }

    #[tokio::test]
    async fn test_gap_is_rejected() {
        let dir = TempDir::new().unwrap();
        let data = vec![7u8; 32];
        let engine = engine();
        engine.accept_incoming(manifest(&data), dir.path()).await.unwrap();

        let err = engine.receive_chunk("conn", &frame(16, &data[16..], 1)).await.unwrap_err();
        assert!(matches!(err, TransferError::Gap { expected: 0, got: 16 }));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails_file() {
        let dir = TempDir::new().unwrap();
        let data = vec![1u8; 16];
        let mut incoming = manifest(&data);
        incoming.files[0].checksum = hash_bytes(b"something else");
        let engine = engine();
        engine.accept_incoming(incoming, dir.path()).await.unwrap();

        let ack = engine.receive_chunk("conn", &frame(0, &data, 0)).await.unwrap();
        assert_eq!(ack.verified, Some(false));
        let session = engine.incoming_transfer("t1").await.unwrap();
        assert_eq!(session.status, TransferStatus::Failed);
        assert_eq!(session.files[0].error.as_deref(), Some("checksum mismatch"));
    }

    #[tokio::test]
    async fn test_garbage_frames_block_connection() {
        let engine = engine();
        for _ in 0..10 {
            assert!(matches!(
                engine.receive_chunk("noisy", b"garbage").await,
                Err(TransferError::Frame(_))
            ));
        }
        assert!(matches!(
            engine.receive_chunk("noisy", b"garbage").await,
            Err(TransferError::ConnectionBlocked(_))
        ));
        // Other connections are unaffected
        assert!(matches!(
            engine.receive_chunk("quiet", b"garbage").await,
            Err(TransferError::Frame(_))
        ));
    }

    #[tokio::test]
    async fn test_encrypted_manifest_needs_ready_session() {
        let dir = TempDir::new().unwrap();
        let mut incoming = manifest(b"x");
        incoming.encryption_enabled = true;
        incoming.session_id = Some("nope".to_string());
        assert!(matches!(
            engine().accept_incoming(incoming, dir.path()).await,
            Err(TransferError::SessionNotReady(_))
        ));
    }
}
