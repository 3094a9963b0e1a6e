// Transfer records, progress events, the chunk frame and the control word

use crate::checksum::ChecksumError;
use crate::crypto::SessionError;
use crate::ratelimit::RateLimitError;
use crate::transport::{TransportError, TransportKind};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Pending,
    Transferring,
    Paused,
    Resuming,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferPriority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferFile {
    pub id: String,
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    /// Last acknowledged offset; resume starts here
    pub bytes_transferred: u64,
    pub status: TransferStatus,
    pub checksum: Option<String>,
    pub error: Option<String>,
    pub can_retry: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSession {
    pub id: String,
    pub target_device_id: String,
    pub files: Vec<TransferFile>,
    pub connection_method: Option<TransportKind>,
    pub connection_token: String,
    pub status: TransferStatus,
    pub total_bytes: u64,
    pub bytes_transferred: u64,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub encryption_enabled: bool,
    pub compression_enabled: bool,
    pub resume_enabled: bool,
    pub direction: TransferDirection,
    pub priority: TransferPriority,
    /// Secure session whose key seals this transfer's chunks
    pub session_id: Option<String>,
    pub fanout_id: Option<String>,
}

impl TransferSession {
    pub fn progress_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.status == TransferStatus::Completed { 100.0 } else { 0.0 };
        }
        self.bytes_transferred as f64 / self.total_bytes as f64 * 100.0
    }

    pub(crate) fn recompute_bytes(&mut self) {
        self.bytes_transferred = self.files.iter().map(|f| f.bytes_transferred).sum();
    }
}

/// Per-transfer throughput and error accounting; not persisted
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetrics {
    pub files_completed: u32,
    pub bytes_transferred: u64,
    /// Bytes per second over the current run
    pub average_speed: f64,
    pub error_count: u32,
    pub error_rate: f64,
    pub chunks_sent: u64,
    pub last_update: u64,
}

impl TransferMetrics {
    pub(crate) fn refresh_error_rate(&mut self) {
        let attempts = self.chunks_sent + u64::from(self.error_count);
        self.error_rate = if attempts == 0 {
            0.0
        } else {
            f64::from(self.error_count) / attempts as f64
        };
    }
}

/// Totals across every transfer the engine knows about
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateMetrics {
    pub total_transfers: usize,
    pub active_transfers: usize,
    pub files_completed: u32,
    pub bytes_transferred: u64,
    /// Sum of the speeds of active transfers
    pub combined_speed: f64,
    pub error_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub transfer_id: String,
    pub file_id: String,
    pub file_name: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub progress: f64,
    pub speed: f64,
    pub status: TransferStatus,
    /// Seconds, when a speed estimate exists
    pub estimated_time_remaining: Option<f64>,
}

/// What a caller asks the engine to send
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub target_device_id: String,
    pub connection_token: String,
    pub connection_method: Option<TransportKind>,
    pub files: Vec<PathBuf>,
    pub priority: TransferPriority,
    pub encryption_enabled: bool,
    pub compression_enabled: bool,
    pub resume_enabled: bool,
    pub session_id: Option<String>,
}

impl TransferRequest {
    /// Encrypted under `session_id`, compression off, resumable
    pub fn new(
        target_device_id: impl Into<String>,
        connection_token: impl Into<String>,
        session_id: impl Into<String>,
        files: Vec<PathBuf>,
    ) -> Self {
        Self {
            target_device_id: target_device_id.into(),
            connection_token: connection_token.into(),
            connection_method: None,
            files,
            priority: TransferPriority::Normal,
            encryption_enabled: true,
            compression_enabled: false,
            resume_enabled: true,
            session_id: Some(session_id.into()),
        }
    }

    /// Plaintext chunks; only ever chosen explicitly
    pub fn unencrypted(
        target_device_id: impl Into<String>,
        connection_token: impl Into<String>,
        files: Vec<PathBuf>,
    ) -> Self {
        Self {
            target_device_id: target_device_id.into(),
            connection_token: connection_token.into(),
            connection_method: None,
            files,
            priority: TransferPriority::Normal,
            encryption_enabled: false,
            compression_enabled: false,
            resume_enabled: true,
            session_id: None,
        }
    }

    pub fn with_method(mut self, method: TransportKind) -> Self {
        self.connection_method = Some(method);
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    pub fn with_priority(mut self, priority: TransferPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_resume(mut self, enabled: bool) -> Self {
        self.resume_enabled = enabled;
        self
    }
}

/// Returned by `start_transfer`; the receiver was subscribed before the
/// first chunk went out
#[derive(Debug)]
pub struct TransferStarted {
    pub transfer_id: String,
    pub progress: broadcast::Receiver<TransferProgress>,
}

/// Chunk envelope plus its coordinates, as it travels through `send_chunk`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFrame {
    pub transfer_id: String,
    pub file_id: String,
    pub index: u64,
    pub total: u64,
    pub offset: u64,
    pub compressed: bool,
    pub encrypted: bool,
    pub payload: Vec<u8>,
}

impl ChunkFrame {
    pub fn encode(&self) -> Result<Vec<u8>, TransferError> {
        bincode::serialize(self).map_err(|e| TransferError::Frame(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransferError> {
        bincode::deserialize(bytes).map_err(|e| TransferError::Frame(e.to_string()))
    }

    /// Associated data binding a sealed payload to its position
    pub fn aad(transfer_id: &str, file_id: &str, offset: u64) -> Vec<u8> {
        format!("{}:{}:{}", transfer_id, file_id, offset).into_bytes()
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
    #[error("Secure session {0} is not ready")]
    SessionNotReady(String),
    #[error("Encrypted transfer requested without a secure session")]
    MissingSession,
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Transfer not found: {0}")]
    NotFound(String),
    #[error("Transfer {id} cannot do that while {status:?}")]
    InvalidState { id: String, status: TransferStatus },
    #[error("Transfer has no files")]
    NoFiles,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Checksum error: {0}")]
    Checksum(#[from] ChecksumError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Malformed chunk frame: {0}")]
    Frame(String),
    #[error("Chunk at offset {got} leaves a gap after {expected}")]
    Gap { expected: u64, got: u64 },
    #[error("Transfer cancelled")]
    Cancelled,
    #[error("Connection {0} is blocked after repeated invalid frames")]
    ConnectionBlocked(String),
}

const RUN: u8 = 0;
const PAUSE: u8 = 1;
const CANCEL: u8 = 2;
const ABORT: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Cancel,
    /// Failed by the health monitor
    Abort,
}

/// Cooperative control word, checked at chunk boundaries and before backoff
#[derive(Debug, Default)]
pub struct TransferControl(AtomicU8);

impl TransferControl {
    pub fn new() -> Self {
        Self(AtomicU8::new(RUN))
    }

    pub fn set(&self, signal: ControlSignal) {
        let raw = match signal {
            ControlSignal::Run => RUN,
            ControlSignal::Pause => PAUSE,
            ControlSignal::Cancel => CANCEL,
            ControlSignal::Abort => ABORT,
        };
        self.0.store(raw, Ordering::SeqCst);
    }

    pub fn get(&self) -> ControlSignal {
        match self.0.load(Ordering::SeqCst) {
            PAUSE => ControlSignal::Pause,
            CANCEL => ControlSignal::Cancel,
            ABORT => ControlSignal::Abort,
            _ => ControlSignal::Run,
        }
    }

    pub fn should_stop(&self) -> bool {
        self.get() != ControlSignal::Run
    }
}
