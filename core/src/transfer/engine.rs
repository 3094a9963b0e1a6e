// Transfer engine: sender loop, control operations, health monitor, snapshots
//
// Each outgoing transfer owns a control word and a broadcast progress
// channel. The send loop reads adaptively sized chunks from the last
// acknowledged offset, optionally compresses, seals them under the secure
// session and sends each frame with bounded retry. Pause and cancel are only
// observed between chunks.

use super::chunking::{compress_chunk, AdaptiveChunkSizer};
use super::receiver::IncomingHandle;
use super::retry::{send_with_retry, RetryPolicy};
use super::snapshot::TransferStateStore;
use super::types::{
    AggregateMetrics, ChunkFrame, ControlSignal, TransferControl, TransferDirection, TransferError,
    TransferFile, TransferMetrics, TransferProgress, TransferRequest, TransferSession, TransferStarted,
    TransferStatus,
};
use crate::checksum::ChecksumService;
use crate::config::TransferConfig;
use crate::crypto::SessionEngine;
use crate::ratelimit::RateLimiter;
use crate::store::StorageBackend;
use crate::transport::TransportGateway;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const PROGRESS_CAPACITY: usize = 1024;

/// A file being sent; shared by every transfer of a fan-out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub id: String,
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub checksum: String,
}

pub(super) struct TransferHandle {
    pub(super) session: Mutex<TransferSession>,
    pub(super) metrics: Mutex<TransferMetrics>,
    pub(super) sources: Vec<Arc<SourceFile>>,
    pub(super) control: TransferControl,
    progress_tx: Mutex<Option<broadcast::Sender<TransferProgress>>>,
    sender_task: Mutex<Option<JoinHandle<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    last_progress: Mutex<Instant>,
    /// Start of the current run and the bytes already sent before it
    run_start: Mutex<(Instant, u64)>,
    /// Bytes and percent at the last snapshot
    last_snapshot: Mutex<(u64, f64)>,
}

impl TransferHandle {
    fn new(session: TransferSession, sources: Vec<Arc<SourceFile>>) -> (Self, broadcast::Receiver<TransferProgress>) {
        let (tx, rx) = broadcast::channel(PROGRESS_CAPACITY);
        let bytes = session.bytes_transferred;
        let percent = session.progress_percent();
        let handle = Self {
            session: Mutex::new(session),
            metrics: Mutex::new(TransferMetrics::default()),
            sources,
            control: TransferControl::new(),
            progress_tx: Mutex::new(Some(tx)),
            sender_task: Mutex::new(None),
            health_task: Mutex::new(None),
            last_progress: Mutex::new(Instant::now()),
            run_start: Mutex::new((Instant::now(), bytes)),
            last_snapshot: Mutex::new((bytes, percent)),
        };
        (handle, rx)
    }

    fn status(&self) -> TransferStatus {
        self.session.lock().status
    }

    /// Fresh channel for a retried run; returns the first receiver
    fn reopen_progress(&self) -> broadcast::Receiver<TransferProgress> {
        let mut slot = self.progress_tx.lock();
        match slot.as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(PROGRESS_CAPACITY);
                *slot = Some(tx);
                rx
            }
        }
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<TransferProgress>> {
        self.progress_tx.lock().as_ref().map(|tx| tx.subscribe())
    }

    fn close_progress(&self) {
        self.progress_tx.lock().take();
    }

    fn emit(&self, file_index: usize) {
        let Some(tx) = self.progress_tx.lock().clone() else {
            return;
        };
        let progress = {
            let session = self.session.lock();
            let metrics = self.metrics.lock();
            let (file_id, file_name) = session
                .files
                .get(file_index)
                .map(|f| (f.id.clone(), f.name.clone()))
                .unwrap_or_default();
            let remaining = session.total_bytes.saturating_sub(session.bytes_transferred);
            TransferProgress {
                transfer_id: session.id.clone(),
                file_id,
                file_name,
                bytes_transferred: session.bytes_transferred,
                total_bytes: session.total_bytes,
                progress: session.progress_percent(),
                speed: metrics.average_speed,
                status: session.status,
                estimated_time_remaining: (metrics.average_speed > 0.0)
                    .then(|| remaining as f64 / metrics.average_speed),
            }
        };
        // No subscribers is fine
        let _ = tx.send(progress);
    }

    /// First file not yet completed, for status-change events
    fn current_file(&self) -> usize {
        let session = self.session.lock();
        session
            .files
            .iter()
            .position(|f| f.status != TransferStatus::Completed)
            .unwrap_or(0)
    }
}

pub struct TransferEngine {
    pub(super) gateway: Arc<dyn TransportGateway>,
    pub(super) sessions: Arc<SessionEngine>,
    pub(super) checksums: Arc<ChecksumService>,
    pub(super) limiter: Arc<RateLimiter>,
    pub(super) config: TransferConfig,
    pub(super) local_device_id: String,
    store: TransferStateStore,
    pub(super) transfers: RwLock<HashMap<String, Arc<TransferHandle>>>,
    pub(super) incoming: RwLock<HashMap<String, Arc<IncomingHandle>>>,
    pub(super) fanouts: RwLock<HashMap<String, Vec<String>>>,
    last_throughput: Mutex<Option<f64>>,
    snapshot_lock: Mutex<()>,
}

impl TransferEngine {
    pub fn new(
        gateway: Arc<dyn TransportGateway>,
        sessions: Arc<SessionEngine>,
        checksums: Arc<ChecksumService>,
        limiter: Arc<RateLimiter>,
        backend: Arc<dyn StorageBackend>,
        config: TransferConfig,
        local_device_id: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            sessions,
            checksums,
            limiter,
            config,
            local_device_id: local_device_id.into(),
            store: TransferStateStore::new(backend),
            transfers: RwLock::new(HashMap::new()),
            incoming: RwLock::new(HashMap::new()),
            fanouts: RwLock::new(HashMap::new()),
            last_throughput: Mutex::new(None),
            snapshot_lock: Mutex::new(()),
        }
    }

    pub(super) fn handle(&self, transfer_id: &str) -> Result<Arc<TransferHandle>, TransferError> {
        self.transfers
            .read()
            .get(transfer_id)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))
    }

    pub(super) fn ensure_session_ready(&self, session_id: Option<&str>) -> Result<(), TransferError> {
        let session_id = session_id.ok_or(TransferError::MissingSession)?;
        if self.sessions.is_ready(session_id) {
            Ok(())
        } else {
            Err(TransferError::SessionNotReady(session_id.to_string()))
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get_transfer(&self, transfer_id: &str) -> Option<TransferSession> {
        self.handle(transfer_id).ok().map(|h| h.session.lock().clone())
    }

    pub fn list_transfers(&self) -> Vec<TransferSession> {
        let mut list: Vec<TransferSession> = self
            .transfers
            .read()
            .values()
            .map(|h| h.session.lock().clone())
            .collect();
        list.sort_by_key(|s| s.created_at);
        list
    }

    pub fn transfer_metrics(&self, transfer_id: &str) -> Option<TransferMetrics> {
        self.handle(transfer_id).ok().map(|h| h.metrics.lock().clone())
    }

    /// `None` once the transfer reached a terminal state
    pub fn subscribe_progress(&self, transfer_id: &str) -> Option<broadcast::Receiver<TransferProgress>> {
        self.handle(transfer_id).ok().and_then(|h| h.subscribe())
    }

    pub fn aggregate_metrics(&self) -> AggregateMetrics {
        let transfers = self.transfers.read();
        let mut total = AggregateMetrics {
            total_transfers: transfers.len(),
            ..Default::default()
        };
        for handle in transfers.values() {
            let status = handle.status();
            let metrics = handle.metrics.lock();
            total.files_completed += metrics.files_completed;
            total.bytes_transferred += metrics.bytes_transferred;
            total.error_count += metrics.error_count;
            if matches!(status, TransferStatus::Transferring | TransferStatus::Resuming) {
                total.active_transfers += 1;
                total.combined_speed += metrics.average_speed;
            }
        }
        total
    }

    // ------------------------------------------------------------------
    // Starting
    // ------------------------------------------------------------------

    pub(super) async fn prepare_sources(
        &self,
        checksum_owner: &str,
        paths: &[PathBuf],
    ) -> Result<Vec<Arc<SourceFile>>, TransferError> {
        let mut sources = Vec::with_capacity(paths.len());
        for path in paths {
            let record = self.checksums.record_file(checksum_owner, path).await?;
            sources.push(Arc::new(SourceFile {
                id: Uuid::new_v4().to_string(),
                path: path.clone(),
                name: record.file_name,
                size: record.file_size,
                checksum: record.checksum,
            }));
        }
        Ok(sources)
    }

    /// Validate, hash the sources, then start the send loop
    pub async fn start_transfer(self: &Arc<Self>, request: TransferRequest) -> Result<TransferStarted, TransferError> {
        if request.files.is_empty() {
            return Err(TransferError::NoFiles);
        }
        if request.encryption_enabled {
            self.ensure_session_ready(request.session_id.as_deref())?;
        }
        self.limiter.admit_transfer(&request.target_device_id)?;

        let transfer_id = Uuid::new_v4().to_string();
        let sources = self.prepare_sources(&transfer_id, &request.files).await?;
        Ok(self.launch(transfer_id, &request, sources, None))
    }

    pub(super) fn launch(
        self: &Arc<Self>,
        transfer_id: String,
        request: &TransferRequest,
        sources: Vec<Arc<SourceFile>>,
        fanout_id: Option<String>,
    ) -> TransferStarted {
        let files: Vec<TransferFile> = sources
            .iter()
            .map(|source| TransferFile {
                id: source.id.clone(),
                path: source.path.clone(),
                name: source.name.clone(),
                size: source.size,
                bytes_transferred: 0,
                status: TransferStatus::Pending,
                checksum: Some(source.checksum.clone()),
                error: None,
                can_retry: true,
            })
            .collect();
        let session = TransferSession {
            id: transfer_id.clone(),
            target_device_id: request.target_device_id.clone(),
            total_bytes: files.iter().map(|f| f.size).sum(),
            files,
            connection_method: request.connection_method,
            connection_token: request.connection_token.clone(),
            status: TransferStatus::Pending,
            bytes_transferred: 0,
            created_at: crate::now_millis(),
            started_at: None,
            completed_at: None,
            encryption_enabled: request.encryption_enabled,
            compression_enabled: request.compression_enabled,
            resume_enabled: request.resume_enabled,
            direction: TransferDirection::Outgoing,
            priority: request.priority,
            session_id: request.session_id.clone(),
            fanout_id,
        };

        let (handle, progress) = TransferHandle::new(session, sources);
        let handle = Arc::new(handle);
        self.transfers.write().insert(transfer_id.clone(), handle.clone());
        self.persist();

        info!(transfer_id = %transfer_id, target = %request.target_device_id, "Transfer started");
        self.spawn_health(&handle);
        self.spawn_sender(&handle);

        TransferStarted { transfer_id, progress }
    }

    fn spawn_sender(self: &Arc<Self>, handle: &Arc<TransferHandle>) {
        let engine = Arc::clone(self);
        let task_handle = Arc::clone(handle);
        let task = tokio::spawn(async move { engine.run_send_loop(task_handle).await });
        *handle.sender_task.lock() = Some(task);
    }

    fn spawn_health(self: &Arc<Self>, handle: &Arc<TransferHandle>) {
        let mut slot = handle.health_task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let engine = Arc::downgrade(self);
        let task_handle = Arc::clone(handle);
        let interval = self.config.health_check_interval();
        *slot = Some(tokio::spawn(health_monitor(engine, task_handle, interval)));
    }

    // ------------------------------------------------------------------
    // Send loop
    // ------------------------------------------------------------------

    async fn run_send_loop(self: Arc<Self>, handle: Arc<TransferHandle>) {
        {
            let mut session = handle.session.lock();
            // Paused or cancelled before the loop got scheduled
            if !matches!(session.status, TransferStatus::Pending | TransferStatus::Resuming) {
                return;
            }
            session.status = TransferStatus::Transferring;
            session.started_at.get_or_insert_with(crate::now_millis);
            *handle.run_start.lock() = (Instant::now(), session.bytes_transferred);
        }
        *handle.last_progress.lock() = Instant::now();
        self.persist();
        handle.emit(handle.current_file());

        for index in 0..handle.sources.len() {
            if handle.session.lock().files[index].status == TransferStatus::Completed {
                continue;
            }
            match self.send_file(&handle, index).await {
                Ok(true) => {
                    handle.session.lock().files[index].status = TransferStatus::Completed;
                    handle.metrics.lock().files_completed += 1;
                    debug!(file = %handle.sources[index].name, "File sent");
                }
                Ok(false) => {
                    self.on_stopped(&handle, index);
                    return;
                }
                Err(e) => {
                    self.fail_file(&handle, index, e);
                    return;
                }
            }
        }
        self.complete(&handle);
    }

    /// Ok(true) when the file finished, Ok(false) when the control word stopped it
    async fn send_file(&self, handle: &TransferHandle, index: usize) -> Result<bool, TransferError> {
        let source = Arc::clone(&handle.sources[index]);
        let (transfer_id, token, encrypted, compressed, session_id, mut offset) = {
            let mut session = handle.session.lock();
            let file = &mut session.files[index];
            file.status = TransferStatus::Transferring;
            let offset = file.bytes_transferred;
            (
                session.id.clone(),
                session.connection_token.clone(),
                session.encryption_enabled,
                session.compression_enabled,
                session.session_id.clone(),
                offset,
            )
        };

        let mut file = tokio::fs::File::open(&source.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut sizer = AdaptiveChunkSizer::new(&self.config, *self.last_throughput.lock());
        let policy = RetryPolicy::from_config(&self.config);
        let mut chunk_index: u64 = 0;

        loop {
            if handle.control.should_stop() {
                return Ok(false);
            }
            // Zero-byte files still send one empty frame so the receiver creates them
            if offset >= source.size && !(source.size == 0 && chunk_index == 0) {
                break;
            }

            let chunk_size = sizer.current() as u64;
            let chunk_len = chunk_size.min(source.size - offset) as usize;
            let mut plain = vec![0u8; chunk_len];
            file.read_exact(&mut plain).await?;

            let after = source.size - offset - chunk_len as u64;
            let total = chunk_index + 1 + after.div_ceil(chunk_size);

            let (payload, was_compressed) = match compressed.then(|| compress_chunk(&plain)).flatten() {
                Some(packed) => (packed, true),
                None => (plain, false),
            };
            let payload = if encrypted {
                let session_id = session_id.as_deref().ok_or(TransferError::MissingSession)?;
                self.sessions
                    .seal(session_id, &ChunkFrame::aad(&transfer_id, &source.id, offset), &payload)?
            } else {
                payload
            };
            let frame = ChunkFrame {
                transfer_id: transfer_id.clone(),
                file_id: source.id.clone(),
                index: chunk_index,
                total,
                offset,
                compressed: was_compressed,
                encrypted,
                payload,
            }
            .encode()?;

            let report = send_with_retry(
                self.gateway.as_ref(),
                &token,
                &frame,
                chunk_index,
                total,
                policy,
                &handle.control,
            )
            .await;
            if report.failed_attempts > 0 {
                for _ in 0..report.failed_attempts {
                    sizer.record_error();
                }
                let mut metrics = handle.metrics.lock();
                metrics.error_count += report.failed_attempts;
                metrics.refresh_error_rate();
            }
            match report.result {
                Ok(()) => {}
                Err(TransferError::Cancelled) => return Ok(false),
                Err(e) => return Err(e),
            }

            sizer.record_success();
            offset += chunk_len as u64;
            chunk_index += 1;

            let speed = self.record_chunk(handle, index, offset);
            sizer.adjust(speed);
            handle.emit(index);
            self.maybe_snapshot(handle);

            if source.size == 0 {
                break;
            }
        }
        Ok(true)
    }

    /// Advance the acknowledged offset; returns the run's average speed
    fn record_chunk(&self, handle: &TransferHandle, index: usize, offset: u64) -> f64 {
        let bytes = {
            let mut session = handle.session.lock();
            session.files[index].bytes_transferred = offset;
            session.recompute_bytes();
            session.bytes_transferred
        };
        let (run_started, run_base) = *handle.run_start.lock();
        let elapsed = run_started.elapsed().as_secs_f64();

        let mut metrics = handle.metrics.lock();
        metrics.chunks_sent += 1;
        metrics.bytes_transferred = bytes;
        if elapsed > 0.0 {
            metrics.average_speed = bytes.saturating_sub(run_base) as f64 / elapsed;
        }
        metrics.last_update = crate::now_millis();
        metrics.refresh_error_rate();
        *handle.last_progress.lock() = Instant::now();
        metrics.average_speed
    }

    fn maybe_snapshot(&self, handle: &TransferHandle) {
        let (bytes, percent) = {
            let session = handle.session.lock();
            (session.bytes_transferred, session.progress_percent())
        };
        let due = {
            let last = handle.last_snapshot.lock();
            bytes.saturating_sub(last.0) >= self.config.snapshot_byte_step
                || percent - last.1 >= self.config.snapshot_percent_step
        };
        if due {
            *handle.last_snapshot.lock() = (bytes, percent);
            self.persist();
        }
    }

    fn on_stopped(&self, handle: &TransferHandle, index: usize) {
        match handle.control.get() {
            ControlSignal::Pause => {
                debug!(transfer_id = %handle.session.lock().id, "Send loop paused at chunk boundary");
                self.persist();
                handle.emit(index);
            }
            signal => debug!("Send loop stopped: {:?}", signal),
        }
    }

    fn fail_file(&self, handle: &TransferHandle, index: usize, error: TransferError) {
        let can_retry = !matches!(
            &error,
            TransferError::Io(e) if e.kind() == std::io::ErrorKind::NotFound
        );
        let transfer_id = {
            let mut session = handle.session.lock();
            if session.status != TransferStatus::Transferring {
                return;
            }
            let file = &mut session.files[index];
            file.status = TransferStatus::Failed;
            file.error = Some(error.to_string());
            file.can_retry = can_retry;
            session.status = TransferStatus::Failed;
            session.completed_at = Some(crate::now_millis());
            session.id.clone()
        };
        error!(transfer_id = %transfer_id, "Transfer failed: {}", error);
        handle.emit(index);
        handle.close_progress();
        self.persist();
    }

    fn complete(&self, handle: &TransferHandle) {
        let transfer_id = {
            let mut session = handle.session.lock();
            // A pause that lands after the last chunk completes on resume
            if session.status != TransferStatus::Transferring {
                return;
            }
            session.status = TransferStatus::Completed;
            session.completed_at = Some(crate::now_millis());
            session.id.clone()
        };
        let speed = handle.metrics.lock().average_speed;
        if speed > 0.0 {
            *self.last_throughput.lock() = Some(speed);
        }
        info!(transfer_id = %transfer_id, "Transfer completed");
        handle.emit(handle.sources.len().saturating_sub(1));
        handle.close_progress();
        self.persist();
    }

    /// Health monitor verdict: too many errors
    fn fail_transfer(&self, handle: &TransferHandle, reason: &str) {
        handle.control.set(ControlSignal::Abort);
        let transfer_id = {
            let mut session = handle.session.lock();
            if session.status.is_terminal() {
                return;
            }
            session.status = TransferStatus::Failed;
            session.completed_at = Some(crate::now_millis());
            for file in session.files.iter_mut().filter(|f| f.status != TransferStatus::Completed) {
                file.status = TransferStatus::Failed;
                file.error = Some(reason.to_string());
                file.can_retry = true;
            }
            session.id.clone()
        };
        error!(transfer_id = %transfer_id, "Transfer failed: {}", reason);
        handle.emit(handle.current_file());
        handle.close_progress();
        self.persist();
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    pub fn pause_transfer(&self, transfer_id: &str) -> Result<(), TransferError> {
        let handle = self.handle(transfer_id)?;
        {
            let mut session = handle.session.lock();
            match session.status {
                TransferStatus::Pending | TransferStatus::Transferring | TransferStatus::Resuming => {
                    session.status = TransferStatus::Paused;
                }
                status => {
                    return Err(TransferError::InvalidState {
                        id: transfer_id.to_string(),
                        status,
                    })
                }
            }
        }
        handle.control.set(ControlSignal::Pause);
        self.persist();
        handle.emit(handle.current_file());
        info!(transfer_id, "Transfer paused");
        Ok(())
    }

    /// Re-enter the send loop from the last acknowledged offset
    pub async fn resume_transfer(self: &Arc<Self>, transfer_id: &str) -> Result<(), TransferError> {
        let handle = self.handle(transfer_id)?;
        let (encrypted, session_id) = {
            let session = handle.session.lock();
            if session.status != TransferStatus::Paused {
                return Err(TransferError::InvalidState {
                    id: transfer_id.to_string(),
                    status: session.status,
                });
            }
            (session.encryption_enabled, session.session_id.clone())
        };
        if encrypted {
            self.ensure_session_ready(session_id.as_deref())?;
        }

        handle.session.lock().status = TransferStatus::Resuming;
        // The old loop exits at its next chunk boundary; never run two
        let previous = handle.sender_task.lock().take();
        if let Some(task) = previous {
            let _ = task.await;
        }

        if handle.status() != TransferStatus::Resuming {
            // Cancelled while we waited
            return Err(TransferError::InvalidState {
                id: transfer_id.to_string(),
                status: handle.status(),
            });
        }
        handle.control.set(ControlSignal::Run);
        handle.reopen_progress();
        self.persist();
        handle.emit(handle.current_file());
        info!(transfer_id, "Transfer resuming");

        self.spawn_health(&handle);
        self.spawn_sender(&handle);
        Ok(())
    }

    /// Terminal. The secure session is left alone for reuse.
    pub fn cancel_transfer(&self, transfer_id: &str) -> Result<(), TransferError> {
        let handle = self.handle(transfer_id)?;
        {
            let mut session = handle.session.lock();
            if session.status.is_terminal() {
                return Err(TransferError::InvalidState {
                    id: transfer_id.to_string(),
                    status: session.status,
                });
            }
            session.status = TransferStatus::Cancelled;
            session.completed_at = Some(crate::now_millis());
            for file in session.files.iter_mut().filter(|f| f.status != TransferStatus::Completed) {
                file.status = TransferStatus::Cancelled;
                file.can_retry = false;
            }
        }
        handle.control.set(ControlSignal::Cancel);
        if let Some(task) = handle.health_task.lock().take() {
            task.abort();
        }
        handle.emit(handle.current_file());
        handle.close_progress();
        self.persist();
        info!(transfer_id, "Transfer cancelled");
        Ok(())
    }

    /// Restart a failed transfer's retryable files from their acknowledged offsets
    pub async fn retry_transfer(
        self: &Arc<Self>,
        transfer_id: &str,
    ) -> Result<broadcast::Receiver<TransferProgress>, TransferError> {
        let handle = self.handle(transfer_id)?;
        let (encrypted, session_id, target) = {
            let mut session = handle.session.lock();
            let retryable = session
                .files
                .iter()
                .any(|f| f.status == TransferStatus::Failed && f.can_retry);
            if session.status != TransferStatus::Failed || !retryable {
                return Err(TransferError::InvalidState {
                    id: transfer_id.to_string(),
                    status: session.status,
                });
            }
            // Claim it so a concurrent retry sees a non-failed status
            session.status = TransferStatus::Pending;
            (
                session.encryption_enabled,
                session.session_id.clone(),
                session.target_device_id.clone(),
            )
        };

        let admitted = if encrypted {
            self.ensure_session_ready(session_id.as_deref())
        } else {
            Ok(())
        }
        .and_then(|_| self.limiter.admit_transfer(&target).map_err(TransferError::from));
        if let Err(e) = admitted {
            handle.session.lock().status = TransferStatus::Failed;
            return Err(e);
        }

        let previous = handle.sender_task.lock().take();
        if let Some(task) = previous {
            let _ = task.await;
        }

        {
            let mut session = handle.session.lock();
            session.completed_at = None;
            for file in session.files.iter_mut().filter(|f| f.status == TransferStatus::Failed && f.can_retry) {
                file.status = TransferStatus::Pending;
                file.error = None;
            }
        }
        {
            let mut metrics = handle.metrics.lock();
            metrics.error_count = 0;
            metrics.refresh_error_rate();
        }
        handle.control.set(ControlSignal::Run);
        let progress = handle.reopen_progress();
        self.persist();
        info!(transfer_id, "Retrying transfer");

        self.spawn_health(&handle);
        self.spawn_sender(&handle);
        Ok(progress)
    }

    /// Platform acknowledgement of a sent chunk keeps the health monitor quiet
    pub fn note_chunk_sent(&self, transfer_id: &str, index: u64) {
        if let Ok(handle) = self.handle(transfer_id) {
            *handle.last_progress.lock() = Instant::now();
            debug!(transfer_id, index, "Chunk acknowledged by platform");
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Write every resumable outgoing session to the snapshot
    pub(super) fn persist(&self) {
        let _guard = self.snapshot_lock.lock();
        let map: BTreeMap<String, TransferSession> = self
            .transfers
            .read()
            .iter()
            .map(|(id, handle)| (id.clone(), handle.session.lock().clone()))
            .filter(|(_, session)| session.resume_enabled)
            .collect();
        self.store.save(&map);
    }

    /// Reload sessions written before a restart. Interrupted transfers come
    /// back paused; returns how many were restored.
    pub fn restore_from_snapshot(&self) -> usize {
        let snapshot = self.store.load();
        let mut restored = 0;
        {
            let mut transfers = self.transfers.write();
            for (id, mut session) in snapshot {
                if transfers.contains_key(&id) || session.direction != TransferDirection::Outgoing {
                    continue;
                }
                if matches!(
                    session.status,
                    TransferStatus::Pending | TransferStatus::Transferring | TransferStatus::Resuming
                ) {
                    session.status = TransferStatus::Paused;
                }
                for file in session.files.iter_mut() {
                    if file.status == TransferStatus::Transferring {
                        file.status = TransferStatus::Pending;
                    }
                }
                let sources = session
                    .files
                    .iter()
                    .map(|f| {
                        Arc::new(SourceFile {
                            id: f.id.clone(),
                            path: f.path.clone(),
                            name: f.name.clone(),
                            size: f.size,
                            checksum: f.checksum.clone().unwrap_or_default(),
                        })
                    })
                    .collect();
                let terminal = session.status.is_terminal();
                let (handle, _) = TransferHandle::new(session, sources);
                handle.control.set(ControlSignal::Pause);
                if terminal {
                    handle.close_progress();
                }
                transfers.insert(id, Arc::new(handle));
                restored += 1;
            }
        }
        if restored > 0 {
            info!("Restored {} transfers from snapshot", restored);
            self.persist();
        }
        restored
    }

    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(crate::now_millis())
    }

    /// Drop finished sessions (completed, cancelled or failed) older than the
    /// retention window, and incoming transfers that finished or went idle
    /// that long ago
    pub fn purge_expired_at(&self, now_ms: u64) -> usize {
        let retention_ms = self.config.retention_secs.saturating_mul(1000);
        let expired: Vec<String> = self
            .transfers
            .read()
            .iter()
            .filter_map(|(id, handle)| {
                let session = handle.session.lock();
                let finished_at = session.completed_at.unwrap_or(session.created_at);
                (session.status.is_terminal() && now_ms.saturating_sub(finished_at) > retention_ms)
                    .then(|| id.clone())
            })
            .collect();

        if !expired.is_empty() {
            let mut transfers = self.transfers.write();
            for id in &expired {
                transfers.remove(id);
            }
        }
        let stale_incoming = {
            let mut incoming = self.incoming.write();
            let before = incoming.len();
            incoming.retain(|_, handle| !handle.expired(now_ms, retention_ms));
            before - incoming.len()
        };

        let purged = expired.len() + stale_incoming;
        if !expired.is_empty() {
            self.persist();
        }
        if purged > 0 {
            debug!(outgoing = expired.len(), incoming = stale_incoming, "Purged expired transfers");
        }
        purged
    }

    /// Checksum of a source file, for building receiver manifests
    pub fn source_checksum(&self, transfer_id: &str, path: &Path) -> Option<String> {
        self.handle(transfer_id)
            .ok()?
            .sources
            .iter()
            .find(|s| s.path == path)
            .map(|s| s.checksum.clone())
    }
}

async fn health_monitor(engine: Weak<TransferEngine>, handle: Arc<TransferHandle>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(engine) = engine.upgrade() else {
            break;
        };
        let status = handle.status();
        if status.is_terminal() {
            break;
        }

        if status == TransferStatus::Transferring {
            let idle = handle.last_progress.lock().elapsed();
            if idle > engine.config.stall_timeout() {
                let transfer_id = handle.session.lock().id.clone();
                warn!(transfer_id = %transfer_id, ?idle, "Transfer stalled");
                let mut metrics = handle.metrics.lock();
                metrics.error_count += 1;
                metrics.refresh_error_rate();
                drop(metrics);
                // Count each stall period once
                *handle.last_progress.lock() = Instant::now();
            }
        }

        let errors = handle.metrics.lock().error_count;
        if errors > engine.config.max_errors {
            engine.fail_transfer(&handle, &format!("{} errors exceeded the limit", errors));
            break;
        }
    }
}
