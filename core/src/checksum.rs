// End-to-end checksum service
//
// SHA-256 over file contents, lower-case hex. Files above the chunked
// threshold are hashed in fixed windows so memory stays bounded; both paths
// yield the same digest. All hashing runs on the blocking pool.
//
// Checksum rows are keyed `checksum/{transfer_id}/{file_path}`; last write wins.

use crate::config::ChecksumConfig;
use crate::store::StorageBackend;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const KEY_PREFIX: &str = "checksum/";

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("I/O error hashing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Hashing task failed: {0}")]
    Task(String),
    #[error("No checksums recorded for transfer {0}")]
    NotVerifiable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecksumRecord {
    pub transfer_id: String,
    pub file_path: String,
    pub file_name: String,
    pub file_size: u64,
    pub checksum: String,
    pub calculated_at: u64,
    pub modified_at: Option<u64>,
}

impl ChecksumRecord {
    pub fn new(transfer_id: &str, path: &Path, file_size: u64, checksum: String) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            file_path: path.to_string_lossy().into_owned(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            file_size,
            checksum,
            calculated_at: crate::now_millis(),
            modified_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileVerification {
    pub file_path: String,
    pub file_name: String,
    pub expected: String,
    pub actual: Option<String>,
    pub verified: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferVerification {
    pub transfer_id: String,
    pub verified_count: usize,
    pub failed_count: usize,
    pub all_verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecksumReport {
    pub transfer_id: String,
    pub generated_at: u64,
    pub summary: TransferVerification,
    pub files: Vec<FileVerification>,
}

/// Incremental SHA-256 over `window`-sized reads
pub fn hash_file_chunked(path: &Path, window: usize) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; window.max(1)];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn hashes_in_windows(size: u64, threshold: u64) -> bool {
    size > threshold
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub struct ChecksumService {
    backend: Arc<dyn StorageBackend>,
    config: ChecksumConfig,
}

impl ChecksumService {
    pub fn new(backend: Arc<dyn StorageBackend>, config: ChecksumConfig) -> Self {
        Self { backend, config }
    }

    fn row_key(transfer_id: &str, file_path: &str) -> String {
        format!("{}{}/{}", KEY_PREFIX, transfer_id, file_path)
    }

    async fn blocking<T, F>(job: F) -> Result<T, ChecksumError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, ChecksumError> + Send + 'static,
    {
        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| ChecksumError::Task(e.to_string()))?
    }

    /// Whole-file hash up to the threshold, chunked above it
    pub async fn calculate_checksum(&self, path: impl AsRef<Path>) -> Result<String, ChecksumError> {
        let path = path.as_ref().to_path_buf();
        let threshold = self.config.chunked_threshold;
        let window = self.config.window_size;
        Self::blocking(move || {
            let io_err = |source| ChecksumError::Io {
                path: path.clone(),
                source,
            };
            let size = std::fs::metadata(&path).map_err(io_err)?.len();
            if hashes_in_windows(size, threshold) {
                hash_file_chunked(&path, window).map_err(io_err)
            } else {
                std::fs::read(&path).map(|bytes| hash_bytes(&bytes)).map_err(io_err)
            }
        })
        .await
    }

    pub async fn calculate_checksum_chunked(&self, path: impl AsRef<Path>) -> Result<String, ChecksumError> {
        let path = path.as_ref().to_path_buf();
        let window = self.config.window_size;
        Self::blocking(move || {
            hash_file_chunked(&path, window).map_err(|source| ChecksumError::Io { path, source })
        })
        .await
    }

    /// Never errors: unreadable files simply fail verification
    pub async fn verify_checksum(&self, path: impl AsRef<Path>, expected: &str) -> bool {
        match self.calculate_checksum_chunked(path.as_ref()).await {
            Ok(actual) => actual.eq_ignore_ascii_case(expected.trim()),
            Err(e) => {
                warn!("Checksum verification could not read file: {}", e);
                false
            }
        }
    }

    /// Hash `path` and store the result under `transfer_id`
    pub async fn record_file(
        &self,
        transfer_id: &str,
        path: impl AsRef<Path>,
    ) -> Result<ChecksumRecord, ChecksumError> {
        let path = path.as_ref();
        let checksum = self.calculate_checksum(path).await?;
        let size = std::fs::metadata(path)
            .map_err(|source| ChecksumError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        let record = ChecksumRecord::new(transfer_id, path, size, checksum);
        self.store_checksum(&record);
        Ok(record)
    }

    pub fn store_checksum(&self, record: &ChecksumRecord) -> bool {
        let key = Self::row_key(&record.transfer_id, &record.file_path);
        let value = match serde_json::to_vec(record) {
            Ok(v) => v,
            Err(e) => {
                error!("Failed to serialize checksum record: {}", e);
                return false;
            }
        };
        match self.backend.put(key.as_bytes(), &value).and_then(|_| self.backend.flush()) {
            Ok(()) => {
                debug!(transfer_id = %record.transfer_id, file = %record.file_name, "Stored checksum");
                true
            }
            Err(e) => {
                error!("Failed to store checksum: {}", e);
                false
            }
        }
    }

    pub fn get_stored_checksum(&self, transfer_id: &str, file_path: &str) -> Option<ChecksumRecord> {
        let key = Self::row_key(transfer_id, file_path);
        match self.backend.get(key.as_bytes()) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes)
                .map_err(|e| error!("Corrupt checksum row {}: {}", key, e))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                error!("Failed to read checksum row: {}", e);
                None
            }
        }
    }

    fn scan(&self, prefix: &str) -> Vec<ChecksumRecord> {
        match self.backend.scan_prefix(prefix.as_bytes()) {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|(_, v)| serde_json::from_slice(&v).ok())
                .collect(),
            Err(e) => {
                error!("Failed to scan checksum table: {}", e);
                Vec::new()
            }
        }
    }

    pub fn get_transfer_checksums(&self, transfer_id: &str) -> Vec<ChecksumRecord> {
        self.scan(&format!("{}{}/", KEY_PREFIX, transfer_id))
    }

    pub async fn generate_checksum_report(&self, transfer_id: &str) -> Result<ChecksumReport, ChecksumError> {
        let records = self.get_transfer_checksums(transfer_id);
        if records.is_empty() {
            return Err(ChecksumError::NotVerifiable(transfer_id.to_string()));
        }

        let mut files = Vec::with_capacity(records.len());
        for record in records {
            let (actual, error) = match self.calculate_checksum_chunked(&record.file_path).await {
                Ok(sum) => (Some(sum), None),
                Err(e) => (None, Some(e.to_string())),
            };
            let verified = actual
                .as_deref()
                .is_some_and(|a| a.eq_ignore_ascii_case(&record.checksum));
            files.push(FileVerification {
                file_path: record.file_path,
                file_name: record.file_name,
                expected: record.checksum,
                actual,
                verified,
                error,
            });
        }

        let verified_count = files.iter().filter(|f| f.verified).count();
        let failed_count = files.len() - verified_count;
        info!(transfer_id, verified_count, failed_count, "Checksum verification finished");

        Ok(ChecksumReport {
            transfer_id: transfer_id.to_string(),
            generated_at: crate::now_millis(),
            summary: TransferVerification {
                transfer_id: transfer_id.to_string(),
                verified_count,
                failed_count,
                all_verified: failed_count == 0,
            },
            files,
        })
    }

    pub async fn verify_transfer(&self, transfer_id: &str) -> Result<TransferVerification, ChecksumError> {
        Ok(self.generate_checksum_report(transfer_id).await?.summary)
    }

    pub fn purge_older_than(&self, max_age: Duration) -> usize {
        self.purge_older_than_at(max_age, crate::now_millis())
    }

    pub fn purge_older_than_at(&self, max_age: Duration, now_ms: u64) -> usize {
        let max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        let mut purged = 0;
        for record in self.scan(KEY_PREFIX) {
            if now_ms.saturating_sub(record.calculated_at) > max_age_ms {
                let key = Self::row_key(&record.transfer_id, &record.file_path);
                match self.backend.remove(key.as_bytes()) {
                    Ok(()) => purged += 1,
                    Err(e) => error!("Failed to purge checksum row: {}", e),
                }
            }
        }
        if purged > 0 {
            let _ = self.backend.flush();
            debug!("Purged {} checksum rows", purged);
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;
    use std::io::Write;
    use tempfile::TempDir;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn service() -> ChecksumService {
        ChecksumService::new(Arc::new(MemoryStorage::new()), ChecksumConfig::default())
    }

    fn write_file(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        path
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_known_vectors() {
        let dir = TempDir::new().unwrap();
        let svc = service();
        let empty = write_file(&dir, "empty", b"");
        let abc = write_file(&dir, "abc", b"abc");

        assert_eq!(svc.calculate_checksum(&empty).await.unwrap(), EMPTY_SHA256);
        assert_eq!(svc.calculate_checksum_chunked(&empty).await.unwrap(), EMPTY_SHA256);
        assert_eq!(svc.calculate_checksum(&abc).await.unwrap(), ABC_SHA256);
    }

    #[tokio::test]
    async fn test_chunked_matches_whole_at_window_boundaries() {
        let dir = TempDir::new().unwrap();
        let svc = service();
        for len in [65_535, 65_536, 65_537, 3 * 65_536] {
            let bytes = patterned(len);
            let path = write_file(&dir, &format!("f{}", len), &bytes);
            assert_eq!(svc.calculate_checksum_chunked(&path).await.unwrap(), hash_bytes(&bytes));
        }
    }

    #[tokio::test]
    async fn test_threshold_switches_to_chunked() {
        let dir = TempDir::new().unwrap();
        let svc = ChecksumService::new(
            Arc::new(MemoryStorage::new()),
            ChecksumConfig {
                chunked_threshold: 1024,
                window_size: 100,
            },
        );
        let bytes = patterned(5000);
        let path = write_file(&dir, "big", &bytes);
        assert_eq!(svc.calculate_checksum(&path).await.unwrap(), hash_bytes(&bytes));

        let at_threshold = patterned(1024);
        let path = write_file(&dir, "edge", &at_threshold);
        assert_eq!(svc.calculate_checksum(&path).await.unwrap(), hash_bytes(&at_threshold));
    }

    #[test]
    fn test_exact_threshold_hashes_whole_file() {
        let ten_mib = 10 * 1024 * 1024;
        assert!(!hashes_in_windows(ten_mib, ten_mib));
        assert!(hashes_in_windows(ten_mib + 1, ten_mib));
        assert!(!hashes_in_windows(0, ten_mib));
    }

    #[tokio::test]
    async fn test_verify_checksum_never_errors() {
        let dir = TempDir::new().unwrap();
        let svc = service();
        let abc = write_file(&dir, "abc", b"abc");

        assert!(svc.verify_checksum(&abc, &ABC_SHA256.to_uppercase()).await);
        assert!(!svc.verify_checksum(&abc, EMPTY_SHA256).await);
        assert!(!svc.verify_checksum(dir.path().join("missing"), ABC_SHA256).await);
    }

    #[tokio::test]
    async fn test_store_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let svc = service();
        let abc = write_file(&dir, "abc", b"abc");

        let first = svc.record_file("t1", &abc).await.unwrap();
        let second = svc.record_file("t1", &abc).await.unwrap();
        assert_eq!(first.checksum, second.checksum);
        assert_eq!(svc.get_transfer_checksums("t1").len(), 1);
        assert_eq!(
            svc.get_stored_checksum("t1", &first.file_path).unwrap().file_name,
            "abc"
        );
        assert!(svc.get_transfer_checksums("t2").is_empty());
    }

    #[tokio::test]
    async fn test_verify_transfer_and_report() {
        let dir = TempDir::new().unwrap();
        let svc = service();
        let good = write_file(&dir, "good", b"good");
        let bad = write_file(&dir, "bad", b"before");
        svc.record_file("t1", &good).await.unwrap();
        svc.record_file("t1", &bad).await.unwrap();

        std::fs::write(&bad, b"after").unwrap();

        let summary = svc.verify_transfer("t1").await.unwrap();
        assert_eq!(summary.verified_count, 1);
        assert_eq!(summary.failed_count, 1);
        assert!(!summary.all_verified);

        let report = svc.generate_checksum_report("t1").await.unwrap();
        let failed = report.files.iter().find(|f| !f.verified).unwrap();
        assert_eq!(failed.file_name, "bad");

        assert!(matches!(
            svc.verify_transfer("nope").await,
            Err(ChecksumError::NotVerifiable(_))
        ));
    }

    #[test]
    fn test_purge_older_than() {
        let svc = service();
        let mut old = ChecksumRecord::new("t1", Path::new("/tmp/a"), 1, EMPTY_SHA256.to_string());
        old.calculated_at = 1_000;
        let mut fresh = ChecksumRecord::new("t2", Path::new("/tmp/b"), 1, EMPTY_SHA256.to_string());
        fresh.calculated_at = 90_000;
        svc.store_checksum(&old);
        svc.store_checksum(&fresh);

        assert_eq!(svc.purge_older_than_at(Duration::from_secs(60), 100_000), 1);
        assert!(svc.get_transfer_checksums("t1").is_empty());
        assert_eq!(svc.get_transfer_checksums("t2").len(), 1);
    }
}
