//! Concurrent multi-algorithm file fingerprinting.
//!
//! Every hashed file gets an xxh128 fingerprint; md5 and sha256 are opt-in.
//! Computation runs on the blocking pool, one file per worker start to
//! finish, bounded by a semaphore. Before computing, the hash cache in the
//! history store is consulted: a row whose recorded size matches the current
//! file size is reused.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use md5::Digest;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, instrument, warn};
use xxhash_rust::xxh3::Xxh3;

use crate::config::{DedupeSettings, HashingMode};
use crate::db::DbError;
use crate::formats;
use crate::history::HistoryStore;
use crate::media::MediaItem;
use crate::progress::RunStats;

/// Maximum files being hashed in parallel.
const DEFAULT_CONCURRENCY: usize = 20;

/// Read chunk for video files.
const VIDEO_CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// Read chunk for everything else.
const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Fingerprint algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// Fast non-cryptographic fingerprint; always computed.
    Xxh128,
    /// Opt-in md5 digest.
    Md5,
    /// Opt-in sha256 digest.
    Sha256,
}

impl HashAlgorithm {
    /// Database identifier of the algorithm.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Xxh128 => "xxh128",
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One computed (or cached) fingerprint with the file state it describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashResult {
    /// Hex fingerprint.
    pub hash: String,
    /// File size at hash time.
    pub file_size: u64,
    /// File mtime at hash time (seconds since epoch).
    pub mtime: i64,
}

/// Hashing errors.
#[derive(Debug, Error)]
pub enum HashError {
    /// Reading the file failed.
    #[error("unable to hash {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A history lookup or record failed.
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Computes a fingerprint of a file synchronously.
///
/// Uses a 10 MB chunk for video files and 1 MB otherwise, with one reusable
/// buffer per call. Intended to run on the blocking pool.
///
/// # Errors
///
/// Returns [`HashError::Io`] when the file cannot be read.
pub fn compute_hash(file: &Path, algorithm: HashAlgorithm) -> Result<String, HashError> {
    let ext = crate::media::extension_of(&file.file_name().map_or_else(
        || file.to_string_lossy().into_owned(),
        |name| name.to_string_lossy().into_owned(),
    ));
    let chunk_size = if formats::is_video(&ext) {
        VIDEO_CHUNK_SIZE
    } else {
        DEFAULT_CHUNK_SIZE
    };

    let mut handle = std::fs::File::open(file).map_err(|source| HashError::Io {
        path: file.to_path_buf(),
        source,
    })?;

    let mut state = HasherState::new(algorithm);
    let mut buffer = vec![0u8; chunk_size];
    loop {
        let read = handle.read(&mut buffer).map_err(|source| HashError::Io {
            path: file.to_path_buf(),
            source,
        })?;
        if read == 0 {
            break;
        }
        state.update(&buffer[..read]);
    }
    Ok(state.finish())
}

/// Streaming state for one algorithm.
enum HasherState {
    Xxh128(Box<Xxh3>),
    Md5(md5::Md5),
    Sha256(sha2::Sha256),
}

impl HasherState {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Xxh128 => Self::Xxh128(Box::new(Xxh3::new())),
            HashAlgorithm::Md5 => Self::Md5(md5::Md5::new()),
            HashAlgorithm::Sha256 => Self::Sha256(sha2::Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Xxh128(state) => state.update(data),
            Self::Md5(state) => state.update(data),
            Self::Sha256(state) => state.update(data),
        }
    }

    fn finish(self) -> String {
        match self {
            Self::Xxh128(state) => format!("{:032x}", state.digest128()),
            Self::Md5(state) => hex::encode(state.finalize()),
            Self::Sha256(state) => hex::encode(state.finalize()),
        }
    }
}

/// Concurrent hasher feeding the history store and the dedup sweep.
#[derive(Debug)]
pub struct Hasher {
    history: HistoryStore,
    stats: Arc<RunStats>,
    mode: HashingMode,
    algorithms: Vec<HashAlgorithm>,
    semaphore: Arc<Semaphore>,
    xxh128_results: Mutex<HashMap<PathBuf, HashResult>>,
}

impl Hasher {
    /// Creates a hasher from the dedupe settings.
    #[must_use]
    pub fn new(history: HistoryStore, stats: Arc<RunStats>, settings: &DedupeSettings) -> Self {
        let mut algorithms = vec![HashAlgorithm::Xxh128];
        if settings.add_md5 {
            algorithms.push(HashAlgorithm::Md5);
        }
        if settings.add_sha256 {
            algorithms.push(HashAlgorithm::Sha256);
        }
        Self {
            history,
            stats,
            mode: settings.hashing,
            algorithms,
            semaphore: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
            xxh128_results: Mutex::new(HashMap::new()),
        }
    }

    /// The configured mode.
    #[must_use]
    pub fn mode(&self) -> HashingMode {
        self.mode
    }

    /// Hashes a completed item right away when the mode is `in_place`.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] when reading or recording fails.
    pub async fn in_place_hash(&self, item: &mut MediaItem) -> Result<(), HashError> {
        if self.mode != HashingMode::InPlace {
            return Ok(());
        }
        self.hash_item(item).await
    }

    /// Hashes a batch of completed items when the mode is `post_download`.
    pub async fn post_download_hash(&self, items: &mut [MediaItem]) {
        if self.mode != HashingMode::PostDownload {
            return;
        }
        for item in items {
            if let Err(error) = self.hash_item(item).await {
                // Files may have been deleted or moved since download.
                warn!(file = %item.complete_file().display(), error = %error, "unable to hash file");
            }
        }
    }

    /// Fingerprints one item and records the results.
    ///
    /// Segments and partial files are never hashed.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] when reading or recording fails.
    #[instrument(skip(self, item), fields(file = %item.complete_file().display()))]
    pub async fn hash_item(&self, item: &mut MediaItem) -> Result<(), HashError> {
        if self.mode == HashingMode::Off || item.is_segment || item.ext == ".part" {
            return Ok(());
        }

        #[allow(clippy::expect_used)]
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("hash semaphore closed");

        let file = item.complete_file();
        self.history
            .insert_or_update_file(Some(&item.original_filename), Some(&item.referer), &file)
            .await?;

        let mut xxh128 = None;
        for algorithm in &self.algorithms {
            let result = self.get_hash_or_compute(&file, *algorithm).await?;
            self.history
                .insert_or_update_hash(&result.hash, algorithm.as_str(), &file)
                .await?;
            if *algorithm == HashAlgorithm::Xxh128 {
                xxh128 = Some(result);
            }
        }

        if let Some(result) = xxh128 {
            item.hash = Some(result.hash.clone());
            self.xxh128_results.lock().await.insert(file, result);
        }
        Ok(())
    }

    /// Snapshot of all xxh128 results collected this run.
    pub async fn results(&self) -> HashMap<PathBuf, HashResult> {
        self.xxh128_results.lock().await.clone()
    }

    /// Returns the cached fingerprint when still valid, else computes it.
    async fn get_hash_or_compute(
        &self,
        file: &Path,
        algorithm: HashAlgorithm,
    ) -> Result<HashResult, HashError> {
        let metadata = tokio::fs::metadata(file)
            .await
            .map_err(|source| HashError::Io {
                path: file.to_path_buf(),
                source,
            })?;
        let file_size = metadata.len();
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
            .unwrap_or(0);

        let folder = file
            .parent()
            .map(|parent| parent.to_string_lossy().into_owned())
            .unwrap_or_default();
        let filename = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        if let Some(cached) = self
            .history
            .get_file_hash(&folder, &filename, algorithm.as_str())
            .await?
        {
            if u64::try_from(cached.file_size).ok() == Some(file_size) {
                debug!(algo = %algorithm, "hash served from cache");
                self.stats.add_previously_hashed();
                return Ok(HashResult {
                    hash: cached.hash,
                    file_size,
                    mtime,
                });
            }
        }

        let path = file.to_path_buf();
        let hash = tokio::task::spawn_blocking(move || compute_hash(&path, algorithm))
            .await
            .map_err(|join_err| HashError::Io {
                path: file.to_path_buf(),
                source: std::io::Error::other(join_err),
            })??;
        self.stats.add_hashed();
        Ok(HashResult {
            hash,
            file_size,
            mtime,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;
    use url::Url;

    fn item(folder: &Path, filename: &str) -> MediaItem {
        MediaItem::new(
            Url::parse("https://example.test/a.mp4").unwrap(),
            "example",
            Url::parse("https://example.test/album").unwrap(),
            folder,
            filename,
            filename,
            format!("/{filename}"),
        )
    }

    async fn hasher(settings: &DedupeSettings) -> Hasher {
        let db = Database::new_in_memory().await.unwrap();
        Hasher::new(
            HistoryStore::new(db, false),
            Arc::new(RunStats::new()),
            settings,
        )
    }

    #[test]
    fn test_compute_hash_xxh128_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.bin");
        std::fs::write(&file, b"hello world").unwrap();

        let first = compute_hash(&file, HashAlgorithm::Xxh128).unwrap();
        let second = compute_hash(&file, HashAlgorithm::Xxh128).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32, "xxh128 is 128 bits of hex");
    }

    #[test]
    fn test_compute_hash_md5_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"abc").unwrap();
        assert_eq!(
            compute_hash(&file, HashAlgorithm::Md5).unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn test_compute_hash_sha256_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"abc").unwrap();
        assert_eq!(
            compute_hash(&file, HashAlgorithm::Sha256).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_compute_hash_missing_file_errors() {
        let result = compute_hash(Path::new("/nonexistent/a.bin"), HashAlgorithm::Xxh128);
        assert!(matches!(result, Err(HashError::Io { .. })));
    }

    #[tokio::test]
    async fn test_hash_item_records_and_sets_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let mut item = item(dir.path(), "a.mp4");
        std::fs::write(item.complete_file(), b"media bytes").unwrap();

        let hasher = hasher(&DedupeSettings::default()).await;
        hasher.hash_item(&mut item).await.unwrap();

        let hash = item.hash.clone().unwrap();
        assert!(
            hasher
                .history
                .check_hash_exists("xxh128", &hash)
                .await
                .unwrap()
        );
        assert_eq!(hasher.results().await.len(), 1);
        assert_eq!(hasher.stats.hashed(), 1);
    }

    #[tokio::test]
    async fn test_hash_item_reuses_cache_when_size_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut item = item(dir.path(), "a.mp4");
        std::fs::write(item.complete_file(), b"media bytes").unwrap();

        let hasher = hasher(&DedupeSettings::default()).await;
        hasher.hash_item(&mut item).await.unwrap();
        let first = item.hash.clone().unwrap();

        hasher.hash_item(&mut item).await.unwrap();
        assert_eq!(item.hash.as_deref(), Some(first.as_str()));
        assert_eq!(hasher.stats.previously_hashed(), 1);
        assert_eq!(hasher.stats.hashed(), 1, "second pass must not recompute");
    }

    #[tokio::test]
    async fn test_hash_item_skips_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut item = item(dir.path(), "seg0001.ts");
        item.is_segment = true;

        let hasher = hasher(&DedupeSettings::default()).await;
        hasher.hash_item(&mut item).await.unwrap();
        assert!(item.hash.is_none());
        assert!(hasher.results().await.is_empty());
    }

    #[tokio::test]
    async fn test_optional_algorithms_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut item = item(dir.path(), "a.bin");
        std::fs::write(item.complete_file(), b"abc").unwrap();

        let settings = DedupeSettings {
            add_md5: true,
            add_sha256: true,
            ..DedupeSettings::default()
        };
        let hasher = hasher(&settings).await;
        hasher.hash_item(&mut item).await.unwrap();

        assert!(
            hasher
                .history
                .check_hash_exists("md5", "900150983cd24fb0d6963f7d28e17f72")
                .await
                .unwrap()
        );
        assert!(
            hasher
                .history
                .check_hash_exists(
                    "sha256",
                    "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
                )
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_mode_off_never_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let mut item = item(dir.path(), "a.bin");
        std::fs::write(item.complete_file(), b"abc").unwrap();

        let settings = DedupeSettings {
            hashing: HashingMode::Off,
            ..DedupeSettings::default()
        };
        let hasher = hasher(&settings).await;
        hasher.hash_item(&mut item).await.unwrap();
        assert!(item.hash.is_none());
    }
}
