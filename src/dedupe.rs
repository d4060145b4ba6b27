//! Duplicate removal keyed on content fingerprints.
//!
//! After hashing, every fresh download is compared against the history. When
//! several files share one (fingerprint, size) pair, exactly one copy is
//! kept (the oldest by recorded date) and the newer duplicates are deleted
//! to the OS trash (default) or unlinked.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::db::DbError;
use crate::hashing::{HashAlgorithm, HashResult};
use crate::history::HistoryStore;
use crate::progress::RunStats;

/// Dedup errors.
#[derive(Debug, Error)]
pub enum DedupeError {
    /// Deleting a duplicate failed.
    #[error("unable to remove duplicate {path}: {message}")]
    Delete {
        /// The file that could not be removed.
        path: PathBuf,
        /// The underlying failure.
        message: String,
    },

    /// A history query failed.
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Deletes duplicate downloads whose fingerprint already exists.
#[derive(Debug)]
pub struct Deduper {
    history: HistoryStore,
    stats: Arc<RunStats>,
    send_to_trash: bool,
    enabled: bool,
}

impl Deduper {
    /// Creates a deduper.
    ///
    /// Dedup is disabled entirely when `auto_dedupe` is off or the run
    /// ignores history.
    #[must_use]
    pub fn new(
        history: HistoryStore,
        stats: Arc<RunStats>,
        auto_dedupe: bool,
        send_to_trash: bool,
    ) -> Self {
        let enabled = auto_dedupe && !history.ignores_history();
        Self {
            history,
            stats,
            send_to_trash,
            enabled,
        }
    }

    /// Whether the sweep will run.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Sweeps this run's hash results and removes confirmed duplicates.
    ///
    /// Errors on individual files are logged and the sweep continues; the
    /// first database failure aborts it.
    ///
    /// # Errors
    ///
    /// Returns [`DedupeError::Db`] when the match query fails.
    #[instrument(skip(self, results), fields(files = results.len()))]
    pub async fn run(&self, results: &HashMap<PathBuf, HashResult>) -> Result<(), DedupeError> {
        if !self.enabled {
            return Ok(());
        }

        for result in results.values() {
            if let Err(error) = self.dedupe_one(result).await {
                match error {
                    DedupeError::Db(db) => return Err(DedupeError::Db(db)),
                    DedupeError::Delete { path, message } => {
                        warn!(path = %path.display(), message, "duplicate removal failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Removes every newer duplicate of one hashed file.
    async fn dedupe_one(&self, result: &HashResult) -> Result<(), DedupeError> {
        let size = i64::try_from(result.file_size).unwrap_or(i64::MAX);
        let mut matches = self
            .history
            .get_files_with_hash_matches(&result.hash, size, HashAlgorithm::Xxh128.as_str())
            .await?;
        if matches.len() < 2 {
            return Ok(());
        }

        // Oldest recorded copy wins; everything newer goes.
        matches.sort_by_key(|m| m.date.unwrap_or(i64::MAX));

        let mut kept = false;
        for candidate in matches {
            let path = candidate.path();
            if !kept && path.exists() {
                kept = true;
                continue;
            }
            if !kept {
                continue;
            }
            if self.delete_file(&path).await? {
                let suffix = if self.send_to_trash {
                    "sent to trash"
                } else {
                    "permanently deleted"
                };
                info!(
                    path = %path.display(),
                    hash = %result.hash,
                    "removed duplicate download ({suffix}); fingerprint matches a previous download"
                );
                self.stats.add_removed_duplicate();
            }
        }

        Ok(())
    }

    /// Deletes a file; `Ok(false)` when it was already gone.
    async fn delete_file(&self, path: &Path) -> Result<bool, DedupeError> {
        if !path.exists() {
            return Ok(false);
        }

        if self.send_to_trash {
            let target = path.to_path_buf();
            let outcome = tokio::task::spawn_blocking(move || trash::delete(&target)).await;
            match outcome {
                Ok(Ok(())) => Ok(true),
                Ok(Err(error)) => Err(DedupeError::Delete {
                    path: path.to_path_buf(),
                    message: error.to_string(),
                }),
                Err(join_err) => Err(DedupeError::Delete {
                    path: path.to_path_buf(),
                    message: join_err.to_string(),
                }),
            }
        } else {
            match tokio::fs::remove_file(path).await {
                Ok(()) => Ok(true),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(error) => Err(DedupeError::Delete {
                    path: path.to_path_buf(),
                    message: error.to_string(),
                }),
            }
        }
    }
}
