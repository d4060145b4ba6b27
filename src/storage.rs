//! Free-space accounting for download destinations.
//!
//! The monitor keeps one cached free-space value per mount point. The first
//! download into a folder resolves its mount and queries it synchronously;
//! a background loop then re-queries every known mount every two seconds so
//! the per-chunk check during streaming reads a cached value instead of
//! hitting the filesystem.
//!
//! Filesystems that cannot report free space store the sentinel `-1`; the
//! check is bypassed for them after a single logged error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::download::DownloadError;
use crate::media::MediaItem;

/// How often the refresh loop re-queries free space.
const CHECK_PERIOD: Duration = Duration::from_secs(2);

/// Log the free-space map every this many loop iterations.
const LOG_PERIOD: u64 = 10;

/// Free-space sentinel for filesystems that cannot report it.
const UNSUPPORTED: i64 = -1;

/// Background free-space monitor with a per-mount cache.
#[derive(Debug)]
pub struct StorageMonitor {
    required_free_space: u64,
    free_space: RwLock<HashMap<PathBuf, i64>>,
    mount_cache: DashMap<PathBuf, PathBuf>,
    refresh_loop: Mutex<Option<JoinHandle<()>>>,
}

impl StorageMonitor {
    /// Creates a monitor enforcing `required_free_space` bytes per mount.
    #[must_use]
    pub fn new(required_free_space: u64) -> Arc<Self> {
        Arc::new(Self {
            required_free_space,
            free_space: RwLock::new(HashMap::new()),
            mount_cache: DashMap::new(),
            refresh_loop: Mutex::new(None),
        })
    }

    /// The enforced free-space threshold in bytes.
    #[must_use]
    pub fn required_free_space(&self) -> u64 {
        self.required_free_space
    }

    /// Refuses the download when its mount is below the threshold.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InsufficientFreeSpace`] when the cached free
    /// space for the destination mount is below the configured threshold, or
    /// when no mount point exists for the folder at all.
    #[instrument(skip(self, item), fields(folder = %item.download_folder.display()))]
    pub async fn check_free_space(self: &Arc<Self>, item: &MediaItem) -> Result<(), DownloadError> {
        let folder = item.download_folder.clone();
        let Some(mount) = self.mount_point_of(&folder) else {
            error!(folder = %folder.display(), "no available mount point for folder");
            return Err(DownloadError::InsufficientFreeSpace { folder });
        };

        let cached = { self.free_space.read().await.get(&mount).copied() };
        let free = match cached {
            Some(free) => free,
            None => {
                // First use of this mount: query it now, then let the loop
                // keep it fresh.
                let free = query_free_space(&mount).await;
                {
                    let mut map = self.free_space.write().await;
                    map.insert(mount.clone(), free);
                }
                info!(mount = %mount.display(), free, "tracking new mount point");
                self.ensure_refresh_loop().await;
                free
            }
        };

        if free == UNSUPPORTED || free > i64::try_from(self.required_free_space).unwrap_or(i64::MAX)
        {
            Ok(())
        } else {
            Err(DownloadError::InsufficientFreeSpace { folder })
        }
    }

    /// Stops the background loop and clears the cache.
    pub async fn close(&self) {
        if let Some(handle) = self.refresh_loop.lock().await.take() {
            handle.abort();
        }
        self.free_space.write().await.clear();
    }

    /// Resolves a folder to the nearest existing ancestor, as mount proxy.
    ///
    /// The folder itself usually does not exist yet (it is created right
    /// before the first write), so the walk goes up until a live directory
    /// answers.
    fn mount_point_of(&self, folder: &Path) -> Option<PathBuf> {
        if let Some(cached) = self.mount_cache.get(folder) {
            return Some(cached.clone());
        }

        let mut current = Some(folder);
        while let Some(path) = current {
            if path.is_dir() {
                let resolved = path.to_path_buf();
                self.mount_cache.insert(folder.to_path_buf(), resolved.clone());
                return Some(resolved);
            }
            current = path.parent();
        }
        None
    }

    /// Spawns the refresh loop once.
    async fn ensure_refresh_loop(self: &Arc<Self>) {
        let mut slot = self.refresh_loop.lock().await;
        if slot.is_some() {
            return;
        }
        let monitor = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            monitor.refresh_loop().await;
        }));
    }

    async fn refresh_loop(&self) {
        let mut iteration: u64 = 0;
        loop {
            tokio::time::sleep(CHECK_PERIOD).await;
            iteration += 1;

            let mounts: Vec<PathBuf> = {
                let map = self.free_space.read().await;
                map.iter()
                    .filter(|(_, free)| **free != UNSUPPORTED)
                    .map(|(mount, _)| mount.clone())
                    .collect()
            };

            for mount in mounts {
                let free = query_free_space(&mount).await;
                self.free_space.write().await.insert(mount, free);
            }

            if iteration % LOG_PERIOD == 0 {
                let map = self.free_space.read().await;
                debug!(?map, "storage status");
            }
        }
    }
}

/// Queries free space for a path, returning `-1` when unsupported.
async fn query_free_space(path: &Path) -> i64 {
    let path = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || fs2::available_space(&path)).await;
    match result {
        Ok(Ok(free)) => i64::try_from(free).unwrap_or(i64::MAX),
        Ok(Err(err)) => {
            error!(error = %err, "unable to query free space; skipping free space check");
            UNSUPPORTED
        }
        Err(join_err) => {
            error!(error = %join_err, "free space query task failed");
            UNSUPPORTED
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use url::Url;

    fn item(folder: &Path) -> MediaItem {
        MediaItem::new(
            Url::parse("https://example.test/a.mp4").unwrap(),
            "example",
            Url::parse("https://example.test/album").unwrap(),
            folder,
            "a.mp4",
            "a.mp4",
            "/a.mp4",
        )
    }

    #[tokio::test]
    async fn test_check_free_space_passes_with_zero_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = StorageMonitor::new(0);
        let item = item(dir.path());
        assert!(monitor.check_free_space(&item).await.is_ok());
        monitor.close().await;
    }

    #[tokio::test]
    async fn test_check_free_space_fails_with_absurd_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = StorageMonitor::new(u64::MAX / 2);
        let item = item(dir.path());
        let result = monitor.check_free_space(&item).await;
        assert!(matches!(
            result,
            Err(DownloadError::InsufficientFreeSpace { .. })
        ));
        monitor.close().await;
    }

    #[tokio::test]
    async fn test_mount_resolution_walks_to_existing_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("not/yet/created");
        let monitor = StorageMonitor::new(0);
        let item = item(&nested);
        // The nested folder does not exist; the check still resolves through
        // the tempdir and passes.
        assert!(monitor.check_free_space(&item).await.is_ok());
        monitor.close().await;
    }

    #[tokio::test]
    async fn test_unsupported_sentinel_bypasses_check() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = StorageMonitor::new(u64::MAX / 2);
        let item = item(dir.path());

        // Pre-seed the mount with the unsupported sentinel.
        let mount = monitor.mount_point_of(dir.path()).unwrap();
        monitor.free_space.write().await.insert(mount, -1);

        assert!(
            monitor.check_free_space(&item).await.is_ok(),
            "sentinel -1 must bypass the threshold"
        );
        monitor.close().await;
    }

    #[tokio::test]
    async fn test_cached_value_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = StorageMonitor::new(0);
        let item = item(dir.path());
        monitor.check_free_space(&item).await.unwrap();

        let mount = monitor.mount_point_of(dir.path()).unwrap();
        assert!(monitor.free_space.read().await.contains_key(&mount));
        monitor.close().await;
    }
}
