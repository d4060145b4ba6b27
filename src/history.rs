//! Persistent download history and fingerprint records.
//!
//! The history store answers "seen before?" queries for the downloader and
//! the dedup pipeline. Three tables back it: `media` (one row per download
//! attempt, keyed by domain + url path + original filename), `files` (one
//! row per file on disk), and `hash` (one fingerprint per file per
//! algorithm).
//!
//! All mutating operations commit immediately; there are no long-lived write
//! transactions, so concurrent readers are always tolerated.

use std::collections::HashMap;
use std::path::Path;

use sqlx::FromRow;
use tracing::{info, instrument, warn};
use url::Url;

use crate::db::{Database, DbError};
use crate::media::MediaItem;

/// Result alias for history operations.
pub type Result<T> = std::result::Result<T, DbError>;

/// A `files` row matched by fingerprint during dedup.
#[derive(Debug, Clone, FromRow)]
pub struct FileMatch {
    /// Directory holding the file.
    pub folder: String,
    /// Name of the file on disk.
    pub download_filename: String,
    /// File mtime recorded at hash time (seconds since epoch).
    pub date: Option<i64>,
}

impl FileMatch {
    /// Full path of the matched file.
    #[must_use]
    pub fn path(&self) -> std::path::PathBuf {
        Path::new(&self.folder).join(&self.download_filename)
    }
}

/// A cached fingerprint row for one (folder, filename, algorithm).
#[derive(Debug, Clone, FromRow)]
pub struct CachedHash {
    /// The fingerprint value.
    pub hash: String,
    /// File size recorded when the hash was computed.
    pub file_size: i64,
    /// File mtime recorded when the hash was computed; absent on legacy rows.
    pub date: Option<i64>,
}

/// Persistent record of downloads, filesizes, durations, and hashes.
///
/// With `ignore_history` set, every pre-download lookup reports "not seen"
/// while writes still happen, so the history stays accurate for later runs.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    db: Database,
    ignore_history: bool,
}

impl HistoryStore {
    /// Creates a history store over an open database.
    #[must_use]
    pub fn new(db: Database, ignore_history: bool) -> Self {
        Self { db, ignore_history }
    }

    /// Whether pre-download lookups are disabled.
    #[must_use]
    pub fn ignores_history(&self) -> bool {
        self.ignore_history
    }

    /// Checks whether a file completed in a previous run.
    ///
    /// When the row is complete but was recorded under a different referer
    /// (and the URL is not its own referer), the stored referer is rewritten
    /// so [`check_complete_by_referer`](Self::check_complete_by_referer)
    /// keeps working for pages whose canonical URL changed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on query failure.
    #[instrument(skip(self, url, referer), fields(domain, db_path))]
    pub async fn check_complete(
        &self,
        domain: &str,
        url: &Url,
        referer: &Url,
        db_path: &str,
    ) -> Result<bool> {
        if self.ignore_history {
            return Ok(false);
        }

        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT referer, completed FROM media WHERE domain = ? AND url_path = ?",
        )
        .bind(domain)
        .bind(db_path)
        .fetch_optional(self.db.pool())
        .await?;

        let Some((stored_referer, completed)) = row else {
            return Ok(false);
        };
        let completed = completed != 0;

        if completed && url != referer && stored_referer != referer.as_str() {
            info!(
                url = %url,
                old = %stored_referer,
                new = %referer,
                "updating stored referer"
            );
            sqlx::query("UPDATE media SET referer = ? WHERE domain = ? AND url_path = ?")
                .bind(referer.as_str())
                .bind(domain)
                .bind(db_path)
                .execute(self.db.pool())
                .await?;
        }

        Ok(completed)
    }

    /// Checks for a completed row by referer; `domain = None` means any.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on query failure.
    pub async fn check_complete_by_referer(
        &self,
        domain: Option<&str>,
        referer: &Url,
    ) -> Result<bool> {
        if self.ignore_history {
            return Ok(false);
        }

        let row: Option<(i64,)> = match domain {
            Some(domain) => {
                sqlx::query_as(
                    "SELECT 1 FROM media WHERE completed = 1 AND referer = ? AND domain = ? LIMIT 1",
                )
                .bind(referer.as_str())
                .bind(domain)
                .fetch_optional(self.db.pool())
                .await?
            }
            None => {
                sqlx::query_as("SELECT 1 FROM media WHERE completed = 1 AND referer = ? LIMIT 1")
                    .bind(referer.as_str())
                    .fetch_optional(self.db.pool())
                    .await?
            }
        };
        Ok(row.is_some())
    }

    /// Returns the completion state of every known item of an album.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on query failure.
    pub async fn check_album(&self, domain: &str, album_id: &str) -> Result<HashMap<String, bool>> {
        if self.ignore_history {
            return Ok(HashMap::new());
        }

        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT url_path, completed FROM media WHERE domain = ? AND album_id = ?")
                .bind(domain)
                .bind(album_id)
                .fetch_all(self.db.pool())
                .await?;
        Ok(rows
            .into_iter()
            .map(|(path, completed)| (path, completed != 0))
            .collect())
    }

    /// Inserts a `completed = 0` row for a new download attempt.
    ///
    /// Re-inserting an existing key is a no-op (`INSERT OR IGNORE`).
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on query failure.
    #[instrument(skip(self, item), fields(domain, db_path = %item.db_path))]
    pub async fn insert_incompleted(&self, domain: &str, item: &MediaItem) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO media
             (domain, url_path, referer, album_id, download_path, download_filename, original_filename)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(domain)
        .bind(&item.db_path)
        .bind(item.referer.as_str())
        .bind(&item.album_id)
        .bind(item.download_folder.to_string_lossy().as_ref())
        .bind(&item.filename)
        .bind(&item.original_filename)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Marks a download as completed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on query failure.
    #[instrument(skip(self, item), fields(domain, db_path = %item.db_path))]
    pub async fn mark_complete(&self, domain: &str, item: &MediaItem) -> Result<()> {
        sqlx::query(
            "UPDATE media SET completed = 1, completed_at = CURRENT_TIMESTAMP
             WHERE domain = ? AND url_path = ?",
        )
        .bind(domain)
        .bind(&item.db_path)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Records the on-disk size of the completed file.
    ///
    /// Silently skips when the file no longer exists.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on query failure.
    pub async fn add_filesize(&self, domain: &str, item: &MediaItem) -> Result<()> {
        let Ok(metadata) = tokio::fs::metadata(item.complete_file()).await else {
            return Ok(());
        };
        sqlx::query("UPDATE media SET file_size = ? WHERE domain = ? AND url_path = ?")
            .bind(i64::try_from(metadata.len()).unwrap_or(i64::MAX))
            .bind(domain)
            .bind(&item.db_path)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Records the probed media duration.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on query failure.
    pub async fn add_duration(&self, domain: &str, item: &MediaItem) -> Result<()> {
        sqlx::query("UPDATE media SET duration = ? WHERE domain = ? AND url_path = ?")
            .bind(item.duration)
            .bind(domain)
            .bind(&item.db_path)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Returns the recorded duration, if any.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on query failure.
    pub async fn get_duration(&self, domain: &str, item: &MediaItem) -> Result<Option<f64>> {
        let row: Option<(Option<f64>,)> =
            sqlx::query_as("SELECT duration FROM media WHERE domain = ? AND url_path = ? LIMIT 1")
                .bind(domain)
                .bind(&item.db_path)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(row.and_then(|(duration,)| duration))
    }

    /// Updates the album id of an existing row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on query failure.
    pub async fn set_album_id(&self, domain: &str, item: &MediaItem) -> Result<()> {
        sqlx::query("UPDATE media SET album_id = ? WHERE domain = ? AND url_path = ?")
            .bind(&item.album_id)
            .bind(domain)
            .bind(&item.db_path)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Fills in the download filename of rows that recorded an empty one.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on query failure.
    pub async fn add_download_filename(&self, domain: &str, item: &MediaItem) -> Result<()> {
        sqlx::query(
            "UPDATE media SET download_filename = ?
             WHERE domain = ? AND url_path = ? AND download_filename = ''",
        )
        .bind(&item.filename)
        .bind(domain)
        .bind(&item.db_path)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Checks whether any file recorded this fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on query failure.
    pub async fn check_hash_exists(&self, hash_type: &str, hash_value: &str) -> Result<bool> {
        if self.ignore_history {
            return Ok(false);
        }

        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM hash WHERE hash_type = ? AND hash = ? LIMIT 1")
                .bind(hash_type)
                .bind(hash_value)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(row.is_some())
    }

    /// Looks up the cached fingerprint for one file and algorithm.
    ///
    /// Returns the hash with the size and mtime recorded at hash time; the
    /// caller decides whether the cache is still valid.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on query failure.
    pub async fn get_file_hash(
        &self,
        folder: &str,
        filename: &str,
        hash_type: &str,
    ) -> Result<Option<CachedHash>> {
        let row = sqlx::query_as::<_, CachedHash>(
            "SELECT hash.hash, files.file_size, files.date
             FROM hash JOIN files
               ON hash.folder = files.folder AND hash.download_filename = files.download_filename
             WHERE hash.folder = ? AND hash.download_filename = ? AND hash.hash_type = ?
               AND hash.hash IS NOT NULL",
        )
        .bind(folder)
        .bind(filename)
        .bind(hash_type)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row)
    }

    /// Returns every file whose recorded fingerprint and size match.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on query failure.
    pub async fn get_files_with_hash_matches(
        &self,
        hash_value: &str,
        size: i64,
        hash_type: &str,
    ) -> Result<Vec<FileMatch>> {
        let rows = sqlx::query_as::<_, FileMatch>(
            "SELECT files.folder, files.download_filename, files.date
             FROM hash JOIN files
               ON hash.folder = files.folder AND hash.download_filename = files.download_filename
             WHERE hash.hash = ? AND files.file_size = ? AND hash.hash_type = ?",
        )
        .bind(hash_value)
        .bind(size)
        .bind(hash_type)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }

    /// Upserts a fingerprint row keyed by (folder, filename, algorithm).
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on query failure.
    pub async fn insert_or_update_hash(
        &self,
        hash_value: &str,
        hash_type: &str,
        file: &Path,
    ) -> Result<()> {
        let (folder, filename) = split_path(file);
        sqlx::query(
            "INSERT INTO hash (hash, hash_type, folder, download_filename)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (download_filename, folder, hash_type) DO UPDATE SET hash = excluded.hash",
        )
        .bind(hash_value)
        .bind(hash_type)
        .bind(&folder)
        .bind(&filename)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Upserts a `files` row keyed by (folder, filename).
    ///
    /// Records the current size and mtime of the file on disk; skips with a
    /// warning when the file vanished.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on query failure.
    pub async fn insert_or_update_file(
        &self,
        original_filename: Option<&str>,
        referer: Option<&Url>,
        file: &Path,
    ) -> Result<()> {
        let (folder, filename) = split_path(file);
        let Ok(metadata) = tokio::fs::metadata(file).await else {
            warn!(file = %file.display(), "file vanished before it could be recorded");
            return Ok(());
        };
        let file_size = i64::try_from(metadata.len()).unwrap_or(i64::MAX);
        let date = metadata
            .modified()
            .ok()
            .and_then(|mtime| mtime.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX));

        sqlx::query(
            "INSERT INTO files (folder, original_filename, download_filename, file_size, referer, date)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (download_filename, folder) DO UPDATE SET
               original_filename = excluded.original_filename,
               file_size = excluded.file_size,
               referer = excluded.referer,
               date = excluded.date",
        )
        .bind(&folder)
        .bind(original_filename)
        .bind(&filename)
        .bind(file_size)
        .bind(referer.map(Url::as_str))
        .bind(date)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}

/// Splits a path into (parent folder, filename) strings.
fn split_path(file: &Path) -> (String, String) {
    let folder = file
        .parent()
        .map(|parent| parent.to_string_lossy().into_owned())
        .unwrap_or_default();
    let filename = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    (folder, filename)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn item(dir: &Path) -> MediaItem {
        MediaItem::new(
            url("https://example.test/a.mp4"),
            "example",
            url("https://example.test/album"),
            dir,
            "a.mp4",
            "a.mp4",
            "/a.mp4",
        )
    }

    async fn store() -> HistoryStore {
        let db = Database::new_in_memory().await.unwrap();
        HistoryStore::new(db, false)
    }

    #[tokio::test]
    async fn test_lifecycle_insert_incomplete_then_mark_complete() {
        let store = store().await;
        let dir = tempfile::tempdir().unwrap();
        let item = item(dir.path());

        assert!(
            !store
                .check_complete(&item.domain, &item.url, &item.referer, &item.db_path)
                .await
                .unwrap()
        );

        store.insert_incompleted(&item.domain, &item).await.unwrap();
        assert!(
            !store
                .check_complete(&item.domain, &item.url, &item.referer, &item.db_path)
                .await
                .unwrap(),
            "incomplete row must not read as complete"
        );

        store.mark_complete(&item.domain, &item).await.unwrap();
        assert!(
            store
                .check_complete(&item.domain, &item.url, &item.referer, &item.db_path)
                .await
                .unwrap()
        );
        assert!(
            store
                .check_complete_by_referer(Some("example"), &item.referer)
                .await
                .unwrap()
        );
        assert!(
            store
                .check_complete_by_referer(None, &item.referer)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_insert_incompleted_is_idempotent() {
        let store = store().await;
        let dir = tempfile::tempdir().unwrap();
        let item = item(dir.path());

        store.insert_incompleted(&item.domain, &item).await.unwrap();
        store.insert_incompleted(&item.domain, &item).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM media")
            .fetch_one(store.db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_check_complete_rewrites_changed_referer() {
        let store = store().await;
        let dir = tempfile::tempdir().unwrap();
        let item = item(dir.path());

        store.insert_incompleted(&item.domain, &item).await.unwrap();
        store.mark_complete(&item.domain, &item).await.unwrap();

        let new_referer = url("https://example.test/album-renamed");
        assert!(
            store
                .check_complete(&item.domain, &item.url, &new_referer, &item.db_path)
                .await
                .unwrap()
        );
        assert!(
            store
                .check_complete_by_referer(Some("example"), &new_referer)
                .await
                .unwrap(),
            "referer lookups must follow the rewrite"
        );
        assert!(
            !store
                .check_complete_by_referer(Some("example"), &item.referer)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_ignore_history_short_circuits_lookups() {
        let db = Database::new_in_memory().await.unwrap();
        let store = HistoryStore::new(db, true);
        let dir = tempfile::tempdir().unwrap();
        let item = item(dir.path());

        store.insert_incompleted(&item.domain, &item).await.unwrap();
        store.mark_complete(&item.domain, &item).await.unwrap();

        assert!(
            !store
                .check_complete(&item.domain, &item.url, &item.referer, &item.db_path)
                .await
                .unwrap()
        );
        assert!(
            !store
                .check_complete_by_referer(None, &item.referer)
                .await
                .unwrap()
        );
        assert!(!store.check_hash_exists("xxh128", "cafe").await.unwrap());
    }

    #[tokio::test]
    async fn test_album_check_reports_per_item_completion() {
        let store = store().await;
        let dir = tempfile::tempdir().unwrap();
        let mut first = item(dir.path());
        first.album_id = Some("al1".to_string());
        let mut second = first.clone();
        second.url = url("https://example.test/b.mp4");
        second.db_path = "/b.mp4".to_string();
        second.filename = "b.mp4".to_string();

        store.insert_incompleted("example", &first).await.unwrap();
        store.insert_incompleted("example", &second).await.unwrap();
        store.mark_complete("example", &first).await.unwrap();

        let album = store.check_album("example", "al1").await.unwrap();
        assert_eq!(album.get("/a.mp4"), Some(&true));
        assert_eq!(album.get("/b.mp4"), Some(&false));
    }

    #[tokio::test]
    async fn test_duration_roundtrip() {
        let store = store().await;
        let dir = tempfile::tempdir().unwrap();
        let mut item = item(dir.path());

        store.insert_incompleted("example", &item).await.unwrap();
        assert!(store.get_duration("example", &item).await.unwrap().is_none());

        item.duration = Some(12.5);
        store.add_duration("example", &item).await.unwrap();
        assert_eq!(
            store.get_duration("example", &item).await.unwrap(),
            Some(12.5)
        );
    }

    #[tokio::test]
    async fn test_add_filesize_records_on_disk_size() {
        let store = store().await;
        let dir = tempfile::tempdir().unwrap();
        let item = item(dir.path());
        std::fs::write(item.complete_file(), b"0123456789").unwrap();

        store.insert_incompleted("example", &item).await.unwrap();
        store.add_filesize("example", &item).await.unwrap();

        let (size,): (Option<i64>,) =
            sqlx::query_as("SELECT file_size FROM media WHERE url_path = '/a.mp4'")
                .fetch_one(store.db.pool())
                .await
                .unwrap();
        assert_eq!(size, Some(10));
    }

    #[tokio::test]
    async fn test_hash_upsert_and_matches() {
        let store = store().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.mp4");
        std::fs::write(&file, b"0123456789").unwrap();

        store
            .insert_or_update_file(Some("a.mp4"), None, &file)
            .await
            .unwrap();
        store
            .insert_or_update_hash("cafebabe", "xxh128", &file)
            .await
            .unwrap();

        assert!(store.check_hash_exists("xxh128", "cafebabe").await.unwrap());
        assert!(!store.check_hash_exists("md5", "cafebabe").await.unwrap());

        let matches = store
            .get_files_with_hash_matches("cafebabe", 10, "xxh128")
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].path(), file);

        // Updating the hash for the same file replaces, not duplicates.
        store
            .insert_or_update_hash("deadbeef", "xxh128", &file)
            .await
            .unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM hash")
            .fetch_one(store.db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_cached_hash_includes_size_and_mtime() {
        let store = store().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.mp4");
        std::fs::write(&file, b"0123456789").unwrap();

        store
            .insert_or_update_file(Some("a.mp4"), None, &file)
            .await
            .unwrap();
        store
            .insert_or_update_hash("cafebabe", "xxh128", &file)
            .await
            .unwrap();

        let cached = store
            .get_file_hash(&dir.path().to_string_lossy(), "a.mp4", "xxh128")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.hash, "cafebabe");
        assert_eq!(cached.file_size, 10);
        assert!(cached.date.is_some());
    }

    #[tokio::test]
    async fn test_add_download_filename_only_fills_empty() {
        let store = store().await;
        let dir = tempfile::tempdir().unwrap();
        let item = item(dir.path());

        sqlx::query(
            "INSERT INTO media (domain, url_path, original_filename, download_path, download_filename)
             VALUES ('example', '/a.mp4', 'a.mp4', '/downloads', '')",
        )
        .execute(store.db.pool())
        .await
        .unwrap();

        store.add_download_filename("example", &item).await.unwrap();
        let (name,): (String,) =
            sqlx::query_as("SELECT download_filename FROM media WHERE url_path = '/a.mp4'")
                .fetch_one(store.db.pool())
                .await
                .unwrap();
        assert_eq!(name, "a.mp4");

        // A second item with a different name must not overwrite it.
        let mut other = item.clone();
        other.filename = "other.mp4".to_string();
        store.add_download_filename("example", &other).await.unwrap();
        let (name,): (String,) =
            sqlx::query_as("SELECT download_filename FROM media WHERE url_path = '/a.mp4'")
                .fetch_one(store.db.pool())
                .await
                .unwrap();
        assert_eq!(name, "a.mp4");
    }
}
