//! The per-file download state machine.
//!
//! One [`StreamDownloader`] serves the whole run. For each media item it:
//! checks history and config predicates, computes the resume offset, opens
//! the response stream through the session pool, streams chunks into the
//! `.part` file under the byte-rate limiter and the free-space gate, aborts
//! sustained-slow transfers, promotes the partial to the complete file, and
//! finalizes (permissions, timestamps, history rows, hashing).
//!
//! Retry control flow is a tagged result: retryable errors loop back to the
//! resume computation until the attempt budget runs out; everything else
//! surfaces to the caller's error boundary.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::client::{self, ClientPool};
use crate::config::Settings;
use crate::formats;
use crate::hashing::Hasher;
use crate::history::HistoryStore;
use crate::limits::{DownloadSlots, RequestPacer, ServerLocks, SpeedLimiter, WeakKeyedLocks};
use crate::media::MediaItem;
use crate::progress::{ProgressHook, RunStats};
use crate::storage::StorageMonitor;

use super::DownloadError;

/// Seconds of continuously slow throughput before the transfer aborts.
const SLOW_DOWNLOAD_PERIOD: Duration = Duration::from_secs(10);

/// Check free space every this many chunks.
const FREE_SPACE_CHECK_PERIOD: u64 = 5;

/// Run lifecycle states signalled to every in-flight task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Downloads proceed.
    Running,
    /// Downloads block at the next chunk boundary until resumed.
    Paused,
    /// Downloads stop at the next chunk boundary and do no further I/O.
    ShuttingDown,
}

/// Concurrency gates shared by every download.
///
/// Acquisition order is global → domain → server → file; permits release in
/// LIFO order when the guards drop.
#[derive(Debug)]
pub struct DownloadGates {
    /// Global and per-domain download slots.
    pub slots: DownloadSlots,
    /// Per-server serialization for opted-in domains.
    pub server_locks: ServerLocks,
    /// Per-filename locks so one output file has one writer.
    pub file_locks: WeakKeyedLocks,
    /// Request pacing token buckets.
    pub pacer: RequestPacer,
}

impl DownloadGates {
    /// Builds the gates from the run settings.
    #[must_use]
    pub fn new(settings: &Settings) -> Self {
        Self {
            slots: DownloadSlots::new(
                settings.rate_limits.max_simultaneous_downloads,
                settings.rate_limits.max_simultaneous_downloads_per_domain,
            ),
            server_locks: ServerLocks::new(),
            file_locks: WeakKeyedLocks::new(),
            pacer: RequestPacer::new(
                settings.rate_limits.global_requests_per_second,
                settings.rate_limits.domain_requests_per_second,
            ),
        }
    }
}

/// Sustained-slow-transfer watchdog, sampled once per chunk.
#[derive(Debug)]
struct SpeedChecker {
    threshold: u64,
    slow_since: Option<Instant>,
}

impl SpeedChecker {
    fn new(threshold: u64) -> Self {
        Self {
            threshold,
            slow_since: None,
        }
    }

    /// Errors once the speed has stayed at or below the threshold for the
    /// full slow period. A zero threshold disables the check.
    fn check(&mut self, speed: u64) -> Result<(), DownloadError> {
        if self.threshold == 0 {
            return Ok(());
        }
        if speed > self.threshold {
            self.slow_since = None;
        } else if let Some(since) = self.slow_since {
            if since.elapsed() > SLOW_DOWNLOAD_PERIOD {
                return Err(DownloadError::SlowDownload);
            }
        } else {
            self.slow_since = Some(Instant::now());
        }
        Ok(())
    }
}

/// Low-level downloader performing the transfer plus database updates.
#[derive(Debug)]
pub struct StreamDownloader {
    settings: Settings,
    clients: Arc<ClientPool>,
    history: HistoryStore,
    storage: Arc<StorageMonitor>,
    hasher: Arc<Hasher>,
    gates: Arc<DownloadGates>,
    speed_limiter: SpeedLimiter,
    stats: Arc<RunStats>,
    run_state: watch::Receiver<RunState>,
    filename_regex: Option<regex::Regex>,
    supports_ranges: bool,
}

impl StreamDownloader {
    /// Creates the downloader with the handles it needs.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        clients: Arc<ClientPool>,
        history: HistoryStore,
        storage: Arc<StorageMonitor>,
        hasher: Arc<Hasher>,
        gates: Arc<DownloadGates>,
        stats: Arc<RunStats>,
        run_state: watch::Receiver<RunState>,
    ) -> Self {
        let filename_regex = settings
            .ignore
            .filename_regex
            .as_deref()
            .and_then(|pattern| match regex::Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(error) => {
                    warn!(pattern, error = %error, "invalid filename_regex; ignoring");
                    None
                }
            });
        let speed_limiter = SpeedLimiter::new(settings.rate_limits.download_speed_limit);
        Self {
            settings,
            clients,
            history,
            storage,
            hasher,
            gates,
            speed_limiter,
            stats,
            run_state,
            filename_regex,
            supports_ranges: true,
        }
    }

    /// Runs one media item through the full state machine.
    ///
    /// Returns `Ok(true)` when the file was downloaded, `Ok(false)` when it
    /// was skipped (history hit, config predicate, or deleted afterwards by
    /// a gate). The attempt counter resets on entry, so re-enqueued items
    /// always get a fresh budget.
    ///
    /// # Errors
    ///
    /// Returns the final [`DownloadError`] after the attempt budget is
    /// exhausted, or immediately for non-retryable errors.
    #[instrument(skip(self, item), fields(url = %item.url, domain = %item.domain))]
    pub async fn run(&self, item: &mut MediaItem) -> Result<bool, DownloadError> {
        item.current_attempt = 0;

        if item.is_segment {
            // Segments skip history, slots, and counters entirely.
            let hook = ProgressHook::new();
            return self.download_with_retry(item, &hook).await;
        }

        if self.pre_download_checks(item).await? {
            return Ok(false);
        }

        self.history
            .insert_incompleted(&item.domain, item)
            .await
            .map_err(db_to_download_error)?;

        if self.settings.download.skip_download_mark_completed {
            info!(url = %item.url, "download skipped due to mark completed option");
            self.stats.add_skipped();
            self.history
                .mark_complete(&item.domain, item)
                .await
                .map_err(db_to_download_error)?;
            return Ok(false);
        }

        let _slots = self.gates.slots.acquire(&item.domain).await;
        let server_lock = self
            .gates
            .server_locks
            .limiter(&item.domain, item.server());
        let _server_guard = match &server_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        let file_lock = self.gates.file_locks.get(&item.filename);
        let _file_guard = file_lock.lock().await;

        info!(url = %item.url, "download starting");
        let hook = ProgressHook::new();
        let downloaded = self.download_with_retry(item, &hook).await?;
        if downloaded {
            if !self.check_duration_gate(item).await? {
                return Ok(false);
            }
            self.finalize(item).await?;
        }
        Ok(downloaded)
    }

    /// Post-download duration gate; `Ok(false)` deletes the file and skips.
    ///
    /// The duration comes from the scraper or the history when known,
    /// otherwise from a best-effort `ffprobe` of the finished file.
    async fn check_duration_gate(&self, item: &mut MediaItem) -> Result<bool, DownloadError> {
        if !formats::is_video(&item.ext) && !formats::is_audio(&item.ext) {
            return Ok(true);
        }

        if item.duration.is_none() {
            item.duration = probe_duration(&item.complete_file()).await;
        }
        if item.duration.is_some() {
            self.history
                .add_duration(&item.domain, item)
                .await
                .map_err(db_to_download_error)?;
        }

        let Some(seconds) = item.duration else {
            return Ok(true);
        };
        if self.allowed_duration(&item.ext, seconds) {
            return Ok(true);
        }

        warn!(url = %item.url, seconds, "download deleted due to runtime restrictions");
        remove_file_if_exists(&item.complete_file()).await?;
        self.stats.add_skipped();
        Ok(false)
    }

    /// History and config predicates; `Ok(true)` means skip the item.
    async fn pre_download_checks(&self, item: &mut MediaItem) -> Result<bool, DownloadError> {
        if self
            .history
            .check_complete(&item.domain, &item.url, &item.referer, &item.db_path)
            .await
            .map_err(db_to_download_error)?
        {
            debug!(url = %item.url, "skipping; already downloaded");
            if item.album_id.is_some() {
                self.history
                    .set_album_id(&item.domain, item)
                    .await
                    .map_err(db_to_download_error)?;
            }
            self.stats.add_previously_completed();
            return Ok(true);
        }

        if !self.allowed_filetype(item) {
            return Err(DownloadError::RestrictedFiletype {
                ext: item.ext.clone(),
            });
        }

        if let Some(regex) = &self.filename_regex {
            if regex.is_match(&item.filename) {
                return Err(DownloadError::RestrictedFilename);
            }
        }

        if !self.allowed_date_range(item) {
            return Err(DownloadError::RestrictedDateRange);
        }

        if item.duration.is_none() {
            item.duration = self
                .history
                .get_duration(&item.domain, item)
                .await
                .map_err(db_to_download_error)?;
        }
        if let Some(seconds) = item.duration {
            if !self.allowed_duration(&item.ext, seconds) {
                return Err(DownloadError::Duration { seconds });
            }
        }

        Ok(false)
    }

    fn allowed_filetype(&self, item: &MediaItem) -> bool {
        let ignore = &self.settings.ignore;
        if formats::is_image(&item.ext) && ignore.exclude_images {
            return false;
        }
        if formats::is_video(&item.ext) && ignore.exclude_videos {
            return false;
        }
        if formats::is_audio(&item.ext) && ignore.exclude_audio {
            return false;
        }
        formats::is_media(&item.ext) || !ignore.exclude_other
    }

    fn allowed_date_range(&self, item: &MediaItem) -> bool {
        let Some(timestamp) = item.timestamp else {
            return true;
        };
        let ignore = &self.settings.ignore;
        if ignore.exclude_before.is_some_and(|before| timestamp < before) {
            return false;
        }
        if ignore.exclude_after.is_some_and(|after| timestamp > after) {
            return false;
        }
        true
    }

    fn allowed_duration(&self, ext: &str, seconds: f64) -> bool {
        let limits = &self.settings.duration_limits;
        if formats::is_video(ext) {
            limits.video_range().contains(&seconds)
        } else if formats::is_audio(ext) {
            limits.audio_range().contains(&seconds)
        } else {
            true
        }
    }

    /// The retry loop around one transfer.
    async fn download_with_retry(
        &self,
        item: &mut MediaItem,
        hook: &ProgressHook,
    ) -> Result<bool, DownloadError> {
        let max_attempts = self.settings.max_attempts();
        loop {
            match self.attempt(item, hook).await {
                Ok(()) => return Ok(true),
                Err(error) if error.retryable() => {
                    item.current_attempt += 1;
                    warn!(url = %item.url, error = %error, "download failed");
                    if item.current_attempt >= max_attempts {
                        return Err(error);
                    }
                    info!(
                        url = %item.url,
                        attempt = item.current_attempt + 1,
                        max_attempts,
                        "retrying download"
                    );
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// One transfer: request, stream, post-check, promote.
    async fn attempt(&self, item: &mut MediaItem, hook: &ProgressHook) -> Result<(), DownloadError> {
        self.wait_until_running().await?;

        if let Some(status) = client::known_bad_url_status(item.real_url()) {
            return Err(DownloadError::http(status, "known placeholder asset"));
        }

        // Resume computation: a surviving partial resumes from its size.
        let partial_file = item.partial_file();
        let mut resume_point = if self.supports_ranges {
            partial_size(&partial_file).await
        } else {
            0
        };
        if resume_point > 0 {
            item.set_header("Range", format!("bytes={resume_point}-"));
        } else {
            item.remove_header("Range");
        }

        self.sleep_download_delay().await;

        self.gates.pacer.acquire(&item.domain).await;
        let mut response = self.send_request(item).await?;

        if response.status().as_u16() == 416 {
            // The partial no longer matches what the server has; start over.
            debug!(url = %item.url, "range not satisfiable; restarting without partial");
            remove_file_if_exists(&partial_file).await?;
            item.remove_header("Range");
            resume_point = 0;
            self.gates.pacer.acquire(&item.domain).await;
            response = self.send_request(item).await?;
        }

        client::check_http_status(&response)?;

        if !item.is_segment {
            client::check_content_type(&item.ext, response.headers())?;
        }

        let reported = client::content_length(response.headers());
        if response.status().as_u16() != 206 {
            // A full response supersedes any stale partial.
            remove_file_if_exists(&partial_file).await?;
            resume_point = 0;
        }
        item.filesize = reported.map(|length| resume_point + length);

        if let Some(filesize) = item.filesize {
            if !item.is_segment && !self.settings.file_size_limits.accepts(&item.ext, filesize) {
                return Err(DownloadError::RestrictedFiletype {
                    ext: item.ext.clone(),
                });
            }
        }

        if !item.is_segment && item.timestamp.is_none() {
            if let Some(last_modified) = client::parse_last_modified(response.headers()) {
                warn!(
                    url = %item.url,
                    "no upload date known; using Last-Modified header as file datetime"
                );
                item.timestamp = Some(last_modified);
            }
        }

        if resume_point > 0 {
            hook.advance(resume_point);
        }

        self.storage.check_free_space(item).await?;
        prepare_partial(&partial_file).await?;

        self.stream_to_partial(item, response, &partial_file, hook)
            .await?;

        // Post-check: an empty partial is a failed transfer, not a file.
        if partial_size(&partial_file).await == 0 {
            remove_file_if_exists(&partial_file).await?;
            return Err(DownloadError::http_retry(500, "File is empty"));
        }

        let complete_file = item.complete_file();
        tokio::fs::rename(&partial_file, &complete_file)
            .await
            .map_err(|source| DownloadError::io(complete_file, source))?;
        Ok(())
    }

    /// The chunked streaming loop.
    async fn stream_to_partial(
        &self,
        item: &MediaItem,
        response: reqwest::Response,
        partial_file: &Path,
        hook: &ProgressHook,
    ) -> Result<(), DownloadError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(partial_file)
            .await
            .map_err(|source| DownloadError::io(partial_file, source))?;
        let mut writer = tokio::io::BufWriter::new(file);

        let mut speed_checker = SpeedChecker::new(self.settings.runtime.slow_download_speed);
        let mut stream = response.bytes_stream();
        let mut chunk_index: u64 = 0;

        let result = loop {
            if let Err(error) = self.wait_until_running().await {
                break Err(error);
            }

            let Some(chunk) = stream.next().await else {
                break Ok(());
            };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(source) => break Err(stream_error(item, source)),
            };

            if chunk_index % FREE_SPACE_CHECK_PERIOD == 0 {
                if let Err(error) = self.storage.check_free_space(item).await {
                    break Err(error);
                }
            }
            chunk_index += 1;

            self.speed_limiter.acquire(chunk.len()).await;
            if let Err(source) = writer.write_all(&chunk).await {
                break Err(DownloadError::io(partial_file, source));
            }
            hook.advance(chunk.len() as u64);

            if let Err(error) = speed_checker.check(hook.speed()) {
                break Err(error);
            }
        };

        // Flush whatever made it, even on the error paths, so the partial
        // stays consistent for resume.
        writer
            .flush()
            .await
            .map_err(|source| DownloadError::io(partial_file, source))?;
        result
    }

    async fn send_request(&self, item: &MediaItem) -> Result<reqwest::Response, DownloadError> {
        let mut request = self
            .clients
            .session_for(&item.domain)
            .get(item.real_url().clone())
            .header(reqwest::header::REFERER, item.referer.as_str());
        for (name, value) in &item.headers {
            request = request.header(name, value);
        }
        request.send().await.map_err(|source| {
            if source.is_timeout() {
                DownloadError::timeout(item.real_url().as_str())
            } else {
                DownloadError::network(item.real_url().as_str(), source)
            }
        })
    }

    /// Fixed delay plus uniform jitter before each request.
    async fn sleep_download_delay(&self) {
        let delay = self.settings.rate_limits.download_delay;
        let jitter = self.settings.rate_limits.download_jitter;
        let total = if jitter > 0.0 {
            delay + rand::thread_rng().gen_range(0.0..jitter)
        } else {
            delay
        };
        if total > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(total)).await;
        }
    }

    /// Blocks while paused; errors out on shutdown.
    async fn wait_until_running(&self) -> Result<(), DownloadError> {
        let mut state = self.run_state.clone();
        loop {
            match *state.borrow_and_update() {
                RunState::Running => return Ok(()),
                RunState::ShuttingDown => {
                    return Err(DownloadError::http(499, "shutting down"));
                }
                RunState::Paused => {}
            }
            if state.changed().await.is_err() {
                // Sender gone: the orchestrator is tearing down.
                return Err(DownloadError::http(499, "shutting down"));
            }
        }
    }

    /// Permissions, timestamps, history rows, hashing, counters.
    async fn finalize(&self, item: &mut MediaItem) -> Result<(), DownloadError> {
        item.downloaded = true;
        let complete_file = item.complete_file();

        set_permissions(&complete_file).await?;

        if !self.settings.download.disable_file_timestamps {
            set_file_datetime(&complete_file, item.timestamp).await;
        }

        self.history
            .mark_complete(&item.domain, item)
            .await
            .map_err(db_to_download_error)?;
        self.history
            .add_filesize(&item.domain, item)
            .await
            .map_err(db_to_download_error)?;
        if item.duration.is_some() {
            self.history
                .add_duration(&item.domain, item)
                .await
                .map_err(db_to_download_error)?;
        }

        if let Err(error) = self.hasher.in_place_hash(item).await {
            warn!(file = %complete_file.display(), error = %error, "hashing failed");
        }

        self.stats.add_completed();
        info!(url = %item.url, "download finished");
        Ok(())
    }
}

/// Size of an existing partial file; zero when absent or empty.
async fn partial_size(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|metadata| metadata.len())
        .unwrap_or(0)
}

async fn remove_file_if_exists(path: &Path) -> Result<(), DownloadError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(DownloadError::io(path, source)),
    }
}

/// Creates parent directories and touches the partial file.
async fn prepare_partial(path: &Path) -> Result<(), DownloadError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| DownloadError::io(parent.to_path_buf(), source))?;
    }
    if tokio::fs::metadata(path).await.is_err() {
        tokio::fs::File::create(path)
            .await
            .map_err(|source| DownloadError::io(path, source))?;
    }
    Ok(())
}

fn stream_error(item: &MediaItem, source: reqwest::Error) -> DownloadError {
    if source.is_timeout() {
        DownloadError::timeout(item.real_url().as_str())
    } else {
        DownloadError::network(item.real_url().as_str(), source)
    }
}

async fn set_permissions(path: &Path) -> Result<(), DownloadError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
            .await
            .map_err(|source| DownloadError::io(path, source))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Restores the file's access and modification times from the upload time.
///
/// Creation time is best-effort and platform-dependent; failures are
/// swallowed the same way missing timestamps are.
async fn set_file_datetime(path: &Path, timestamp: Option<i64>) {
    let Some(timestamp) = timestamp else {
        warn!(path = %path.display(), "no upload date known; keeping current file datetime");
        return;
    };
    let Ok(timestamp) = u64::try_from(timestamp) else {
        return;
    };
    let target = path.to_path_buf();
    let set = move || -> std::io::Result<()> {
        let when = std::time::UNIX_EPOCH + Duration::from_secs(timestamp);
        let times = std::fs::FileTimes::new().set_accessed(when).set_modified(when);
        let file = std::fs::OpenOptions::new().write(true).open(&target)?;
        file.set_times(times)
    };
    if let Ok(Err(error)) = tokio::task::spawn_blocking(set).await {
        warn!(path = %path.display(), error = %error, "unable to set file datetime");
    }
}

/// Reads the container duration of a media file via `ffprobe`.
///
/// Absence of ffprobe, a probe failure, or unparseable output all yield
/// `None`; the duration gate treats unknown durations as acceptable.
async fn probe_duration(path: &Path) -> Option<f64> {
    let output = tokio::process::Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
}

fn db_to_download_error(error: crate::db::DbError) -> DownloadError {
    DownloadError::io(
        "history.db",
        std::io::Error::other(error.to_string()),
    )
}
