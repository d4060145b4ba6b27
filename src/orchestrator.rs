//! Run orchestration: URL dispatch, task ownership, shutdown, post-run steps.
//!
//! The orchestrator owns the task set for the whole run. Input URLs become
//! scrape items and flow through dispatch: a registered site scraper when one
//! claims the host, the direct-file fallback when the URL names a media
//! file, otherwise the unsupported-URL report. Scrapers hand resolved media
//! back through channel senders; every media item gets its own download
//! task. When the set drains, the post-runtime steps run: batch hashing,
//! the dedupe sweep, and the final summary.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::Settings;
use crate::dedupe::Deduper;
use crate::download::{RunState, StreamDownloader};
use crate::hashing::Hasher;
use crate::input::ParsedInput;
use crate::media::{MediaItem, ScrapeItem};
use crate::progress::RunStats;
use crate::reports::CsvReports;
use crate::scrape::{DirectHttpFile, ScrapeContext, ScrapeError, Scraper, ScraperRegistry};

/// Host fragments that are never scraped.
const BLOCKED_DOMAIN_FRAGMENTS: &[&str] = &[
    "facebook.com",
    "instagram.com",
    "youtube.com",
    "youtu.be",
    "twitter.com",
    "x.com",
    "tiktok.com",
];

/// Owner of the run's tasks and lifecycle.
pub struct Orchestrator {
    settings: Settings,
    registry: Arc<ScraperRegistry>,
    direct: DirectHttpFile,
    downloader: Arc<StreamDownloader>,
    hasher: Arc<Hasher>,
    deduper: Deduper,
    reports: Arc<CsvReports>,
    stats: Arc<RunStats>,
    state_tx: watch::Sender<RunState>,
    seen_urls: Mutex<HashSet<Url>>,
    completed: Arc<Mutex<Vec<MediaItem>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates the orchestrator over already-wired components.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        registry: Arc<ScraperRegistry>,
        downloader: Arc<StreamDownloader>,
        hasher: Arc<Hasher>,
        deduper: Deduper,
        reports: Arc<CsvReports>,
        stats: Arc<RunStats>,
        state_tx: watch::Sender<RunState>,
    ) -> Self {
        Self {
            settings,
            registry,
            direct: DirectHttpFile::new(),
            downloader,
            hasher,
            deduper,
            reports,
            stats,
            state_tx,
            seen_urls: Mutex::new(HashSet::new()),
            completed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Signals every in-flight task to stop at its next chunk boundary.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        let _ = self.state_tx.send(RunState::ShuttingDown);
    }

    /// Pauses (or resumes) all downloads.
    pub fn set_paused(&self, paused: bool) {
        let state = if paused {
            RunState::Paused
        } else {
            RunState::Running
        };
        let _ = self.state_tx.send(state);
    }

    /// Runs the whole pipeline for one parsed input.
    ///
    /// Returns the run counters once every task has drained and the
    /// post-runtime steps finished.
    #[instrument(skip(self, input), fields(urls = input.len()))]
    pub async fn run(self: &Arc<Self>, input: &ParsedInput) -> Arc<RunStats> {
        let (media_tx, mut media_rx) = mpsc::unbounded_channel::<MediaItem>();
        let (scrape_tx, mut scrape_rx) = mpsc::unbounded_channel::<ScrapeItem>();
        let ctx = ScrapeContext::new(
            media_tx,
            scrape_tx,
            self.settings.runtime.download_folder.clone(),
        );

        for entry in &input.entries {
            let mut item = ScrapeItem::new(entry.url.clone());
            if let Some(group) = &entry.group {
                item.add_to_parent_title(group);
                item.part_of_album = true;
            }
            ctx.handle_external_links(item);
        }
        if input.is_empty() {
            info!("no valid links found");
        }

        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            if tasks.is_empty() && scrape_rx.is_empty() && media_rx.is_empty() {
                break;
            }

            tokio::select! {
                Some(item) = scrape_rx.recv() => {
                    self.dispatch(item, &ctx, &mut tasks).await;
                }
                Some(item) = media_rx.recv() => {
                    self.spawn_download(item, &mut tasks);
                }
                joined = tasks.join_next(), if !tasks.is_empty() => {
                    if let Some(Err(error)) = joined {
                        warn!(error = %error, "task panicked");
                    }
                }
            }
        }

        self.post_runtime().await;
        Arc::clone(&self.stats)
    }

    /// Routes one scrape item to a scraper, the direct fallback, or the
    /// unsupported log.
    async fn dispatch(
        self: &Arc<Self>,
        item: ScrapeItem,
        ctx: &ScrapeContext,
        tasks: &mut JoinSet<()>,
    ) {
        if !self.should_scrape(&item).await {
            return;
        }

        let host = item.url.host_str().unwrap_or_default().to_string();
        if let Some(scraper) = self.registry.find_for_host(&host) {
            let orchestrator = Arc::clone(self);
            let ctx = ctx.clone();
            tasks.spawn(async move {
                let url = item.url.clone();
                if let Err(error) = orchestrator.registry.run(&scraper, item, &ctx).await {
                    orchestrator.report_scrape_error(&url, &error).await;
                }
            });
            return;
        }

        match self.direct.fetch(item.clone(), ctx).await {
            Ok(()) => {}
            Err(ScrapeError::NoExtension { url } | ScrapeError::InvalidUrl { url }) => {
                info!(url = %url, "unsupported URL");
                let origin = item
                    .origin()
                    .map(|origin| origin.to_string())
                    .unwrap_or_default();
                self.reports.write_unsupported(&url, &origin).await;
                self.stats.add_unsupported();
            }
            Err(error) => self.report_scrape_error(&item.url, &error).await,
        }
    }

    /// Spawns the download task for one resolved media item.
    fn spawn_download(self: &Arc<Self>, item: MediaItem, tasks: &mut JoinSet<()>) {
        let orchestrator = Arc::clone(self);
        tasks.spawn(async move {
            let mut item = item;
            match orchestrator.downloader.run(&mut item).await {
                Ok(true) => {
                    orchestrator.completed.lock().await.push(item);
                }
                Ok(false) => {}
                Err(error) if error.is_skip() => {
                    debug!(url = %item.url, error = %error, "download skipped");
                    orchestrator.stats.add_skipped();
                }
                Err(error) => {
                    warn!(
                        url = %item.url,
                        referer = %item.referer,
                        error = %error,
                        "download failed"
                    );
                    orchestrator
                        .reports
                        .write_download_error(
                            &item.url,
                            &error.ui_label(),
                            &item.referer,
                            item.parents
                                .first()
                                .map(Url::as_str)
                                .unwrap_or_default(),
                        )
                        .await;
                    orchestrator.stats.add_failed();
                }
            }
        });
    }

    /// Per-run seen-set plus blocked/skip/only host filters.
    async fn should_scrape(&self, item: &ScrapeItem) -> bool {
        {
            let mut seen = self.seen_urls.lock().await;
            if !seen.insert(item.url.clone()) {
                return false;
            }
        }

        let host = item.url.host_str().unwrap_or_default();
        if BLOCKED_DOMAIN_FRAGMENTS
            .iter()
            .any(|fragment| host.contains(fragment))
        {
            info!(url = %item.url, "skipping blocked domain");
            return false;
        }

        let skip_hosts = &self.settings.ignore.skip_hosts;
        if skip_hosts.iter().any(|fragment| host.contains(fragment)) {
            info!(url = %item.url, "skipping URL by skip_hosts config");
            return false;
        }

        let only_hosts = &self.settings.ignore.only_hosts;
        if !only_hosts.is_empty() && !only_hosts.iter().any(|fragment| host.contains(fragment)) {
            info!(url = %item.url, "skipping URL by only_hosts config");
            return false;
        }

        true
    }

    async fn report_scrape_error(&self, url: &Url, error: &ScrapeError) {
        warn!(url = %url, error = %error, "scrape failed");
        self.reports
            .write_scrape_error(url, &error.to_string(), "")
            .await;
        self.stats.add_scrape_error();
    }

    /// Batch hashing and the dedupe sweep, after all downloads drained.
    async fn post_runtime(&self) {
        {
            let mut completed = self.completed.lock().await;
            self.hasher.post_download_hash(&mut completed).await;
        }

        let results = self.hasher.results().await;
        if let Err(error) = self.deduper.run(&results).await {
            warn!(error = %error, "dedupe sweep failed");
        }

        info!(
            completed = self.stats.completed(),
            failed = self.stats.failed(),
            skipped = self.stats.skipped(),
            previously_completed = self.stats.previously_completed(),
            removed_duplicates = self.stats.removed_duplicates(),
            unsupported = self.stats.unsupported(),
            "run finished"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::client::ClientPool;
    use crate::config::HashingMode;
    use crate::db::Database;
    use crate::download::DownloadGates;
    use crate::history::HistoryStore;
    use crate::input::parse_input;
    use crate::storage::StorageMonitor;
    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn orchestrator(settings: Settings) -> Arc<Orchestrator> {
        let db = Database::new_in_memory().await.unwrap();
        let history = HistoryStore::new(db, settings.runtime.ignore_history);
        let stats = Arc::new(RunStats::new());
        let hasher = Arc::new(Hasher::new(
            history.clone(),
            Arc::clone(&stats),
            &settings.dedupe,
        ));
        let deduper = Deduper::new(
            history.clone(),
            Arc::clone(&stats),
            settings.dedupe.auto_dedupe,
            false,
        );
        let clients = Arc::new(ClientPool::new(&settings).unwrap());
        let storage = StorageMonitor::new(0);
        let gates = Arc::new(DownloadGates::new(&settings));
        let (state_tx, state_rx) = watch::channel(RunState::Running);
        let downloader = Arc::new(StreamDownloader::new(
            settings.clone(),
            clients,
            history,
            storage,
            Arc::clone(&hasher),
            gates,
            Arc::clone(&stats),
            state_rx,
        ));
        let reports = Arc::new(CsvReports::new(settings.runtime.log_folder.clone()));
        Arc::new(Orchestrator::new(
            settings,
            Arc::new(ScraperRegistry::new()),
            downloader,
            hasher,
            deduper,
            reports,
            stats,
            state_tx,
        ))
    }

    fn settings_for(dir: &tempfile::TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.runtime.download_folder = dir.path().join("downloads");
        settings.runtime.log_folder = dir.path().join("logs");
        settings.dedupe.hashing = HashingMode::Off;
        settings
    }

    #[tokio::test]
    async fn test_run_downloads_direct_media_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/clip.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7_u8; 256]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&dir);
        let orchestrator = orchestrator(settings).await;

        let input = parse_input(&format!("{}/clip.mp4\n", server.uri()));
        let stats = orchestrator.run(&input).await;

        assert_eq!(stats.completed(), 1);
        assert_eq!(stats.failed(), 0);
        let expected = dir
            .path()
            .join("downloads/Loose Files/clip.mp4");
        assert!(expected.exists(), "missing {}", expected.display());
    }

    #[tokio::test]
    async fn test_run_same_url_twice_deduplicates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/clip.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7_u8; 64]))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(settings_for(&dir)).await;

        let text = format!("{0}/clip.mp4\n{0}/clip.mp4\n", server.uri());
        let stats = orchestrator.run(&parse_input(&text)).await;
        assert_eq!(stats.completed(), 1, "seen-set drops the repeat");
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/clip.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7_u8; 64]))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(settings_for(&dir)).await;
        let input = parse_input(&format!("{}/clip.mp4\n", server.uri()));

        orchestrator.run(&input).await;

        // Clear the per-run seen set the way a fresh process would.
        orchestrator.seen_urls.lock().await.clear();
        let stats = orchestrator.run(&input).await;

        assert_eq!(stats.completed(), 1, "no new download on the second run");
        assert_eq!(stats.previously_completed(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_url_reported() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&dir);
        let orchestrator = orchestrator(settings).await;

        let input = parse_input("https://example.test/profile/12345\n");
        let stats = orchestrator.run(&input).await;

        assert_eq!(stats.unsupported(), 1);
        assert!(
            dir.path().join("logs/Unsupported_URLs.csv").exists(),
            "unsupported report must be written"
        );
    }

    #[tokio::test]
    async fn test_skip_hosts_filter_issues_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_for(&dir);
        settings.ignore.skip_hosts = vec!["127.0.0.1".to_string(), "localhost".to_string()];
        let orchestrator = orchestrator(settings).await;

        let input = parse_input(&format!("{}/clip.mp4\n", server.uri()));
        let stats = orchestrator.run(&input).await;
        assert_eq!(stats.completed(), 0);
    }

    #[tokio::test]
    async fn test_only_hosts_filter_drops_everything_else() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_for(&dir);
        settings.ignore.only_hosts = vec!["allowed.test".to_string()];
        let orchestrator = orchestrator(settings).await;

        let input = parse_input("https://other.test/clip.mp4\n");
        let stats = orchestrator.run(&input).await;
        assert_eq!(stats.completed(), 0);
        assert_eq!(stats.unsupported(), 0, "filtered, not unsupported");
    }

    #[tokio::test]
    async fn test_blocked_domains_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(settings_for(&dir)).await;
        let input = parse_input("https://www.youtube.com/watch?v=abc123\n");
        let stats = orchestrator.run(&input).await;
        assert_eq!(stats.unsupported(), 0);
        assert_eq!(stats.completed(), 0);
    }

    #[tokio::test]
    async fn test_failed_download_writes_error_report() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/gone.mp4"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(settings_for(&dir)).await;
        let input = parse_input(&format!("{}/gone.mp4\n", server.uri()));
        let stats = orchestrator.run(&input).await;

        assert_eq!(stats.failed(), 1);
        let report = dir.path().join("logs/Download_Error_URLs.csv");
        let text = std::fs::read_to_string(report).unwrap();
        assert!(text.contains("gone.mp4"));
        assert!(text.contains("404"));
    }

    #[tokio::test]
    async fn test_group_header_becomes_parent_title() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/clip.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7_u8; 64]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(settings_for(&dir)).await;
        let text = format!("--- Vacation Pics\n{}/clip.mp4\n", server.uri());
        let stats = orchestrator.run(&parse_input(&text)).await;

        assert_eq!(stats.completed(), 1);
        let expected = dir
            .path()
            .join("downloads/Vacation Pics/Loose Files/clip.mp4");
        assert!(expected.exists(), "missing {}", expected.display());
    }

    #[tokio::test]
    async fn test_post_run_dedupe_removes_newer_duplicate() {
        let server = MockServer::start().await;
        let body = vec![42_u8; 128];
        Mock::given(method("GET"))
            .and(url_path("/a/clip.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(url_path("/b/copy.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_for(&dir);
        settings.dedupe.hashing = HashingMode::PostDownload;
        let orchestrator = orchestrator(settings).await;

        let text = format!("{0}/a/clip.mp4\n{0}/b/copy.mp4\n", server.uri());
        let stats = orchestrator.run(&parse_input(&text)).await;

        assert_eq!(stats.completed(), 2);
        assert_eq!(
            stats.removed_duplicates(),
            1,
            "one of the two identical files must be removed"
        );
        let folder = dir.path().join("downloads/Loose Files");
        let survivors: Vec<_> = std::fs::read_dir(folder).unwrap().collect();
        assert_eq!(survivors.len(), 1);
    }
}
