//! Scraper capability and registry.
//!
//! Site scrapers turn a [`ScrapeItem`] (a page, album, profile, or post)
//! into media items. The orchestrator owns the registry; scrapers never hold
//! the orchestrator; they emit results through a [`ScrapeContext`] handle,
//! which feeds resolved media and newly discovered pages back into the run.
//!
//! Domain lookup matches host fragments against each scraper's supported
//! hosts, after folding renamed hosts through [`OLD_DOMAINS`].

mod direct;

pub use direct::DirectHttpFile;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{OnceCell, Semaphore, mpsc};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::media::{MaxChildrenError, MediaItem, ScrapeItem};

/// Default concurrent fetches per scraper.
const DEFAULT_SCRAPER_CONCURRENCY: usize = 20;

/// Hosts that moved: URLs with the old fragment map to the new scraper key.
pub const OLD_DOMAINS: &[(&str, &str)] = &[
    ("cyberdrop.cc", "cyberdrop"),
    ("cyberdrop.nl", "cyberdrop"),
    ("bunkr.ru", "bunkr"),
    ("bunkr.su", "bunkr"),
    ("bunkr.la", "bunkr"),
];

/// A scraper could not extract items from a page.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// HTTP-level or parse failure for one page.
    #[error("scrape failed with status {status}: {message}")]
    Failed {
        /// Status code or synthesized sentinel.
        status: u16,
        /// Failure description.
        message: String,
    },

    /// The URL carries no usable file extension.
    #[error("no file extension in {url}")]
    NoExtension {
        /// The offending URL.
        url: Url,
    },

    /// The URL cannot be handled by this scraper.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The offending URL.
        url: Url,
    },

    /// An item produced more children than its type allows.
    #[error(transparent)]
    MaxChildren(#[from] MaxChildrenError),

    /// Credentialed access required and failed.
    #[error("login failed for {domain}: {message}")]
    Login {
        /// Scraper domain.
        domain: String,
        /// Failure description.
        message: String,
    },
}

impl ScrapeError {
    /// Creates a generic scrape failure.
    pub fn failed(status: u16, message: impl Into<String>) -> Self {
        Self::Failed {
            status,
            message: message.into(),
        }
    }
}

/// Handle through which scrapers hand results back to the orchestrator.
///
/// Holding only channel senders (not the orchestrator itself) keeps the
/// task graph acyclic.
#[derive(Debug, Clone)]
pub struct ScrapeContext {
    media_tx: mpsc::UnboundedSender<MediaItem>,
    scrape_tx: mpsc::UnboundedSender<ScrapeItem>,
    /// Root directory finished downloads land under.
    pub download_root: PathBuf,
}

impl ScrapeContext {
    /// Creates a context over the orchestrator's intake channels.
    #[must_use]
    pub fn new(
        media_tx: mpsc::UnboundedSender<MediaItem>,
        scrape_tx: mpsc::UnboundedSender<ScrapeItem>,
        download_root: PathBuf,
    ) -> Self {
        Self {
            media_tx,
            scrape_tx,
            download_root,
        }
    }

    /// Hands a resolved media item to the downloader pipeline.
    pub fn handle_media_item(&self, item: MediaItem) {
        if self.media_tx.send(item).is_err() {
            warn!("media intake closed; dropping item");
        }
    }

    /// Feeds a newly discovered page back into URL dispatch.
    pub fn handle_external_links(&self, item: ScrapeItem) {
        if self.scrape_tx.send(item).is_err() {
            warn!("scrape intake closed; dropping item");
        }
    }
}

/// A site scraper.
///
/// `ready` runs once before the first fetch (login, token acquisition);
/// `fetch` handles one scrape item and emits results through the context.
#[async_trait]
pub trait Scraper: Send + Sync {
    /// Logical scraper key used in history rows and limiter registries.
    fn domain(&self) -> &'static str;

    /// Host fragments this scraper claims.
    fn supported_hosts(&self) -> &'static [&'static str];

    /// Canonical site URL.
    fn primary_url(&self) -> Url;

    /// One-shot async setup; the default does nothing.
    async fn ready(&self) -> Result<(), ScrapeError> {
        Ok(())
    }

    /// Processes one scrape item.
    async fn fetch(&self, item: ScrapeItem, ctx: &ScrapeContext) -> Result<(), ScrapeError>;
}

/// One registered scraper with its concurrency gate and ready latch.
struct Registered {
    scraper: Arc<dyn Scraper>,
    semaphore: Arc<Semaphore>,
    ready: OnceCell<()>,
}

/// Static table of scrapers with host→scraper lookup.
#[derive(Default)]
pub struct ScraperRegistry {
    entries: Vec<Registered>,
}

impl std::fmt::Debug for ScraperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let domains: Vec<&str> = self.entries.iter().map(|e| e.scraper.domain()).collect();
        f.debug_struct("ScraperRegistry")
            .field("scrapers", &domains)
            .finish()
    }
}

impl ScraperRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a scraper.
    pub fn register(&mut self, scraper: Arc<dyn Scraper>) {
        debug!(domain = scraper.domain(), "registering scraper");
        self.entries.push(Registered {
            scraper,
            semaphore: Arc::new(Semaphore::new(DEFAULT_SCRAPER_CONCURRENCY)),
            ready: OnceCell::new(),
        });
    }

    /// Number of registered scrapers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the scraper claiming a host, folding renamed hosts first.
    #[must_use]
    pub fn find_for_host(&self, host: &str) -> Option<Arc<dyn Scraper>> {
        let folded = fold_old_domain(host);
        self.entries
            .iter()
            .find(|entry| {
                entry
                    .scraper
                    .supported_hosts()
                    .iter()
                    .any(|fragment| folded.contains(fragment))
            })
            .map(|entry| Arc::clone(&entry.scraper))
    }

    /// Runs one scrape item on its scraper, under the scraper's semaphore.
    ///
    /// The scraper's `ready` runs exactly once, before its first fetch.
    ///
    /// # Errors
    ///
    /// Propagates the scraper's [`ScrapeError`].
    #[instrument(skip(self, scraper, item, ctx), fields(domain = scraper.domain(), url = %item.url))]
    pub async fn run(
        &self,
        scraper: &Arc<dyn Scraper>,
        item: ScrapeItem,
        ctx: &ScrapeContext,
    ) -> Result<(), ScrapeError> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.scraper.domain() == scraper.domain());
        let Some(entry) = entry else {
            return Err(ScrapeError::InvalidUrl { url: item.url });
        };

        entry
            .ready
            .get_or_try_init(|| async {
                entry.scraper.ready().await?;
                Ok::<(), ScrapeError>(())
            })
            .await?;

        #[allow(clippy::expect_used)]
        let _permit = entry
            .semaphore
            .acquire()
            .await
            .expect("scraper semaphore closed");
        entry.scraper.fetch(item, ctx).await
    }
}

/// Maps a renamed host fragment onto its current scraper key.
#[must_use]
pub fn fold_old_domain(host: &str) -> String {
    for (old, new) in OLD_DOMAINS {
        if host.contains(old) {
            return host.replace(old, new);
        }
    }
    host.to_string()
}
