//! Per-run CSV report files.
//!
//! Four reports live in the log folder, each truncated on its first write of
//! the run and given a fixed header row: `Download_Error_URLs.csv`,
//! `Scrape_Error_URLs.csv`, `Last_Scraped_Forum_Posts.csv`, and
//! `Unsupported_URLs.csv`. Every field is quoted.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use url::Url;

/// Download failure report.
const DOWNLOAD_ERROR_URLS: &str = "Download_Error_URLs.csv";

/// Scrape failure report.
const SCRAPE_ERROR_URLS: &str = "Scrape_Error_URLs.csv";

/// Newest forum post seen per thread.
const LAST_SCRAPED_FORUM_POSTS: &str = "Last_Scraped_Forum_Posts.csv";

/// URLs no scraper claimed.
const UNSUPPORTED_URLS: &str = "Unsupported_URLs.csv";

/// Writer for the per-run CSV reports.
///
/// Failures to write a report line are logged and swallowed; reporting must
/// never take a download down with it.
#[derive(Debug)]
pub struct CsvReports {
    log_folder: PathBuf,
    has_headers: Mutex<HashSet<PathBuf>>,
}

impl CsvReports {
    /// Creates the writer rooted at the log folder.
    ///
    /// The `DEBUG_LOG_FOLDER` environment variable overrides the location.
    #[must_use]
    pub fn new(log_folder: impl Into<PathBuf>) -> Self {
        let log_folder = std::env::var_os("DEBUG_LOG_FOLDER")
            .map_or_else(|| log_folder.into(), PathBuf::from);
        Self {
            log_folder,
            has_headers: Mutex::new(HashSet::new()),
        }
    }

    /// The folder reports are written to.
    #[must_use]
    pub fn log_folder(&self) -> &Path {
        &self.log_folder
    }

    /// Records one failed download.
    pub async fn write_download_error(&self, url: &Url, error: &str, referer: &Url, origin: &str) {
        self.write_row(
            DOWNLOAD_ERROR_URLS,
            &["url", "error", "referer", "origin"],
            &[url.as_str(), error, referer.as_str(), origin],
        )
        .await;
    }

    /// Records one failed scrape.
    pub async fn write_scrape_error(&self, url: &Url, error: &str, origin: &str) {
        self.write_row(
            SCRAPE_ERROR_URLS,
            &["url", "error", "origin"],
            &[url.as_str(), error, origin],
        )
        .await;
    }

    /// Records the newest post seen in a forum thread.
    pub async fn write_last_forum_post(&self, url: &Url) {
        self.write_row(LAST_SCRAPED_FORUM_POSTS, &["url"], &[url.as_str()])
            .await;
    }

    /// Records an input URL no scraper claimed.
    pub async fn write_unsupported(&self, url: &Url, origin: &str) {
        self.write_row(
            UNSUPPORTED_URLS,
            &["url", "origin"],
            &[url.as_str(), origin],
        )
        .await;
    }

    /// Appends one quoted row, truncating and writing the header first on
    /// the file's first write of the run.
    async fn write_row(&self, filename: &str, header: &[&str], fields: &[&str]) {
        let path = self.log_folder.join(filename);
        let first_write = { self.has_headers.lock().await.insert(path.clone()) };

        let result = async {
            if first_write {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let mut file = tokio::fs::File::create(&path).await?;
                file.write_all(csv_line(header).as_bytes()).await?;
                file.write_all(csv_line(fields).as_bytes()).await?;
                file.flush().await?;
                return Ok::<_, std::io::Error>(());
            }

            let mut file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .await?;
            file.write_all(csv_line(fields).as_bytes()).await?;
            file.flush().await?;
            Ok(())
        }
        .await;

        if let Err(error) = result {
            warn!(path = %path.display(), error = %error, "unable to write report row");
        }
    }
}

/// Builds one CSV line with every field quoted.
fn csv_line(fields: &[&str]) -> String {
    let mut out = String::new();
    for (index, field) in fields.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        out.push('"');
        out.push_str(&field.replace('"', "\"\""));
        out.push('"');
    }
    out.push('\n');
    out
}
