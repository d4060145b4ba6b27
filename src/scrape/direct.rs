//! Fallback scraper for URLs that point straight at a media file.

use async_trait::async_trait;
use url::Url;

use crate::formats;
use crate::media::{DbPathStyle, MediaItem, ScrapeItem, extension_of};

use super::{ScrapeContext, ScrapeError, Scraper};

/// Claims any URL whose last path segment carries a known media extension.
#[derive(Debug, Default)]
pub struct DirectHttpFile;

impl DirectHttpFile {
    /// Creates the fallback scraper.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Scraper for DirectHttpFile {
    fn domain(&self) -> &'static str {
        "no_crawler"
    }

    fn supported_hosts(&self) -> &'static [&'static str] {
        // Fallback: never matched by host, invoked explicitly by dispatch.
        &[]
    }

    fn primary_url(&self) -> Url {
        #[allow(clippy::expect_used)]
        Url::parse("https://localhost").expect("static URL is valid")
    }

    async fn fetch(&self, item: ScrapeItem, ctx: &ScrapeContext) -> Result<(), ScrapeError> {
        let filename = url_filename(&item.url).ok_or_else(|| ScrapeError::NoExtension {
            url: item.url.clone(),
        })?;
        let ext = extension_of(&filename);
        if ext.is_empty() {
            return Err(ScrapeError::NoExtension {
                url: item.url.clone(),
            });
        }
        if !formats::is_media(&ext) {
            return Err(ScrapeError::InvalidUrl {
                url: item.url.clone(),
            });
        }

        let mut item = item;
        item.add_to_parent_title("Loose Files");
        item.part_of_album = true;

        let folder = ctx.download_root.join(item.create_download_path(self.domain()));
        let db_path = DbPathStyle::Path.derive(&item.url);
        let media = MediaItem::from_scrape(
            &item,
            item.url.clone(),
            self.domain(),
            folder,
            filename,
            db_path,
        );
        ctx.handle_media_item(media);
        Ok(())
    }
}

/// Decoded filename from the URL's last path segment.
fn url_filename(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?;
    if segment.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(segment)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    Some(decoded)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    fn context() -> (ScrapeContext, mpsc::UnboundedReceiver<MediaItem>) {
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let (scrape_tx, _scrape_rx) = mpsc::unbounded_channel();
        (
            ScrapeContext::new(media_tx, scrape_tx, PathBuf::from("/downloads")),
            media_rx,
        )
    }

    #[tokio::test]
    async fn test_direct_file_emits_media_item() {
        let (ctx, mut media_rx) = context();
        let scraper = DirectHttpFile::new();
        let item = ScrapeItem::new(Url::parse("https://example.test/videos/clip%20one.mp4").unwrap());

        scraper.fetch(item, &ctx).await.unwrap();

        let media = media_rx.recv().await.unwrap();
        assert_eq!(media.filename, "clip one.mp4");
        assert_eq!(media.domain, "no_crawler");
        assert_eq!(media.db_path, "/videos/clip%20one.mp4");
        assert!(
            media
                .download_folder
                .to_string_lossy()
                .contains("Loose Files")
        );
    }

    #[tokio::test]
    async fn test_direct_file_rejects_extensionless() {
        let (ctx, _media_rx) = context();
        let scraper = DirectHttpFile::new();
        let item = ScrapeItem::new(Url::parse("https://example.test/page/12345").unwrap());
        let result = scraper.fetch(item, &ctx).await;
        assert!(matches!(result, Err(ScrapeError::NoExtension { .. })));
    }

    #[tokio::test]
    async fn test_direct_file_rejects_non_media() {
        let (ctx, _media_rx) = context();
        let scraper = DirectHttpFile::new();
        let item = ScrapeItem::new(Url::parse("https://example.test/setup.exe").unwrap());
        let result = scraper.fetch(item, &ctx).await;
        assert!(matches!(result, Err(ScrapeError::InvalidUrl { .. })));
    }
}
