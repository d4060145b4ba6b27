//! Media and scrape item records flowing through the pipeline.
//!
//! A [`ScrapeItem`] represents a page or collection handed to a scraper; it
//! yields zero or more [`MediaItem`]s, each of which is one file on disk.
//! Scrapers derive the history identity (`db_path`) of a media item with a
//! per-scraper [`DbPathStyle`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use url::Url;

/// Raised when a scrape item produces more children than its type allows.
#[derive(Debug, Error)]
#[error("maximum number of children reached for {url}")]
pub struct MaxChildrenError {
    /// URL of the item that exceeded its limit.
    pub url: Url,
}

/// Kind of collection a scrape item represents.
///
/// Used as the index into the per-type children limits list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeItemType {
    /// A forum thread (paginated list of posts).
    Forum = 0,
    /// A single forum post.
    ForumPost = 1,
    /// A user profile on a file host.
    FileHostProfile = 2,
    /// An album on a file host.
    FileHostAlbum = 3,
}

/// Rule for deriving the stable history identity of a URL.
///
/// Each scraper picks the style that survives URL churn on its site: some
/// hosts encode the file id in the path, others in the query or fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DbPathStyle {
    /// The full URL string.
    FullUrl,
    /// Only the last path segment.
    Name,
    /// The URL path.
    #[default]
    Path,
    /// Path plus query string.
    PathQuery,
    /// Path plus query string plus fragment.
    PathQueryFragment,
    /// Path plus fragment.
    PathFragment,
}

impl DbPathStyle {
    /// Derives the `db_path` of a URL under this style.
    #[must_use]
    pub fn derive(self, url: &Url) -> String {
        match self {
            Self::FullUrl => url.to_string(),
            Self::Name => url
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
                .unwrap_or_else(|| url.path().to_string()),
            Self::Path => url.path().to_string(),
            Self::PathQuery => match url.query() {
                Some(query) => format!("{}?{query}", url.path()),
                None => url.path().to_string(),
            },
            Self::PathQueryFragment => {
                let mut out = url.path().to_string();
                if let Some(query) = url.query() {
                    out.push('?');
                    out.push_str(query);
                }
                if let Some(fragment) = url.fragment() {
                    out.push('#');
                    out.push_str(fragment);
                }
                out
            }
            Self::PathFragment => match url.fragment() {
                Some(fragment) => format!("{}#{fragment}", url.path()),
                None => url.path().to_string(),
            },
        }
    }
}

/// Replaces filesystem-hostile characters in a folder title.
#[must_use]
pub fn sanitize_folder(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    cleaned.trim().trim_end_matches('.').to_string()
}

/// The atomic unit handed to the downloader; one file on disk.
///
/// Filename and folder are sanitized by the producing scraper before the
/// item reaches the downloader. `db_path` is empty iff the URL scheme is
/// `metadata` (pseudo-items that never touch the network).
#[derive(Debug, Clone)]
pub struct MediaItem {
    /// Origin of the bytes.
    pub url: Url,
    /// Logical scraper key; not necessarily the URL host.
    pub domain: String,
    /// The page that yielded this item; request header and history keying.
    pub referer: Url,
    /// Destination directory.
    pub download_folder: PathBuf,
    /// Destination filename (sanitized).
    pub filename: String,
    /// Unchanged server-reported name.
    pub original_filename: String,
    /// File extension including the dot, lowercased at construction.
    pub ext: String,
    /// Stable identity used in the history store.
    pub db_path: String,
    /// Groups items of one album.
    pub album_id: Option<String>,
    /// Total bytes expected (`Content-Length` plus resume offset).
    pub filesize: Option<u64>,
    /// Media duration in seconds, when probed.
    pub duration: Option<f64>,
    /// Upload time (seconds since epoch); used to set the file mtime.
    pub timestamp: Option<i64>,
    /// Segments of a larger stream: not counted, hashed, or history-tracked.
    pub is_segment: bool,
    /// Alternate fetch URL from an unlock service.
    pub debrid_url: Option<Url>,
    /// Request headers; mutated to inject `Range` on resume.
    pub headers: Vec<(String, String)>,
    /// Retry counter for the current pass through the download loop.
    pub current_attempt: u32,
    /// Content fingerprint, filled by the hasher after success.
    pub hash: Option<String>,
    /// Set true on successful completion.
    pub downloaded: bool,
    /// Ancestor URLs, oldest first.
    pub parents: Vec<Url>,
    /// Forum threads this item descends from.
    pub parent_threads: HashSet<Url>,
}

impl MediaItem {
    /// Creates a media item, deriving `ext` from the filename when absent.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: Url,
        domain: impl Into<String>,
        referer: Url,
        download_folder: impl Into<PathBuf>,
        filename: impl Into<String>,
        original_filename: impl Into<String>,
        db_path: impl Into<String>,
    ) -> Self {
        let filename = filename.into();
        let ext = extension_of(&filename);
        let db_path = if url.scheme() == "metadata" {
            String::new()
        } else {
            db_path.into()
        };
        Self {
            url,
            domain: domain.into(),
            referer,
            download_folder: download_folder.into(),
            filename,
            original_filename: original_filename.into(),
            ext,
            db_path,
            album_id: None,
            filesize: None,
            duration: None,
            timestamp: None,
            is_segment: false,
            debrid_url: None,
            headers: Vec::new(),
            current_attempt: 0,
            hash: None,
            downloaded: false,
            parents: Vec::new(),
            parent_threads: HashSet::new(),
        }
    }

    /// Creates a media item from a scrape item, carrying ancestry forward.
    ///
    /// The scrape item's URL becomes the referer; parents, parent threads,
    /// album id, and timestamp are copied from the origin.
    #[must_use]
    pub fn from_scrape(
        origin: &ScrapeItem,
        url: Url,
        domain: impl Into<String>,
        download_folder: impl Into<PathBuf>,
        filename: impl Into<String>,
        db_path: impl Into<String>,
    ) -> Self {
        let mut item = Self::new(
            url,
            domain,
            origin.url.clone(),
            download_folder,
            filename,
            String::new(),
            db_path,
        );
        item.original_filename = item.filename.clone();
        item.album_id = origin.album_id.clone();
        item.timestamp = origin.timestamp;
        item.parents = origin.parents.clone();
        item.parent_threads = origin.parent_threads.clone();
        item
    }

    /// Destination path of the finished file.
    #[must_use]
    pub fn complete_file(&self) -> PathBuf {
        self.download_folder.join(&self.filename)
    }

    /// Path of the in-progress partial file (`<complete>.part`).
    #[must_use]
    pub fn partial_file(&self) -> PathBuf {
        let mut name = self.filename.clone();
        name.push_str(".part");
        self.download_folder.join(name)
    }

    /// The URL actually fetched: the debrid URL when present, else `url`.
    #[must_use]
    pub fn real_url(&self) -> &Url {
        self.debrid_url.as_ref().unwrap_or(&self.url)
    }

    /// Hostname of the server the bytes come from.
    #[must_use]
    pub fn server(&self) -> &str {
        self.real_url().host_str().unwrap_or_default()
    }

    /// Sets or replaces a request header.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            entry.1 = value;
        } else {
            self.headers.push((name.to_string(), value));
        }
    }

    /// Removes a request header if present.
    pub fn remove_header(&mut self, name: &str) {
        self.headers
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
    }
}

// Identity for equality and hashing is the URL plus the history key; request
// headers and runtime counters are excluded.
impl PartialEq for MediaItem {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url && self.domain == other.domain && self.db_path == other.db_path
    }
}

impl Eq for MediaItem {}

impl std::hash::Hash for MediaItem {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.url.hash(state);
        self.domain.hash(state);
        self.db_path.hash(state);
    }
}

/// Returns the lowercased extension of a filename, including the dot.
#[must_use]
pub fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
        .unwrap_or_default()
}

/// An intermediate unit representing a page or collection.
///
/// Scrapers transform an item in place or spawn children from it; the
/// producer counts children against the per-type limit.
#[derive(Debug, Clone)]
pub struct ScrapeItem {
    /// Page URL.
    pub url: Url,
    /// Slash-joined breadcrumb of ancestor titles.
    pub parent_title: String,
    /// Whether this item belongs to an album/collection.
    pub part_of_album: bool,
    /// Album grouping key, when known.
    pub album_id: Option<String>,
    /// Upload time carried down to media items.
    pub timestamp: Option<i64>,
    /// Ancestor URLs, oldest first.
    pub parents: Vec<Url>,
    /// Forum threads this item descends from.
    pub parent_threads: HashSet<Url>,
    /// Children produced so far.
    pub children: u32,
    /// Limit for the current type; zero disables the check.
    pub children_limit: u32,
    /// Per-type limits, indexed by [`ScrapeItemType`].
    pub children_limits: Vec<u32>,
    /// Collection kind, set by the scraper.
    pub item_type: Option<ScrapeItemType>,
    /// Password taken from the URL query at construction.
    pub password: Option<String>,
}

impl ScrapeItem {
    /// Creates a scrape item for a URL, extracting `password` from the query.
    #[must_use]
    pub fn new(url: Url) -> Self {
        let password = url
            .query_pairs()
            .find(|(key, _)| key == "password")
            .map(|(_, value)| value.into_owned());
        Self {
            url,
            parent_title: String::new(),
            part_of_album: false,
            album_id: None,
            timestamp: None,
            parents: Vec::new(),
            parent_threads: HashSet::new(),
            children: 0,
            children_limit: 0,
            children_limits: Vec::new(),
            item_type: None,
            password,
        }
    }

    /// Appends a sanitized title segment to the breadcrumb.
    pub fn add_to_parent_title(&mut self, title: &str) {
        if title.is_empty() {
            return;
        }
        let title = sanitize_folder(title);
        if self.parent_title.is_empty() {
            self.parent_title = title;
        } else {
            self.parent_title.push('/');
            self.parent_title.push_str(&title);
        }
    }

    /// Sets the collection type and re-derives the children limit.
    pub fn set_type(&mut self, item_type: Option<ScrapeItemType>) {
        self.item_type = item_type;
        self.children = 0;
        self.children_limit = 0;
        if let Some(item_type) = self.item_type {
            if let Some(limit) = self.children_limits.get(item_type as usize) {
                self.children_limit = *limit;
            }
        }
    }

    /// Marks this item as an album and pushes its title onto the breadcrumb.
    pub fn setup_as_album(&mut self, title: &str, album_id: Option<String>) {
        self.setup_as(title, ScrapeItemType::FileHostAlbum, album_id);
    }

    /// Marks this item as a profile and pushes its title onto the breadcrumb.
    pub fn setup_as_profile(&mut self, title: &str, album_id: Option<String>) {
        self.setup_as(title, ScrapeItemType::FileHostProfile, album_id);
    }

    fn setup_as(&mut self, title: &str, item_type: ScrapeItemType, album_id: Option<String>) {
        self.part_of_album = true;
        if album_id.is_some() {
            self.album_id = album_id;
        }
        if self.item_type != Some(item_type) {
            self.set_type(Some(item_type));
        }
        self.add_to_parent_title(title);
    }

    /// Counts `number` new children against the limit.
    ///
    /// # Errors
    ///
    /// Returns [`MaxChildrenError`] when a non-zero limit is reached.
    pub fn add_children(&mut self, number: u32) -> Result<(), MaxChildrenError> {
        self.children += number;
        if self.children_limit != 0 && self.children >= self.children_limit {
            return Err(MaxChildrenError {
                url: self.url.clone(),
            });
        }
        Ok(())
    }

    /// Returns a child item for `url` with this item's URL appended as parent.
    ///
    /// The child counts against this item's children limit on the caller's
    /// next [`add_children`](Self::add_children).
    #[must_use]
    pub fn create_child(&self, url: Url) -> Self {
        let mut child = self.clone();
        child.parents.push(self.url.clone());
        child.url = url;
        child.part_of_album = true;
        child.children = 0;
        child
    }

    /// Clears album, type, and timestamp before handoff to another scraper.
    pub fn reset(&mut self) {
        self.album_id = None;
        self.timestamp = None;
        self.part_of_album = false;
        self.set_type(None);
    }

    /// The originating input URL, when any parent exists.
    #[must_use]
    pub fn origin(&self) -> Option<&Url> {
        self.parents.first()
    }

    /// Relative download path for media produced from this item.
    #[must_use]
    pub fn create_download_path(&self, domain: &str) -> PathBuf {
        if !self.parent_title.is_empty() && self.part_of_album {
            return PathBuf::from(&self.parent_title);
        }
        if !self.parent_title.is_empty() {
            return PathBuf::from(&self.parent_title).join(format!("Loose Files ({domain})"));
        }
        PathBuf::from(format!("Loose Files ({domain})"))
    }
}
