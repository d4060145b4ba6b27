//! HTTP session pool and shared response checks.
//!
//! Two long-lived sessions share one cookie jar: a normal session used for
//! scraping and most downloads, and a browser-impersonating session for the
//! small allow list of hosts that fingerprint clients. Status handling is
//! explicit: neither session errors on status by itself; callers run the
//! shared checks below.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use reqwest::cookie::Jar;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Response};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::Settings;
use crate::download::DownloadError;
use crate::formats;

/// Domains that require a browser-matching client fingerprint.
const IMPERSONATED_DOMAINS: &[&str] = &["vsco", "celebforum"];

/// Browser User-Agent presented by the impersonating session.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// ETags some hosts return for placeholder "removed" assets.
///
/// A download response carrying one of these is a miss regardless of status.
const BAD_ETAGS: &[(&str, &str)] = &[
    ("d835884373f4d6c8f24742ceabe74946", "Imgur image has been removed"),
    ("65b7753c-528a", "SC Scrape Image"),
    ("5c4fb843-ece", "PixHost Removed Image"),
    ("637be5da-11d2b", "eFukt Video removed"),
    ("63a05f27-11d2b", "eFukt Video removed"),
    ("5a56b09d-1485eb", "eFukt Video removed"),
];

/// URLs of known placeholder assets, mapped to the status they stand for.
const KNOWN_BAD_URLS: &[(&str, u16)] = &[
    ("https://i.imgur.com/removed.png", 404),
    ("https://saint2.su/assets/notfound.gif", 404),
    ("https://bnkr.b-cdn.net/maintenance-vid.mp4", 503),
    ("https://bnkr.b-cdn.net/maintenance.mp4", 503),
    ("https://c.bunkr-cache.se/maintenance-vid.mp4", 503),
    ("https://c.bunkr-cache.se/maintenance.jpg", 503),
];

/// Content types rewritten before the html/text check.
const CONTENT_TYPE_OVERRIDES: &[(&str, &str)] = &[("text/vnd.trolltech.linguist", "video/MP2T")];

/// Cookie-jar-bearing sessions for scraping and downloading.
#[derive(Debug, Clone)]
pub struct ClientPool {
    normal: Client,
    impersonating: Client,
    jar: Arc<Jar>,
}

impl ClientPool {
    /// Builds both sessions from the run settings.
    ///
    /// # Errors
    ///
    /// Returns the builder error when a client cannot be constructed.
    #[instrument(skip(settings))]
    pub fn new(settings: &Settings) -> Result<Self, reqwest::Error> {
        let jar = Arc::new(Jar::default());

        let user_agent = if settings.user_agent.is_empty() {
            concat!("mediagrab/", env!("CARGO_PKG_VERSION")).to_string()
        } else {
            settings.user_agent.clone()
        };

        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(settings.rate_limits.connect_timeout_secs))
            .timeout(Duration::from_secs(settings.rate_limits.read_timeout_secs))
            .gzip(true)
            .cookie_provider(Arc::clone(&jar))
            .user_agent(&user_agent);
        if settings.disable_ssl_verification {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let normal = builder.build()?;

        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9"),
        );
        headers.insert(
            "sec-ch-ua",
            HeaderValue::from_static(
                "\"Google Chrome\";v=\"131\", \"Chromium\";v=\"131\", \"Not_A Brand\";v=\"24\"",
            ),
        );
        headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
        headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"macOS\""));

        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(settings.rate_limits.connect_timeout_secs))
            .timeout(Duration::from_secs(settings.rate_limits.read_timeout_secs))
            .gzip(true)
            .cookie_provider(Arc::clone(&jar))
            .default_headers(headers)
            .user_agent(BROWSER_USER_AGENT);
        if settings.disable_ssl_verification {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let impersonating = builder.build()?;

        Ok(Self {
            normal,
            impersonating,
            jar,
        })
    }

    /// Returns the session to use for a domain.
    #[must_use]
    pub fn session_for(&self, domain: &str) -> &Client {
        if IMPERSONATED_DOMAINS.contains(&domain) {
            &self.impersonating
        } else {
            &self.normal
        }
    }

    /// The normal scrape/download session.
    #[must_use]
    pub fn normal(&self) -> &Client {
        &self.normal
    }

    /// Loads every Netscape-format cookie file in a directory into the jar.
    ///
    /// Expired cookies are loaded anyway with a warning; a domain appearing
    /// in more than one file warns about the overwrite.
    ///
    /// # Errors
    ///
    /// Returns the IO error when the directory cannot be read.
    #[instrument(skip(self, dir), fields(dir = %dir.display()))]
    pub async fn load_netscape_cookies(&self, dir: &Path) -> std::io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(error) => return Err(error),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "txt") {
                files.push(path);
            }
        }
        files.sort();

        let mut loaded = 0;
        let mut seen_domains = std::collections::HashSet::new();
        for file in files {
            let text = tokio::fs::read_to_string(&file).await?;
            for cookie in parse_netscape_cookies(&text) {
                if !seen_domains.insert(cookie.domain.clone()) {
                    warn!(
                        domain = %cookie.domain,
                        file = %file.display(),
                        "cookie domain appears in multiple files; later values overwrite earlier ones"
                    );
                }
                if cookie.expired {
                    warn!(domain = %cookie.domain, name = %cookie.name, "loading expired cookie");
                }
                let origin = format!("https://{}/", cookie.domain.trim_start_matches('.'));
                if let Ok(origin) = Url::parse(&origin) {
                    self.jar.add_cookie_str(&cookie.to_header_value(), &origin);
                    loaded += 1;
                }
            }
        }
        debug!(loaded, "cookies imported");
        Ok(loaded)
    }
}

/// One parsed Netscape cookie line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NetscapeCookie {
    domain: String,
    path: String,
    secure: bool,
    expired: bool,
    name: String,
    value: String,
}

impl NetscapeCookie {
    fn to_header_value(&self) -> String {
        let mut out = format!(
            "{}={}; Domain={}; Path={}",
            self.name, self.value, self.domain, self.path
        );
        if self.secure {
            out.push_str("; Secure");
        }
        out
    }
}

/// Parses Netscape cookies.txt content.
///
/// Lines are `domain, include_subdomains, path, secure, expires, name,
/// value` separated by tabs. `#HttpOnly_` prefixed lines are real cookies;
/// other `#` lines are comments.
fn parse_netscape_cookies(text: &str) -> Vec<NetscapeCookie> {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);

    let mut cookies = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        let line = if let Some(rest) = line.strip_prefix("#HttpOnly_") {
            rest
        } else if line.starts_with('#') || line.is_empty() {
            continue;
        } else {
            line
        };

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 {
            continue;
        }
        let expires = fields[4].parse::<u64>().unwrap_or(0);
        cookies.push(NetscapeCookie {
            domain: fields[0].to_string(),
            path: fields[2].to_string(),
            secure: fields[1].eq_ignore_ascii_case("true")
                || fields[3].eq_ignore_ascii_case("true"),
            expired: expires != 0 && expires < now,
            name: fields[5].to_string(),
            value: fields[6].to_string(),
        });
    }
    cookies
}

/// Returns the sentinel status for URLs of known placeholder assets.
#[must_use]
pub fn known_bad_url_status(url: &Url) -> Option<u16> {
    KNOWN_BAD_URLS
        .iter()
        .find(|(bad, _)| url.as_str() == *bad)
        .map(|(_, status)| *status)
}

/// Runs the shared status checks against a download response.
///
/// Order matters: the bad-ETag map catches placeholder bodies that arrive
/// with a 200, the content-length sentinels catch maintenance videos, and
/// only then is the raw status inspected. 5xx and 429 map to retryable
/// errors.
///
/// # Errors
///
/// Returns a [`DownloadError`] describing the refusal.
pub fn check_http_status(response: &Response) -> Result<(), DownloadError> {
    if let Some(etag) = response
        .headers()
        .get(header::ETAG)
        .and_then(|value| value.to_str().ok())
    {
        let etag = etag.trim_matches('"');
        if let Some((_, message)) = BAD_ETAGS.iter().find(|(bad, _)| etag == *bad) {
            return Err(DownloadError::http(404, *message));
        }
    }

    check_content_length_sentinels(response.headers())?;

    let status = response.status();
    if status.is_success() || status.is_redirection() {
        return Ok(());
    }

    let code = status.as_u16();
    if code >= 500 || code == 429 {
        Err(DownloadError::http_retry(code, status_reason(code)))
    } else {
        Err(DownloadError::http(code, status_reason(code)))
    }
}

/// Catches placeholder bodies identifiable by exact length + type.
fn check_content_length_sentinels(headers: &HeaderMap) -> Result<(), DownloadError> {
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok());
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let (Some(content_length), Some(content_type)) = (content_length, content_type) else {
        return Ok(());
    };

    if content_length == "322509" && content_type == "video/mp4" {
        return Err(DownloadError::http(503, "Bunkr under maintenance"));
    }
    if content_length == "73003" && content_type == "video/mp4" {
        // Placeholder video with burned-in "Video removed" text.
        return Err(DownloadError::http(410, "Video removed"));
    }
    Ok(())
}

fn status_reason(code: u16) -> String {
    reqwest::StatusCode::from_u16(code)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("HTTP error")
        .to_string()
}

/// Rejects `html`/`text` bodies for files whose extension is not a text
/// format.
///
/// # Errors
///
/// Returns [`DownloadError::InvalidContentType`] on mismatch.
pub fn check_content_type(ext: &str, headers: &HeaderMap) -> Result<(), DownloadError> {
    let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    else {
        return Ok(());
    };

    let content_type = CONTENT_TYPE_OVERRIDES
        .iter()
        .find(|(from, _)| content_type.contains(from))
        .map_or_else(|| content_type.to_lowercase(), |(_, to)| (*to).to_string());

    let lowered = content_type.to_lowercase();
    if (lowered.contains("html") || lowered.contains("text")) && !formats::is_text(ext) {
        return Err(DownloadError::InvalidContentType {
            received: content_type,
        });
    }
    Ok(())
}

/// Parses a `Last-Modified` header into seconds since the epoch.
#[must_use]
pub fn parse_last_modified(headers: &HeaderMap) -> Option<i64> {
    let value = headers.get(header::LAST_MODIFIED)?.to_str().ok()?;
    let parsed = httpdate::parse_http_date(value).ok()?;
    let elapsed = parsed.duration_since(SystemTime::UNIX_EPOCH).ok()?;
    i64::try_from(elapsed.as_secs()).ok()
}

/// Reads `Content-Length` as a number, tolerating absence.
#[must_use]
pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_known_bad_url_statuses() {
        let removed = Url::parse("https://i.imgur.com/removed.png").unwrap();
        assert_eq!(known_bad_url_status(&removed), Some(404));

        let maintenance = Url::parse("https://bnkr.b-cdn.net/maintenance.mp4").unwrap();
        assert_eq!(known_bad_url_status(&maintenance), Some(503));

        let fine = Url::parse("https://example.test/a.mp4").unwrap();
        assert_eq!(known_bad_url_status(&fine), None);
    }

    #[test]
    fn test_content_type_check_rejects_html_for_video() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        let result = check_content_type(".mp4", &headers);
        assert!(matches!(
            result,
            Err(DownloadError::InvalidContentType { .. })
        ));
    }

    #[test]
    fn test_content_type_check_allows_text_for_text_formats() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain"),
        );
        assert!(check_content_type(".txt", &headers).is_ok());
    }

    #[test]
    fn test_content_type_override_rescues_mpegts() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/vnd.trolltech.linguist"),
        );
        assert!(check_content_type(".ts", &headers).is_ok());
    }

    #[test]
    fn test_content_type_check_tolerates_missing_header() {
        assert!(check_content_type(".mp4", &HeaderMap::new()).is_ok());
    }

    #[test]
    fn test_content_length_sentinel_bunkr_maintenance() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("322509"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
        let result = check_content_length_sentinels(&headers);
        assert!(
            matches!(result, Err(DownloadError::Http { status: 503, .. })),
            "expected 503, got: {result:?}"
        );
    }

    #[test]
    fn test_content_length_sentinel_ignores_normal_sizes() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("322510"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
        assert!(check_content_length_sentinels(&headers).is_ok());
    }

    #[test]
    fn test_parse_last_modified() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_last_modified(&headers), Some(1_445_412_480));
        assert_eq!(parse_last_modified(&HeaderMap::new()), None);
    }

    #[test]
    fn test_parse_netscape_cookies_skips_comments_keeps_httponly() {
        let text = "# Netscape HTTP Cookie File\n\
                    .example.test\tTRUE\t/\tTRUE\t0\tsession\tabc123\n\
                    #HttpOnly_.example.test\tTRUE\t/\tFALSE\t0\ttoken\txyz\n\
                    # a comment line\n\
                    malformed line\n";
        let cookies = parse_netscape_cookies(text);
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].name, "session");
        assert!(cookies[0].secure);
        assert_eq!(cookies[1].name, "token");
    }

    #[test]
    fn test_parse_netscape_cookies_flags_expired() {
        let text = ".example.test\tTRUE\t/\tFALSE\t1000000000\told\tvalue\n";
        let cookies = parse_netscape_cookies(text);
        assert_eq!(cookies.len(), 1);
        assert!(cookies[0].expired, "epoch-second 1e9 is long past");
    }

    #[test]
    fn test_session_for_impersonated_domain() {
        let settings = Settings::default();
        let pool = ClientPool::new(&settings).unwrap();
        // Pointer identity distinguishes the two sessions.
        assert!(std::ptr::eq(pool.session_for("vsco"), &pool.impersonating));
        assert!(std::ptr::eq(pool.session_for("example"), &pool.normal));
    }

    #[tokio::test]
    async fn test_load_netscape_cookies_missing_dir_is_empty() {
        let settings = Settings::default();
        let pool = ClientPool::new(&settings).unwrap();
        let loaded = pool
            .load_netscape_cookies(Path::new("/nonexistent/cookies"))
            .await
            .unwrap();
        assert_eq!(loaded, 0);
    }

    #[tokio::test]
    async fn test_load_netscape_cookies_reads_txt_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("example.txt"),
            ".example.test\tTRUE\t/\tFALSE\t0\tsession\tabc123\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("ignored.json"), "{}").unwrap();

        let settings = Settings::default();
        let pool = ClientPool::new(&settings).unwrap();
        let loaded = pool.load_netscape_cookies(dir.path()).await.unwrap();
        assert_eq!(loaded, 1);
    }
}
