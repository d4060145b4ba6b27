//! Error types for the download engine.
//!
//! The retry loop pattern-matches on [`DownloadError::retryable`]; the
//! orchestrator's error boundary uses [`DownloadError::is_skip`] to decide
//! between the "skipped" counter and the failure log.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while downloading one media item.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// HTTP-level failure with the status the server (or a sentinel check)
    /// produced.
    #[error("HTTP {status}: {message}")]
    Http {
        /// Status code, or a sentinel value for synthesized failures.
        status: u16,
        /// Human-readable failure description.
        message: String,
        /// Whether the retry loop may try again.
        retry: bool,
    },

    /// Network-level error (DNS, connection reset, TLS, mid-stream abort).
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// File system error while writing the partial file.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// Path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The response body's declared type is incompatible with the file.
    #[error("received '{received}', was expecting other")]
    InvalidContentType {
        /// The Content-Type header value.
        received: String,
    },

    /// Throughput stayed below the slow threshold for the full slow period.
    #[error("download speed stayed below the threshold for too long")]
    SlowDownload,

    /// Free space on the destination mount fell below the floor.
    #[error("insufficient free space on the mount holding {folder}")]
    InsufficientFreeSpace {
        /// The download folder that was refused.
        folder: PathBuf,
    },

    /// The file's type is excluded by configuration.
    #[error("filetype {ext:?} is excluded by config")]
    RestrictedFiletype {
        /// The lowercased extension.
        ext: String,
    },

    /// The item's upload date falls outside the configured range.
    #[error("upload date outside the configured date range")]
    RestrictedDateRange,

    /// The item's filename matches the configured skip regex.
    #[error("filename matches the configured skip pattern")]
    RestrictedFilename,

    /// The probed media duration falls outside the configured range.
    #[error("duration {seconds}s outside the configured range")]
    Duration {
        /// Probed duration in seconds.
        seconds: f64,
    },

    /// The provided URL is malformed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The offending URL string.
        url: String,
    },

    /// Credentialed access was required and failed.
    #[error("login required for {domain}")]
    Login {
        /// The domain requiring credentials.
        domain: String,
    },
}

impl DownloadError {
    /// Creates a non-retryable HTTP error.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
            retry: false,
        }
    }

    /// Creates a retryable HTTP error.
    pub fn http_retry(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
            retry: true,
        }
    }

    /// Creates a network error from a client error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the retry loop may attempt this item again.
    ///
    /// Connection resets, timeouts, filesystem errors, and slow-download
    /// aborts are promoted to retryable; config-predicate skips and hard
    /// HTTP failures are not.
    #[must_use]
    pub fn retryable(&self) -> bool {
        match self {
            Self::Http { retry, .. } => *retry,
            Self::Network { .. } | Self::Timeout { .. } | Self::Io { .. } | Self::SlowDownload => {
                true
            }
            _ => false,
        }
    }

    /// Whether this is a config-predicate skip rather than a failure.
    #[must_use]
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            Self::RestrictedFiletype { .. }
                | Self::RestrictedDateRange
                | Self::RestrictedFilename
                | Self::Duration { .. }
        )
    }

    /// Short label for the failure counters and the error CSV.
    #[must_use]
    pub fn ui_label(&self) -> String {
        match self {
            Self::Http { status, .. } => status.to_string(),
            Self::Network { .. } => "Network Error".to_string(),
            Self::Timeout { .. } => "Timeout".to_string(),
            Self::Io { .. } => "IO Error".to_string(),
            Self::InvalidContentType { .. } => "Invalid Content Type".to_string(),
            Self::SlowDownload => "Slow Download".to_string(),
            Self::InsufficientFreeSpace { .. } => "Insufficient Free Space".to_string(),
            Self::RestrictedFiletype { .. } => "Restricted Filetype".to_string(),
            Self::RestrictedDateRange => "Restricted Date Range".to_string(),
            Self::RestrictedFilename => "Restricted Filename".to_string(),
            Self::Duration { .. } => "Duration".to_string(),
            Self::InvalidUrl { .. } => "Invalid URL".to_string(),
            Self::Login { .. } => "Login Required".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_error_retry_flag_drives_retryable() {
        assert!(!DownloadError::http(404, "not found").retryable());
        assert!(DownloadError::http_retry(500, "server error").retryable());
    }

    #[test]
    fn test_io_and_timeout_are_retryable() {
        let io = DownloadError::io(
            "/tmp/a.part",
            std::io::Error::new(std::io::ErrorKind::Other, "disk"),
        );
        assert!(io.retryable());
        assert!(DownloadError::timeout("https://example.test/a.mp4").retryable());
        assert!(DownloadError::SlowDownload.retryable());
    }

    #[test]
    fn test_skip_classification() {
        assert!(
            DownloadError::RestrictedFiletype {
                ext: ".exe".to_string()
            }
            .is_skip()
        );
        assert!(DownloadError::RestrictedDateRange.is_skip());
        assert!(DownloadError::Duration { seconds: 2.0 }.is_skip());
        assert!(!DownloadError::SlowDownload.is_skip());
        assert!(!DownloadError::http(404, "gone").is_skip());
    }

    #[test]
    fn test_display_includes_status_and_message() {
        let error = DownloadError::http(404, "Imgur image has been removed");
        let msg = error.to_string();
        assert!(msg.contains("404"), "expected status in: {msg}");
        assert!(msg.contains("Imgur"), "expected message in: {msg}");
    }

    #[test]
    fn test_ui_labels() {
        assert_eq!(DownloadError::http(503, "maintenance").ui_label(), "503");
        assert_eq!(DownloadError::SlowDownload.ui_label(), "Slow Download");
    }
}
