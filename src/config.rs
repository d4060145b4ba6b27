//! Run settings threaded to components through their constructors.
//!
//! One [`Settings`] value is built at startup (defaults overridden by CLI
//! flags) and each component receives only the sections it needs; there is
//! no process-global configuration state.

use std::ops::RangeInclusive;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Floor for the free-space threshold (512 MB).
pub const MIN_REQUIRED_FREE_SPACE: u64 = 512 * 1024 * 1024;

/// Default free-space threshold (5 GB).
pub const DEFAULT_REQUIRED_FREE_SPACE: u64 = 5 * 1024 * 1024 * 1024;

/// Concurrency and pacing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Global cap on simultaneous downloads.
    pub max_simultaneous_downloads: usize,
    /// Default cap on simultaneous downloads per domain.
    pub max_simultaneous_downloads_per_domain: usize,
    /// Outgoing requests per second across all domains.
    pub global_requests_per_second: u32,
    /// Outgoing requests per second to a single domain.
    pub domain_requests_per_second: u32,
    /// Fixed sleep before each download request, in seconds.
    pub download_delay: f64,
    /// Upper bound of the uniform jitter added to the delay, in seconds.
    pub download_jitter: f64,
    /// Read chunk size for streaming downloads, in bytes.
    pub chunk_size: usize,
    /// Byte-rate cap for downloads; zero disables throttling.
    pub download_speed_limit: u64,
    /// Attempts per item (including the first).
    pub download_attempts: u32,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Read timeout in seconds.
    pub read_timeout_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_simultaneous_downloads: 15,
            max_simultaneous_downloads_per_domain: 3,
            global_requests_per_second: 50,
            domain_requests_per_second: 10,
            download_delay: 0.0,
            download_jitter: 0.0,
            chunk_size: 64 * 1024,
            download_speed_limit: 0,
            download_attempts: 5,
            connect_timeout_secs: 30,
            read_timeout_secs: 300,
        }
    }
}

/// Download behavior toggles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    /// Mark items complete in history without downloading them.
    pub skip_download_mark_completed: bool,
    /// Do not restore file mtimes from the item timestamp.
    pub disable_file_timestamps: bool,
    /// Treat every item as single-attempt.
    pub disable_download_attempt_limit: bool,
}

/// Pre-download filters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreSettings {
    /// Skip image files.
    pub exclude_images: bool,
    /// Skip video files.
    pub exclude_videos: bool,
    /// Skip audio files.
    pub exclude_audio: bool,
    /// Skip files outside the known media classes.
    pub exclude_other: bool,
    /// Skip items whose filename matches this regex.
    pub filename_regex: Option<String>,
    /// Skip URLs whose host matches any of these fragments.
    pub skip_hosts: Vec<String>,
    /// Only scrape URLs whose host matches one of these fragments.
    pub only_hosts: Vec<String>,
    /// Reject items uploaded before this time (seconds since epoch).
    pub exclude_before: Option<i64>,
    /// Reject items uploaded after this time (seconds since epoch).
    pub exclude_after: Option<i64>,
}

/// Accepted media durations in seconds, per class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DurationLimits {
    /// Minimum video duration.
    pub video_min: f64,
    /// Maximum video duration; zero means unbounded.
    pub video_max: f64,
    /// Minimum audio duration.
    pub audio_min: f64,
    /// Maximum audio duration; zero means unbounded.
    pub audio_max: f64,
}

impl Default for DurationLimits {
    fn default() -> Self {
        Self {
            video_min: 0.0,
            video_max: 0.0,
            audio_min: 0.0,
            audio_max: 0.0,
        }
    }
}

impl DurationLimits {
    /// Accepted range for videos.
    #[must_use]
    pub fn video_range(&self) -> RangeInclusive<f64> {
        let max = if self.video_max > 0.0 {
            self.video_max
        } else {
            f64::INFINITY
        };
        self.video_min..=max
    }

    /// Accepted range for audio.
    #[must_use]
    pub fn audio_range(&self) -> RangeInclusive<f64> {
        let max = if self.audio_max > 0.0 {
            self.audio_max
        } else {
            f64::INFINITY
        };
        self.audio_min..=max
    }
}

/// Accepted file sizes in bytes, per class; zero bounds are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSizeLimits {
    /// Minimum image size.
    pub minimum_image_size: u64,
    /// Maximum image size.
    pub maximum_image_size: u64,
    /// Minimum video size.
    pub minimum_video_size: u64,
    /// Maximum video size.
    pub maximum_video_size: u64,
    /// Minimum size for files outside the image/video classes.
    pub minimum_other_size: u64,
    /// Maximum size for files outside the image/video classes.
    pub maximum_other_size: u64,
}

impl FileSizeLimits {
    /// Whether a file of `size` bytes with extension `ext` is accepted.
    #[must_use]
    pub fn accepts(&self, ext: &str, size: u64) -> bool {
        let (min, max) = if crate::formats::is_image(ext) {
            (self.minimum_image_size, self.maximum_image_size)
        } else if crate::formats::is_video(ext) {
            (self.minimum_video_size, self.maximum_video_size)
        } else {
            (self.minimum_other_size, self.maximum_other_size)
        };
        if min != 0 && size < min {
            return false;
        }
        if max != 0 && size > max {
            return false;
        }
        true
    }
}

/// Hashing mode for the dedup pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashingMode {
    /// Hash each item right after it completes.
    #[default]
    InPlace,
    /// Hash all successful items in one batch at the end of the run.
    PostDownload,
    /// No hashing.
    Off,
}

/// Dedup pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeSettings {
    /// When fingerprints are computed.
    pub hashing: HashingMode,
    /// Also compute md5 digests.
    pub add_md5: bool,
    /// Also compute sha256 digests.
    pub add_sha256: bool,
    /// Delete confirmed duplicates after the run.
    pub auto_dedupe: bool,
    /// Send deleted duplicates to the OS trash instead of unlinking.
    pub send_deleted_to_trash: bool,
}

impl Default for DedupeSettings {
    fn default() -> Self {
        Self {
            hashing: HashingMode::InPlace,
            add_md5: false,
            add_sha256: false,
            auto_dedupe: true,
            send_deleted_to_trash: true,
        }
    }
}

/// Runtime paths and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Root directory for finished downloads.
    pub download_folder: PathBuf,
    /// History database file.
    pub db_file: PathBuf,
    /// Directory for per-run CSV reports; `DEBUG_LOG_FOLDER` overrides it.
    pub log_folder: PathBuf,
    /// Skip all history lookups (also disables the dedupe sweep).
    pub ignore_history: bool,
    /// Abort threshold for sustained slow downloads, in bytes per second;
    /// zero disables the check.
    pub slow_download_speed: u64,
    /// Free-space threshold per mount point, in bytes.
    pub required_free_space: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            download_folder: PathBuf::from("downloads"),
            db_file: PathBuf::from("mediagrab.db"),
            log_folder: PathBuf::from("logs"),
            ignore_history: false,
            slow_download_speed: 0,
            required_free_space: DEFAULT_REQUIRED_FREE_SPACE,
        }
    }
}

impl RuntimeSettings {
    /// The configured free-space threshold, clamped to the floor.
    #[must_use]
    pub fn effective_required_free_space(&self) -> u64 {
        self.required_free_space.max(MIN_REQUIRED_FREE_SPACE)
    }
}

/// All run settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Concurrency and pacing.
    pub rate_limits: RateLimitSettings,
    /// Download behavior toggles.
    pub download: DownloadSettings,
    /// Pre-download filters.
    pub ignore: IgnoreSettings,
    /// Duration gates.
    pub duration_limits: DurationLimits,
    /// File size gates.
    pub file_size_limits: FileSizeLimits,
    /// Dedup pipeline.
    pub dedupe: DedupeSettings,
    /// Paths and thresholds.
    pub runtime: RuntimeSettings,
    /// User agent sent on every request.
    pub user_agent: String,
    /// Skip TLS certificate verification entirely.
    pub disable_ssl_verification: bool,
}

impl Settings {
    /// Effective per-item attempt budget.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        if self.download.disable_download_attempt_limit {
            1
        } else {
            self.rate_limits.download_attempts.max(1)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_required_free_space_clamped_to_floor() {
        let mut runtime = RuntimeSettings::default();
        runtime.required_free_space = 1;
        assert_eq!(
            runtime.effective_required_free_space(),
            MIN_REQUIRED_FREE_SPACE
        );
    }

    #[test]
    fn test_max_attempts_disabled_limit_is_one() {
        let mut settings = Settings::default();
        settings.rate_limits.download_attempts = 5;
        settings.download.disable_download_attempt_limit = true;
        assert_eq!(settings.max_attempts(), 1);
    }

    #[test]
    fn test_max_attempts_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.max_attempts(), 5);
    }

    #[test]
    fn test_duration_range_zero_max_is_unbounded() {
        let limits = DurationLimits::default();
        assert!(limits.video_range().contains(&86_400.0));
        let bounded = DurationLimits {
            video_max: 60.0,
            ..DurationLimits::default()
        };
        assert!(!bounded.video_range().contains(&61.0));
        assert!(bounded.video_range().contains(&60.0));
    }

    #[test]
    fn test_file_size_limits_zero_bounds_ignored() {
        let limits = FileSizeLimits::default();
        assert!(limits.accepts(".jpg", 1));
        assert!(limits.accepts(".mp4", u64::MAX));

        let bounded = FileSizeLimits {
            minimum_video_size: 1024,
            maximum_video_size: 2048,
            ..FileSizeLimits::default()
        };
        assert!(!bounded.accepts(".mp4", 512));
        assert!(bounded.accepts(".mp4", 1500));
        assert!(!bounded.accepts(".mp4", 4096));
        assert!(bounded.accepts(".jpg", 512), "image class is unbounded");
    }

    #[test]
    fn test_settings_deserialize_partial_toml_uses_defaults() {
        let json = r#"{"runtime": {"ignore_history": true}}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert!(settings.runtime.ignore_history);
        assert_eq!(settings.rate_limits.max_simultaneous_downloads, 15);
    }
}
