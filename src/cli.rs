//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use mediagrab_core::Settings;
use mediagrab_core::config::HashingMode;

/// Bulk concurrent downloader for file hosts.
///
/// Takes a list of URLs (arguments or an input file), resolves the media
/// behind them, and downloads everything concurrently with resumable
/// transfers, hashing, and deduplication against a persistent history.
#[derive(Parser, Debug)]
#[command(name = "mediagrab")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to download; reads the input file when omitted
    pub urls: Vec<String>,

    /// Input file with one URL per line (# comments, --- group headers)
    #[arg(short = 'i', long)]
    pub input_file: Option<PathBuf>,

    /// Root directory for finished downloads
    #[arg(short = 'd', long, default_value = "downloads")]
    pub download_folder: PathBuf,

    /// History database file
    #[arg(long, default_value = "mediagrab.db")]
    pub db_file: PathBuf,

    /// Directory for per-run CSV reports
    #[arg(long, default_value = "logs")]
    pub log_folder: PathBuf,

    /// Maximum simultaneous downloads (1-100)
    #[arg(short = 'c', long, default_value_t = 15, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub max_simultaneous_downloads: u8,

    /// Maximum simultaneous downloads per domain (1-100)
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub max_simultaneous_downloads_per_domain: u8,

    /// Attempts per file, including the first (1-10)
    #[arg(short = 'r', long, default_value_t = 5, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub download_attempts: u8,

    /// Download speed cap in bytes per second (0 disables)
    #[arg(long, default_value_t = 0)]
    pub download_speed_limit: u64,

    /// Abort downloads slower than this (bytes per second) for 10s straight
    #[arg(long, default_value_t = 0)]
    pub slow_download_speed: u64,

    /// Fixed delay before each download request, in seconds
    #[arg(long, default_value_t = 0.0)]
    pub download_delay: f64,

    /// Skip history lookups (also disables the dedupe sweep)
    #[arg(long)]
    pub ignore_history: bool,

    /// When fingerprints are computed
    #[arg(long, value_enum, default_value_t = HashingCli::InPlace)]
    pub hashing: HashingCli,

    /// Also compute md5 digests
    #[arg(long)]
    pub add_md5: bool,

    /// Also compute sha256 digests
    #[arg(long)]
    pub add_sha256: bool,

    /// Keep duplicate downloads instead of removing them
    #[arg(long)]
    pub no_dedupe: bool,

    /// Permanently delete duplicates instead of sending them to the trash
    #[arg(long)]
    pub no_trash: bool,

    /// Skip URLs whose host matches any of these fragments
    #[arg(long)]
    pub skip_hosts: Vec<String>,

    /// Only scrape URLs whose host matches one of these fragments
    #[arg(long)]
    pub only_hosts: Vec<String>,

    /// Skip image files
    #[arg(long)]
    pub exclude_images: bool,

    /// Skip video files
    #[arg(long)]
    pub exclude_videos: bool,

    /// Skip audio files
    #[arg(long)]
    pub exclude_audio: bool,

    /// Skip files outside the known media classes
    #[arg(long)]
    pub exclude_other: bool,

    /// Do not restore file mtimes from the item timestamp
    #[arg(long)]
    pub disable_file_timestamps: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

/// CLI surface of [`HashingMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum HashingCli {
    /// Hash each file right after it completes.
    InPlace,
    /// Hash all successful files at the end of the run.
    PostDownload,
    /// No hashing.
    Off,
}

impl From<HashingCli> for HashingMode {
    fn from(value: HashingCli) -> Self {
        match value {
            HashingCli::InPlace => Self::InPlace,
            HashingCli::PostDownload => Self::PostDownload,
            HashingCli::Off => Self::Off,
        }
    }
}

impl Args {
    /// Folds the CLI flags into run settings.
    #[must_use]
    pub fn to_settings(&self) -> Settings {
        let mut settings = Settings::default();
        settings.runtime.download_folder = self.download_folder.clone();
        settings.runtime.db_file = self.db_file.clone();
        settings.runtime.log_folder = self.log_folder.clone();
        settings.runtime.ignore_history = self.ignore_history;
        settings.runtime.slow_download_speed = self.slow_download_speed;
        settings.rate_limits.max_simultaneous_downloads =
            usize::from(self.max_simultaneous_downloads);
        settings.rate_limits.max_simultaneous_downloads_per_domain =
            usize::from(self.max_simultaneous_downloads_per_domain);
        settings.rate_limits.download_attempts = u32::from(self.download_attempts);
        settings.rate_limits.download_speed_limit = self.download_speed_limit;
        settings.rate_limits.download_delay = self.download_delay;
        settings.dedupe.hashing = self.hashing.into();
        settings.dedupe.add_md5 = self.add_md5;
        settings.dedupe.add_sha256 = self.add_sha256;
        settings.dedupe.auto_dedupe = !self.no_dedupe;
        settings.dedupe.send_deleted_to_trash = !self.no_trash;
        settings.ignore.skip_hosts = self.skip_hosts.clone();
        settings.ignore.only_hosts = self.only_hosts.clone();
        settings.ignore.exclude_images = self.exclude_images;
        settings.ignore.exclude_videos = self.exclude_videos;
        settings.ignore.exclude_audio = self.exclude_audio;
        settings.ignore.exclude_other = self.exclude_other;
        settings.download.disable_file_timestamps = self.disable_file_timestamps;
        settings
    }
}
