//! Mediagrab Core Library
//!
//! Bulk concurrent downloader for file hosts: URLs go in, site scrapers
//! enumerate the media behind them, and the download engine fetches
//! everything concurrently with rate limiting, resumable transfers,
//! on-the-fly hashing, and content-addressed deduplication against a
//! persistent history.
//!
//! # Architecture
//!
//! - [`media`] - Media and scrape item records
//! - [`db`] / [`history`] - SQLite history store with schema gating
//! - [`limits`] - Concurrency gates and token-bucket rate limiting
//! - [`client`] - HTTP session pool and shared response checks
//! - [`storage`] - Free-space monitoring per mount point
//! - [`download`] - The streaming download state machine
//! - [`hashing`] / [`dedupe`] - Fingerprinting and duplicate removal
//! - [`scrape`] - Scraper capability, registry, and the direct-file fallback
//! - [`orchestrator`] - Task ownership, URL dispatch, shutdown, post-run steps
//! - [`input`] / [`reports`] - Input parsing and per-run CSV reports

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod db;
pub mod dedupe;
pub mod download;
pub mod formats;
pub mod hashing;
pub mod history;
pub mod input;
pub mod limits;
pub mod media;
pub mod orchestrator;
pub mod progress;
pub mod reports;
pub mod scrape;
pub mod storage;

// Re-export commonly used types
pub use client::ClientPool;
pub use config::Settings;
pub use db::{Database, DbError};
pub use dedupe::Deduper;
pub use download::{DownloadError, DownloadGates, RunState, StreamDownloader};
pub use hashing::{HashAlgorithm, Hasher};
pub use history::HistoryStore;
pub use input::{ParsedInput, parse_input, parse_input_file};
pub use media::{MediaItem, ScrapeItem, ScrapeItemType};
pub use orchestrator::Orchestrator;
pub use progress::{ProgressHook, RunStats};
pub use reports::CsvReports;
pub use scrape::{DirectHttpFile, ScrapeContext, ScrapeError, Scraper, ScraperRegistry};
pub use storage::StorageMonitor;
