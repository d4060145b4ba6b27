//! Progress hooks and run counters.
//!
//! A [`ProgressHook`] is handed to the streaming loop for one file; it
//! accumulates advanced bytes and keeps a short window of samples so the
//! slow-download check can read a recent speed. Hooks are cheap to create,
//! never block, and dropping one with bytes still in flight is a no-op.
//!
//! [`RunStats`] aggregates the per-run counters shown at the end of a run.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Window over which the recent speed is computed.
const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Per-file progress observer with speed sampling.
#[derive(Debug)]
pub struct ProgressHook {
    total_bytes: AtomicU64,
    samples: Mutex<VecDeque<(Instant, u64)>>,
}

impl Default for ProgressHook {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHook {
    /// Creates a hook with no bytes advanced.
    #[must_use]
    pub fn new() -> Self {
        Self {
            total_bytes: AtomicU64::new(0),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Records `bytes` of progress.
    pub fn advance(&self, bytes: u64) {
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        let now = Instant::now();
        let Ok(mut samples) = self.samples.lock() else {
            return;
        };
        samples.push_back((now, bytes));
        while let Some((instant, _)) = samples.front() {
            if now.duration_since(*instant) > SPEED_WINDOW {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Total bytes advanced so far.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Recent throughput in bytes per second.
    ///
    /// Returns zero before the first sample and once the window empties.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn speed(&self) -> u64 {
        let Ok(samples) = self.samples.lock() else {
            return 0;
        };
        let Some((oldest, _)) = samples.front() else {
            return 0;
        };
        let elapsed = oldest.elapsed();
        let bytes: u64 = samples.iter().map(|(_, n)| n).sum();
        if elapsed < Duration::from_millis(100) {
            // Too little history to extrapolate; report the raw window sum so
            // a burst at stream start never reads as a stall.
            return bytes;
        }
        (bytes as f64 / elapsed.as_secs_f64()) as u64
    }
}

/// Aggregated counters for one run.
#[derive(Debug, Default)]
pub struct RunStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    previously_completed: AtomicUsize,
    previously_hashed: AtomicUsize,
    hashed: AtomicUsize,
    removed_duplicates: AtomicUsize,
    unsupported: AtomicUsize,
    scrape_errors: AtomicUsize,
}

impl RunStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a finished download.
    pub fn add_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a failed download.
    pub fn add_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts an item skipped by config predicates.
    pub fn add_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts an item found complete in history.
    pub fn add_previously_completed(&self) {
        self.previously_completed.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a fingerprint served from the hash cache.
    pub fn add_previously_hashed(&self) {
        self.previously_hashed.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a freshly computed fingerprint.
    pub fn add_hashed(&self) {
        self.hashed.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a duplicate removed by the deduper.
    pub fn add_removed_duplicate(&self) {
        self.removed_duplicates.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts an unsupported input URL.
    pub fn add_unsupported(&self) {
        self.unsupported.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a scraper failure.
    pub fn add_scrape_error(&self) {
        self.scrape_errors.fetch_add(1, Ordering::SeqCst);
    }

    /// Finished downloads.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Failed downloads.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Config-predicate skips.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }

    /// History hits.
    #[must_use]
    pub fn previously_completed(&self) -> usize {
        self.previously_completed.load(Ordering::SeqCst)
    }

    /// Hash-cache hits.
    #[must_use]
    pub fn previously_hashed(&self) -> usize {
        self.previously_hashed.load(Ordering::SeqCst)
    }

    /// Fresh fingerprints.
    #[must_use]
    pub fn hashed(&self) -> usize {
        self.hashed.load(Ordering::SeqCst)
    }

    /// Duplicates removed.
    #[must_use]
    pub fn removed_duplicates(&self) -> usize {
        self.removed_duplicates.load(Ordering::SeqCst)
    }

    /// Unsupported URLs.
    #[must_use]
    pub fn unsupported(&self) -> usize {
        self.unsupported.load(Ordering::SeqCst)
    }

    /// Scraper failures.
    #[must_use]
    pub fn scrape_errors(&self) -> usize {
        self.scrape_errors.load(Ordering::SeqCst)
    }
}
