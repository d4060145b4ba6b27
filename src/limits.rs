//! Concurrency gates and rate limiting for scrape and download traffic.
//!
//! Four coordinated mechanisms live here:
//!
//! 1. [`DownloadSlots`]: a global semaphore plus one semaphore per domain,
//!    bounding how many downloads run at once.
//! 2. [`WeakKeyedLocks`]: a weak-keyed mutex map used for per-server locks
//!    (serializing requests against one physical server) and per-filename
//!    locks (two items mapping to the same output file never stream
//!    concurrently). Entries with no live users are swept on access.
//! 3. [`RequestPacer`]: token buckets gating outgoing HTTP requests, one
//!    global and one per domain.
//! 4. [`SpeedLimiter`]: a byte-rate token bucket throttling download
//!    throughput; a zero cap disables acquisition entirely.
//!
//! Acquisition order is always global → domain → server → file; guards
//! release in LIFO order and none is held across a retry backoff sleep.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Sweep the weak-keyed lock maps every this many accesses.
const LOCK_SWEEP_PERIOD: u64 = 256;

/// RAII guard holding the global and per-domain download permits.
///
/// Dropping the guard releases the permits in LIFO order.
#[derive(Debug)]
pub struct SlotPermits {
    _domain: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

/// Global and per-domain download concurrency gates.
///
/// Per-domain capacity defaults to the configured per-domain limit, clamped
/// to the global maximum; scrapers may register a lower override for their
/// domain before downloads start.
#[derive(Debug)]
pub struct DownloadSlots {
    global: Arc<Semaphore>,
    global_max: usize,
    default_per_domain: usize,
    overrides: DashMap<String, usize>,
    domains: DashMap<String, Arc<Semaphore>>,
}

impl DownloadSlots {
    /// Creates the gates with the given global and per-domain capacities.
    #[must_use]
    pub fn new(global_max: usize, default_per_domain: usize) -> Self {
        let global_max = global_max.max(1);
        Self {
            global: Arc::new(Semaphore::new(global_max)),
            global_max,
            default_per_domain: default_per_domain.max(1),
            overrides: DashMap::new(),
            domains: DashMap::new(),
        }
    }

    /// Registers a per-domain slot override; effective before first use.
    pub fn register_domain_limit(&self, domain: &str, limit: usize) {
        self.overrides.insert(domain.to_string(), limit.max(1));
    }

    /// Returns the effective slot count for a domain.
    #[must_use]
    pub fn domain_limit(&self, domain: &str) -> usize {
        let limit = self
            .overrides
            .get(domain)
            .map_or(self.default_per_domain, |entry| *entry.value());
        limit.min(self.global_max)
    }

    /// Acquires one global and one domain permit, in that order.
    ///
    /// # Panics
    ///
    /// Panics if a semaphore is closed, which never happens: the semaphores
    /// live as long as the gate itself.
    #[instrument(skip(self))]
    pub async fn acquire(&self, domain: &str) -> SlotPermits {
        #[allow(clippy::expect_used)]
        let global = Arc::clone(&self.global)
            .acquire_owned()
            .await
            .expect("global download semaphore closed");

        let semaphore = self
            .domains
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.domain_limit(domain))))
            .clone();
        #[allow(clippy::expect_used)]
        let domain_permit = semaphore
            .acquire_owned()
            .await
            .expect("domain download semaphore closed");

        SlotPermits {
            _domain: domain_permit,
            _global: global,
        }
    }
}

/// A map of asynchronous mutexes keyed by string, holding only weak entries.
///
/// Callers get an `Arc<Mutex<()>>` per key; once every clone is dropped the
/// entry is dead and gets removed by the periodic sweep, so long-running
/// processes do not accumulate state for transient hosts.
#[derive(Debug, Default)]
pub struct WeakKeyedLocks {
    locks: DashMap<String, Weak<Mutex<()>>>,
    accesses: AtomicU64,
}

impl WeakKeyedLocks {
    /// Creates an empty lock map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live mutex for `key`, creating one when absent or dead.
    #[must_use]
    pub fn get(&self, key: &str) -> Arc<Mutex<()>> {
        if self.accesses.fetch_add(1, Ordering::Relaxed) % LOCK_SWEEP_PERIOD == 0 {
            self.sweep();
        }

        let mut entry = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Weak::new());
        if let Some(existing) = entry.value().upgrade() {
            return existing;
        }
        let fresh = Arc::new(Mutex::new(()));
        *entry.value_mut() = Arc::downgrade(&fresh);
        fresh
    }

    /// Number of keys currently tracked (live or dead).
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether the map tracks no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drops entries whose mutex has no live references.
    fn sweep(&self) {
        self.locks.retain(|_, weak| weak.strong_count() > 0);
    }
}

/// Per-server serialization for domains that opt in.
///
/// Only domains registered as server-locked go through the mutex; everyone
/// else proceeds without one.
#[derive(Debug, Default)]
pub struct ServerLocks {
    locks: WeakKeyedLocks,
    locked_domains: DashMap<String, ()>,
}

impl ServerLocks {
    /// Creates the server-lock registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opts a domain into per-server serialization.
    pub fn register_domain(&self, domain: &str) {
        self.locked_domains.insert(domain.to_string(), ());
    }

    /// Returns the mutex for `server` when `domain` opted in, else `None`.
    #[must_use]
    pub fn limiter(&self, domain: &str, server: &str) -> Option<Arc<Mutex<()>>> {
        if !self.locked_domains.contains_key(domain) {
            return None;
        }
        Some(self.locks.get(server))
    }
}

/// Token buckets pacing outgoing HTTP requests.
///
/// Every request acquires one token from the domain bucket and one from the
/// global bucket. Domains without a registered rate share the default
/// per-domain quota (each domain still gets its own bucket).
pub struct RequestPacer {
    global: DirectLimiter,
    default_per_second: NonZeroU32,
    rates: DashMap<String, NonZeroU32>,
    domains: DashMap<String, Arc<DirectLimiter>>,
}

impl std::fmt::Debug for RequestPacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPacer")
            .field("default_per_second", &self.default_per_second)
            .field("domains", &self.domains.len())
            .finish_non_exhaustive()
    }
}

impl RequestPacer {
    /// Creates the pacer with global and per-domain request rates.
    #[must_use]
    pub fn new(global_per_second: u32, domain_per_second: u32) -> Self {
        let global = NonZeroU32::new(global_per_second).unwrap_or(nonzero!(50u32));
        let per_domain = NonZeroU32::new(domain_per_second).unwrap_or(nonzero!(10u32));
        Self {
            global: RateLimiter::direct(Quota::per_second(global)),
            default_per_second: per_domain,
            rates: DashMap::new(),
            domains: DashMap::new(),
        }
    }

    /// Registers a dedicated request rate for a domain.
    pub fn register_domain_rate(&self, domain: &str, per_second: u32) {
        if let Some(rate) = NonZeroU32::new(per_second) {
            self.rates.insert(domain.to_string(), rate);
            self.domains.remove(domain);
        }
    }

    /// Waits until both the domain and the global bucket yield a token.
    pub async fn acquire(&self, domain: &str) {
        let limiter = self
            .domains
            .entry(domain.to_string())
            .or_insert_with(|| {
                let rate = self
                    .rates
                    .get(domain)
                    .map_or(self.default_per_second, |entry| *entry.value());
                Arc::new(RateLimiter::direct(Quota::per_second(rate)))
            })
            .clone();
        limiter.until_ready().await;
        self.global.until_ready().await;
    }
}

/// Byte-rate token bucket for download throughput.
///
/// `acquire(n)` blocks until `n` bytes of budget are available. A zero cap
/// disables throttling: acquisition returns immediately.
pub struct SpeedLimiter {
    limiter: Option<DirectLimiter>,
    burst: u32,
}

impl std::fmt::Debug for SpeedLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeedLimiter")
            .field("enabled", &self.limiter.is_some())
            .field("burst", &self.burst)
            .finish()
    }
}

impl SpeedLimiter {
    /// Creates a limiter capped at `bytes_per_second`; zero disables it.
    #[must_use]
    pub fn new(bytes_per_second: u64) -> Self {
        let Some(rate) = NonZeroU32::new(u32::try_from(bytes_per_second).unwrap_or(u32::MAX))
        else {
            return Self {
                limiter: None,
                burst: 0,
            };
        };
        debug!(bytes_per_second = rate.get(), "download speed cap enabled");
        Self {
            limiter: Some(RateLimiter::direct(Quota::per_second(rate))),
            burst: rate.get(),
        }
    }

    /// Whether throttling is active.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    /// Blocks until `bytes` of budget are available.
    ///
    /// Chunks larger than the bucket are drawn in burst-sized pieces so a
    /// small cap still admits large read chunks, just slowly.
    pub async fn acquire(&self, bytes: usize) {
        let Some(limiter) = &self.limiter else {
            return;
        };

        let mut remaining = u64::try_from(bytes).unwrap_or(u64::MAX);
        while remaining > 0 {
            let piece = u32::try_from(remaining.min(u64::from(self.burst))).unwrap_or(self.burst);
            let Some(n) = NonZeroU32::new(piece) else {
                return;
            };
            // Cannot exceed capacity: piece is clamped to the bucket size.
            let _ = limiter.until_n_ready(n).await;
            remaining -= u64::from(piece);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_download_slots_domain_limit_clamped_to_global() {
        let slots = DownloadSlots::new(2, 10);
        assert_eq!(slots.domain_limit("example"), 2);
    }

    #[tokio::test]
    async fn test_download_slots_override_applies() {
        let slots = DownloadSlots::new(10, 5);
        slots.register_domain_limit("example", 1);
        assert_eq!(slots.domain_limit("example"), 1);
        assert_eq!(slots.domain_limit("other"), 5);
    }

    #[tokio::test]
    async fn test_download_slots_domain_semaphore_blocks_at_capacity() {
        let slots = Arc::new(DownloadSlots::new(10, 1));

        let first = slots.acquire("example").await;

        let blocked = {
            let slots = Arc::clone(&slots);
            tokio::spawn(async move { slots.acquire("example").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "second acquire must wait");

        drop(first);
        let _second = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_download_slots_other_domains_proceed() {
        let slots = DownloadSlots::new(10, 1);
        let _a = slots.acquire("a.example").await;
        // Different domain is not blocked by a.example's slot.
        let _b = tokio::time::timeout(Duration::from_secs(1), slots.acquire("b.example"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_weak_keyed_locks_same_key_shares_mutex() {
        let locks = WeakKeyedLocks::new();
        let a = locks.get("host.example");
        let b = locks.get("host.example");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_weak_keyed_locks_dead_entries_swept() {
        let locks = WeakKeyedLocks::new();
        for i in 0..LOCK_SWEEP_PERIOD {
            drop(locks.get(&format!("host{i}.example")));
        }
        let keep = locks.get("keeper.example");
        // The next sweep access drops every dead entry.
        for _ in 0..LOCK_SWEEP_PERIOD {
            drop(locks.get("keeper.example"));
        }
        assert_eq!(locks.len(), 1);
        drop(keep);
    }

    #[tokio::test]
    async fn test_server_locks_only_for_registered_domains() {
        let locks = ServerLocks::new();
        assert!(locks.limiter("example", "cdn1.example").is_none());

        locks.register_domain("example");
        let a = locks.limiter("example", "cdn1.example").unwrap();
        let b = locks.limiter("example", "cdn1.example").unwrap();
        assert!(Arc::ptr_eq(&a, &b), "same server must share one mutex");

        let c = locks.limiter("example", "cdn2.example").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_request_pacer_first_tokens_are_immediate() {
        let pacer = RequestPacer::new(50, 10);
        tokio::time::timeout(Duration::from_secs(1), pacer.acquire("example"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_speed_limiter_zero_cap_is_disabled() {
        let limiter = SpeedLimiter::new(0);
        assert!(!limiter.is_enabled());
        tokio::time::timeout(Duration::from_millis(100), limiter.acquire(usize::MAX))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_speed_limiter_burst_admits_chunk() {
        let limiter = SpeedLimiter::new(1024 * 1024);
        assert!(limiter.is_enabled());
        tokio::time::timeout(Duration::from_secs(1), limiter.acquire(64 * 1024))
            .await
            .unwrap();
    }
}
