//! Dht Configurations

use std::time::Duration;

use crate::bucket_list::DEFAULT_B;
use crate::kbucket::DEFAULT_K;

/// Default lookup concurrency width.
pub const DEFAULT_ALPHA: usize = 3;
/// Default number of consecutive failed interactions before a contact is
/// replaced.
pub const DEFAULT_EVICTION_LIMIT: u32 = 5;
/// Default base expiration of stored values (24 hours).
pub const DEFAULT_EXPIRATION_SECS: u64 = 24 * 60 * 60;

pub const DEFAULT_BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_KEY_REPUBLISH_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_ORIGINATOR_REPUBLISH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_EXPIRATION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Maximum contacts per k-bucket.
    ///
    /// Defaults to [DEFAULT_K](crate::kbucket::DEFAULT_K)
    pub k: usize,
    /// Lookup concurrency width: number of peers queried per lookup round.
    ///
    /// Defaults to [DEFAULT_ALPHA]
    pub alpha: usize,
    /// Branching factor controlling when a full bucket that does not cover
    /// our own id may still split.
    ///
    /// Defaults to [DEFAULT_B](crate::bucket_list::DEFAULT_B)
    pub b: usize,
    /// Consecutive failed interactions after which a contact is replaced.
    ///
    /// Defaults to [DEFAULT_EVICTION_LIMIT]
    pub eviction_limit: u32,
    /// Base expiration in seconds for stored and propagated values; cache
    /// entries decay from this by distance.
    ///
    /// Defaults to [DEFAULT_EXPIRATION_SECS]
    pub expiration_secs: u64,
    /// Buckets not refreshed for this long get a random-id lookup through
    /// their own contacts.
    pub bucket_refresh_interval: Duration,
    /// Republish-tier entries untouched past this interval are re-pushed to
    /// the currently closest contacts.
    pub key_republish_interval: Duration,
    /// Same as `key_republish_interval`, for values this node authored.
    pub originator_republish_interval: Duration,
    /// How often expired cache/republish entries are swept out.
    pub expiration_sweep_interval: Duration,
    /// Resolution of the background maintenance loop.
    pub maintenance_tick: Duration,
    /// Whether to run the background maintenance thread at all. Disabled in
    /// deterministic tests that drive maintenance passes manually.
    pub maintenance: bool,
    /// Use the worker-pool [ParallelRouter](crate::router::ParallelRouter)
    /// instead of the sequential router.
    pub parallel: bool,
    /// Worker threads in the parallel router's pool.
    pub pool_size: usize,
    /// How often the parallel router polls its accumulator.
    pub poll_interval: Duration,
    /// How long the parallel router waits without progress before giving up
    /// on a round.
    pub query_time: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            b: DEFAULT_B,
            eviction_limit: DEFAULT_EVICTION_LIMIT,
            expiration_secs: DEFAULT_EXPIRATION_SECS,
            bucket_refresh_interval: DEFAULT_BUCKET_REFRESH_INTERVAL,
            key_republish_interval: DEFAULT_KEY_REPUBLISH_INTERVAL,
            originator_republish_interval: DEFAULT_ORIGINATOR_REPUBLISH_INTERVAL,
            expiration_sweep_interval: DEFAULT_EXPIRATION_SWEEP_INTERVAL,
            maintenance_tick: Duration::from_secs(1),
            maintenance: true,
            parallel: false,
            pool_size: DEFAULT_ALPHA,
            poll_interval: Duration::from_millis(10),
            query_time: Duration::from_millis(500),
        }
    }
}

impl Config {
    // === Options ===

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_alpha(mut self, alpha: usize) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_eviction_limit(mut self, eviction_limit: u32) -> Self {
        self.eviction_limit = eviction_limit;
        self
    }

    pub fn with_expiration_secs(mut self, expiration_secs: u64) -> Self {
        self.expiration_secs = expiration_secs;
        self
    }

    pub fn with_maintenance(mut self, maintenance: bool) -> Self {
        self.maintenance = maintenance;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}
