//! Default constants for failcluster configuration.

// =============================================================================
// Storage Defaults (RocksDB)
// =============================================================================

/// Default data directory for the persistent stores
pub const DEFAULT_DATA_DIR: &str = "failcluster-data";

/// Default block cache size in MB
pub const DEFAULT_BLOCK_CACHE_MB: usize = 256;

/// Default write buffer size in MB
pub const DEFAULT_WRITE_BUFFER_MB: usize = 64;

/// Default number of background compaction jobs
pub const DEFAULT_BACKGROUND_JOBS: i32 = 4;

// =============================================================================
// Ingestion Defaults
// =============================================================================

/// Exonerate failures of test variants that never passed in the invocation.
/// Off by default: only presubmit flows treat such failures as exonerated.
pub const DEFAULT_IMPLICITLY_EXONERATE_BLOCKING_FAILURES: bool = false;

// =============================================================================
// Reclustering Defaults
// =============================================================================

/// Clustering state rows read from the store per batch
pub const DEFAULT_RECLUSTERING_BATCH_SIZE: usize = 1000;

/// Chunks of one batch reclustered concurrently
pub const DEFAULT_MAX_CONCURRENT_CHUNKS: usize = 8;

/// Default number of shards a reclustering run is split into
pub const DEFAULT_SHARD_COUNT: usize = 16;

// =============================================================================
// Rules Defaults
// =============================================================================

/// Seconds before a cached ruleset is refetched
pub const DEFAULT_RULES_REFRESH_INTERVAL_SECS: u64 = 30;

/// Projects whose rulesets are kept in memory
pub const DEFAULT_RULES_CACHE_CAPACITY: usize = 256;
