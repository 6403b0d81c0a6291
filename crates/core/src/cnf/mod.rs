use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

/// The prefix used when creating spill files for buffered scan results.
pub const SPILL_FILE_PREFIX: &str = "vbscan_spill-";

/// Keys starting with this prefix belong to transaction records and are never
/// returned from a range scan.
pub const TRANSACTION_KEY_PREFIX: &[u8] = b"_txn:";

/// The hard upper bound on the number of keys requested from a single shard in
/// one continue request.
pub static MAX_KEYS_PER_REQUEST: LazyLock<u32> =
	lazy_env_parse!("VBSCAN_MAX_KEYS_PER_REQUEST", u32, 10_240);

/// Ordered scans initially cache at most this many keys, spread evenly across
/// all shards being scanned.
pub static ORDERED_CACHE_LIMIT: LazyLock<u32> =
	lazy_env_parse!("VBSCAN_ORDERED_CACHE_LIMIT", u32, 20 * 1024);

/// Unordered scans with a fetch limit below this value start with a single
/// shard scan, as they are likely to be serviced by a single shard.
pub static SMALL_RESULT_SET: LazyLock<u32> = lazy_env_parse!("VBSCAN_SMALL_RESULT_SET", u32, 100);

/// A worker keeps issuing continue requests until at least this many keys
/// have been buffered for a shard, unless the server completes the scan.
pub static MIN_SCAN_SIZE: LazyLock<usize> = lazy_env_parse!("VBSCAN_MIN_SCAN_SIZE", usize, 256);

/// The maximum number of bytes buffered for one shard scan in a single cycle
/// before control returns to the coordinator.
pub static MAX_CACHED_SIZE: LazyLock<u64> =
	lazy_env_parse!("VBSCAN_MAX_CACHED_SIZE", u64, 100 * 1024 * 1024);

/// The number of bytes of buffered keys held in memory before a shard scan
/// starts spilling to a temporary file.
pub static KEY_BUFFER_SIZE: LazyLock<usize> =
	lazy_env_parse!("VBSCAN_KEY_BUFFER_SIZE", usize, 16 * 1024);

/// The number of bytes of buffered documents held in memory before a shard
/// scan starts spilling to a temporary file.
pub static DOC_BUFFER_SIZE: LazyLock<usize> =
	lazy_env_parse!("VBSCAN_DOC_BUFFER_SIZE", usize, 2 * 1024 * 1024);

/// The hard upper bound on the number of documents requested from a single
/// shard in one continue request.
pub static MAX_DOCS_PER_REQUEST: LazyLock<u32> =
	lazy_env_parse!("VBSCAN_MAX_DOCS_PER_REQUEST", u32, 512);

/// The size of the buffered reader used when reading back spilled keys.
pub static SPILL_READ_BUFFER: LazyLock<usize> =
	lazy_env_parse!("VBSCAN_SPILL_READ_BUFFER", usize, 16 * 1024);

/// The duration of a scan when the caller does not specify a timeout.
pub static MAX_SCAN_DURATION: LazyLock<Duration> = LazyLock::new(|| {
	std::env::var("VBSCAN_MAX_SCAN_DURATION_SECS")
		.ok()
		.and_then(|s| s.parse::<u64>().ok())
		.map(Duration::from_secs)
		.unwrap_or(Duration::from_secs(600))
});

/// The timeout applied to each individual wire request when the caller does
/// not specify one.
pub static DEFAULT_KV_TIMEOUT: LazyLock<Duration> = LazyLock::new(|| {
	std::env::var("VBSCAN_KV_TIMEOUT_MS")
		.ok()
		.and_then(|s| s.parse::<u64>().ok())
		.map(Duration::from_millis)
		.unwrap_or(Duration::from_millis(2500))
});

/// The number of shard scans allowed to run concurrently against a single
/// server. Defaults to the number of available cores.
pub static MAX_CONCURRENT_SCANS_PER_SERVER: LazyLock<usize> =
	lazy_env_parse!("VBSCAN_MAX_CONCURRENT_SCANS_PER_SERVER", usize, || num_cpus::get().max(1));

/// The total number of bytes all spill files may occupy at once. Unbounded
/// when not specified.
pub static TEMP_STORAGE_QUOTA: LazyLock<Option<u64>> =
	lazy_env_parse!("VBSCAN_TEMP_STORAGE_QUOTA", Option<u64>);

/// The directory in which spill files are created. Defaults to the system
/// temporary directory.
pub static TEMP_DIRECTORY: LazyLock<Option<PathBuf>> =
	lazy_env_parse!("VBSCAN_TEMP_DIRECTORY", Option<PathBuf>);
