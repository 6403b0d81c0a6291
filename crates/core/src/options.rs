use std::time::Duration;

use crate::cnf::{
	DEFAULT_KV_TIMEOUT, DOC_BUFFER_SIZE, KEY_BUFFER_SIZE, MAX_CONCURRENT_SCANS_PER_SERVER,
};

/// Configuration for the scan engine behaviour
///
/// The defaults are read from the environment, so please only modify these if
/// you know deliberately why you are modifying them.
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub struct EngineOptions {
	/// The number of shard scans which may be in flight against one server
	pub max_concurrent_per_server: usize,
	/// The timeout for a single wire request when a scan does not specify one
	pub default_kv_timeout: Duration,
	/// The number of buffered bytes held in memory before spilling to disk
	pub spill_threshold: usize,
	/// The number of buffered bytes held in memory before spilling, for scans
	/// returning documents
	pub doc_spill_threshold: usize,
}

impl Default for EngineOptions {
	fn default() -> Self {
		Self {
			max_concurrent_per_server: *MAX_CONCURRENT_SCANS_PER_SERVER,
			default_kv_timeout: *DEFAULT_KV_TIMEOUT,
			spill_threshold: *KEY_BUFFER_SIZE,
			doc_spill_threshold: *DOC_BUFFER_SIZE,
		}
	}
}

impl EngineOptions {
	pub fn with_max_concurrent_per_server(mut self, max: usize) -> Self {
		self.max_concurrent_per_server = max.max(1);
		self
	}
	pub fn with_default_kv_timeout(mut self, timeout: Duration) -> Self {
		self.default_kv_timeout = timeout;
		self
	}
	pub fn with_spill_threshold(mut self, bytes: usize) -> Self {
		self.spill_threshold = bytes;
		self
	}
	pub fn with_doc_spill_threshold(mut self, bytes: usize) -> Self {
		self.doc_spill_threshold = bytes;
		self
	}
}
