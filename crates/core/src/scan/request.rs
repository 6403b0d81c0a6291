use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::key::range::KeyRange;
use crate::kvs::CollectionId;

/// A predicate deciding whether a key should be dropped from the results
pub type SkipKey = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// The parameters of a range scan
#[derive(Clone)]
#[non_exhaustive]
pub struct ScanRequest {
	pub collection: CollectionId,
	pub request_id: String,
	pub ranges: Vec<KeyRange>,
	pub ordered: bool,
	/// The maximum number of keys to return, zero or negative for no limit
	pub limit: i64,
	/// The number of keys to skip before returning results
	pub offset: i64,
	/// The maximum number of keys sent to the caller in one batch
	pub pipeline_size: usize,
	/// The deadline for the whole scan, measured from the start
	pub timeout: Option<Duration>,
	/// The timeout for each individual wire request
	pub kv_timeout: Option<Duration>,
	pub skip_key: Option<SkipKey>,
}

impl fmt::Debug for ScanRequest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ScanRequest")
			.field("collection", &self.collection)
			.field("request_id", &self.request_id)
			.field("ranges", &self.ranges)
			.field("ordered", &self.ordered)
			.field("limit", &self.limit)
			.field("offset", &self.offset)
			.field("pipeline_size", &self.pipeline_size)
			.field("timeout", &self.timeout)
			.field("kv_timeout", &self.kv_timeout)
			.finish_non_exhaustive()
	}
}

impl ScanRequest {
	pub fn new(collection: CollectionId, ranges: Vec<KeyRange>) -> Self {
		Self {
			collection,
			request_id: String::new(),
			ranges,
			ordered: false,
			limit: 0,
			offset: 0,
			pipeline_size: 1,
			timeout: None,
			kv_timeout: None,
			skip_key: None,
		}
	}
	pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
		self.request_id = id.into();
		self
	}
	pub fn with_ordered(mut self, ordered: bool) -> Self {
		self.ordered = ordered;
		self
	}
	pub fn with_limit(mut self, limit: i64) -> Self {
		self.limit = limit;
		self
	}
	pub fn with_offset(mut self, offset: i64) -> Self {
		self.offset = offset;
		self
	}
	pub fn with_pipeline_size(mut self, size: usize) -> Self {
		self.pipeline_size = size;
		self
	}
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}
	pub fn with_kv_timeout(mut self, timeout: Duration) -> Self {
		self.kv_timeout = Some(timeout);
		self
	}
	pub fn with_skip_key<F>(mut self, skip: F) -> Self
	where
		F: Fn(&[u8]) -> bool + Send + Sync + 'static,
	{
		self.skip_key = Some(Arc::new(skip));
		self
	}
}

/// The parameters of a random sampling scan
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct SampleRequest {
	pub collection: CollectionId,
	pub request_id: String,
	/// The total number of keys to sample across all shards
	pub sample_size: u64,
	/// Return whole documents instead of keys
	pub with_docs: bool,
	pub pipeline_size: usize,
	pub timeout: Option<Duration>,
	pub kv_timeout: Option<Duration>,
}

impl SampleRequest {
	pub fn new(collection: CollectionId, sample_size: u64) -> Self {
		Self {
			collection,
			request_id: String::new(),
			sample_size,
			with_docs: false,
			pipeline_size: 1,
			timeout: None,
			kv_timeout: None,
		}
	}
	pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
		self.request_id = id.into();
		self
	}
	pub fn with_docs(mut self, with_docs: bool) -> Self {
		self.with_docs = with_docs;
		self
	}
	pub fn with_pipeline_size(mut self, size: usize) -> Self {
		self.pipeline_size = size;
		self
	}
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}
	pub fn with_kv_timeout(mut self, timeout: Duration) -> Self {
		self.kv_timeout = Some(timeout);
		self
	}
}

/// The number of keys to request from each shard when sampling. Random
/// sampling on the server is probabilistic, so the even share of the sample
/// is inflated to make it likely enough keys are returned.
pub(crate) fn sample_per_shard(sample_size: u64, shards: usize) -> u64 {
	if sample_size == 0 || shards == 0 {
		return 0;
	}
	let s = sample_size.div_ceil(shards as u64);
	let sf = s as f64;
	s + (sf * 0.2153 * sf.powf(-0.398)).ceil() as u64
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sample_sizes_are_inflated() {
		assert_eq!(sample_per_shard(0, 1024), 0);
		// One key per shard, inflated by one
		assert_eq!(sample_per_shard(1024, 1024), 2);
		// 100 per shard gains ceil(100 * 0.2153 * 100^-0.398) = 4
		assert_eq!(sample_per_shard(400, 4), 104);
	}

	#[test]
	fn builders() {
		let req = ScanRequest::new(8, vec![KeyRange::single("a")])
			.with_ordered(true)
			.with_limit(2)
			.with_offset(1)
			.with_skip_key(|k| k.starts_with(b"x"));
		assert!(req.ordered);
		assert_eq!((req.limit, req.offset), (2, 1));
		assert!(req.skip_key.as_ref().is_some_and(|f| f(b"xy")));
	}
}
