use std::fmt::{self, Display};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cnf::{SPILL_FILE_PREFIX, TRANSACTION_KEY_PREFIX};
use crate::key::range::KeyRange;
use crate::kvs::temp::TempStorage;
use crate::kvs::{CollectionId, ServerId};
use crate::scan::ready::ReadyQueue;
use crate::scan::request::SkipKey;
use crate::scan::spill::SpillBuffer;

static SCAN_NUM: AtomicU64 = AtomicU64::new(0);

/// The state shared by the coordinator and the workers of one logical scan
pub(crate) struct ScanContext {
	/// A process unique number identifying this scan
	pub(crate) num: u64,
	pub(crate) request_id: String,
	pub(crate) collection: CollectionId,
	pub(crate) ranges: Vec<KeyRange>,
	pub(crate) ordered: bool,
	/// The total number of keys requested, if this is a sampling scan
	pub(crate) sample_size: Option<u64>,
	/// Whether the scan returns whole documents rather than keys
	pub(crate) documents: bool,
	pub(crate) deadline: Instant,
	pub(crate) kv_timeout: Duration,
	pub(crate) ready: ReadyQueue,
	/// Cancelled when the caller stops the scan
	pub(crate) stop: CancellationToken,
	/// Cancelled when the scan deadline passes
	pub(crate) expired: CancellationToken,
	inactive: AtomicBool,
	timed_out: AtomicBool,
	read_units: AtomicU64,
	skip_key: Option<SkipKey>,
	temp: Arc<dyn TempStorage>,
	spill_threshold: usize,
	working: Vec<AtomicUsize>,
	peak: Vec<AtomicUsize>,
}

/// The settings used to build a [`ScanContext`]
pub(crate) struct ContextOptions {
	pub(crate) request_id: String,
	pub(crate) collection: CollectionId,
	pub(crate) ranges: Vec<KeyRange>,
	pub(crate) ordered: bool,
	pub(crate) sample_size: Option<u64>,
	pub(crate) documents: bool,
	pub(crate) timeout: Duration,
	pub(crate) kv_timeout: Duration,
	pub(crate) skip_key: Option<SkipKey>,
	pub(crate) temp: Arc<dyn TempStorage>,
	pub(crate) spill_threshold: usize,
	pub(crate) servers: usize,
	pub(crate) capacity: usize,
}

impl ScanContext {
	pub(crate) fn new(opts: ContextOptions) -> Self {
		Self {
			num: SCAN_NUM.fetch_add(1, Ordering::Relaxed) + 1,
			request_id: opts.request_id,
			collection: opts.collection,
			ranges: opts.ranges,
			ordered: opts.ordered,
			sample_size: opts.sample_size,
			documents: opts.documents,
			deadline: Instant::now() + opts.timeout,
			kv_timeout: opts.kv_timeout,
			ready: ReadyQueue::new(opts.capacity),
			stop: CancellationToken::new(),
			expired: CancellationToken::new(),
			inactive: AtomicBool::new(false),
			timed_out: AtomicBool::new(false),
			read_units: AtomicU64::new(0),
			skip_key: opts.skip_key,
			temp: opts.temp,
			spill_threshold: opts.spill_threshold,
			working: (0..opts.servers).map(|_| AtomicUsize::new(0)).collect(),
			peak: (0..opts.servers).map(|_| AtomicUsize::new(0)).collect(),
		}
	}

	/// Whether a key returned by the server should be buffered
	pub(crate) fn accepts(&self, key: &[u8]) -> bool {
		if key.starts_with(TRANSACTION_KEY_PREFIX) {
			return false;
		}
		match &self.skip_key {
			Some(skip) => !skip(key),
			None => true,
		}
	}

	/// Create an empty buffer for a shard scan of this scan
	pub(crate) fn buffer(&self) -> SpillBuffer {
		let prefix = format!("{SPILL_FILE_PREFIX}{:08x}-", self.num);
		SpillBuffer::new(self.temp.clone(), self.spill_threshold, prefix)
	}

	/// The deadline for a single wire request
	pub(crate) fn request_deadline(&self) -> Instant {
		self.deadline.min(Instant::now() + self.kv_timeout)
	}

	pub(crate) fn is_inactive(&self) -> bool {
		self.inactive.load(Ordering::Acquire)
	}

	pub(crate) fn set_inactive(&self) -> bool {
		!self.inactive.swap(true, Ordering::AcqRel)
	}

	pub(crate) fn is_timed_out(&self) -> bool {
		self.timed_out.load(Ordering::Acquire)
	}

	/// Mark the scan as timed out, waking the coordinator
	pub(crate) fn set_timed_out(&self) {
		self.timed_out.store(true, Ordering::Release);
		self.ready.expire();
		self.expired.cancel();
	}

	pub(crate) fn add_read_units(&self, units: u64) {
		self.read_units.fetch_add(units, Ordering::Relaxed);
	}

	pub(crate) fn read_units(&self) -> u64 {
		self.read_units.load(Ordering::Relaxed)
	}

	/// Record a shard scan starting work against a server
	pub(crate) fn begin_work(self: &Arc<Self>, server: ServerId) -> WorkGuard {
		if let (Some(working), Some(peak)) = (self.working.get(server), self.peak.get(server)) {
			let now = working.fetch_add(1, Ordering::AcqRel) + 1;
			peak.fetch_max(now, Ordering::AcqRel);
		}
		WorkGuard {
			ctx: self.clone(),
			server,
		}
	}

	/// The highest number of shard scans concurrently working against a server
	pub(crate) fn peak_working(&self, server: ServerId) -> usize {
		self.peak.get(server).map(|p| p.load(Ordering::Acquire)).unwrap_or(0)
	}
}

impl Display for ScanContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{{{:#010x},requestId:{}", self.num, self.request_id)?;
		match self.sample_size {
			Some(size) => {
				write!(f, ",sampleSize:{size}")?;
				if self.documents {
					f.write_str(",withDocs")?;
				}
			}
			None => {
				f.write_str(",ranges:[")?;
				for (i, r) in self.ranges.iter().enumerate() {
					if i > 0 {
						f.write_str(",")?;
					}
					write!(f, "{r}")?;
				}
				f.write_str("]")?;
			}
		}
		f.write_str("}")
	}
}

/// Tracks a shard scan which is working against a server
pub(crate) struct WorkGuard {
	ctx: Arc<ScanContext>,
	server: ServerId,
}

impl Drop for WorkGuard {
	fn drop(&mut self) {
		if let Some(working) = self.ctx.working.get(self.server) {
			working.fetch_sub(1, Ordering::AcqRel);
		}
	}
}
