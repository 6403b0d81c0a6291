use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::cnf::{
	MAX_DOCS_PER_REQUEST, MAX_KEYS_PER_REQUEST, MAX_SCAN_DURATION, ORDERED_CACHE_LIMIT,
	SMALL_RESULT_SET,
};
use crate::err::{Error, Result};
use crate::key::debug::Sprintable;
use crate::key::range::KeyRange;
use crate::kvs::api::{ConnectionProvider, ShardMap};
use crate::kvs::doc::Document;
use crate::kvs::temp::TempStorage;
use crate::kvs::{Key, ServerId, ShardId};
use crate::options::EngineOptions;
use crate::scan::context::{ContextOptions, ScanContext};
use crate::scan::coordinator::{Coordinator, CoordinatorOptions, Message};
use crate::scan::pool::WorkerPool;
use crate::scan::request::{SampleRequest, ScanRequest, sample_per_shard};
use crate::scan::unit::{ShardScan, UnitKind};

const TARGET: &str = "vbscan::core::scan::handle";

/// The outcome of a single fetch from a running scan
#[derive(Debug, PartialEq, Eq)]
pub enum Fetch {
	/// A batch of keys
	Keys(Vec<Key>),
	/// Every key has been returned
	Done,
	/// No keys arrived before the poll timeout
	Pending,
}

/// The outcome of a single fetch from a running document scan
#[derive(Debug, PartialEq, Eq)]
pub enum FetchDocs {
	/// A batch of documents
	Docs(Vec<Document>),
	/// Every document has been returned
	Done,
	/// No documents arrived before the poll timeout
	Pending,
}

/// What the coordinator handed over before the poll timeout
enum Received {
	Message(Message),
	Pending,
}

/// Starts range scans against a sharded key-value store
pub struct RangeScanner {
	shards: Arc<dyn ShardMap>,
	temp: Arc<dyn TempStorage>,
	pool: WorkerPool,
	opts: EngineOptions,
}

/// A shard scan which has been placed on a server, but not yet built
struct Placement {
	shard: ShardId,
	range: Option<usize>,
	server: ServerId,
	kind: UnitKind,
}

impl RangeScanner {
	/// Create a scanner. The worker pool is shared by every scan started from
	/// this scanner, and is shut down once the scanner is dropped.
	pub fn new(
		shards: Arc<dyn ShardMap>,
		provider: Arc<dyn ConnectionProvider>,
		temp: Arc<dyn TempStorage>,
		opts: EngineOptions,
	) -> Self {
		let pool = WorkerPool::new(provider, opts.max_concurrent_per_server, opts.default_kv_timeout);
		Self {
			shards,
			temp,
			pool,
			opts,
		}
	}

	pub fn options(&self) -> &EngineOptions {
		&self.opts
	}

	/// The number of shard scans from every scan waiting for a worker
	pub fn queued(&self) -> usize {
		self.pool.queued()
	}

	/// Start a range scan over a set of key ranges. This must be called from
	/// within a tokio runtime.
	pub fn start(&self, req: ScanRequest) -> Result<ScanHandle> {
		let (shards, servers) = self.topology()?;
		// Split each range across the shards which can hold its keys
		let mut placements = Vec::with_capacity(req.ranges.len() * shards);
		for (i, range) in req.ranges.iter().enumerate() {
			if range.is_single_key() {
				let shard = self
					.shards
					.hash(range.start())
					.filter(|s| (*s as usize) < shards)
					.ok_or_else(|| Error::ShardResolve(range.start().sprint()))?;
				placements.push(self.place(shard, Some(i), UnitKind::Single(range.clone()), servers)?);
			} else {
				for shard in 0..shards {
					let kind = UnitKind::Range(range.clone());
					placements.push(self.place(shard as ShardId, Some(i), kind, servers)?);
				}
			}
		}
		// Normalise the paging parameters
		let limit = u64::try_from(req.limit).ok().filter(|l| *l > 0);
		let offset = u64::try_from(req.offset).unwrap_or(0);
		let mut fetch_limit = match limit {
			Some(limit) => limit.saturating_add(offset).min(u64::from(*MAX_KEYS_PER_REQUEST)) as u32,
			None => *MAX_KEYS_PER_REQUEST,
		};
		// Spread the ordered cache across every shard scan
		if req.ordered && !placements.is_empty() {
			let share = (*ORDERED_CACHE_LIMIT as usize / placements.len()).max(1) as u32;
			fetch_limit = fetch_limit.min(share);
		}
		let seed = match !req.ordered && fetch_limit < *SMALL_RESULT_SET {
			true => 1,
			false => servers * self.opts.max_concurrent_per_server,
		};
		let ctx = Arc::new(ScanContext::new(ContextOptions {
			request_id: req.request_id,
			collection: req.collection,
			ranges: req.ranges,
			ordered: req.ordered,
			sample_size: None,
			documents: false,
			timeout: req.timeout.unwrap_or(*MAX_SCAN_DURATION),
			kv_timeout: req.kv_timeout.unwrap_or(self.opts.default_kv_timeout),
			skip_key: req.skip_key,
			temp: self.temp.clone(),
			spill_threshold: self.opts.spill_threshold,
			servers,
			capacity: placements.len(),
		}));
		let opts = CoordinatorOptions {
			servers,
			max_per_server: self.opts.max_concurrent_per_server,
			seed,
			limit,
			offset,
			pipeline_size: req.pipeline_size,
		};
		Ok(self.spawn(ctx, placements, fetch_limit, opts))
	}

	/// Start a scan returning a random sample of keys, or of documents, from
	/// every shard. This must be called from within a tokio runtime.
	pub fn start_random(&self, req: SampleRequest) -> Result<ScanHandle> {
		let (shards, servers) = self.topology()?;
		let sample_size = req.sample_size.max(1);
		let per_shard = sample_per_shard(sample_size, shards);
		let mut placements = Vec::with_capacity(shards);
		for shard in 0..shards {
			let kind = UnitKind::Sample {
				samples: per_shard,
				docs: req.with_docs,
			};
			placements.push(self.place(shard as ShardId, None, kind, servers)?);
		}
		// Documents are far larger than keys
		let (spill_threshold, max_per_request) = match req.with_docs {
			true => (self.opts.doc_spill_threshold, *MAX_DOCS_PER_REQUEST),
			false => (self.opts.spill_threshold, u32::MAX),
		};
		let ctx = Arc::new(ScanContext::new(ContextOptions {
			request_id: req.request_id,
			collection: req.collection,
			ranges: Vec::new(),
			ordered: false,
			sample_size: Some(sample_size),
			documents: req.with_docs,
			timeout: req.timeout.unwrap_or(*MAX_SCAN_DURATION),
			kv_timeout: req.kv_timeout.unwrap_or(self.opts.default_kv_timeout),
			skip_key: None,
			temp: self.temp.clone(),
			spill_threshold,
			servers,
			capacity: placements.len(),
		}));
		let opts = CoordinatorOptions {
			servers,
			max_per_server: self.opts.max_concurrent_per_server,
			seed: servers * self.opts.max_concurrent_per_server,
			limit: Some(per_shard.saturating_mul(shards as u64)),
			offset: 0,
			pipeline_size: req.pipeline_size,
		};
		let fetch_limit = u32::try_from(per_shard).unwrap_or(u32::MAX).min(max_per_request);
		Ok(self.spawn(ctx, placements, fetch_limit, opts))
	}

	/// The current number of shards and servers
	fn topology(&self) -> Result<(usize, usize)> {
		let shards = self.shards.shard_count();
		let servers = self.shards.server_count();
		if shards == 0 || shards > ShardId::MAX as usize + 1 {
			return Err(Error::Failed(format!("invalid shard count {shards}")));
		}
		if servers == 0 {
			return Err(Error::Failed("no servers available".to_string()));
		}
		Ok((shards, servers))
	}

	fn place(
		&self,
		shard: ShardId,
		range: Option<usize>,
		kind: UnitKind,
		servers: usize,
	) -> Result<Placement> {
		let server = self
			.shards
			.owning_server(shard)
			.filter(|s| *s < servers)
			.ok_or_else(|| Error::Failed(format!("no server owns shard {shard}")))?;
		Ok(Placement {
			shard,
			range,
			server,
			kind,
		})
	}

	fn spawn(
		&self,
		ctx: Arc<ScanContext>,
		placements: Vec<Placement>,
		fetch_limit: u32,
		opts: CoordinatorOptions,
	) -> ScanHandle {
		let units = placements
			.into_iter()
			.enumerate()
			.map(|(id, p)| {
				Arc::new(ShardScan::new(
					ctx.clone(),
					id,
					p.shard,
					p.range,
					p.server,
					p.kind,
					fetch_limit.max(1),
				))
			})
			.collect();
		let (tx, rx) = mpsc::channel(1);
		let coordinator = Coordinator::new(ctx.clone(), self.pool.clone(), units, opts, tx);
		tokio::spawn(coordinator.run());
		ScanHandle {
			ctx,
			rx,
			failed: false,
		}
	}
}

/// A running scan
pub struct ScanHandle {
	ctx: Arc<ScanContext>,
	rx: mpsc::Receiver<Message>,
	failed: bool,
}

impl ScanHandle {
	/// A process unique number identifying this scan
	pub fn id(&self) -> u64 {
		self.ctx.num
	}

	/// The ranges being scanned
	pub fn ranges(&self) -> &[KeyRange] {
		&self.ctx.ranges
	}

	/// Whether this scan returns documents rather than keys
	pub fn with_docs(&self) -> bool {
		self.ctx.documents
	}

	/// Wait up to the poll timeout for the next batch of keys
	pub async fn fetch(&mut self, poll: Duration) -> Result<Fetch> {
		if self.ctx.documents {
			return Err(Error::Invalid("keys fetched from a document scan".to_string()));
		}
		match self.receive(poll).await? {
			Received::Pending => Ok(Fetch::Pending),
			Received::Message(Message::Keys(keys)) => Ok(Fetch::Keys(keys)),
			Received::Message(_) => Ok(Fetch::Done),
		}
	}

	/// Wait up to the poll timeout for the next batch of documents
	pub async fn fetch_docs(&mut self, poll: Duration) -> Result<FetchDocs> {
		if !self.ctx.documents {
			return Err(Error::Invalid("documents fetched from a key scan".to_string()));
		}
		match self.receive(poll).await? {
			Received::Pending => Ok(FetchDocs::Pending),
			Received::Message(Message::Docs(docs)) => Ok(FetchDocs::Docs(docs)),
			Received::Message(_) => Ok(FetchDocs::Done),
		}
	}

	async fn receive(&mut self, poll: Duration) -> Result<Received> {
		// Check to see if the scan is still running
		if self.failed || self.ctx.is_inactive() {
			return match self.rx.try_recv() {
				Ok(Message::Error(e)) => Err(e),
				_ => Err(Error::Inactive),
			};
		}
		match tokio::time::timeout(poll, self.rx.recv()).await {
			Err(_) => Ok(Received::Pending),
			Ok(Some(Message::Error(e))) => {
				self.failed = true;
				Err(e)
			}
			Ok(Some(msg)) => Ok(Received::Message(msg)),
			Ok(None) => Ok(Received::Message(Message::End)),
		}
	}

	/// Stop the scan, returning the read units consumed so far. Stopping a
	/// scan more than once has no further effect.
	pub fn stop(&self) -> Result<u64> {
		if self.ctx.set_inactive() {
			trace!(target: TARGET, "Stopping range scan {:#010x}", self.ctx.num);
			self.ctx.stop.cancel();
			self.ctx.ready.cancel();
		}
		Ok(self.ctx.read_units())
	}

	/// The read units consumed so far
	pub fn read_units(&self) -> u64 {
		self.ctx.read_units()
	}

	/// Whether the scan exceeded its deadline
	pub fn is_timed_out(&self) -> bool {
		self.ctx.is_timed_out()
	}

	/// The highest number of shard scans concurrently working against a server
	pub fn peak_working(&self, server: ServerId) -> usize {
		self.ctx.peak_working(server)
	}
}

impl Display for ScanHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		Display::fmt(&self.ctx, f)
	}
}

impl Drop for ScanHandle {
	fn drop(&mut self) {
		let _ = self.stop();
	}
}
