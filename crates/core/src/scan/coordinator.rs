use std::sync::Arc;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::sleep_until;

use crate::cnf::MAX_KEYS_PER_REQUEST;
use crate::err::{Error, Result};
use crate::kvs::Key;
use crate::kvs::doc::Document;
use crate::scan::context::ScanContext;
use crate::scan::heap::MergeHeap;
use crate::scan::pool::WorkerPool;
use crate::scan::unit::{ShardScan, UnitState};

const TARGET: &str = "vbscan::core::scan::coordinator";

/// A message sent from the coordinator to the scan handle
#[derive(Debug)]
pub(crate) enum Message {
	/// A batch of keys
	Keys(Vec<Key>),
	/// A batch of documents
	Docs(Vec<Document>),
	/// Every key has been returned
	End,
	/// The scan failed
	Error(Error),
}

/// Whether the scan should keep going after handling a shard scan
enum Step {
	Continue,
	Done,
}

/// Drives one logical scan from start to finish
pub(crate) struct Coordinator {
	ctx: Arc<ScanContext>,
	pool: WorkerPool,
	units: Vec<Arc<ShardScan>>,
	/// Whether each shard scan is still part of the scan
	live: Vec<bool>,
	/// The number of live shard scans
	active: usize,
	/// The number of shard scans queued or working per server
	queued: Vec<usize>,
	max_per_server: usize,
	/// The number of shard scans to admit initially
	seed: usize,
	/// The number of keys still to return, if limited
	limit: Option<u64>,
	/// The number of keys still to skip
	offset: u64,
	pipeline_size: usize,
	batch: Vec<Key>,
	heap: MergeHeap,
	tx: mpsc::Sender<Message>,
}

/// The settings used to build a [`Coordinator`]
pub(crate) struct CoordinatorOptions {
	pub(crate) servers: usize,
	pub(crate) max_per_server: usize,
	pub(crate) seed: usize,
	pub(crate) limit: Option<u64>,
	pub(crate) offset: u64,
	pub(crate) pipeline_size: usize,
}

impl Coordinator {
	pub(crate) fn new(
		ctx: Arc<ScanContext>,
		pool: WorkerPool,
		units: Vec<Arc<ShardScan>>,
		opts: CoordinatorOptions,
		tx: mpsc::Sender<Message>,
	) -> Self {
		let count = units.len();
		Self {
			ctx,
			pool,
			live: vec![true; count],
			active: count,
			queued: vec![0; opts.servers],
			max_per_server: opts.max_per_server.max(1),
			seed: opts.seed.max(1),
			limit: opts.limit,
			offset: opts.offset,
			pipeline_size: opts.pipeline_size.max(1),
			batch: Vec::with_capacity(opts.pipeline_size.max(1)),
			heap: MergeHeap::with_capacity(count),
			units,
			tx,
		}
	}

	/// Run the scan to completion, delivering the outcome to the handle
	pub(crate) async fn run(mut self) {
		debug!(target: TARGET, units = self.units.len(), "Starting range scan {}", self.ctx);
		self.pool.init_workers(self.queued.len());
		let res = self.process().await;
		// Cancel anything still outstanding
		self.cancel_all();
		self.pool.release_workers();
		// Nothing is reported to a stopped scan
		if self.ctx.stop.is_cancelled() {
			debug!(target: TARGET, "Range scan {:#010x} stopped", self.ctx.num);
			return;
		}
		let msg = match res {
			Ok(()) => {
				debug!(target: TARGET, "Range scan {:#010x} completed", self.ctx.num);
				Message::End
			}
			Err(e) => {
				debug!(target: TARGET, "Range scan {:#010x} failed: {e}", self.ctx.num);
				Message::Error(e)
			}
		};
		tokio::select! {
			biased;
			_ = self.ctx.stop.cancelled() => {},
			_ = self.tx.send(msg) => {},
		}
	}

	async fn process(&mut self) -> Result<()> {
		self.seed_units()?;
		while self.active > 0 {
			// Wait for a shard scan to be handed back
			let id = tokio::select! {
				biased;
				_ = self.ctx.stop.cancelled() => return Ok(()),
				_ = sleep_until(self.ctx.deadline) => {
					self.ctx.set_timed_out();
					return Err(Error::Timeout);
				}
				id = self.ctx.ready.pop() => match id {
					Some(id) => id,
					None if self.ctx.is_timed_out() => return Err(Error::Timeout),
					None => return Ok(()),
				},
			};
			let Some(unit) = self.units.get(id).cloned() else {
				continue;
			};
			if let Some(queued) = self.queued.get_mut(unit.server) {
				*queued = queued.saturating_sub(1);
			}
			// Check the outcome of the fetch
			match unit.state() {
				UnitState::Worked => {
					unit.advance(UnitState::Worked, UnitState::Processing);
				}
				UnitState::Error => {
					let err = unit.data.lock().error.take().unwrap_or(Error::WorkerAborted);
					if err.is_timeout() {
						self.ctx.set_timed_out();
					}
					return Err(err);
				}
				UnitState::Cancelled => {
					self.remove(id);
					continue;
				}
				state => {
					warn!(target: TARGET, "Unexpected state {state:?} for shard scan {unit}");
					continue;
				}
			}
			trace!(target: TARGET, ready = self.ctx.ready.len(), "Processing shard scan {unit}");
			let step = match self.ctx.ordered {
				true => self.merge(id).await?,
				false => self.stream(id).await?,
			};
			if let Step::Done = step {
				return self.flush().await;
			}
			self.flush().await?;
			self.readmit(id)?;
		}
		Ok(())
	}

	/// Queue the initial wave of shard scans, starting from a random unit
	fn seed_units(&mut self) -> Result<()> {
		let total = self.units.len();
		if total == 0 {
			return Ok(());
		}
		let start = rand::thread_rng().gen_range(0..total);
		let mut admitted = 0;
		for i in 0..total {
			if admitted >= self.seed {
				break;
			}
			let id = (start + i) % total;
			if self.has_capacity(id) {
				self.admit(id)?;
				admitted += 1;
			}
		}
		trace!(target: TARGET, admitted, total, "Seeded range scan {:#010x}", self.ctx.num);
		Ok(())
	}

	/// Admit ready shard scans while their servers have capacity. The shard
	/// scan which was just serviced is considered last.
	fn readmit(&mut self, serviced: usize) -> Result<()> {
		let total = self.units.len();
		let start = rand::thread_rng().gen_range(0..total);
		let order: Vec<usize> = (0..total)
			.map(|i| (start + i) % total)
			.filter(|id| *id != serviced)
			.chain(std::iter::once(serviced))
			.collect();
		for id in order {
			if !self.live[id] || self.units[id].state() != UnitState::Ready {
				continue;
			}
			// Skip shard scans which still hold keys or have finished
			let waiting = {
				let data = self.units[id].data.lock();
				!data.complete && data.remaining() == 0
			};
			if waiting && self.has_capacity(id) {
				self.admit(id)?;
			}
		}
		Ok(())
	}

	fn has_capacity(&self, id: usize) -> bool {
		let server = self.units[id].server;
		self.queued.get(server).is_some_and(|q| *q < self.max_per_server)
	}

	fn admit(&mut self, id: usize) -> Result<()> {
		let unit = self.units[id].clone();
		let server = unit.server;
		if !self.pool.queue_scan(unit) {
			return Err(Error::Failed(format!("no range scan workers for server {server}")));
		}
		if let Some(queued) = self.queued.get_mut(server) {
			*queued += 1;
		}
		Ok(())
	}

	/// Drop a shard scan from the scan
	fn remove(&mut self, id: usize) {
		if std::mem::replace(&mut self.live[id], false) {
			self.active -= 1;
			self.units[id].data.lock().buffer = None;
		}
	}

	/// Stream the keys of a shard scan straight to the caller
	async fn stream(&mut self, id: usize) -> Result<Step> {
		let unit = self.units[id].clone();
		let (buffer, complete) = {
			let mut data = unit.data.lock();
			(data.buffer.take(), data.complete)
		};
		if let Some(mut buffer) = buffer {
			// Apply the global offset once across all shards
			let skipped = buffer.skip(usize::try_from(self.offset).unwrap_or(usize::MAX));
			self.offset -= skipped as u64;
			while buffer.remaining() > 0 {
				let mut want = self.pipeline_size - self.batch.len();
				if let Some(limit) = self.limit {
					want = want.min(usize::try_from(limit).unwrap_or(usize::MAX));
				}
				if want == 0 {
					break;
				}
				let keys = buffer.take(want)?;
				if let Some(limit) = self.limit.as_mut() {
					*limit -= keys.len() as u64;
				}
				self.batch.extend(keys);
				if self.batch.len() >= self.pipeline_size {
					self.flush().await?;
				}
			}
			buffer.truncate()?;
			unit.data.lock().buffer = Some(buffer);
		}
		if self.limit == Some(0) {
			return Ok(Step::Done);
		}
		match complete {
			true => self.remove(id),
			false => {
				unit.advance(UnitState::Processing, UnitState::Ready);
			}
		}
		Ok(Step::Continue)
	}

	/// Merge the keys of every shard scan in key order
	async fn merge(&mut self, id: usize) -> Result<Step> {
		let unit = self.units[id].clone();
		let (head, complete) = {
			let mut data = unit.data.lock();
			let complete = data.complete;
			let head = match data.buffer.as_mut() {
				Some(buffer) => buffer.next()?,
				None => None,
			};
			(head, complete)
		};
		match (head, complete) {
			(Some(key), _) => self.heap.push(id, key),
			(None, true) => self.remove(id),
			// Nothing was buffered, so fetch again
			(None, false) => self.refill(id)?,
		}
		// Merge once every live shard scan has a head key
		while self.active > 0 && self.heap.len() == self.active {
			let Some((id, key)) = self.heap.pop() else {
				break;
			};
			// Apply the global offset and limit
			if self.offset > 0 {
				self.offset -= 1;
			} else {
				self.batch.push(key);
				if let Some(limit) = self.limit.as_mut() {
					*limit -= 1;
				}
				if self.batch.len() >= self.pipeline_size {
					self.flush().await?;
				}
				if self.limit == Some(0) {
					return Ok(Step::Done);
				}
			}
			// Advance the shard scan the key came from
			let unit = self.units[id].clone();
			let (next, complete) = {
				let mut data = unit.data.lock();
				let complete = data.complete;
				let next = match data.buffer.as_mut() {
					Some(buffer) => buffer.next()?,
					None => None,
				};
				(next, complete)
			};
			match (next, complete) {
				(Some(key), _) => self.heap.push(id, key),
				(None, true) => self.remove(id),
				// Wait for this shard scan to be refilled
				(None, false) => {
					self.grow_fetch_limit(id);
					self.refill(id)?;
					break;
				}
			}
		}
		Ok(Step::Continue)
	}

	/// Return a drained shard scan to the ready state so it is fetched again
	fn refill(&mut self, id: usize) -> Result<()> {
		let unit = &self.units[id];
		unit.data.lock().truncate()?;
		unit.advance(UnitState::Processing, UnitState::Ready);
		Ok(())
	}

	/// Double the fetch limit of a shard scan which ran dry mid-merge, as long
	/// as that does not fetch more than the remaining limit
	fn grow_fetch_limit(&self, id: usize) {
		let mut data = self.units[id].data.lock();
		let doubled = data.fetch_limit.saturating_mul(2).min(*MAX_KEYS_PER_REQUEST);
		let allowed = match self.limit {
			Some(limit) => u64::from(doubled) <= limit.saturating_add(self.offset),
			None => true,
		};
		if allowed {
			data.fetch_limit = doubled;
		}
	}

	/// Send the pending batch to the caller
	async fn flush(&mut self) -> Result<()> {
		if self.batch.is_empty() {
			return Ok(());
		}
		let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(self.pipeline_size));
		// Document scans buffer encoded document records
		let msg = match self.ctx.documents {
			true => Message::Docs(
				batch.iter().map(|r| Document::from_record(r)).collect::<Result<Vec<_>>>()?,
			),
			false => Message::Keys(batch),
		};
		tokio::select! {
			biased;
			_ = self.ctx.stop.cancelled() => Err(Error::Inactive),
			_ = self.ctx.expired.cancelled() => Err(Error::Timeout),
			_ = sleep_until(self.ctx.deadline) => {
				self.ctx.set_timed_out();
				Err(Error::Timeout)
			}
			res = self.tx.send(msg) => res.map_err(|_| Error::Inactive),
		}
	}

	/// Cancel every shard scan, releasing buffers which no worker is using
	fn cancel_all(&mut self) {
		for unit in self.units.iter() {
			if unit.cancel() != UnitState::Working {
				unit.data.lock().buffer = None;
			}
		}
		self.pool.cancel_queued(self.ctx.num);
	}
}
