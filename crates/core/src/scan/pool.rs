use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::err::{Error, WireError};
use crate::kvs::api::{ConnectionProvider, ScanToken};
use crate::kvs::{ServerId, ShardId};
use crate::scan::share::{ScanShare, ShareKey};
use crate::scan::unit::{ShardScan, UnitState};
use crate::scan::worker;

const TARGET: &str = "vbscan::core::scan::pool";

/// Everything a worker needs in order to talk to the cluster
#[derive(Clone)]
pub(crate) struct WorkerEnv {
	pub(crate) provider: Arc<dyn ConnectionProvider>,
	pub(crate) shutdown: CancellationToken,
	/// The timeout for best effort scan cancellation requests
	pub(crate) cancel_timeout: Duration,
}

enum Next {
	Share(ScanShare),
	Empty,
	Abort,
}

struct Pending {
	shares: VecDeque<ScanShare>,
	cancels: VecDeque<(ShardId, ScanToken)>,
	abort: bool,
}

/// The pending work for one physical data server
pub(crate) struct ServerQueue {
	pub(crate) server: ServerId,
	pending: Mutex<Pending>,
	work: Notify,
	cancels: Notify,
}

impl ServerQueue {
	fn new(server: ServerId) -> Self {
		Self {
			server,
			pending: Mutex::new(Pending {
				shares: VecDeque::new(),
				cancels: VecDeque::new(),
				abort: false,
			}),
			work: Notify::new(),
			cancels: Notify::new(),
		}
	}

	/// Queue a shard scan, joining a pending share making the same request
	fn push_share(&self, key: ShareKey, unit: Arc<ShardScan>) {
		let mut pending = self.pending.lock();
		let mut unit = unit;
		for share in pending.shares.iter_mut() {
			match share.join(&key, unit) {
				Ok(()) => {
					trace!(target: TARGET, server = self.server, shard = key.shard, "Joined a pending scan share");
					return;
				}
				Err(u) => unit = u,
			}
		}
		pending.shares.push_back(ScanShare::new(key, unit));
		drop(pending);
		self.work.notify_one();
	}

	fn next_share(&self) -> Next {
		let mut pending = self.pending.lock();
		if pending.abort {
			return Next::Abort;
		}
		match pending.shares.pop_front() {
			Some(share) => Next::Share(share),
			None => Next::Empty,
		}
	}

	/// Queue a best effort cancellation of a server side scan
	pub(crate) fn push_cancel(&self, shard: ShardId, token: ScanToken) {
		self.pending.lock().cancels.push_back((shard, token));
		self.cancels.notify_one();
	}

	fn next_cancel(&self) -> Option<(ShardId, ScanToken)> {
		self.pending.lock().cancels.pop_front()
	}

	fn is_aborted(&self) -> bool {
		self.pending.lock().abort
	}

	/// The number of shard scans waiting in pending shares
	fn queued(&self) -> usize {
		self.pending.lock().shares.iter().map(|share| share.members.len()).sum()
	}

	/// Remove every pending shard scan belonging to a scan
	fn remove_scan(&self, scan: u64) {
		self.pending.lock().shares.retain_mut(|share| share.leave(scan) > 0);
	}

	/// Ask every worker on this queue to exit
	fn abort(&self) {
		self.pending.lock().abort = true;
		self.work.notify_waiters();
		self.cancels.notify_waiters();
	}
}

struct Refs {
	count: usize,
	servers: usize,
}

struct PoolInner {
	env: WorkerEnv,
	per_server: usize,
	queues: RwLock<Vec<Arc<ServerQueue>>>,
	refs: Mutex<Refs>,
}

impl Drop for PoolInner {
	fn drop(&mut self) {
		self.env.shutdown.cancel();
		for queue in self.queues.get_mut().drain(..) {
			queue.abort();
		}
	}
}

/// A fixed number of workers per data server, shared by every scan started
/// from the same scanner
#[derive(Clone)]
pub(crate) struct WorkerPool {
	inner: Arc<PoolInner>,
}

impl WorkerPool {
	pub(crate) fn new(
		provider: Arc<dyn ConnectionProvider>,
		per_server: usize,
		cancel_timeout: Duration,
	) -> Self {
		Self {
			inner: Arc::new(PoolInner {
				env: WorkerEnv {
					provider,
					shutdown: CancellationToken::new(),
					cancel_timeout,
				},
				per_server: per_server.max(1),
				queues: RwLock::new(Vec::new()),
				refs: Mutex::new(Refs {
					count: 0,
					servers: 0,
				}),
			}),
		}
	}

	/// Ensure workers exist for every server, registering an active scan
	pub(crate) fn init_workers(&self, servers: usize) {
		let mut refs = self.inner.refs.lock();
		refs.count += 1;
		refs.servers = servers;
		let mut queues = self.inner.queues.write();
		while queues.len() < servers {
			let queue = Arc::new(ServerQueue::new(queues.len()));
			debug!(target: TARGET, server = queue.server, workers = self.inner.per_server, "Starting range scan workers");
			for _ in 0..self.inner.per_server {
				spawn_worker(self.inner.env.clone(), queue.clone());
			}
			tokio::spawn(run_canceller(self.inner.env.clone(), queue.clone()));
			queues.push(queue);
		}
	}

	/// Unregister an active scan. Once no scans are active, the workers of
	/// servers which are no longer part of the cluster are shut down.
	pub(crate) fn release_workers(&self) {
		let mut refs = self.inner.refs.lock();
		refs.count = refs.count.saturating_sub(1);
		if refs.count > 0 {
			return;
		}
		let mut queues = self.inner.queues.write();
		while queues.len() > refs.servers {
			if let Some(queue) = queues.pop() {
				debug!(target: TARGET, server = queue.server, "Stopping range scan workers");
				queue.abort();
			}
		}
	}

	/// Hand a ready shard scan to the workers of its server
	pub(crate) fn queue_scan(&self, unit: Arc<ShardScan>) -> bool {
		let queue = self.inner.queues.read().get(unit.server).cloned();
		let Some(queue) = queue else {
			return false;
		};
		if !unit.advance(UnitState::Ready, UnitState::Scheduled) {
			return false;
		}
		let key = ShareKey::of(&unit);
		queue.push_share(key, unit);
		true
	}

	/// The number of shard scans waiting for a worker on any server
	pub(crate) fn queued(&self) -> usize {
		self.inner.queues.read().iter().map(|queue| queue.queued()).sum()
	}

	/// Drop every queued shard scan belonging to a scan
	pub(crate) fn cancel_queued(&self, scan: u64) {
		for queue in self.inner.queues.read().iter() {
			queue.remove_scan(scan);
		}
	}
}

fn spawn_worker(env: WorkerEnv, queue: Arc<ServerQueue>) {
	tokio::spawn(run_worker(env, queue));
}

async fn run_worker(env: WorkerEnv, queue: Arc<ServerQueue>) {
	trace!(target: TARGET, server = queue.server, "Range scan worker started");
	loop {
		let share = {
			// Register for a wakeup before checking the queue
			let notified = queue.work.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			match queue.next_share() {
				Next::Abort => break,
				Next::Share(share) => share,
				Next::Empty => {
					tokio::select! {
						biased;
						// Check if the pool has shutdown
						_ = env.shutdown.cancelled() => break,
						// Wait for more work to be queued
						_ = &mut notified => continue,
					}
				}
			}
		};
		// Keep hold of the members in case the worker panics
		let members = share.members.clone();
		let result = AssertUnwindSafe(worker::execute(&env, &queue, share)).catch_unwind().await;
		if let Err(panic) = result {
			error!(
				target: TARGET,
				server = queue.server,
				"Range scan worker panicked: {}",
				panic_message(panic.as_ref())
			);
			// Ensure the coordinator hears about every unfinished member
			for unit in members {
				if unit.fail(Error::WorkerAborted) {
					unit.report();
				}
			}
			// Replace this worker so the pool keeps its size
			spawn_worker(env.clone(), queue.clone());
			return;
		}
	}
	trace!(target: TARGET, server = queue.server, "Range scan worker exited");
}

async fn run_canceller(env: WorkerEnv, queue: Arc<ServerQueue>) {
	loop {
		let (shard, token) = {
			let notified = queue.cancels.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			match queue.next_cancel() {
				Some(cancel) => cancel,
				None if queue.is_aborted() => break,
				None => {
					tokio::select! {
						biased;
						_ = env.shutdown.cancelled() => break,
						_ = &mut notified => continue,
					}
				}
			}
		};
		cancel_scan(&env, shard, token).await;
	}
	trace!(target: TARGET, server = queue.server, "Range scan cancel worker exited");
}

#[instrument(level = "trace", target = "vbscan::core::scan::pool", skip(env, token), fields(token = %token))]
async fn cancel_scan(env: &WorkerEnv, shard: ShardId, token: ScanToken) {
	let res = tokio::time::timeout(env.cancel_timeout, async {
		let mut conn = env.provider.connection(shard).await?;
		let res = conn.cancel_range_scan(shard, &token).await;
		match &res {
			Err(e) if e.is_transport() => env.provider.discard(conn),
			_ => env.provider.release(conn),
		}
		res
	})
	.await;
	match res {
		Ok(Ok(())) | Ok(Err(WireError::KeyNotFound)) => {
			trace!(target: TARGET, shard, "Cancelled range scan {token}");
		}
		Ok(Err(e)) => {
			debug!(target: TARGET, shard, "Unable to cancel range scan {token}: {e}");
		}
		Err(_) => {
			debug!(target: TARGET, shard, "Timed out cancelling range scan {token}");
		}
	}
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
	if let Some(s) = panic.downcast_ref::<&str>() {
		s
	} else if let Some(s) = panic.downcast_ref::<String>() {
		s.as_str()
	} else {
		"unknown panic"
	}
}
