use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::spawn_blocking;
use tokio::time::Instant;

use crate::cnf::{MAX_CACHED_SIZE, MIN_SCAN_SIZE};
use crate::err::{Error, Result, WireError};
use crate::kvs::api::{Connection, ScanToken, Status};
use crate::kvs::Key;
use crate::kvs::body::{DocSpan, parse_documents, parse_keys};
use crate::kvs::doc::Document;
use crate::scan::context::{ScanContext, WorkGuard};
use crate::scan::pool::{ServerQueue, WorkerEnv};
use crate::scan::share::{ScanShare, ShareKey};
use crate::scan::unit::{ShardScan, UnitKind, UnitState};

const TARGET: &str = "vbscan::core::scan::worker";

/// A shard scan claimed by a worker
struct Member {
	unit: Arc<ShardScan>,
	guard: Option<WorkGuard>,
}

impl Member {
	fn is_live(&self) -> bool {
		self.unit.state() == UnitState::Working
	}

	/// Hand the fetched keys back to the coordinator
	fn finish(mut self) {
		let worked = self.unit.advance(UnitState::Working, UnitState::Worked);
		self.guard.take();
		if worked {
			self.unit.report();
		}
	}

	/// Report an error back to the coordinator
	fn fail(mut self, err: Error) {
		let failed = self.unit.fail(err);
		self.guard.take();
		if failed {
			self.unit.report();
		}
	}
}

/// The entries decoded from a response body
enum Entries {
	Keys(Vec<Range<usize>>),
	Docs(Vec<DocSpan>),
}

impl Entries {
	fn decode(body: &[u8], docs: bool) -> Result<Self, String> {
		match docs {
			true => parse_documents(body).map(Entries::Docs),
			false => parse_keys(body).map(Entries::Keys),
		}
	}

	fn is_empty(&self) -> bool {
		match self {
			Entries::Keys(keys) => keys.is_empty(),
			Entries::Docs(docs) => docs.is_empty(),
		}
	}

	/// The position of the last key in the body
	fn last_key(&self) -> Option<Range<usize>> {
		match self {
			Entries::Keys(keys) => keys.last().cloned(),
			Entries::Docs(docs) => docs.last().map(|d| d.key.clone()),
		}
	}
}

enum Created {
	Token(ScanToken),
	/// The share was settled without a server side scan, and the connection
	/// is healthy if true
	Done(bool),
}

struct Execution<'a> {
	env: &'a WorkerEnv,
	queue: &'a ServerQueue,
	key: ShareKey,
	/// The scan which the first member belongs to
	ctx: Arc<ScanContext>,
	members: Vec<Member>,
	/// The last key received from the server
	last: Option<Key>,
}

/// Perform one fetch cycle for a scan share, fanning the keys returned by the
/// server out to every member of the share
#[instrument(level = "trace", target = "vbscan::core::scan::worker", skip_all, fields(shard = share.key.shard, server = share.key.server))]
pub(crate) async fn execute(env: &WorkerEnv, queue: &ServerQueue, share: ScanShare) {
	let ScanShare {
		key,
		members,
	} = share;
	// Claim every member which was not cancelled while queued
	let members: Vec<Member> = members
		.into_iter()
		.filter(|unit| unit.advance(UnitState::Scheduled, UnitState::Working))
		.map(|unit| {
			let guard = unit.ctx.begin_work(unit.server);
			Member {
				unit,
				guard: Some(guard),
			}
		})
		.collect();
	let Some(ctx) = members.first().map(|m| m.unit.ctx.clone()) else {
		trace!(target: TARGET, "Every member of the scan share was cancelled");
		return;
	};
	let mut exec = Execution {
		env,
		queue,
		key,
		ctx,
		members,
		last: None,
	};
	exec.run().await;
}

impl Execution<'_> {
	async fn run(&mut self) {
		let shard = self.key.shard;
		// Acquire a connection to the owning server
		let mut conn = match self.env.provider.connection(shard).await {
			Ok(conn) => conn,
			Err(e) => {
				debug!(target: TARGET, shard, "Unable to acquire a connection: {e}");
				self.fail_all(Error::Connection {
					shard,
					message: e.to_string(),
				});
				return;
			}
		};
		// Return the connection only if it is still usable
		match self.scan(conn.as_mut()).await {
			true => self.env.provider.release(conn),
			false => self.env.provider.discard(conn),
		}
	}

	/// Run the wire exchange, returning whether the connection is healthy
	async fn scan(&mut self, conn: &mut dyn Connection) -> bool {
		let shard = self.key.shard;
		// Look up single keys directly on the active copy
		if let UnitKind::Single(range) = &self.key.kind {
			if !conn.is_replica() {
				let key = range.start().to_vec();
				return self.validate(conn, key).await;
			}
		}
		// Create the server side scan
		let token = match self.create(conn).await {
			Created::Token(token) => token,
			Created::Done(healthy) => return healthy,
		};
		let fetch_limit = self.key.fetch_limit;
		let (sampling, docs) = match self.key.kind {
			UnitKind::Sample {
				docs,
				..
			} => (true, docs),
			_ => (false, false),
		};
		loop {
			// Request the next batch of keys
			trace!(target: TARGET, shard, fetch_limit, "Continuing range scan {token}");
			let deadline = self.ctx.request_deadline();
			if let Err(e) = conn.continue_range_scan(shard, &token, fetch_limit, 0).await {
				self.fail_wire(&e, |message| Error::Continue {
					shard,
					message,
				});
				self.queue.push_cancel(shard, token);
				return false;
			}
			// Receive responses until this request is satisfied
			loop {
				let response = match conn.receive(deadline).await {
					Ok(response) => response,
					Err(e) => {
						debug!(target: TARGET, shard, "Receive failed for range scan {token}: {e}");
						self.fail_wire(&e, |message| Error::Continue {
							shard,
							message,
						});
						self.queue.push_cancel(shard, token);
						return false;
					}
				};
				self.ctx.add_read_units(response.read_units);
				if !self.prune() {
					return self.abandon(conn, token, response.status).await;
				}
				// Decode the entries in the response
				let entries = match Entries::decode(&response.body, docs) {
					Ok(entries) => entries,
					Err(message) => {
						self.fail_all(Error::BadResponse {
							shard,
							message,
						});
						self.queue.push_cancel(shard, token);
						return false;
					}
				};
				if let Some(last) = entries.last_key() {
					self.last = Some(response.body[last].to_vec());
				}
				// Buffer the entries for every member
				if !entries.is_empty() {
					self.append(response.body.clone(), entries).await;
				}
				if !self.prune() {
					return self.abandon(conn, token, response.status).await;
				}
				match response.status {
					// Issue another continue for this cycle
					Status::More if sampling || self.wants_more() => break,
					// End this cycle, resuming from the last key next time
					Status::More => {
						let healthy = self.cancel(conn, token).await;
						self.settle(false);
						return healthy;
					}
					Status::Complete => {
						self.settle(true);
						return true;
					}
					Status::Success if response.body.is_empty() => {
						self.settle(true);
						return true;
					}
					Status::Success => continue,
				}
			}
		}
	}

	#[instrument(level = "trace", target = "vbscan::core::scan::worker", skip_all)]
	async fn validate(&mut self, conn: &mut dyn Connection, key: Key) -> bool {
		let shard = self.key.shard;
		match conn.validate_key(shard, self.key.collection, &key).await {
			Ok(exists) => {
				if exists {
					let len = key.len();
					self.append(Bytes::from(key), Entries::Keys(vec![0..len])).await;
				}
				if self.prune() {
					self.settle(true);
				}
				true
			}
			Err(WireError::KeyNotFound) => {
				self.settle(true);
				true
			}
			Err(e) => {
				let healthy = !e.is_transport();
				self.fail_wire(&e, |message| Error::Validate {
					shard,
					message,
				});
				healthy
			}
		}
	}

	async fn create(&mut self, conn: &mut dyn Connection) -> Created {
		let shard = self.key.shard;
		let collection = self.key.collection;
		let res = match &self.key.kind {
			UnitKind::Sample {
				samples,
				docs,
			} => conn.create_random_scan(shard, collection, *samples, *docs).await,
			UnitKind::Range(range) | UnitKind::Single(range) => {
				let (start, exclude_start) = self.key.start();
				conn.create_range_scan(
					shard,
					collection,
					start,
					exclude_start,
					range.end(),
					range.exclude_end(),
				)
				.await
			}
		};
		match res {
			Ok(token) => {
				trace!(target: TARGET, shard, "Created range scan {token}");
				// Check to see if the share was cancelled in the meantime
				if !self.prune() {
					self.queue.push_cancel(shard, token);
					return Created::Done(true);
				}
				Created::Token(token)
			}
			// The range holds no keys on this shard
			Err(WireError::KeyNotFound) => {
				trace!(target: TARGET, shard, "No data for range scan");
				self.settle(true);
				Created::Done(true)
			}
			Err(e) => {
				debug!(target: TARGET, shard, "Unable to create range scan: {e}");
				let healthy = !e.is_transport();
				self.fail_wire(&e, |message| Error::Create {
					shard,
					message,
				});
				Created::Done(healthy)
			}
		}
	}

	/// Cancel the server side scan once a request has been fully received
	async fn cancel(&mut self, conn: &mut dyn Connection, token: ScanToken) -> bool {
		let shard = self.key.shard;
		let res =
			tokio::time::timeout(self.env.cancel_timeout, conn.cancel_range_scan(shard, &token)).await;
		match res {
			Ok(Ok(())) | Ok(Err(WireError::KeyNotFound)) => true,
			_ => {
				// Fall back to the cancel worker
				self.queue.push_cancel(shard, token);
				false
			}
		}
	}

	/// Every member has gone, so release the server side scan
	async fn abandon(&mut self, conn: &mut dyn Connection, token: ScanToken, status: Status) -> bool {
		trace!(target: TARGET, shard = self.key.shard, "Abandoning range scan {token}");
		match status {
			Status::Complete => true,
			Status::More => self.cancel(conn, token).await,
			// Further responses are still in flight on this connection
			Status::Success => {
				self.queue.push_cancel(self.key.shard, token);
				false
			}
		}
	}

	/// Append entries to the buffer of every member. A member which fails to
	/// buffer the entries is reported individually.
	async fn append(&mut self, body: Bytes, entries: Entries) {
		let units: Vec<Arc<ShardScan>> = self.members.iter().map(|m| m.unit.clone()).collect();
		let res = spawn_blocking(move || {
			units.iter().map(|unit| buffer_entries(unit, &body, &entries)).collect::<Vec<_>>()
		})
		.await;
		match res {
			Ok(results) => {
				let members = std::mem::take(&mut self.members);
				for (member, res) in members.into_iter().zip(results) {
					match res {
						Ok(()) => self.members.push(member),
						Err(e) => {
							debug!(target: TARGET, shard = self.key.shard, "Unable to buffer keys: {e}");
							member.fail(e);
						}
					}
				}
			}
			Err(e) => {
				error!(target: TARGET, shard = self.key.shard, "Buffering task failed: {e}");
				self.fail_all(e.into());
			}
		}
	}

	/// Whether another continue should be issued in this cycle
	fn wants_more(&self) -> bool {
		let Some(member) = self.members.first() else {
			return false;
		};
		let data = member.unit.data.lock();
		let buffered = data.buffered();
		(self.key.fetch_limit as usize) > buffered
			&& buffered < *MIN_SCAN_SIZE
			&& data.size() < *MAX_CACHED_SIZE
	}

	/// Drop members which are no longer working, returning whether any remain
	fn prune(&mut self) -> bool {
		self.members.retain(Member::is_live);
		!self.members.is_empty()
	}

	/// Hand every member back to the coordinator at the end of a cycle
	fn settle(&mut self, complete: bool) {
		for member in self.members.drain(..) {
			{
				let mut data = member.unit.data.lock();
				if complete {
					data.complete = true;
					data.cursor = None;
				} else if let Some(last) = &self.last {
					data.cursor = Some(last.clone());
				}
			}
			member.finish();
		}
	}

	fn fail_all(&mut self, err: Error) {
		for member in self.members.drain(..) {
			member.fail(err.clone());
		}
	}

	/// Fail every member with a wire error, judged against each member's own scan
	fn fail_wire(&mut self, e: &WireError, wrap: impl Fn(String) -> Error) {
		fail_members(self.members.drain(..), e, wrap);
	}
}

fn fail_members(
	members: impl Iterator<Item = Member>,
	e: &WireError,
	wrap: impl Fn(String) -> Error,
) {
	for member in members {
		let err = classify(&member.unit.ctx, e, &wrap);
		member.fail(err);
	}
}

/// Convert a wire error, attributing expired requests to the scan deadline
fn classify(ctx: &ScanContext, e: &WireError, wrap: impl Fn(String) -> Error) -> Error {
	match e {
		WireError::Timeout if ctx.is_timed_out() || Instant::now() >= ctx.deadline => Error::Timeout,
		e => wrap(e.to_string()),
	}
}

fn buffer_entries(unit: &ShardScan, body: &[u8], entries: &Entries) -> Result<()> {
	let mut data = unit.data.lock();
	let buffer = data.buffer.get_or_insert_with(|| unit.ctx.buffer());
	match entries {
		Entries::Keys(keys) => {
			for range in keys {
				let key = &body[range.clone()];
				if unit.accepts(key) {
					buffer.push(key)?;
				}
			}
		}
		Entries::Docs(docs) => {
			for doc in docs {
				let key = &body[doc.key.clone()];
				if !unit.accepts(key) {
					continue;
				}
				let meta = &body[doc.meta.clone()];
				let value = &body[doc.value.clone()];
				let Some(record) = Document::record(key, meta, value) else {
					return Err(Error::BadResponse {
						shard: unit.shard,
						message: format!("document key of {} bytes is too long", key.len()),
					});
				};
				buffer.push(&record)?;
			}
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;
	use crate::key::range::KeyRange;
	use crate::scan::context::tests::{context, context_with_timeout};

	fn working(ctx: &Arc<ScanContext>) -> Member {
		let kind = UnitKind::Range(KeyRange::full());
		let unit = Arc::new(ShardScan::new(ctx.clone(), 0, 3, Some(0), 0, kind, 16));
		assert!(unit.advance(UnitState::Ready, UnitState::Scheduled));
		assert!(unit.advance(UnitState::Scheduled, UnitState::Working));
		let guard = Some(ctx.begin_work(0));
		Member {
			unit,
			guard,
		}
	}

	#[tokio::test]
	async fn timeouts_are_judged_per_scan() {
		let expired = context_with_timeout(vec![KeyRange::full()], None, Duration::ZERO);
		let live = context(vec![KeyRange::full()], None);
		let members = vec![working(&live), working(&expired)];
		let units: Vec<Arc<ShardScan>> = members.iter().map(|m| m.unit.clone()).collect();
		fail_members(members.into_iter(), &WireError::Timeout, |message| Error::Continue {
			shard: 3,
			message,
		});
		for unit in &units {
			assert_eq!(unit.state(), UnitState::Error);
		}
		// Only the scan whose deadline passed sees a scan timeout
		let live_err = units[0].data.lock().error.take();
		assert!(matches!(live_err, Some(Error::Continue { shard: 3, .. })), "{live_err:?}");
		let expired_err = units[1].data.lock().error.take();
		assert!(matches!(expired_err, Some(Error::Timeout)), "{expired_err:?}");
		// Both units were handed back to their coordinators
		assert_eq!(live.ready.len(), 1);
		assert_eq!(expired.ready.len(), 1);
	}

	#[test]
	fn other_wire_errors_are_wrapped() {
		let expired = context_with_timeout(vec![KeyRange::full()], None, Duration::ZERO);
		let err = classify(&expired, &WireError::NotMyShard, |message| Error::Create {
			shard: 1,
			message,
		});
		assert!(matches!(err, Error::Create { shard: 1, .. }), "{err}");
	}
}
