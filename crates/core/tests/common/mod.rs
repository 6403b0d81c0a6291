//! An in-memory cluster used to drive range scans end to end

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use vbscan_core::err::WireError;
use vbscan_core::kvs::api::Response;
use vbscan_core::kvs::body::{encode_documents, encode_keys};
use vbscan_core::kvs::doc::DATATYPE_JSON;
use vbscan_core::{
	CollectionId, Connection, ConnectionProvider, DocumentMeta, Key, ScanToken, ServerId, ShardId,
	ShardMap, Status,
};

/// The maximum number of keys carried in one response
const KEYS_PER_RESPONSE: usize = 3;

/// Faults injected into every connection
#[derive(Clone, Debug, Default)]
pub struct Faults {
	/// Fail every continue request for this shard
	pub fail_continue: Option<ShardId>,
	/// Accept continue requests but never respond to them
	pub stall: bool,
	/// Delay every continue request
	pub delay: Option<Duration>,
	/// Hand out replica connections
	pub replica: bool,
	/// Hold every continue request until the cluster is released
	pub hold: bool,
	/// Panic inside every continue request
	pub panic_continue: bool,
	/// Return at most this many keys for each continue request
	pub max_keys_per_continue: Option<usize>,
}

struct ServerScan {
	shard: ShardId,
	keys: VecDeque<Key>,
	/// Whether to return documents rather than keys
	docs: bool,
}

#[derive(Default)]
struct Counters {
	created: AtomicUsize,
	cancelled: AtomicUsize,
	validated: AtomicUsize,
	released: AtomicUsize,
	discarded: AtomicUsize,
}

/// A cluster of servers each owning a share of the shards
pub struct Cluster {
	shards: usize,
	servers: usize,
	data: Vec<Mutex<BTreeSet<Key>>>,
	scans: Mutex<HashMap<ScanToken, ServerScan>>,
	next_token: AtomicUsize,
	faults: Mutex<Faults>,
	gate: Semaphore,
	counters: Counters,
}

impl Cluster {
	pub fn new(shards: usize, servers: usize) -> Arc<Self> {
		Arc::new(Self {
			shards,
			servers,
			data: (0..shards).map(|_| Mutex::new(BTreeSet::new())).collect(),
			scans: Mutex::new(HashMap::new()),
			next_token: AtomicUsize::new(1),
			faults: Mutex::new(Faults::default()),
			gate: Semaphore::new(0),
			counters: Counters::default(),
		})
	}

	/// Store a key on the shard which owns it
	pub fn insert(&self, key: impl Into<Key>) {
		let key = key.into();
		let shard = shard_of(&key, self.shards);
		self.data[shard as usize].lock().insert(key);
	}

	pub fn insert_all<K: Into<Key>>(&self, keys: impl IntoIterator<Item = K>) {
		for key in keys {
			self.insert(key);
		}
	}

	pub fn set_faults(&self, faults: Faults) {
		*self.faults.lock() = faults;
	}

	/// Let every held continue request proceed
	pub fn release(&self) {
		self.faults.lock().hold = false;
		self.gate.add_permits(1);
	}

	/// The number of server side scans created
	pub fn created(&self) -> usize {
		self.counters.created.load(Ordering::Acquire)
	}

	/// The number of single key lookups performed
	pub fn validated(&self) -> usize {
		self.counters.validated.load(Ordering::Acquire)
	}

	/// The number of server side scans which were cancelled
	pub fn cancelled(&self) -> usize {
		self.counters.cancelled.load(Ordering::Acquire)
	}

	pub fn discarded(&self) -> usize {
		self.counters.discarded.load(Ordering::Acquire)
	}

	pub fn provider(self: &Arc<Self>) -> Arc<dyn ConnectionProvider> {
		Arc::new(Provider {
			cluster: self.clone(),
		})
	}

	pub fn shard_map(self: &Arc<Self>) -> Arc<dyn ShardMap> {
		self.clone()
	}

	fn token(&self) -> ScanToken {
		let n = self.next_token.fetch_add(1, Ordering::AcqRel) as u128;
		ScanToken(n.to_be_bytes())
	}

	fn register(&self, shard: ShardId, keys: VecDeque<Key>, docs: bool) -> ScanToken {
		let token = self.token();
		self.counters.created.fetch_add(1, Ordering::AcqRel);
		self.scans.lock().insert(
			token,
			ServerScan {
				shard,
				keys,
				docs,
			},
		);
		token
	}
}

/// The value stored for every key
pub fn document_body(key: &[u8]) -> Vec<u8> {
	format!(r#"{{"id":"{}"}}"#, String::from_utf8_lossy(key)).into_bytes()
}

/// The metadata stored for every key
pub fn document_meta(key: &[u8]) -> DocumentMeta {
	DocumentMeta {
		flags: 0x0200_0006,
		expiration: 0,
		seqno: key.len() as u64,
		cas: u64::from(fnv(key)) << 16,
		datatype: DATATYPE_JSON,
	}
}

fn fnv(key: &[u8]) -> u32 {
	key.iter().fold(2166136261u32, |h, b| (h ^ u32::from(*b)).wrapping_mul(16777619))
}

/// A stable hash of a key onto a shard
pub fn shard_of(key: &[u8], shards: usize) -> ShardId {
	(fnv(key) as usize % shards) as ShardId
}

impl ShardMap for Cluster {
	fn shard_count(&self) -> usize {
		self.shards
	}

	fn server_count(&self) -> usize {
		self.servers
	}

	fn hash(&self, key: &[u8]) -> Option<ShardId> {
		Some(shard_of(key, self.shards))
	}

	fn owning_server(&self, shard: ShardId) -> Option<ServerId> {
		Some(shard as usize % self.servers)
	}
}

struct Provider {
	cluster: Arc<Cluster>,
}

#[async_trait::async_trait]
impl ConnectionProvider for Provider {
	async fn connection(&self, shard: ShardId) -> Result<Box<dyn Connection>, WireError> {
		let server = self.cluster.owning_server(shard).ok_or(WireError::NotMyShard)?;
		let replica = self.cluster.faults.lock().replica;
		Ok(Box::new(SimConnection {
			cluster: self.cluster.clone(),
			server,
			replica,
			pending: VecDeque::new(),
		}))
	}

	fn release(&self, conn: Box<dyn Connection>) {
		self.cluster.counters.released.fetch_add(1, Ordering::AcqRel);
		drop(conn);
	}

	fn discard(&self, conn: Box<dyn Connection>) {
		self.cluster.counters.discarded.fetch_add(1, Ordering::AcqRel);
		drop(conn);
	}
}

struct SimConnection {
	cluster: Arc<Cluster>,
	server: ServerId,
	replica: bool,
	pending: VecDeque<Response>,
}

#[async_trait::async_trait]
impl Connection for SimConnection {
	fn server(&self) -> ServerId {
		self.server
	}

	fn is_replica(&self) -> bool {
		self.replica
	}

	async fn validate_key(
		&mut self,
		shard: ShardId,
		_collection: CollectionId,
		key: &[u8],
	) -> Result<bool, WireError> {
		self.cluster.counters.validated.fetch_add(1, Ordering::AcqRel);
		match self.cluster.data[shard as usize].lock().contains(key) {
			true => Ok(true),
			false => Err(WireError::KeyNotFound),
		}
	}

	async fn create_range_scan(
		&mut self,
		shard: ShardId,
		_collection: CollectionId,
		start: &[u8],
		exclude_start: bool,
		end: &[u8],
		exclude_end: bool,
	) -> Result<ScanToken, WireError> {
		let lower = match exclude_start {
			true => Bound::Excluded(start.to_vec()),
			false => Bound::Included(start.to_vec()),
		};
		let upper = match exclude_end {
			true => Bound::Excluded(end.to_vec()),
			false => Bound::Included(end.to_vec()),
		};
		if start > end || (start == end && (exclude_start || exclude_end)) {
			return Err(WireError::KeyNotFound);
		}
		let keys: VecDeque<Key> =
			self.cluster.data[shard as usize].lock().range((lower, upper)).cloned().collect();
		if keys.is_empty() {
			return Err(WireError::KeyNotFound);
		}
		Ok(self.cluster.register(shard, keys, false))
	}

	async fn create_random_scan(
		&mut self,
		shard: ShardId,
		_collection: CollectionId,
		samples: u64,
		with_docs: bool,
	) -> Result<ScanToken, WireError> {
		let keys: VecDeque<Key> = self.cluster.data[shard as usize]
			.lock()
			.iter()
			.take(samples as usize)
			.cloned()
			.collect();
		if keys.is_empty() {
			return Err(WireError::KeyNotFound);
		}
		Ok(self.cluster.register(shard, keys, with_docs))
	}

	async fn continue_range_scan(
		&mut self,
		shard: ShardId,
		token: &ScanToken,
		fetch_limit: u32,
		_byte_limit: u32,
	) -> Result<(), WireError> {
		let faults = self.cluster.faults.lock().clone();
		if faults.hold {
			let _ = self.cluster.gate.acquire().await;
		}
		if faults.panic_continue {
			panic!("continue request on shard {shard} crashed");
		}
		if let Some(delay) = faults.delay {
			tokio::time::sleep(delay).await;
		}
		if faults.fail_continue == Some(shard) {
			return Err(WireError::Io("connection reset by peer".to_string()));
		}
		if faults.stall {
			return Ok(());
		}
		let mut scans = self.cluster.scans.lock();
		let Some(scan) = scans.get_mut(token) else {
			return Err(WireError::KeyNotFound);
		};
		if scan.shard != shard {
			return Err(WireError::NotMyShard);
		}
		// Take the keys for this request
		let mut count = match fetch_limit {
			0 => scan.keys.len(),
			n => (n as usize).min(scan.keys.len()),
		};
		if let Some(max) = faults.max_keys_per_continue {
			count = count.min(max);
		}
		let keys: Vec<Key> = scan.keys.drain(..count).collect();
		let docs = scan.docs;
		let complete = scan.keys.is_empty();
		if complete {
			scans.remove(token);
		}
		drop(scans);
		// Split the keys across several responses
		let chunks: Vec<&[Key]> = keys.chunks(KEYS_PER_RESPONSE).collect();
		if chunks.is_empty() {
			self.pending.push_back(Response {
				status: Status::Complete,
				body: Bytes::new(),
				read_units: 1,
			});
			return Ok(());
		}
		let last = chunks.len() - 1;
		for (i, chunk) in chunks.into_iter().enumerate() {
			let status = match (i == last, complete) {
				(false, _) => Status::Success,
				(true, true) => Status::Complete,
				(true, false) => Status::More,
			};
			let body = match docs {
				true => {
					let docs: Vec<_> = chunk
						.iter()
						.map(|key| (document_meta(key).encode(), key.as_slice(), document_body(key)))
						.collect();
					let docs = docs.iter().map(|(meta, key, value)| (meta, *key, value.as_slice()));
					encode_documents(docs)
				}
				false => encode_keys(chunk.iter().map(Vec::as_slice)),
			};
			self.pending.push_back(Response {
				status,
				body: Bytes::from(body),
				read_units: 1,
			});
		}
		Ok(())
	}

	async fn receive(&mut self, deadline: Instant) -> Result<Response, WireError> {
		match self.pending.pop_front() {
			Some(response) => Ok(response),
			None => {
				tokio::time::sleep_until(deadline).await;
				Err(WireError::Timeout)
			}
		}
	}

	async fn cancel_range_scan(&mut self, _shard: ShardId, token: &ScanToken) -> Result<(), WireError> {
		match self.cluster.scans.lock().remove(token) {
			Some(_) => {
				self.cluster.counters.cancelled.fetch_add(1, Ordering::AcqRel);
				Ok(())
			}
			None => Err(WireError::KeyNotFound),
		}
	}
}
