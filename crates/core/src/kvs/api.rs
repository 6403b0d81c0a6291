use std::fmt::{self, Display};

use bytes::Bytes;
use tokio::time::Instant;

use crate::err::WireError;
use crate::kvs::{CollectionId, ServerId, ShardId};

/// The opaque identifier of a server side range scan
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ScanToken(pub [u8; 16]);

impl Display for ScanToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for (i, b) in self.0.iter().enumerate() {
			if matches!(i, 4 | 6 | 8 | 10) {
				f.write_str("-")?;
			}
			write!(f, "{b:02x}")?;
		}
		Ok(())
	}
}

/// The status of a range scan continue response
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
	/// A partial batch of keys, more responses follow for this request
	Success,
	/// The request limits were reached, but the server has more keys
	More,
	/// The server has returned every key in the range
	Complete,
}

/// One response received from a range scan continue request
#[derive(Clone, Debug)]
pub struct Response {
	pub status: Status,
	/// A stream of LEB128 length prefixed keys, or of documents
	pub body: Bytes,
	/// The number of read units charged for this response
	pub read_units: u64,
}

/// A transport to the server which owns a shard
#[async_trait::async_trait]
pub trait Connection: Send {
	/// The server this connection is attached to
	fn server(&self) -> ServerId;

	/// Whether this connection points at a replica rather than the active copy
	fn is_replica(&self) -> bool {
		false
	}

	/// Check whether a single key exists
	async fn validate_key(
		&mut self,
		shard: ShardId,
		collection: CollectionId,
		key: &[u8],
	) -> Result<bool, WireError>;

	/// Create a server side scan over a key range
	async fn create_range_scan(
		&mut self,
		shard: ShardId,
		collection: CollectionId,
		start: &[u8],
		exclude_start: bool,
		end: &[u8],
		exclude_end: bool,
	) -> Result<ScanToken, WireError>;

	/// Create a server side scan returning a random sample of keys. When
	/// `with_docs` is set, the responses carry whole documents.
	async fn create_random_scan(
		&mut self,
		shard: ShardId,
		collection: CollectionId,
		samples: u64,
		with_docs: bool,
	) -> Result<ScanToken, WireError>;

	/// Request the next batch of keys. The responses are delivered through
	/// subsequent calls to [`Connection::receive`].
	async fn continue_range_scan(
		&mut self,
		shard: ShardId,
		token: &ScanToken,
		fetch_limit: u32,
		byte_limit: u32,
	) -> Result<(), WireError>;

	/// Wait for the next response, failing if it does not arrive before the deadline
	async fn receive(&mut self, deadline: Instant) -> Result<Response, WireError>;

	/// Cancel a server side scan
	async fn cancel_range_scan(&mut self, shard: ShardId, token: &ScanToken) -> Result<(), WireError>;
}

/// A source of connections to the servers owning each shard
#[async_trait::async_trait]
pub trait ConnectionProvider: Send + Sync + 'static {
	/// Acquire a connection to the server currently owning a shard
	async fn connection(&self, shard: ShardId) -> Result<Box<dyn Connection>, WireError>;

	/// Return a healthy connection after use
	fn release(&self, conn: Box<dyn Connection>);

	/// Drop a connection after a transport failure
	fn discard(&self, conn: Box<dyn Connection>) {
		drop(conn);
	}
}

/// The assignment of shards to servers
pub trait ShardMap: Send + Sync + 'static {
	/// The number of shards in the bucket
	fn shard_count(&self) -> usize;

	/// The number of physical data servers
	fn server_count(&self) -> usize;

	/// The shard which owns a key
	fn hash(&self, key: &[u8]) -> Option<ShardId>;

	/// The server which currently owns a shard
	fn owning_server(&self, shard: ShardId) -> Option<ServerId>;
}
