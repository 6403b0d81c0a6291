//! The interfaces through which the scan engine talks to the cluster.
//!
//! Connections, the shard map, and the temporary storage quota are owned by
//! the caller. The engine only depends on the traits declared here.
pub mod api;
pub mod body;
pub mod doc;
pub mod temp;

/// The key type returned from scans
pub type Key = Vec<u8>;

/// The identifier of a shard (vbucket)
pub type ShardId = u16;

/// The index of a physical data server in the shard map
pub type ServerId = usize;

/// The identifier of the collection being scanned
pub type CollectionId = u32;
