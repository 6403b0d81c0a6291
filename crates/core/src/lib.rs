//! # Vbscan Core
//!
//! This crate implements the client-side engine which performs full keyspace
//! range scans against a key-value store that is partitioned into shards
//! (vbuckets) spread across many servers.
//!
//! A single logical scan is split into one scan per shard and range. These
//! are executed concurrently by a bounded pool of workers per server, and the
//! results are merged back together either in key order, or in the order in
//! which they arrive. Buffered keys which do not fit in memory are spilled to
//! temporary files on local disk. Random sampling scans can also return whole
//! documents rather than keys.
//!
//! The connection layer, the shard map, and the temporary storage quota are
//! supplied by the caller through the traits in [`kvs`].

#[macro_use]
extern crate tracing;

#[macro_use]
mod mac;

pub mod cnf;
pub mod err;
pub mod key;
pub mod kvs;
pub mod options;
pub mod scan;

pub use crate::err::{Error, Result};
pub use crate::key::range::KeyRange;
pub use crate::kvs::api::{Connection, ConnectionProvider, ScanToken, ShardMap, Status};
pub use crate::kvs::doc::{Document, DocumentMeta};
pub use crate::kvs::temp::{TempQuota, TempStorage};
pub use crate::kvs::{CollectionId, Key, ServerId, ShardId};
pub use crate::options::EngineOptions;
pub use crate::scan::handle::{Fetch, FetchDocs, RangeScanner, ScanHandle};
pub use crate::scan::request::{SampleRequest, ScanRequest};
