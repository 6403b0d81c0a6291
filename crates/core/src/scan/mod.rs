//! The range scan engine.
//!
//! A [`handle::RangeScanner`] splits each scan into one [`unit::ShardScan`]
//! per shard and range. A coordinator task admits these to a pool of workers
//! per server, and merges or streams the buffered keys back to the
//! [`handle::ScanHandle`].
pub mod handle;
pub mod request;

pub(crate) mod context;
pub(crate) mod coordinator;
pub(crate) mod heap;
pub(crate) mod pool;
pub(crate) mod ready;
pub(crate) mod share;
pub(crate) mod spill;
pub(crate) mod unit;
pub(crate) mod worker;
