use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::kvs::Key;

/// The current head key of one shard scan
#[derive(Debug, PartialEq, Eq)]
struct Head {
	key: Key,
	unit: usize,
}

impl Ord for Head {
	fn cmp(&self, other: &Self) -> Ordering {
		self.key.cmp(&other.key).then(self.unit.cmp(&other.unit))
	}
}

impl PartialOrd for Head {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

/// A min heap over the head key of each shard scan, used to merge the
/// results of many shards into a single ordered stream
#[derive(Debug, Default)]
pub(crate) struct MergeHeap {
	heap: BinaryHeap<Reverse<Head>>,
}

impl MergeHeap {
	pub(crate) fn with_capacity(capacity: usize) -> Self {
		Self {
			heap: BinaryHeap::with_capacity(capacity),
		}
	}

	pub(crate) fn push(&mut self, unit: usize, key: Key) {
		self.heap.push(Reverse(Head {
			key,
			unit,
		}));
	}

	/// Remove the smallest head key, returning the unit it came from
	pub(crate) fn pop(&mut self) -> Option<(usize, Key)> {
		self.heap.pop().map(|Reverse(h)| (h.unit, h.key))
	}

	pub(crate) fn len(&self) -> usize {
		self.heap.len()
	}
}
