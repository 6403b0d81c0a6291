use std::sync::Arc;

use crate::kvs::{CollectionId, Key, ServerId, ShardId};
use crate::scan::unit::{ShardScan, UnitKind};

/// Identifies the exact request a shard scan will send to its server. Shard
/// scans with equal keys can be satisfied by a single round trip.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ShareKey {
	pub(crate) collection: CollectionId,
	pub(crate) shard: ShardId,
	pub(crate) server: ServerId,
	pub(crate) kind: UnitKind,
	/// The exclusive key to resume from
	pub(crate) cursor: Option<Key>,
	pub(crate) fetch_limit: u32,
}

impl ShareKey {
	pub(crate) fn of(unit: &ShardScan) -> Self {
		let data = unit.data.lock();
		Self {
			collection: unit.ctx.collection,
			shard: unit.shard,
			server: unit.server,
			kind: unit.kind.clone(),
			cursor: data.cursor.clone(),
			fetch_limit: data.fetch_limit,
		}
	}

	/// The start of the next request as a key and an exclusive flag
	pub(crate) fn start(&self) -> (&[u8], bool) {
		match (&self.cursor, &self.kind) {
			(Some(cursor), _) => (cursor.as_slice(), true),
			(None, UnitKind::Range(r) | UnitKind::Single(r)) => (r.start(), r.exclude_start()),
			(None, UnitKind::Sample {
				..
			}) => (&[][..], false),
		}
	}
}

/// One or more identical shard scans dispatched to a worker together
pub(crate) struct ScanShare {
	pub(crate) key: ShareKey,
	pub(crate) members: Vec<Arc<ShardScan>>,
}

impl ScanShare {
	pub(crate) fn new(key: ShareKey, unit: Arc<ShardScan>) -> Self {
		Self {
			key,
			members: vec![unit],
		}
	}

	/// Add a shard scan to this share if it makes the identical request
	pub(crate) fn join(&mut self, key: &ShareKey, unit: Arc<ShardScan>) -> Result<(), Arc<ShardScan>> {
		match &self.key == key {
			true => {
				self.members.push(unit);
				Ok(())
			}
			false => Err(unit),
		}
	}

	/// Remove every member belonging to a scan, returning how many remain
	pub(crate) fn leave(&mut self, scan: u64) -> usize {
		self.members.retain(|unit| unit.ctx.num != scan);
		self.members.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::key::range::KeyRange;
	use crate::scan::context::tests::context;

	#[test]
	fn resumes_after_the_cursor() {
		let range = KeyRange::new("b", true, "p", false);
		let ctx = context(vec![range.clone()], None);
		let unit = ShardScan::new(ctx, 0, 3, Some(0), 1, UnitKind::Range(range), 8);
		assert_eq!(ShareKey::of(&unit).start(), (&b"b"[..], true));
		unit.data.lock().cursor = Some(b"k".to_vec());
		let key = ShareKey::of(&unit);
		assert_eq!(key.start(), (&b"k"[..], true));
		assert_eq!((key.shard, key.server, key.fetch_limit), (3, 1, 8));
	}
}
