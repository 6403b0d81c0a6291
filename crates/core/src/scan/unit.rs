use std::fmt::{self, Display};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::err::{Error, Result};
use crate::key::debug::Sprintable;
use crate::key::range::KeyRange;
use crate::kvs::{Key, ServerId, ShardId};
use crate::scan::context::ScanContext;
use crate::scan::spill::SpillBuffer;

/// The lifecycle state of a shard scan
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum UnitState {
	/// Waiting to be admitted to a worker
	Ready = 0,
	/// Queued for a worker
	Scheduled = 1,
	/// Being fetched by a worker
	Working = 2,
	/// Fetched and waiting for the coordinator
	Worked = 3,
	/// Being consumed by the coordinator
	Processing = 4,
	/// Failed
	Error = 5,
	/// Cancelled
	Cancelled = 6,
}

impl UnitState {
	fn from_u8(v: u8) -> Self {
		match v {
			0 => Self::Ready,
			1 => Self::Scheduled,
			2 => Self::Working,
			3 => Self::Worked,
			4 => Self::Processing,
			5 => Self::Error,
			_ => Self::Cancelled,
		}
	}

	/// Whether a unit may move from this state to the next
	pub(crate) fn can_advance(self, next: UnitState) -> bool {
		use UnitState::*;
		matches!(
			(self, next),
			(Ready, Scheduled)
				| (Scheduled, Working)
				| (Working, Worked)
				| (Worked, Processing)
				| (Processing, Ready)
				| (Working | Processing, Error)
				| (_, Cancelled)
		)
	}
}

/// What a shard scan requests from the server
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum UnitKind {
	/// A range of keys
	Range(KeyRange),
	/// A single key, validated rather than scanned where possible
	Single(KeyRange),
	/// A random sample of keys, or of whole documents
	Sample {
		samples: u64,
		docs: bool,
	},
}

/// The mutable state of a shard scan
pub(crate) struct UnitData {
	/// The key to resume from on the next cycle, always exclusive
	pub(crate) cursor: Option<Key>,
	pub(crate) buffer: Option<SpillBuffer>,
	/// Whether the server has returned every key for this shard
	pub(crate) complete: bool,
	pub(crate) error: Option<Error>,
	/// The number of keys to request per cycle
	pub(crate) fetch_limit: u32,
}

impl UnitData {
	/// The number of buffered keys not yet consumed
	pub(crate) fn remaining(&self) -> usize {
		self.buffer.as_ref().map(SpillBuffer::remaining).unwrap_or(0)
	}

	/// The number of keys buffered in this cycle
	pub(crate) fn buffered(&self) -> usize {
		self.buffer.as_ref().map(SpillBuffer::len).unwrap_or(0)
	}

	/// The number of bytes buffered in this cycle
	pub(crate) fn size(&self) -> u64 {
		self.buffer.as_ref().map(SpillBuffer::size).unwrap_or(0)
	}

	/// Discard every buffered key ahead of the next cycle
	pub(crate) fn truncate(&mut self) -> Result<()> {
		match self.buffer.as_mut() {
			Some(buffer) => buffer.truncate(),
			None => Ok(()),
		}
	}
}

/// The scan of one range on one shard
pub(crate) struct ShardScan {
	/// The index of this unit within its scan
	pub(crate) id: usize,
	pub(crate) shard: ShardId,
	/// The index of the range being scanned, if not sampling
	pub(crate) range: Option<usize>,
	pub(crate) server: ServerId,
	pub(crate) kind: UnitKind,
	pub(crate) ctx: Arc<ScanContext>,
	state: AtomicU8,
	pub(crate) data: Mutex<UnitData>,
}

impl ShardScan {
	pub(crate) fn new(
		ctx: Arc<ScanContext>,
		id: usize,
		shard: ShardId,
		range: Option<usize>,
		server: ServerId,
		kind: UnitKind,
		fetch_limit: u32,
	) -> Self {
		Self {
			id,
			shard,
			range,
			server,
			kind,
			ctx,
			state: AtomicU8::new(UnitState::Ready as u8),
			data: Mutex::new(UnitData {
				cursor: None,
				buffer: None,
				complete: false,
				error: None,
				fetch_limit,
			}),
		}
	}

	pub(crate) fn state(&self) -> UnitState {
		UnitState::from_u8(self.state.load(Ordering::Acquire))
	}

	/// Move from one state to another, failing if the unit is no longer in
	/// the expected state or the transition is not allowed
	pub(crate) fn advance(&self, from: UnitState, to: UnitState) -> bool {
		if !from.can_advance(to) {
			return false;
		}
		self.state
			.compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
	}

	/// Mark this unit as cancelled, returning the state it was in
	pub(crate) fn cancel(&self) -> UnitState {
		UnitState::from_u8(self.state.swap(UnitState::Cancelled as u8, Ordering::AcqRel))
	}

	/// Record an error and move a working unit to the error state
	pub(crate) fn fail(&self, err: Error) -> bool {
		let mut data = self.data.lock();
		if !self.advance(UnitState::Working, UnitState::Error) {
			return false;
		}
		if data.error.is_none() {
			data.error = Some(err);
		}
		true
	}

	/// Return this unit to the coordinator
	pub(crate) fn report(&self) {
		self.ctx.ready.enqueue(self.id);
	}

	/// Whether a key should be buffered for this scan
	pub(crate) fn accepts(&self, key: &[u8]) -> bool {
		self.ctx.accepts(key)
	}
}

impl Display for ShardScan {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{{{:#010x},shard:{},server:{}", self.ctx.num, self.shard, self.server)?;
		match (&self.kind, self.range) {
			(UnitKind::Range(r) | UnitKind::Single(r), Some(i)) => write!(f, ",range[{i}]:{r}")?,
			(UnitKind::Range(r) | UnitKind::Single(r), None) => write!(f, ",range:{r}")?,
			(
				UnitKind::Sample {
					samples,
					docs,
				},
				_,
			) => {
				write!(f, ",sample:{samples}")?;
				if *docs {
					f.write_str(",docs")?;
				}
			}
		}
		if let Some(data) = self.data.try_lock() {
			if let Some(cursor) = &data.cursor {
				write!(f, ",cursor:{}", cursor.sprint())?;
			}
			if data.buffer.as_ref().is_some_and(SpillBuffer::is_spilled) {
				f.write_str(",spilled")?;
			}
		}
		write!(f, ",state:{:?}}}", self.state())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn legal_transitions() {
		use UnitState::*;
		assert!(Ready.can_advance(Scheduled));
		assert!(Scheduled.can_advance(Working));
		assert!(Working.can_advance(Worked));
		assert!(Worked.can_advance(Processing));
		assert!(Processing.can_advance(Ready));
		assert!(Working.can_advance(Error));
		assert!(Ready.can_advance(Cancelled));
		assert!(Worked.can_advance(Cancelled));
		assert!(!Ready.can_advance(Working));
		assert!(!Worked.can_advance(Ready));
		assert!(!Error.can_advance(Ready));
		assert!(!Cancelled.can_advance(Ready));
		assert!(!Processing.can_advance(Scheduled));
	}
}
