use std::fmt::{self, Display};

use crate::key::debug::Sprintable;
use crate::kvs::Key;

/// An immutable range of keys with independently inclusive or exclusive bounds
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyRange {
	start: Key,
	exclude_start: bool,
	end: Key,
	exclude_end: bool,
}

impl KeyRange {
	/// Creates a new range between two keys
	pub fn new(start: impl Into<Key>, exclude_start: bool, end: impl Into<Key>, exclude_end: bool) -> Self {
		Self {
			start: start.into(),
			exclude_start,
			end: end.into(),
			exclude_end,
		}
	}
	/// Creates an inclusive range between two keys
	pub fn inclusive(start: impl Into<Key>, end: impl Into<Key>) -> Self {
		Self::new(start, false, end, false)
	}
	/// Creates a range which matches exactly one key
	pub fn single(key: impl Into<Key>) -> Self {
		let key = key.into();
		Self::new(key.clone(), false, key, false)
	}
	/// Creates a range spanning every possible key
	pub fn full() -> Self {
		Self::new(Vec::new(), false, vec![0xff; 250], false)
	}
	pub fn start(&self) -> &[u8] {
		&self.start
	}
	pub fn end(&self) -> &[u8] {
		&self.end
	}
	pub fn exclude_start(&self) -> bool {
		self.exclude_start
	}
	pub fn exclude_end(&self) -> bool {
		self.exclude_end
	}
	/// Whether this range matches exactly one key, and so lives on a single shard
	pub fn is_single_key(&self) -> bool {
		!self.exclude_start && !self.exclude_end && self.start == self.end
	}
	/// Whether a key falls within this range
	pub fn contains(&self, key: &[u8]) -> bool {
		let above = match self.exclude_start {
			true => key > self.start.as_slice(),
			false => key >= self.start.as_slice(),
		};
		let below = match self.exclude_end {
			true => key < self.end.as_slice(),
			false => key <= self.end.as_slice(),
		};
		above && below
	}
}

impl Display for KeyRange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let incl = |excl: bool| match excl {
			true => '-',
			false => '+',
		};
		write!(
			f,
			"{{{}start:{},{}end:{}}}",
			incl(self.exclude_start),
			self.start.sprint(),
			incl(self.exclude_end),
			self.end.sprint()
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn single_key_ranges() {
		assert!(KeyRange::single("a").is_single_key());
		assert!(!KeyRange::new("a", true, "a", false).is_single_key());
		assert!(!KeyRange::inclusive("a", "b").is_single_key());
	}

	#[test]
	fn bounds_are_respected() {
		let r = KeyRange::new("b", true, "d", false);
		assert!(!r.contains(b"b"));
		assert!(r.contains(b"ba"));
		assert!(r.contains(b"d"));
		assert!(!r.contains(b"da"));
		let r = KeyRange::new("b", false, "d", true);
		assert!(r.contains(b"b"));
		assert!(!r.contains(b"d"));
		assert!(KeyRange::full().contains(b""));
		assert!(KeyRange::full().contains(b"\xfe\xff"));
	}

	#[test]
	fn display_escapes_keys() {
		let r = KeyRange::new("a\x01", false, "z", true);
		assert_eq!(r.to_string(), "{+start:a\\x01,-end:z}");
	}
}
