//! Debug purposes only. It may be used in logs. Not for key handling in implementation code.

/// Helpers for debugging keys
pub trait Sprintable {
	/// Converts a key to an escaped string
	fn sprint(&self) -> String;
}

impl Sprintable for [u8] {
	fn sprint(&self) -> String {
		self.iter()
			.flat_map(|&byte| std::ascii::escape_default(byte))
			.map(|byte| byte as char)
			.collect::<String>()
	}
}

impl Sprintable for Vec<u8> {
	fn sprint(&self) -> String {
		self.as_slice().sprint()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn escapes_non_printable_bytes() {
		let key: &[u8] = b"doc\x00\xffa";
		assert_eq!(key.sprint(), "doc\\x00\\xffa");
		assert_eq!(b"_txn:1".to_vec().sprint(), "_txn:1");
	}
}
