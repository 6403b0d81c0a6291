use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tempfile::{Builder, NamedTempFile};

use crate::cnf::{TEMP_DIRECTORY, TEMP_STORAGE_QUOTA};

const TARGET: &str = "vbscan::core::kvs::temp";

/// A budget for the temporary files used to spill scan results to disk
pub trait TempStorage: Send + Sync + 'static {
	/// Create a new temporary file whose name begins with the given prefix
	fn create_temp(&self, prefix: &str) -> io::Result<NamedTempFile>;

	/// Account for bytes written to a temporary file. Returns false if the
	/// write would exceed the quota, in which case nothing is accounted.
	fn use_temp(&self, path: &Path, bytes: u64) -> bool;

	/// Return bytes previously accounted to a temporary file
	fn release_temp(&self, path: &Path, bytes: u64);
}

/// A process wide temporary storage quota
#[derive(Debug)]
pub struct TempQuota {
	dir: PathBuf,
	limit: Option<u64>,
	used: AtomicU64,
	files: Mutex<HashMap<PathBuf, u64>>,
}

impl Default for TempQuota {
	fn default() -> Self {
		let dir = TEMP_DIRECTORY.clone().unwrap_or_else(std::env::temp_dir);
		Self::new(dir, *TEMP_STORAGE_QUOTA)
	}
}

impl TempQuota {
	/// Create a quota for files in a directory, optionally limited in size
	pub fn new(dir: impl Into<PathBuf>, limit: Option<u64>) -> Self {
		Self {
			dir: dir.into(),
			limit,
			used: AtomicU64::new(0),
			files: Mutex::new(HashMap::new()),
		}
	}
	/// The directory in which temporary files are created
	pub fn dir(&self) -> &Path {
		&self.dir
	}
	/// The number of bytes currently accounted
	pub fn used(&self) -> u64 {
		self.used.load(Ordering::Acquire)
	}
	/// The number of bytes accounted to a single file
	pub fn file_usage(&self, path: &Path) -> u64 {
		self.files.lock().get(path).copied().unwrap_or(0)
	}
}

impl TempStorage for TempQuota {
	fn create_temp(&self, prefix: &str) -> io::Result<NamedTempFile> {
		Builder::new().prefix(prefix).tempfile_in(&self.dir)
	}

	fn use_temp(&self, path: &Path, bytes: u64) -> bool {
		// Reserve the bytes against the global quota
		let reserved = self.used.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
			let next = used.checked_add(bytes)?;
			match self.limit {
				Some(limit) if next > limit => None,
				_ => Some(next),
			}
		});
		if reserved.is_err() {
			debug!(target: TARGET, path = %path.display(), bytes, "Temporary storage quota exceeded");
			return false;
		}
		// Account the bytes to the file
		*self.files.lock().entry(path.to_path_buf()).or_default() += bytes;
		true
	}

	fn release_temp(&self, path: &Path, bytes: u64) {
		// Never release more than was accounted to the file
		let released = {
			let mut files = self.files.lock();
			match files.get_mut(path) {
				Some(usage) => {
					let released = bytes.min(*usage);
					*usage -= released;
					if *usage == 0 {
						files.remove(path);
					}
					released
				}
				None => 0,
			}
		};
		self.used.fetch_sub(released, Ordering::AcqRel);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn quota_is_enforced() {
		let dir = temp_dir::TempDir::new().unwrap();
		let quota = TempQuota::new(dir.path(), Some(100));
		let file = quota.create_temp("test-").unwrap();
		assert!(quota.use_temp(file.path(), 60));
		assert!(!quota.use_temp(file.path(), 60));
		assert_eq!(quota.used(), 60);
		assert!(quota.use_temp(file.path(), 40));
		assert_eq!(quota.file_usage(file.path()), 100);
		quota.release_temp(file.path(), 70);
		assert_eq!(quota.used(), 30);
		// Releasing more than was used is clamped
		quota.release_temp(file.path(), 1000);
		assert_eq!(quota.used(), 0);
		assert_eq!(quota.file_usage(file.path()), 0);
	}

	#[test]
	fn unlimited_quota() {
		let dir = temp_dir::TempDir::new().unwrap();
		let quota = TempQuota::new(dir.path(), None);
		let file = quota.create_temp("test-").unwrap();
		assert!(file.path().starts_with(dir.path()));
		assert!(quota.use_temp(file.path(), u64::MAX / 2));
	}
}
