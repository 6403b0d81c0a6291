use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use tempfile::NamedTempFile;

use crate::cnf::SPILL_READ_BUFFER;
use crate::err::{Error, Result};
use crate::kvs::Key;
use crate::kvs::temp::TempStorage;

const TARGET: &str = "vbscan::core::scan::spill";

const LEN_SIZE: u64 = 4;

/// An append only buffer of keys, or encoded documents, for one shard scan.
///
/// Records are held in memory until the buffer grows beyond its threshold, at
/// which point the buffered records are flushed to a lazily created
/// temporary file and every further record is appended to that file. Each
/// record is stored as a 4 byte big endian length followed by its bytes, and
/// the cumulative end offset of every record is tracked so that any record
/// can be found without scanning.
pub(crate) struct SpillBuffer {
	temp: Arc<dyn TempStorage>,
	threshold: usize,
	/// The name prefix of the spill file
	prefix: String,
	memory: Vec<u8>,
	file: Option<SpillFile>,
	/// The end offset of each record
	offsets: Vec<u64>,
	/// The index of the next record to read
	cursor: usize,
}

struct SpillFile {
	file: NamedTempFile,
	writer: BufWriter<File>,
	reader: Option<(BufReader<File>, u64)>,
	/// The number of bytes accounted against the temporary storage quota
	accounted: u64,
}

impl SpillBuffer {
	pub(crate) fn new(temp: Arc<dyn TempStorage>, threshold: usize, prefix: String) -> Self {
		Self {
			temp,
			threshold,
			prefix,
			memory: Vec::new(),
			file: None,
			offsets: Vec::new(),
			cursor: 0,
		}
	}

	/// The total number of records in the buffer
	pub(crate) fn len(&self) -> usize {
		self.offsets.len()
	}

	/// The number of records which have not yet been read
	pub(crate) fn remaining(&self) -> usize {
		self.offsets.len() - self.cursor
	}

	/// The total size in bytes of all records in the buffer
	pub(crate) fn size(&self) -> u64 {
		self.offsets.last().copied().unwrap_or(0)
	}

	/// Whether the records have been spilled to disk
	pub(crate) fn is_spilled(&self) -> bool {
		self.file.is_some()
	}

	/// Append a key to the end of the buffer
	pub(crate) fn push(&mut self, key: &[u8]) -> Result<()> {
		let len = u32::try_from(key.len()).map_err(|_| {
			Error::Spill(Arc::new(std::io::Error::other("key too large for spill record")))
		})?;
		let record = LEN_SIZE + u64::from(len);
		let end = self.size() + record;
		// Check if this record still fits in memory
		if self.file.is_none() && self.memory.len() as u64 + record <= self.threshold as u64 {
			self.memory.extend_from_slice(&len.to_be_bytes());
			self.memory.extend_from_slice(key);
			self.offsets.push(end);
			return Ok(());
		}
		// Create the spill file and move the memory buffer into it
		if self.file.is_none() {
			let file = self.temp.create_temp(&self.prefix)?;
			let writer = BufWriter::new(file.reopen()?);
			trace!(target: TARGET, path = %file.path().display(), "Spilling scan buffer to disk");
			let mut spill = SpillFile {
				file,
				writer,
				reader: None,
				accounted: 0,
			};
			if !self.memory.is_empty() {
				spill.write(self.temp.as_ref(), &self.memory)?;
				self.memory = Vec::new();
			}
			self.file = Some(spill);
		}
		// Append the record to the spill file
		if let Some(spill) = self.file.as_mut() {
			let mut bytes = Vec::with_capacity(record as usize);
			bytes.extend_from_slice(&len.to_be_bytes());
			bytes.extend_from_slice(key);
			spill.write(self.temp.as_ref(), &bytes)?;
		}
		self.offsets.push(end);
		Ok(())
	}

	/// Position the read cursor at the n-th record
	pub(crate) fn seek(&mut self, n: usize) {
		self.cursor = n.min(self.offsets.len());
	}

	/// Skip over up to n unread records, returning how many were skipped
	pub(crate) fn skip(&mut self, n: usize) -> usize {
		let skipped = n.min(self.remaining());
		self.seek(self.cursor + skipped);
		skipped
	}

	/// Read the next unread record
	pub(crate) fn next(&mut self) -> Result<Option<Key>> {
		if self.cursor >= self.offsets.len() {
			return Ok(None);
		}
		let start = match self.cursor {
			0 => 0,
			n => self.offsets[n - 1],
		};
		let end = self.offsets[self.cursor];
		self.cursor += 1;
		let key = match self.file.as_mut() {
			None => self.memory[(start + LEN_SIZE) as usize..end as usize].to_vec(),
			Some(spill) => spill.read(start, end)?,
		};
		Ok(Some(key))
	}

	/// Read up to n unread records
	pub(crate) fn take(&mut self, n: usize) -> Result<Vec<Key>> {
		let mut keys = Vec::with_capacity(n.min(self.remaining()));
		while keys.len() < n {
			match self.next()? {
				Some(key) => keys.push(key),
				None => break,
			}
		}
		Ok(keys)
	}

	/// Discard every record, keeping any spill file open for reuse
	pub(crate) fn truncate(&mut self) -> Result<()> {
		self.memory.clear();
		self.offsets.clear();
		self.cursor = 0;
		if let Some(spill) = self.file.as_mut() {
			spill.truncate(self.temp.as_ref())?;
		}
		Ok(())
	}
}

impl Drop for SpillBuffer {
	fn drop(&mut self) {
		if let Some(spill) = self.file.take() {
			self.temp.release_temp(spill.file.path(), spill.accounted);
		}
	}
}

impl SpillFile {
	fn write(&mut self, temp: &dyn TempStorage, bytes: &[u8]) -> Result<()> {
		// Account for the bytes before writing them
		if !temp.use_temp(self.file.path(), bytes.len() as u64) {
			return Err(Error::TempQuotaExceeded);
		}
		self.accounted += bytes.len() as u64;
		self.writer.write_all(bytes)?;
		Ok(())
	}

	fn read(&mut self, start: u64, end: u64) -> Result<Key> {
		// Ensure all written records are visible to the reader
		self.writer.flush()?;
		let (reader, pos) = match self.reader.as_mut() {
			Some(reader) => reader,
			None => {
				let file = self.file.reopen()?;
				self.reader.insert((BufReader::with_capacity(*SPILL_READ_BUFFER, file), 0))
			}
		};
		if *pos != start {
			reader.seek(SeekFrom::Start(start))?;
		}
		let mut len = [0u8; LEN_SIZE as usize];
		reader.read_exact(&mut len)?;
		let len = u32::from_be_bytes(len) as u64;
		if start + LEN_SIZE + len != end {
			return Err(Error::Spill(Arc::new(std::io::Error::other("corrupt spill record"))));
		}
		let mut key = vec![0u8; len as usize];
		reader.read_exact(&mut key)?;
		*pos = end;
		Ok(key)
	}

	fn truncate(&mut self, temp: &dyn TempStorage) -> Result<()> {
		self.writer.flush()?;
		self.file.as_file().set_len(0)?;
		self.writer.seek(SeekFrom::Start(0))?;
		self.reader = None;
		temp.release_temp(self.file.path(), self.accounted);
		self.accounted = 0;
		Ok(())
	}
}
