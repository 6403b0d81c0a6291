//! Documents returned from sampling scans.
use std::sync::Arc;

use crate::err::{Error, Result};
use crate::kvs::Key;
use crate::kvs::body::META_SIZE;

/// The value is JSON
pub const DATATYPE_JSON: u8 = 0x01;
/// The value is snappy compressed
pub const DATATYPE_SNAPPY: u8 = 0x02;
/// The value is prefixed with extended attributes
pub const DATATYPE_XATTR: u8 = 0x04;

/// The metadata stored alongside a document
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DocumentMeta {
	pub flags: u32,
	pub expiration: u32,
	pub seqno: u64,
	pub cas: u64,
	pub datatype: u8,
}

impl DocumentMeta {
	pub fn decode(meta: &[u8; META_SIZE]) -> Self {
		let u32_at = |i: usize| u32::from_be_bytes([meta[i], meta[i + 1], meta[i + 2], meta[i + 3]]);
		let u64_at = |i: usize| (u64::from(u32_at(i)) << 32) | u64::from(u32_at(i + 4));
		Self {
			flags: u32_at(0),
			expiration: u32_at(4),
			seqno: u64_at(8),
			cas: u64_at(16),
			datatype: meta[24],
		}
	}

	pub fn encode(&self) -> [u8; META_SIZE] {
		let mut out = [0u8; META_SIZE];
		out[0..4].copy_from_slice(&self.flags.to_be_bytes());
		out[4..8].copy_from_slice(&self.expiration.to_be_bytes());
		out[8..16].copy_from_slice(&self.seqno.to_be_bytes());
		out[16..24].copy_from_slice(&self.cas.to_be_bytes());
		out[24] = self.datatype;
		out
	}

	pub fn is_json(&self) -> bool {
		self.datatype & DATATYPE_JSON != 0
	}

	/// Whether the body must be snappy decompressed before use. Bodies are
	/// returned exactly as the server sent them.
	pub fn is_compressed(&self) -> bool {
		self.datatype & DATATYPE_SNAPPY != 0
	}

	pub fn has_xattrs(&self) -> bool {
		self.datatype & DATATYPE_XATTR != 0
	}
}

/// A document returned from a sampling scan
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Document {
	pub key: Key,
	pub meta: DocumentMeta,
	pub body: Vec<u8>,
}

impl Document {
	/// Encode a document as a buffer record. The key is prefixed with its
	/// length as a 2 byte big endian integer, and is followed by the raw
	/// metadata and the body.
	pub(crate) fn record(key: &[u8], meta: &[u8], body: &[u8]) -> Option<Vec<u8>> {
		let len = u16::try_from(key.len()).ok()?;
		if meta.len() != META_SIZE {
			return None;
		}
		let mut out = Vec::with_capacity(2 + key.len() + META_SIZE + body.len());
		out.extend_from_slice(&len.to_be_bytes());
		out.extend_from_slice(key);
		out.extend_from_slice(meta);
		out.extend_from_slice(body);
		Some(out)
	}

	/// Decode a buffer record written by [`Document::record`]
	pub(crate) fn from_record(record: &[u8]) -> Result<Self> {
		let corrupt = || Error::Spill(Arc::new(std::io::Error::other("corrupt document record")));
		let (len, rest) = record.split_first_chunk::<2>().ok_or_else(corrupt)?;
		let len = u16::from_be_bytes(*len) as usize;
		if rest.len() < len + META_SIZE {
			return Err(corrupt());
		}
		let (key, rest) = rest.split_at(len);
		let (meta, body) = rest.split_at(META_SIZE);
		let meta: &[u8; META_SIZE] = meta.try_into().map_err(|_| corrupt())?;
		Ok(Self {
			key: key.to_vec(),
			meta: DocumentMeta::decode(meta),
			body: body.to_vec(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decodes_metadata() {
		let meta = DocumentMeta {
			flags: 0x0200_0006,
			expiration: 3600,
			seqno: 42,
			cas: 0x1781_2a5f_0000_0001,
			datatype: DATATYPE_JSON | DATATYPE_XATTR,
		};
		let raw = meta.encode();
		assert_eq!(&raw[0..4], &[0x02, 0x00, 0x00, 0x06]);
		assert_eq!(raw[24], 0x05);
		let decoded = DocumentMeta::decode(&raw);
		assert_eq!(decoded, meta);
		assert!(decoded.is_json());
		assert!(decoded.has_xattrs());
		assert!(!decoded.is_compressed());
	}

	#[test]
	fn buffer_records() {
		let meta = DocumentMeta {
			cas: 9,
			datatype: DATATYPE_JSON,
			..Default::default()
		};
		let record = Document::record(b"doc-1", &meta.encode(), br#"{"a":1}"#).unwrap();
		assert_eq!(&record[0..2], &[0x00, 0x05]);
		let doc = Document::from_record(&record).unwrap();
		assert_eq!(doc.key, b"doc-1");
		assert_eq!(doc.meta, meta);
		assert_eq!(doc.body, br#"{"a":1}"#);
		// Truncated records and oversized keys are rejected
		assert!(Document::from_record(&record[..10]).is_err());
		assert!(Document::from_record(&[0x00]).is_err());
		assert!(Document::record(&vec![b'k'; 70_000], &meta.encode(), b"").is_none());
	}
}
