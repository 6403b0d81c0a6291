//! The entries carried in the body of a range scan response.
//!
//! A key scan returns a stream of keys, each prefixed with its length encoded
//! as an unsigned LEB128 integer. A document scan returns a stream of
//! documents, each made up of a fixed size metadata block followed by the
//! LEB128 length prefixed key and the LEB128 length prefixed value.
use std::ops::Range;

/// The size of the metadata block preceding each document
pub const META_SIZE: usize = 25;

/// The byte ranges of one document within a response body
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocSpan {
	pub meta: Range<usize>,
	pub key: Range<usize>,
	pub value: Range<usize>,
}

/// Decode a length prefix, advancing the position past it
fn read_len(body: &[u8], pos: &mut usize) -> Result<usize, String> {
	let mut len: u64 = 0;
	let mut shift = 0;
	loop {
		let Some(&byte) = body.get(*pos) else {
			return Err(format!("truncated length at offset {pos}"));
		};
		*pos += 1;
		if shift >= 64 {
			return Err(format!("length overflow at offset {pos}"));
		}
		len |= u64::from(byte & 0x7f) << shift;
		if byte & 0x80 == 0 {
			break;
		}
		shift += 7;
	}
	usize::try_from(len).map_err(|_| format!("length {len} too large"))
}

/// Decode a length prefixed field, returning its byte range
fn read_field(body: &[u8], pos: &mut usize) -> Result<Range<usize>, String> {
	let len = read_len(body, pos)?;
	let start = *pos;
	let end = start.checked_add(len).filter(|end| *end <= body.len());
	let Some(end) = end else {
		return Err(format!("field of length {len} at offset {start} exceeds the body"));
	};
	*pos = end;
	Ok(start..end)
}

fn write_len(out: &mut Vec<u8>, len: usize) {
	let mut len = len as u64;
	loop {
		let byte = (len & 0x7f) as u8;
		len >>= 7;
		if len == 0 {
			out.push(byte);
			break;
		}
		out.push(byte | 0x80);
	}
}

/// Split a response body into the byte ranges of each key it contains
pub fn parse_keys(body: &[u8]) -> Result<Vec<Range<usize>>, String> {
	let mut keys = Vec::new();
	let mut pos = 0;
	while pos < body.len() {
		keys.push(read_field(body, &mut pos)?);
	}
	Ok(keys)
}

/// Encode a list of keys into a response body
pub fn encode_keys<'a>(keys: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
	let mut out = Vec::new();
	for key in keys {
		write_len(&mut out, key.len());
		out.extend_from_slice(key);
	}
	out
}

/// Split a response body into the byte ranges of each document it contains
pub fn parse_documents(body: &[u8]) -> Result<Vec<DocSpan>, String> {
	let mut docs = Vec::new();
	let mut pos = 0;
	while pos < body.len() {
		let meta = pos..pos + META_SIZE;
		if meta.end > body.len() {
			return Err(format!("truncated document metadata at offset {pos}"));
		}
		pos = meta.end;
		let key = read_field(body, &mut pos)?;
		let value = read_field(body, &mut pos)?;
		docs.push(DocSpan {
			meta,
			key,
			value,
		});
	}
	Ok(docs)
}

/// Encode a list of documents, given as metadata, key, and value, into a
/// response body
pub fn encode_documents<'a>(
	docs: impl IntoIterator<Item = (&'a [u8; META_SIZE], &'a [u8], &'a [u8])>,
) -> Vec<u8> {
	let mut out = Vec::new();
	for (meta, key, value) in docs {
		out.extend_from_slice(meta);
		write_len(&mut out, key.len());
		out.extend_from_slice(key);
		write_len(&mut out, value.len());
		out.extend_from_slice(value);
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_multi_byte_lengths() {
		let long = vec![b'x'; 300];
		let body = encode_keys([b"a".as_slice(), long.as_slice(), b"".as_slice()]);
		assert_eq!(&body[2..4], &[0xac, 0x02]);
		let keys = parse_keys(&body).unwrap();
		assert_eq!(keys.len(), 3);
		assert_eq!(&body[keys[0].clone()], b"a");
		assert_eq!(&body[keys[1].clone()], long.as_slice());
		assert!(keys[2].is_empty());
	}

	#[test]
	fn rejects_truncated_bodies() {
		assert!(parse_keys(&[0x05, b'a', b'b']).is_err());
		assert!(parse_keys(&[0x80]).is_err());
		assert!(parse_keys(&[]).unwrap().is_empty());
	}

	#[test]
	fn parses_documents() {
		let meta = [7u8; META_SIZE];
		let value = vec![b'v'; 200];
		let body = encode_documents([
			(&meta, b"k1".as_slice(), value.as_slice()),
			(&meta, b"k2".as_slice(), b"{}".as_slice()),
		]);
		let docs = parse_documents(&body).unwrap();
		assert_eq!(docs.len(), 2);
		assert_eq!(docs[0].meta, 0..META_SIZE);
		assert_eq!(&body[docs[0].key.clone()], b"k1");
		assert_eq!(&body[docs[0].value.clone()], value.as_slice());
		assert_eq!(&body[docs[1].meta.clone()], &meta);
		assert_eq!(&body[docs[1].key.clone()], b"k2");
		assert_eq!(&body[docs[1].value.clone()], b"{}");
		// A body cut short inside the metadata or the value is rejected
		assert!(parse_documents(&body[..10]).is_err());
		assert!(parse_documents(&body[..body.len() - 1]).is_err());
	}
}
