//! Dual on-wire dataset form.
//!
//! Two independent codecs share one in-memory representation:
//! - the modern form: a little-endian `u16` version header followed by a
//!   JSON body;
//! - the legacy v3 form: a hand-rolled little-endian binary layout kept for
//!   peers that predate the versioned JSON body. Name and object strings are
//!   written as separate fields and friend attachments as a flat
//!   `(element, alias)` pair sequence. The v3 layout cannot carry entry
//!   lists; encoding drops them while the in-memory dataset keeps them, so
//!   state never round-trips through the lossy form in memory.
//!
//! Decoding dispatches on the version field; a dataset decoded from a v3
//! payload has `write_v3` set so replies stay readable by the old peer.

use pfw_common::{PfwError, Result};

use crate::dataset::Dataset;
use crate::element::{DatasetElement, FriendElement};

/// Wire version written by the modern codec.
pub const WIRE_VERSION: u16 = 5;

/// Highest version handled by the legacy binary codec.
pub const LEGACY_VERSION: u16 = 3;

/// Encode `dataset` in the form selected by its `write_v3` flag.
pub fn encode_dataset(dataset: &Dataset) -> Result<Vec<u8>> {
    if dataset.write_v3 {
        return Ok(encode_v3(dataset));
    }
    let mut out = WIRE_VERSION.to_le_bytes().to_vec();
    let body = serde_json::to_vec(dataset)
        .map_err(|e| PfwError::Protocol(format!("encode dataset failed: {e}")))?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a dataset from either wire form.
pub fn decode_dataset(bytes: &[u8]) -> Result<Dataset> {
    if bytes.len() < 2 {
        return Err(PfwError::Protocol(
            "dataset payload shorter than version header".to_string(),
        ));
    }
    let version = u16::from_le_bytes([bytes[0], bytes[1]]);
    if version <= LEGACY_VERSION {
        let mut reader = Reader::new(&bytes[2..]);
        let mut ds = decode_v3(&mut reader)?;
        ds.write_v3 = true;
        return Ok(ds);
    }
    if version != WIRE_VERSION {
        return Err(PfwError::Protocol(format!(
            "unsupported dataset wire version {version}"
        )));
    }
    let mut ds: Dataset = serde_json::from_slice(&bytes[2..])
        .map_err(|e| PfwError::Protocol(format!("decode dataset failed: {e}")))?;
    ds.write_v3 = false;
    Ok(ds)
}

fn encode_v3(dataset: &Dataset) -> Vec<u8> {
    let mut out = LEGACY_VERSION.to_le_bytes().to_vec();
    write_string(&mut out, &dataset.name);
    write_string(&mut out, &dataset.directory);
    write_string(&mut out, &dataset.object_name);
    out.extend_from_slice(&(dataset.elements.len() as u32).to_le_bytes());
    for e in &dataset.elements {
        encode_element_v3(&mut out, e);
    }
    out.push(dataset.is_tree as u8);
    out
}

fn encode_element_v3(out: &mut Vec<u8>, e: &DatasetElement) {
    out.extend_from_slice(&LEGACY_VERSION.to_le_bytes());
    // The old layout carried the file name and the object name as two
    // leading standalone strings.
    write_string(out, &e.file_url);
    write_string(out, &e.object_name);
    write_string(out, &e.directory);
    out.extend_from_slice(&e.first.to_le_bytes());
    out.extend_from_slice(&e.num.to_le_bytes());
    out.extend_from_slice(&e.dataset_offset.to_le_bytes());
    // v3 has no entry-list payload; the marker is always absent.
    out.push(0);
    out.push(e.valid as u8);
    out.extend_from_slice(&e.entries.to_le_bytes());
    out.extend_from_slice(&(e.friends.len() as u32).to_le_bytes());
    for f in &e.friends {
        encode_element_v3(out, &f.element);
        write_string(out, &f.alias);
    }
    // Unused boolean the old form carried; filled with its default.
    out.push(0);
}

fn decode_v3(r: &mut Reader<'_>) -> Result<Dataset> {
    let name = r.read_string()?;
    let directory = r.read_string()?;
    let object_name = r.read_string()?;
    let count = r.read_u32()? as usize;
    let mut elements = Vec::with_capacity(count);
    for _ in 0..count {
        elements.push(decode_element_v3(r)?);
    }
    let is_tree = r.read_u8()? != 0;
    let mut ds = Dataset::new(&name, &object_name, &directory, is_tree);
    ds.elements = elements;
    Ok(ds)
}

fn decode_element_v3(r: &mut Reader<'_>) -> Result<DatasetElement> {
    let version = r.read_u16()?;
    if version > LEGACY_VERSION {
        return Err(PfwError::Protocol(format!(
            "element version {version} inside legacy dataset payload"
        )));
    }
    let file_url = r.read_string()?;
    let object_name = r.read_string()?;
    let directory = r.read_string()?;
    let first = r.read_i64()?;
    let num = r.read_i64()?;
    let dataset_offset = r.read_i64()?;
    let list_marker = r.read_u8()?;
    if list_marker != 0 {
        return Err(PfwError::Protocol(
            "legacy dataset payload carries an entry-list body".to_string(),
        ));
    }
    let valid = r.read_u8()? != 0;
    let entries = r.read_i64()?;
    let friend_count = r.read_u32()? as usize;
    let mut friends = Vec::with_capacity(friend_count);
    for _ in 0..friend_count {
        let element = decode_element_v3(r)?;
        let alias = r.read_string()?;
        friends.push(FriendElement { element, alias });
    }
    r.read_u8()?; // unused legacy boolean

    let mut e = DatasetElement::new(&file_url, &object_name, &directory, first, num);
    e.dataset_offset = dataset_offset;
    e.valid = valid;
    e.entries = entries;
    e.friends = friends;
    Ok(e)
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(truncated)?;
        if end > self.buf.len() {
            return Err(truncated());
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_le_bytes(raw))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| PfwError::Protocol("non-utf8 string in legacy payload".to_string()))
    }
}

fn truncated() -> PfwError {
    PfwError::Protocol("truncated legacy dataset payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modern_header_precedes_json_body() {
        let ds = Dataset::new("d", "events", "/", true);
        let bytes = encode_dataset(&ds).expect("encode");
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), WIRE_VERSION);
        assert_eq!(bytes[2], b'{');
    }

    #[test]
    fn unknown_version_is_a_protocol_error() {
        let bytes = 9_u16.to_le_bytes().to_vec();
        assert!(matches!(
            decode_dataset(&bytes),
            Err(PfwError::Protocol(_))
        ));
    }

    #[test]
    fn truncated_legacy_payload_is_rejected() {
        let mut ds = Dataset::new("d", "events", "/", true);
        ds.write_v3 = true;
        let mut bytes = encode_dataset(&ds).expect("encode");
        bytes.truncate(bytes.len() - 1);
        assert!(decode_dataset(&bytes).is_err());
    }
}
