// Structural check of yrs v1 payloads before they reach the decoder.
//
// The walk follows the v1 layout field by field and refuses anything the
// decoder would read unchecked: non UTF-8 strings, clocks that overflow,
// counts larger than the bytes left to hold them, and nesting deeper than
// the relay is willing to recurse.

use thiserror::Error;

/// Deepest `Any` nesting accepted inside one value.
pub const MAX_ANY_DEPTH: usize = 64;

/// Upper bound for any clock or clock range end.
pub const MAX_CLOCK: u64 = (u32::MAX / 2) as u64;

const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;

const BLOCK_GC: u8 = 0;
const BLOCK_SKIP: u8 = 10;

const CONTENT_DELETED: u8 = 1;
const CONTENT_JSON: u8 = 2;
const CONTENT_BINARY: u8 = 3;
const CONTENT_STRING: u8 = 4;
const CONTENT_EMBED: u8 = 5;
const CONTENT_FORMAT: u8 = 6;
const CONTENT_TYPE: u8 = 7;
const CONTENT_ANY: u8 = 8;

const TYPE_XML_ELEMENT: u8 = 3;
const TYPE_XML_TEXT: u8 = 6;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InspectError {
    #[error("payload ends early at byte {0}")]
    Truncated(usize),
    #[error("varint at byte {0} is too long")]
    VarIntTooLong(usize),
    #[error("string at byte {0} is not valid UTF-8")]
    InvalidUtf8(usize),
    #[error("count {count} at byte {at} exceeds the remaining payload")]
    CountTooLarge { at: usize, count: u64 },
    #[error("clock overflows at byte {0}")]
    ClockOverflow(usize),
    #[error("unsupported content kind {0}")]
    UnsupportedContent(u8),
    #[error("unsupported shared type {0}")]
    UnsupportedType(u8),
    #[error("unknown value tag {0}")]
    UnknownTag(u8),
    #[error("values nested deeper than {MAX_ANY_DEPTH}")]
    TooDeep,
}

/// Cursor over a byte slice reading lib0 primitives.
struct BytesReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BytesReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8, InspectError> {
        let byte = *self.buf.get(self.pos).ok_or(InspectError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn skip(&mut self, len: usize) -> Result<&'a [u8], InspectError> {
        if len > self.remaining() {
            return Err(InspectError::Truncated(self.pos));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_uleb128(&mut self, max_bytes: usize) -> Result<u64, InspectError> {
        let start = self.pos;
        let mut value: u64 = 0;
        for index in 0..max_bytes {
            let byte = self.read_u8()?;
            value |= u64::from(byte & 0x7f) << (7 * index);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(InspectError::VarIntTooLong(start))
    }

    fn read_u32(&mut self) -> Result<u32, InspectError> {
        let start = self.pos;
        let value = self.read_uleb128(5)?;
        u32::try_from(value).map_err(|_| InspectError::VarIntTooLong(start))
    }

    fn read_u64(&mut self) -> Result<u64, InspectError> {
        let start = self.pos;
        let value = self.read_uleb128(10)?;
        if self.pos - start == 10 && self.buf[self.pos - 1] > 1 {
            return Err(InspectError::VarIntTooLong(start));
        }
        Ok(value)
    }

    /// Signed lib0 varint: six data bits in the first byte.
    fn read_i64(&mut self) -> Result<(), InspectError> {
        let start = self.pos;
        let mut byte = self.read_u8()?;
        let mut read = 1;
        while byte & 0x80 != 0 {
            if read == 9 {
                return Err(InspectError::VarIntTooLong(start));
            }
            byte = self.read_u8()?;
            read += 1;
        }
        Ok(())
    }

    /// A count of items that each take at least `min_size` bytes.
    fn read_count(&mut self, min_size: usize, wide: bool) -> Result<u64, InspectError> {
        let at = self.pos;
        let count = if wide { self.read_u64()? } else { u64::from(self.read_u32()?) };
        if count.saturating_mul(min_size as u64) > self.remaining() as u64 {
            return Err(InspectError::CountTooLarge { at, count });
        }
        Ok(count)
    }

    fn read_var_bytes(&mut self) -> Result<&'a [u8], InspectError> {
        let at = self.pos;
        let len = self.read_u32()? as usize;
        if len > self.remaining() {
            return Err(InspectError::CountTooLarge { at, count: len as u64 });
        }
        self.skip(len)
    }

    fn read_str(&mut self) -> Result<&'a str, InspectError> {
        let at = self.pos;
        let bytes = self.read_var_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| InspectError::InvalidUtf8(at))
    }

    fn read_id(&mut self) -> Result<(), InspectError> {
        self.read_u32()?;
        let at = self.pos;
        clock_in_range(u64::from(self.read_u32()?), at)
    }
}

fn clock_in_range(clock: u64, at: usize) -> Result<(), InspectError> {
    if clock > MAX_CLOCK {
        Err(InspectError::ClockOverflow(at))
    } else {
        Ok(())
    }
}

/// Check a v1 update.
pub fn inspect_update(update: &[u8]) -> Result<(), InspectError> {
    let mut reader = BytesReader::new(update);

    let clients = reader.read_count(3, false)?;
    for _ in 0..clients {
        let blocks = reader.read_count(1, false)?;
        reader.read_u32()?;
        let at = reader.pos;
        let mut clock = u64::from(reader.read_u32()?);
        clock_in_range(clock, at)?;
        for _ in 0..blocks {
            let at = reader.pos;
            clock += block(&mut reader)?;
            clock_in_range(clock, at)?;
        }
    }

    delete_set(&mut reader)
}

/// Check a v1 state vector.
pub fn inspect_state_vector(state_vector: &[u8]) -> Result<(), InspectError> {
    let mut reader = BytesReader::new(state_vector);
    let entries = reader.read_count(2, false)?;
    for _ in 0..entries {
        reader.read_u64()?;
        let at = reader.pos;
        clock_in_range(u64::from(reader.read_u32()?), at)?;
    }
    Ok(())
}

/// Returns the number of clock ticks the block occupies.
fn block(reader: &mut BytesReader<'_>) -> Result<u64, InspectError> {
    let info = reader.read_u8()?;
    match info {
        BLOCK_SKIP | BLOCK_GC => Ok(u64::from(reader.read_u32()?)),
        info => {
            if info & HAS_ORIGIN != 0 {
                reader.read_id()?;
            }
            if info & HAS_RIGHT_ORIGIN != 0 {
                reader.read_id()?;
            }
            if info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0 {
                if reader.read_u32()? == 1 {
                    reader.read_str()?;
                } else {
                    reader.read_id()?;
                }
                if info & HAS_PARENT_SUB != 0 {
                    reader.read_str()?;
                }
            }
            content(reader, info & 0b1111)
        }
    }
}

fn content(reader: &mut BytesReader<'_>, kind: u8) -> Result<u64, InspectError> {
    match kind {
        CONTENT_DELETED => Ok(u64::from(reader.read_u32()?)),
        CONTENT_JSON => {
            // One more string than the stored count.
            let count = reader.read_count(1, false)?;
            for _ in 0..=count {
                reader.read_str()?;
            }
            Ok(count + 1)
        }
        CONTENT_BINARY => {
            reader.read_var_bytes()?;
            Ok(1)
        }
        CONTENT_STRING => Ok(reader.read_str()?.encode_utf16().count() as u64),
        CONTENT_EMBED => {
            reader.read_str()?;
            Ok(1)
        }
        CONTENT_FORMAT => {
            reader.read_str()?;
            reader.read_str()?;
            Ok(1)
        }
        CONTENT_TYPE => {
            let type_ref = reader.read_u8()?;
            match type_ref {
                TYPE_XML_ELEMENT => {
                    reader.read_str()?;
                }
                0..=TYPE_XML_TEXT => {}
                other => return Err(InspectError::UnsupportedType(other)),
            }
            Ok(1)
        }
        CONTENT_ANY => {
            let count = reader.read_count(1, false)?;
            for _ in 0..count {
                value(reader, 0)?;
            }
            Ok(count)
        }
        other => Err(InspectError::UnsupportedContent(other)),
    }
}

fn value(reader: &mut BytesReader<'_>, depth: usize) -> Result<(), InspectError> {
    if depth >= MAX_ANY_DEPTH {
        return Err(InspectError::TooDeep);
    }
    match reader.read_u8()? {
        120 | 121 | 126 | 127 => {}
        125 => reader.read_i64()?,
        124 => {
            reader.skip(4)?;
        }
        122 | 123 => {
            reader.skip(8)?;
        }
        119 => {
            reader.read_str()?;
        }
        118 => {
            let entries = reader.read_count(2, true)?;
            for _ in 0..entries {
                reader.read_str()?;
                value(reader, depth + 1)?;
            }
        }
        117 => {
            let items = reader.read_count(1, true)?;
            for _ in 0..items {
                value(reader, depth + 1)?;
            }
        }
        116 => {
            reader.read_var_bytes()?;
        }
        tag => return Err(InspectError::UnknownTag(tag)),
    }
    Ok(())
}

fn delete_set(reader: &mut BytesReader<'_>) -> Result<(), InspectError> {
    let clients = reader.read_count(2, false)?;
    for _ in 0..clients {
        reader.read_u32()?;
        let ranges = reader.read_count(2, false)?;
        for _ in 0..ranges {
            let at = reader.pos;
            let clock = u64::from(reader.read_u32()?);
            let len = u64::from(reader.read_u32()?);
            clock_in_range(clock + len, at)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use yrs::updates::encoder::Encode;
    use yrs::{Doc, Map, ReadTxn, StateVector, Text, Transact};

    use super::*;

    fn sample_update() -> Vec<u8> {
        let doc = Doc::with_client_id(7);
        let nodes = doc.get_or_insert_map("nodes");
        let text = doc.get_or_insert_text("notes");
        {
            let mut txn = doc.transact_mut();
            nodes.insert(&mut txn, "users", "table users");
            nodes.insert(&mut txn, "orders", 42.0);
            text.insert(&mut txn, 0, "héllo 👋");
        }
        {
            let mut txn = doc.transact_mut();
            nodes.remove(&mut txn, "orders");
            text.remove_range(&mut txn, 1, 2);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    #[test]
    fn updates_from_a_real_document_pass() {
        inspect_update(&sample_update()).expect("encoder output is well formed");
        inspect_update(&[0, 0]).expect("empty update");
    }

    #[test]
    fn state_vectors_from_a_real_document_pass() {
        let doc = Doc::with_client_id(7);
        let nodes = doc.get_or_insert_map("nodes");
        nodes.insert(&mut doc.transact_mut(), "users", "table users");
        let state_vector = doc.transact().state_vector().encode_v1();
        inspect_state_vector(&state_vector).expect("encoder output is well formed");
    }

    #[test]
    fn skip_block_that_overflows_the_clock_is_refused() {
        let update = [1, 2, 1, 250, 255, 255, 255, 15, 0, 10, 0, 10, 0, 0];
        assert!(matches!(inspect_update(&update), Err(InspectError::ClockOverflow(_))));
    }

    #[test]
    fn invalid_utf8_in_a_string_item_is_refused() {
        // One client, one string item under the root type "m".
        let update = [1, 1, 1, 0, 4, 1, 1, b'm', 2, 0xff, 0xfe, 0, 0];
        assert_eq!(inspect_update(&update), Err(InspectError::InvalidUtf8(8)));
    }

    #[test]
    fn deep_nesting_is_refused() {
        let mut update = vec![1, 1, 1, 0, 8, 1, 1, b'm', 1];
        for _ in 0..100 {
            update.extend([117, 1]);
        }
        update.push(126);
        update.extend([0, 0]);
        assert_eq!(inspect_update(&update), Err(InspectError::TooDeep));
    }

    #[test]
    fn huge_counts_are_refused_before_allocation() {
        let update = [1, 1, 1, 0, 8, 1, 1, b'm', 1, 117, 0xff, 0xff, 0xff, 0xff, 0x0f];
        assert!(matches!(inspect_update(&update), Err(InspectError::CountTooLarge { .. })));
        let state_vector = [0xff, 0xff, 0xff, 0xff, 0x0f, 1, 1];
        assert!(matches!(
            inspect_state_vector(&state_vector),
            Err(InspectError::CountTooLarge { .. })
        ));
    }

    #[test]
    fn subdocuments_are_refused() {
        let update = [1, 1, 1, 0, 9, 1, 1, b'm', 0, 0, 0];
        assert_eq!(inspect_update(&update), Err(InspectError::UnsupportedContent(9)));
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = inspect_update(&bytes);
            let _ = inspect_state_vector(&bytes);
        }

        #[test]
        fn truncated_updates_are_refused_cleanly(cut in 0usize..64) {
            let update = sample_update();
            let cut = cut.min(update.len().saturating_sub(1));
            let _ = inspect_update(&update[..cut]);
        }
    }
}
