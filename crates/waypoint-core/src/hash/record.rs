//! Serialized join records
//!
//! ```text
//! u32  body length
//! u32  bitstring length | bitstring bytes (u64 little endian)
//! repeated, ascending slot order:
//!   u16 slot | u32 length | field bytes
//! ```
//!
//! Slots with no value are simply omitted, so readers must not assume a
//! fixed stride and must tolerate partial records.

use crate::chunk::{QueryIdSet, SlotId};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};

const BITSTRING_LEN: usize = 8;

/// Incremental writer for one record
#[derive(Debug)]
pub struct RecordBuilder {
    buf: BytesMut,
    last_slot: Option<SlotId>,
}

impl RecordBuilder {
    /// Start a record for tuples live for `bitstring`
    pub fn new(bitstring: QueryIdSet) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32_le(0);
        buf.put_u32_le(BITSTRING_LEN as u32);
        buf.put_u64_le(bitstring.bits());
        Self {
            buf,
            last_slot: None,
        }
    }

    /// Append a field. Slots must be strictly ascending.
    pub fn field(&mut self, slot: SlotId, bytes: &[u8]) -> Result<&mut Self> {
        if self.last_slot.is_some_and(|last| slot <= last) {
            return Err(Error::record(format!(
                "slot {slot} written after slot {:?}",
                self.last_slot
            )));
        }
        let len = u32::try_from(bytes.len())
            .map_err(|_| Error::record(format!("field for slot {slot} is too large")))?;
        self.buf.put_u16_le(slot);
        self.buf.put_u32_le(len);
        self.buf.put_slice(bytes);
        self.last_slot = Some(slot);
        Ok(self)
    }

    /// Seal the length prefix and return the encoded record
    pub fn finish(mut self) -> Vec<u8> {
        let body = (self.buf.len() - 4) as u32;
        self.buf[..4].copy_from_slice(&body.to_le_bytes());
        self.buf.to_vec()
    }
}

/// Borrowed, lazily decoded record
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    bitstring: QueryIdSet,
    fields: &'a [u8],
}

impl<'a> RecordView<'a> {
    /// Validate the framing of `bytes` and read the bitstring
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let mut cursor = bytes;
        if cursor.remaining() < 8 {
            return Err(Error::record("record shorter than its header"));
        }
        let body = cursor.get_u32_le() as usize;
        if body != cursor.remaining() {
            return Err(Error::record(format!(
                "record declares {body} bytes, has {}",
                cursor.remaining()
            )));
        }
        let bits_len = cursor.get_u32_le() as usize;
        if bits_len != BITSTRING_LEN || cursor.remaining() < bits_len {
            return Err(Error::record(format!("bad bitstring length {bits_len}")));
        }
        let bitstring = QueryIdSet::from_bits(cursor.get_u64_le());
        Ok(Self {
            bitstring,
            fields: cursor,
        })
    }

    /// Queries the stored tuple is live for
    pub fn bitstring(&self) -> QueryIdSet {
        self.bitstring
    }

    /// Bytes of one field, or `None` when the slot was not stored
    pub fn field(&self, slot: SlotId) -> Result<Option<&'a [u8]>> {
        for entry in self.fields() {
            let (s, bytes) = entry?;
            if s == slot {
                return Ok(Some(bytes));
            }
            if s > slot {
                break;
            }
        }
        Ok(None)
    }

    /// Iterate stored fields in slot order
    pub fn fields(&self) -> FieldIter<'a> {
        FieldIter { rest: self.fields }
    }
}

/// Iterator over `(slot, bytes)` fields of a record
pub struct FieldIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for FieldIter<'a> {
    type Item = Result<(SlotId, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < 6 {
            self.rest = &[];
            return Some(Err(Error::record("truncated field header")));
        }
        let mut cursor = self.rest;
        let slot = cursor.get_u16_le();
        let len = cursor.get_u32_le() as usize;
        if cursor.len() < len {
            self.rest = &[];
            return Some(Err(Error::record(format!(
                "field for slot {slot} needs {len} bytes, {} left",
                cursor.len()
            ))));
        }
        let (bytes, rest) = cursor.split_at(len);
        self.rest = rest;
        Some(Ok((slot, bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_read() {
        let mut builder = RecordBuilder::new(QueryIdSet::from_bits(0b101));
        builder.field(1, b"abc").unwrap().field(4, &[]).unwrap().field(9, &[7; 8]).unwrap();
        let bytes = builder.finish();

        let view = RecordView::parse(&bytes).unwrap();
        assert_eq!(view.bitstring(), QueryIdSet::from_bits(0b101));
        assert_eq!(view.field(1).unwrap(), Some(&b"abc"[..]));
        assert_eq!(view.field(4).unwrap(), Some(&[][..]));
        assert_eq!(view.field(9).unwrap(), Some(&[7u8; 8][..]));
        assert_eq!(view.field(2).unwrap(), None);
        assert_eq!(view.field(10).unwrap(), None);
        assert_eq!(view.fields().count(), 3);
    }

    #[test]
    fn test_slots_must_ascend() {
        let mut builder = RecordBuilder::new(QueryIdSet::EMPTY);
        builder.field(3, b"x").unwrap();
        assert!(builder.field(3, b"y").is_err());
        assert!(builder.field(2, b"y").is_err());
    }

    #[test]
    fn test_bitstring_only_record() {
        let bytes = RecordBuilder::new(QueryIdSet::from_bits(1)).finish();
        let view = RecordView::parse(&bytes).unwrap();
        assert_eq!(view.fields().count(), 0);
    }

    #[test]
    fn test_malformed_records() {
        assert!(RecordView::parse(&[1, 2, 3]).is_err());

        let mut builder = RecordBuilder::new(QueryIdSet::EMPTY);
        builder.field(0, b"hello").unwrap();
        let mut bytes = builder.finish();
        bytes.pop();
        assert!(RecordView::parse(&bytes).is_err());

        // consistent framing, but the field claims more than remains
        let mut forged = RecordBuilder::new(QueryIdSet::EMPTY).finish();
        forged.extend_from_slice(&0u16.to_le_bytes());
        forged.extend_from_slice(&100u32.to_le_bytes());
        let body = (forged.len() - 4) as u32;
        forged[..4].copy_from_slice(&body.to_le_bytes());
        let view = RecordView::parse(&forged).unwrap();
        assert!(view.field(0).is_err());
    }
}
