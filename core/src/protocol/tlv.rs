//! TLV (type-length-value) sub-encoding for envelope payloads
//!
//! Standard fields use `type:u8, length:u16 (BE), value`. File-content fields
//! use a 4-byte length so a single value can exceed 64 KiB; which types are
//! "wide" is declared by the reader, since width is a property of the schema,
//! not the stream. Unknown types are skippable, preserving forward
//! compatibility.

use super::ProtocolError;

/// Incremental TLV writer over a growing byte buffer.
#[derive(Debug, Default)]
pub struct TlvWriter {
    buf: Vec<u8>,
}

impl TlvWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append a standard field (u16 length). Panics in debug builds if the
    /// value exceeds u16 range; callers size standard fields well below it.
    pub fn put(&mut self, tlv_type: u8, value: &[u8]) -> &mut Self {
        debug_assert!(value.len() <= u16::MAX as usize);
        self.buf.push(tlv_type);
        self.buf
            .extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(value);
        self
    }

    /// Append a wide field (u32 length), used for file content.
    pub fn put_wide(&mut self, tlv_type: u8, value: &[u8]) -> &mut Self {
        self.buf.push(tlv_type);
        self.buf
            .extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(value);
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// A single decoded field, borrowing from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvField<'a> {
    pub tlv_type: u8,
    pub value: &'a [u8],
}

/// Validating TLV reader. Every declared length is checked against the
/// remaining buffer before the value is touched, so decode cost is bounded
/// by the input size and never by attacker-controlled loops.
#[derive(Debug)]
pub struct TlvReader<'a> {
    buf: &'a [u8],
    pos: usize,
    /// Types whose length field is u32 instead of u16.
    wide_types: &'a [u8],
}

impl<'a> TlvReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            wide_types: &[],
        }
    }

    /// Reader that treats `wide_types` as having 4-byte length fields.
    pub fn with_wide_types(buf: &'a [u8], wide_types: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            wide_types,
        }
    }

    /// Read the next field, or `Ok(None)` at end of buffer.
    pub fn next_field(&mut self) -> Result<Option<TlvField<'a>>, ProtocolError> {
        if self.pos == self.buf.len() {
            return Ok(None);
        }
        let start = self.pos;
        let tlv_type = self.buf[self.pos];
        self.pos += 1;

        let len = if self.wide_types.contains(&tlv_type) {
            let bytes = self
                .buf
                .get(self.pos..self.pos + 4)
                .ok_or(ProtocolError::MalformedTlv(start))?;
            self.pos += 4;
            u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
        } else {
            let bytes = self
                .buf
                .get(self.pos..self.pos + 2)
                .ok_or(ProtocolError::MalformedTlv(start))?;
            self.pos += 2;
            u16::from_be_bytes([bytes[0], bytes[1]]) as usize
        };

        let value = self
            .buf
            .get(self.pos..self.pos + len)
            .ok_or(ProtocolError::MalformedTlv(start))?;
        self.pos += len;

        Ok(Some(TlvField { tlv_type, value }))
    }

    /// Scan the buffer for the first field of the given type, skipping
    /// (and validating) everything else.
    pub fn find(buf: &'a [u8], tlv_type: u8) -> Result<Option<&'a [u8]>, ProtocolError> {
        let mut reader = TlvReader::new(buf);
        while let Some(field) = reader.next_field()? {
            if field.tlv_type == tlv_type {
                return Ok(Some(field.value));
            }
        }
        Ok(None)
    }
}
