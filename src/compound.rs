//! Decode tables for compound (structured) elements
//!
//! A [`CompoundLayout`] lists the members of a record as `(name, offset,
//! size, decode)` entries. Decoding a record runs each member's decoder
//! over its byte range and assembles the result into a `T`. Member values
//! are stored with the byte order of the file, so decoders pick the
//! matching `from_le_bytes`/`from_be_bytes` themselves.

use crate::error::{H5Error, Result};
use std::fmt;

/// Writes one member, decoded from exactly `size` bytes, into the record
pub type MemberDecoder<T> = fn(&mut T, &[u8]) -> Result<()>;

/// One member of a compound record
pub struct CompoundMember<T> {
    pub name: String,
    pub offset: usize,
    pub size: usize,
    decode: MemberDecoder<T>,
}

impl<T> fmt::Debug for CompoundMember<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompoundMember")
            .field("name", &self.name)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

/// Member table of a compound element type
#[derive(Debug)]
pub struct CompoundLayout<T> {
    record_size: usize,
    members: Vec<CompoundMember<T>>,
}

impl<T: Default> CompoundLayout<T> {
    pub fn new(record_size: usize) -> Self {
        Self {
            record_size,
            members: Vec::new(),
        }
    }

    /// Add a member; its byte range must lie inside the record
    pub fn member(
        mut self,
        name: impl Into<String>,
        offset: usize,
        size: usize,
        decode: MemberDecoder<T>,
    ) -> Result<Self> {
        let name = name.into();

        if offset.checked_add(size).map_or(true, |end| end > self.record_size) {
            return Err(H5Error::InvalidFormat(format!(
                "member '{}' at {}..{} exceeds the {}-byte record",
                name,
                offset,
                offset.saturating_add(size),
                self.record_size
            )));
        }

        if self.members.iter().any(|m| m.name == name) {
            return Err(H5Error::InvalidFormat(format!(
                "duplicate compound member '{}'",
                name
            )));
        }

        self.members.push(CompoundMember {
            name,
            offset,
            size,
            decode,
        });
        Ok(self)
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn members(&self) -> &[CompoundMember<T>] {
        &self.members
    }

    /// Decode a single record of exactly `record_size` bytes
    pub fn decode_record(&self, bytes: &[u8]) -> Result<T> {
        if bytes.len() != self.record_size {
            return Err(H5Error::InvalidFormat(format!(
                "compound record has {} bytes, expected {}",
                bytes.len(),
                self.record_size
            )));
        }

        let mut record = T::default();
        for member in &self.members {
            (member.decode)(&mut record, &bytes[member.offset..member.offset + member.size])?;
        }
        Ok(record)
    }

    /// Decode a buffer of back-to-back records
    pub fn decode_all(&self, bytes: &[u8]) -> Result<Vec<T>> {
        if self.record_size == 0 || bytes.len() % self.record_size != 0 {
            return Err(H5Error::InvalidFormat(format!(
                "{} bytes is not a whole number of {}-byte records",
                bytes.len(),
                self.record_size
            )));
        }

        bytes
            .chunks_exact(self.record_size)
            .map(|record| self.decode_record(record))
            .collect()
    }
}

/// Fixed-length string member, trimmed at the first NUL
pub fn fixed_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
