//! # Wire Serialization
//!
//! Little-endian primitive encoding shared by snapshots and control messages.
//!
//! ## Design
//!
//! - Writer appends to a growable buffer (element blobs have no fixed bound)
//! - Reader never panics: every read is bounds-checked and returns a
//!   [`DirectLinkError::StreamError`] on truncation
//! - Counts and lengths use a 7-bit packed varint

use bytemuck::{bytes_of, Pod};

use crate::error::{DirectLinkError, DirectLinkResult};

/// Error text for reads past the end of the buffer.
const TRUNCATED: &str = "truncated buffer";

/// Appends wire-encoded values to a byte buffer.
#[derive(Clone, Debug, Default)]
pub struct WireWriter {
    buffer: Vec<u8>,
}

impl WireWriter {
    /// Creates an empty writer.
    #[must_use]
    pub const fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Creates a writer with preallocated capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Returns the number of bytes written.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if no bytes have been written.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Returns a slice of the written data.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Consumes the writer and returns its buffer.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Writes a single byte.
    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Writes a bool as one byte.
    #[inline]
    pub fn write_bool(&mut self, value: bool) {
        self.buffer.push(u8::from(value));
    }

    /// Writes a u32 in little-endian format.
    #[inline]
    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a u64 in little-endian format.
    #[inline]
    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a u128 in little-endian format.
    #[inline]
    pub fn write_u128(&mut self, value: u128) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes an i64 in little-endian format.
    #[inline]
    pub fn write_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a f64 in little-endian format.
    #[inline]
    pub fn write_f64(&mut self, value: f64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a f32 in little-endian format.
    #[inline]
    pub fn write_f32(&mut self, value: f32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a Pod type directly.
    #[inline]
    pub fn write_pod<T: Pod>(&mut self, value: &T) {
        self.buffer.extend_from_slice(bytes_of(value));
    }

    /// Writes a count as a 7-bit packed varint.
    #[allow(clippy::cast_possible_truncation)] // masked to 7 bits
    pub fn write_packed(&mut self, mut value: u32) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buffer.push(byte);
                return;
            }
            self.buffer.push(byte | 0x80);
        }
    }

    /// Writes a collection length as a packed count.
    ///
    /// Lengths above `u32::MAX` are not representable on the wire.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_len(&mut self, len: usize) {
        debug_assert!(u32::try_from(len).is_ok(), "length {len} exceeds the wire limit");
        self.write_packed(len as u32);
    }

    /// Writes a length-prefixed byte blob.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_len(bytes.len());
        self.buffer.extend_from_slice(bytes);
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }
}

/// Reads wire-encoded values from a borrowed buffer.
pub struct WireReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> WireReader<'a> {
    /// Creates a new reader over a buffer.
    #[must_use]
    pub const fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, position: 0 }
    }

    /// Returns the number of bytes remaining.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Returns the current read offset.
    #[inline]
    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }

    /// Takes the next `len` bytes.
    pub fn read_raw(&mut self, len: usize) -> DirectLinkResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(DirectLinkError::StreamError(TRUNCATED));
        }
        let slice = &self.buffer[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> DirectLinkResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_raw(N)?);
        Ok(out)
    }

    /// Reads a single byte.
    #[inline]
    pub fn read_u8(&mut self) -> DirectLinkResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Reads a bool encoded as one byte.
    #[inline]
    pub fn read_bool(&mut self) -> DirectLinkResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a u32 in little-endian format.
    #[inline]
    pub fn read_u32(&mut self) -> DirectLinkResult<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    /// Reads a u64 in little-endian format.
    #[inline]
    pub fn read_u64(&mut self) -> DirectLinkResult<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    /// Reads a u128 in little-endian format.
    #[inline]
    pub fn read_u128(&mut self) -> DirectLinkResult<u128> {
        self.read_array().map(u128::from_le_bytes)
    }

    /// Reads an i64 in little-endian format.
    #[inline]
    pub fn read_i64(&mut self) -> DirectLinkResult<i64> {
        self.read_array().map(i64::from_le_bytes)
    }

    /// Reads a f64 in little-endian format.
    #[inline]
    pub fn read_f64(&mut self) -> DirectLinkResult<f64> {
        self.read_array().map(f64::from_le_bytes)
    }

    /// Reads a f32 in little-endian format.
    #[inline]
    pub fn read_f32(&mut self) -> DirectLinkResult<f32> {
        self.read_array().map(f32::from_le_bytes)
    }

    /// Reads a Pod type directly.
    pub fn read_pod<T: Pod>(&mut self) -> DirectLinkResult<T> {
        let slice = self.read_raw(std::mem::size_of::<T>())?;
        bytemuck::try_pod_read_unaligned(slice)
            .map_err(|_| DirectLinkError::StreamError("misaligned pod"))
    }

    /// Reads a 7-bit packed varint.
    pub fn read_packed(&mut self) -> DirectLinkResult<u32> {
        let mut value: u32 = 0;
        for shift in (0..35).step_by(7) {
            let byte = self.read_u8()?;
            value |= u32::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(DirectLinkError::StreamError("packed integer overflow"))
    }

    /// Reads a length-prefixed byte blob.
    pub fn read_bytes(&mut self) -> DirectLinkResult<&'a [u8]> {
        let len = self.read_packed()? as usize;
        self.read_raw(len)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> DirectLinkResult<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DirectLinkError::StreamError("invalid utf-8"))
    }

    /// Fails unless the next byte equals `expected`.
    pub fn expect_u8(&mut self, expected: u8, what: &'static str) -> DirectLinkResult<()> {
        if self.read_u8()? == expected {
            Ok(())
        } else {
            Err(DirectLinkError::StreamError(what))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_boundaries() {
        let mut writer = WireWriter::new();
        for value in [0u32, 127, 128, 16_383, 16_384, u32::MAX] {
            writer.write_packed(value);
        }
        // 1 + 1 + 2 + 2 + 3 + 5
        assert_eq!(writer.len(), 14);

        let mut reader = WireReader::new(writer.as_slice());
        for value in [0u32, 127, 128, 16_383, 16_384, u32::MAX] {
            assert_eq!(reader.read_packed().unwrap(), value);
        }
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_truncated_read_is_an_error() {
        let mut reader = WireReader::new(&[1, 2, 3]);
        assert!(matches!(reader.read_u32(), Err(DirectLinkError::StreamError(_))));
        // A failed read consumes nothing.
        assert_eq!(reader.remaining(), 3);
    }

    #[test]
    fn test_oversized_blob_length_rejected() {
        let mut writer = WireWriter::new();
        writer.write_packed(1000);
        writer.write_u32(0);
        let mut reader = WireReader::new(writer.as_slice());
        assert!(reader.read_bytes().is_err());
    }

    #[test]
    fn test_little_endian_layout() {
        let mut writer = WireWriter::new();
        writer.write_u32(0x0403_0201);
        writer.write_str("ab");
        assert_eq!(writer.as_slice(), &[1, 2, 3, 4, 2, b'a', b'b']);
    }
}
