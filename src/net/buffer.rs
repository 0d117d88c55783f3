//! Packet buffer implementation
//!
//! Provides little-endian read/write access to inter-server frames:
//! - `PacketReader`: a bounds-checked cursor over a received frame. Every read
//!   returns a `ProtocolError` instead of touching bytes past the frame end.
//! - `PacketWriter`: an append-only builder for outbound frames with support
//!   for patching the length field of variable-length frames.

use bytes::{BufMut, BytesMut};

use crate::error::ProtocolError;

type BufResult<T> = std::result::Result<T, ProtocolError>;

/// Bounds-checked little-endian reader over a byte slice
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Create a reader positioned at the start of `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    // ============ Properties ============

    /// Total length of the underlying slice
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the underlying slice is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Move the cursor to an absolute offset
    pub fn seek(&mut self, offset: usize) -> BufResult<()> {
        self.check(offset, 0)?;
        self.pos = offset;
        Ok(())
    }

    fn check(&self, offset: usize, len: usize) -> BufResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(ProtocolError::OutOfBounds {
                offset,
                len,
                available: self.data.len(),
            }),
        }
    }

    fn take(&mut self, len: usize) -> BufResult<&'a [u8]> {
        self.check(self.pos, len)?;
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    // ============ Sequential reads ============

    /// Read a fixed-width, NUL-padded string field
    pub fn read_fixed_string(&mut self, width: usize) -> BufResult<String> {
        let raw = self.take(width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    // ============ Absolute reads ============

    /// Read an unsigned byte at `offset` without moving the cursor
    pub fn u8_at(&self, offset: usize) -> BufResult<u8> {
        self.check(offset, 1)?;
        Ok(self.data[offset])
    }

    /// Read an unsigned little-endian short at `offset`
    pub fn u16_at(&self, offset: usize) -> BufResult<u16> {
        self.check(offset, 2)?;
        Ok(u16::from_le_bytes([self.data[offset], self.data[offset + 1]]))
    }

    /// Read an unsigned little-endian int at `offset`
    pub fn u32_at(&self, offset: usize) -> BufResult<u32> {
        self.check(offset, 4)?;
        let b = &self.data[offset..offset + 4];
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Borrow `len` bytes at `offset`
    pub fn bytes_at(&self, offset: usize, len: usize) -> BufResult<&'a [u8]> {
        self.check(offset, len)?;
        Ok(&self.data[offset..offset + len])
    }
}

/// Little-endian frame builder
#[derive(Debug, Clone, Default)]
pub struct PacketWriter {
    data: BytesMut,
}

impl PacketWriter {
    /// Create a writer with the given capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
        }
    }

    /// Start a frame with the given opcode
    pub fn frame(opcode: u16, capacity: usize) -> Self {
        let mut writer = Self::with_capacity(capacity);
        writer.write_u16(opcode);
        writer
    }

    /// Start a variable-length frame; the length at offset 2 is patched by `finish_variable`
    pub fn variable_frame(opcode: u16, capacity: usize) -> Self {
        let mut writer = Self::frame(opcode, capacity);
        writer.write_u16(0);
        writer
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    // ============ Writing Methods ============

    pub fn write_u8(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.data.put_u16_le(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.data.put_u32_le(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.data.put_i32_le(value);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Write `value` into a fixed-width, NUL-padded field (truncated to `width`)
    pub fn write_fixed_string(&mut self, value: &str, width: usize) {
        let bytes = value.as_bytes();
        let len = bytes.len().min(width);
        self.data.extend_from_slice(&bytes[..len]);
        self.data.put_bytes(0, width - len);
    }

    /// Overwrite a little-endian short at `offset`
    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Consume the writer and return the frame bytes
    pub fn finish(self) -> Vec<u8> {
        self.data.to_vec()
    }

    /// Patch the total length at offset 2 and return the frame bytes.
    ///
    /// Fails when the frame no longer fits its 2-byte length field.
    pub fn finish_variable(mut self) -> BufResult<Vec<u8>> {
        let len = u16::try_from(self.data.len()).map_err(|_| ProtocolError::FrameTooLarge {
            size: self.data.len(),
            max: u16::MAX as usize,
        })?;
        self.patch_u16(2, len);
        Ok(self.finish())
    }
}
