//! Little-endian binary writer/reader used by every command body.
//!
//! The writer collects chunks and concatenates them once in [`BinaryWriter::to_bytes`].
//! The reader is a cursor over a borrowed slice; every read advances the cursor or fails with
//! [`DrillError::OutOfBounds`] without moving it.
//!
//! Blocks are length-prefixed: `[u32 LE length][bytes]`.

use crate::error::{DrillError, DrillResult};
use uuid::Uuid;

/// Size of a packed UUID on the wire.
pub const UUID_SIZE: usize = 16;

/// Append-only byte writer.
#[derive(Debug, Default)]
pub struct BinaryWriter {
    parts: Vec<Vec<u8>>,
    len: usize,
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes.
    pub fn write(&mut self, data: &[u8]) {
        self.len += data.len();
        self.parts.push(data.to_vec());
    }

    /// Append `size` zero bytes.
    pub fn write_blank(&mut self, size: usize) {
        self.len += size;
        self.parts.push(vec![0u8; size]);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write(&[value]);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write(&value.to_le_bytes());
    }

    /// Append a length-prefixed block.
    ///
    /// Blocks longer than `u32::MAX` cannot be framed; callers keep chunks far below that.
    pub fn write_block(&mut self, data: &[u8]) {
        self.write_u32(data.len() as u32);
        self.write(data);
    }

    /// Append a UUID as its 16 raw bytes.
    pub fn write_uuid(&mut self, id: &Uuid) {
        self.write(id.as_bytes());
    }

    /// Total number of bytes written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Concatenate all written chunks.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for part in &self.parts {
            out.extend_from_slice(part);
        }
        out
    }
}

/// Cursor over an immutable byte buffer.
#[derive(Debug)]
pub struct BinaryReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Read exactly `size` bytes.
    pub fn read(&mut self, size: usize) -> DrillResult<&'a [u8]> {
        let end = self
            .position
            .checked_add(size)
            .filter(|end| *end <= self.buffer.len())
            .ok_or(DrillError::OutOfBounds)?;
        let data = &self.buffer[self.position..end];
        self.position = end;
        Ok(data)
    }

    fn read_array<const N: usize>(&mut self) -> DrillResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> DrillResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> DrillResult<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> DrillResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> DrillResult<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// Read a length-prefixed block. The cursor is left untouched on failure.
    pub fn read_block(&mut self) -> DrillResult<&'a [u8]> {
        let start = self.position;
        let len = self.read_u32()? as usize;
        let block = self.read(len);
        if block.is_err() {
            self.position = start;
        }
        block
    }

    pub fn read_uuid(&mut self) -> DrillResult<Uuid> {
        Ok(Uuid::from_bytes(self.read_array::<UUID_SIZE>()?))
    }

    /// Advance without reading.
    pub fn skip(&mut self, size: usize) -> DrillResult<()> {
        self.read(size).map(|_| ())
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }
}
