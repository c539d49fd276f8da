//! Growable byte accumulator for reassembling frames from a byte stream.
//!
//! Capacity starts at 16 bytes and doubles as needed. [`ByteList::shift`] moves the remainder
//! to the front and never releases capacity.

const INITIAL_CAPACITY: usize = 16;

#[derive(Debug)]
pub struct ByteList {
    buffer: Vec<u8>,
    len: usize,
}

impl Default for ByteList {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteList {
    pub fn new() -> Self {
        Self {
            buffer: vec![0u8; INITIAL_CAPACITY],
            len: 0,
        }
    }

    /// Append bytes, growing to the next power of two that fits.
    pub fn push(&mut self, data: &[u8]) {
        let new_len = self.len + data.len();
        if new_len > self.buffer.len() {
            self.buffer.resize(new_len.next_power_of_two(), 0);
        }
        self.buffer[self.len..new_len].copy_from_slice(data);
        self.len = new_len;
    }

    /// Discard the first `size` bytes. Shifting more than [`ByteList::len`] empties the list.
    pub fn shift(&mut self, size: usize) {
        let size = size.min(self.len);
        self.buffer.copy_within(size..self.len, 0);
        self.len -= size;
    }

    /// Live content.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// Owned snapshot of the live content.
    #[cfg(test)]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }
}
