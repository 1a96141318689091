//! Growable message buffer
//!
//! One type serves both directions of a framed connection. The input side
//! fills it from a socket up to a target length and clears it after each
//! message; the output side appends framed replies, grows in whole blocks
//! when a reply does not fit, and compacts after partial sends.

use crate::error::{Error, Result};
use std::io::{self, Read};

#[derive(Debug)]
pub struct MessageBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl MessageBuffer {
    /// Allocate a buffer with a fixed logical capacity
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)?;
        Ok(Self { data, capacity })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free space before the buffer has to grow
    pub fn available(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Append bytes without growing
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.available() {
            return Err(Error::BufferFull {
                needed: bytes.len(),
                available: self.available(),
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Grow so that `additional` more bytes fit
    ///
    /// The new capacity is rounded to a multiple of `block`. Returns the new
    /// capacity; on allocation failure the buffer is left unchanged.
    pub fn grow_for(&mut self, additional: usize, block: usize) -> Result<usize> {
        if additional <= self.available() {
            return Ok(self.capacity);
        }
        let block = block.max(1);
        let new_capacity = (self.capacity + additional + block) / block * block;
        self.data
            .try_reserve_exact(new_capacity - self.data.len())?;
        self.capacity = new_capacity;
        Ok(new_capacity)
    }

    /// Append bytes, growing in `block` steps if they do not fit
    pub fn append_growing(&mut self, bytes: &[u8], block: usize) -> Result<()> {
        self.grow_for(bytes.len(), block)?;
        self.append(bytes)
    }

    /// Discard the first `count` bytes, keeping the rest in order
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.data.len());
        self.data.drain(..count);
    }

    /// Read from `reader` until the buffer holds `target` bytes
    ///
    /// Performs a single read call. Returns the number of bytes read, which
    /// is zero when the peer has closed the stream.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R, target: usize) -> io::Result<usize> {
        let target = target.min(self.capacity);
        let start = self.data.len();
        if start >= target {
            return Ok(0);
        }

        self.data.resize(target, 0);
        match reader.read(&mut self.data[start..target]) {
            Ok(read) => {
                self.data.truncate(start + read);
                Ok(read)
            }
            Err(e) => {
                self.data.truncate(start);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_append_respects_capacity() {
        let mut buf = MessageBuffer::with_capacity(8).unwrap();
        buf.append(b"12345").unwrap();
        assert_eq!(buf.available(), 3);

        let err = buf.append(b"6789").unwrap_err();
        assert!(matches!(
            err,
            Error::BufferFull {
                needed: 4,
                available: 3
            }
        ));
        assert_eq!(buf.as_slice(), b"12345");
    }

    #[test]
    fn test_grow_rounds_to_block() {
        let mut buf = MessageBuffer::with_capacity(4096).unwrap();
        buf.append(&[0u8; 4000]).unwrap();

        let capacity = buf.grow_for(200, 4096).unwrap();
        assert_eq!(capacity, 8192);
        assert_eq!(capacity % 4096, 0);
        assert!(buf.available() >= 200);

        // Already fits, nothing changes
        assert_eq!(buf.grow_for(100, 4096).unwrap(), 8192);
    }

    #[test]
    fn test_append_growing() {
        let mut buf = MessageBuffer::with_capacity(16).unwrap();
        buf.append_growing(&[7u8; 100], 64).unwrap();
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.capacity() % 64, 0);
        assert!(buf.capacity() >= 100);
    }

    #[test]
    fn test_consume_compacts_in_order() {
        let mut buf = MessageBuffer::with_capacity(32).unwrap();
        buf.append(b"abcdefgh").unwrap();
        buf.consume(3);
        assert_eq!(buf.as_slice(), b"defgh");
        buf.append(b"ij").unwrap();
        assert_eq!(buf.as_slice(), b"defghij");
        buf.consume(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_fill_from_stops_at_target() {
        let mut buf = MessageBuffer::with_capacity(64).unwrap();
        let mut source = Cursor::new(b"0123456789".to_vec());

        assert_eq!(buf.fill_from(&mut source, 4).unwrap(), 4);
        assert_eq!(buf.as_slice(), b"0123");
        assert_eq!(buf.fill_from(&mut source, 4).unwrap(), 0);
        assert_eq!(buf.fill_from(&mut source, 16).unwrap(), 6);
        assert_eq!(buf.as_slice(), b"0123456789");

        // Exhausted source reports end of stream
        assert_eq!(buf.fill_from(&mut source, 16).unwrap(), 0);
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_fill_from_clamps_to_capacity() {
        let mut buf = MessageBuffer::with_capacity(4).unwrap();
        let mut source = Cursor::new(vec![1u8; 10]);
        assert_eq!(buf.fill_from(&mut source, 10).unwrap(), 4);
        assert_eq!(buf.available(), 0);
    }
}
