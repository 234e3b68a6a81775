//! Fixed-size circular byte buffer between a blocking reader and a decoder

use std::io::{self, Read};

use bytes::BytesMut;

use super::decode::TextDecoder;

/// Result of one [`RingByteBuffer::decode`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingDecode {
    /// UTF-8 bytes appended to the destination
    pub written: usize,
    /// No raw bytes remain (and, when final, the decoder was flushed)
    pub exhausted: bool,
}

/// Circular raw-byte buffer
///
/// `read == write` is ambiguous on its own; `has_data` tells full from empty.
pub struct RingByteBuffer {
    data: Box<[u8]>,
    read: usize,
    write: usize,
    has_data: bool,
}

impl RingByteBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity.max(1)].into_boxed_slice(),
            read: 0,
            write: 0,
            has_data: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn has_data(&self) -> bool {
        self.has_data
    }

    /// Raw bytes waiting to be decoded
    pub fn len(&self) -> usize {
        if !self.has_data {
            0
        } else if self.write > self.read {
            self.write - self.read
        } else {
            self.capacity() - self.read + self.write
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.has_data
    }

    pub fn is_full(&self) -> bool {
        self.has_data && self.read == self.write
    }

    /// Perform at most one read into the contiguous unwritten region.
    ///
    /// Returns `false` only when the reader reports end of stream. A full
    /// buffer returns `true` without reading.
    pub fn fill<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<bool> {
        if self.is_full() {
            return Ok(true);
        }
        if !self.has_data {
            self.read = 0;
            self.write = 0;
        }

        let cap = self.capacity();
        let end = if self.write >= self.read { cap } else { self.read };
        let region = &mut self.data[self.write..end];

        let n = loop {
            match reader.read(region) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        if n == 0 {
            return Ok(false);
        }

        self.write += n;
        if self.write == cap {
            self.write = 0;
        }
        self.has_data = true;
        Ok(true)
    }

    /// Feed unread bytes through `decoder` into the spare capacity of `out`
    /// until `out` is full or the ring is drained.
    pub fn decode(
        &mut self,
        decoder: &mut dyn TextDecoder,
        out: &mut BytesMut,
        is_final: bool,
    ) -> RingDecode {
        let cap = self.capacity();
        let mut written = 0;

        while self.has_data {
            let end = if self.write > self.read { self.write } else { cap };
            let decoded = decoder.decode(&self.data[self.read..end], out);
            written += decoded.written;
            if decoded.consumed == 0 {
                break;
            }

            self.read += decoded.consumed;
            if self.read == cap {
                self.read = 0;
            }
            if self.read == self.write {
                self.has_data = false;
            }
        }

        let mut exhausted = !self.has_data;
        if exhausted && is_final {
            match decoder.finish(out) {
                Some(n) => written += n,
                None => exhausted = false,
            }
        }

        RingDecode { written, exhausted }
    }
}

impl std::fmt::Debug for RingByteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingByteBuffer")
            .field("capacity", &self.capacity())
            .field("read", &self.read)
            .field("write", &self.write)
            .field("has_data", &self.has_data)
            .finish()
    }
}
