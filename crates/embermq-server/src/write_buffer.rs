//! Per-session outbound byte buffer.
//!
//! The engine writes encoded packets here; the event loop drains the
//! buffer to the socket when it is writable. Crossing the soft limit is
//! the engine's "would block" signal: scheduled publishes stop and the
//! affected in-flight entries keep their state until the buffer drains.
//! Protocol acks bypass the soft limit so a slow reader cannot wedge a
//! QoS flow, but nothing may grow the buffer past the hard cap.

use std::io::{self, Write};

/// Above this many buffered bytes, publish writes report "would block".
pub const SOFT_LIMIT: usize = 1024 * 1024;

/// Hard cap; exceeding it is treated as resource exhaustion.
pub const HARD_LIMIT: usize = 16 * 1024 * 1024;

/// Growable byte queue with a read cursor.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    buf: Vec<u8>,
    /// Bytes before `pos` have already been flushed.
    pos: usize,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes waiting to be flushed.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// May the engine schedule another publish into this buffer?
    #[inline]
    pub fn writable(&self) -> bool {
        self.len() < SOFT_LIMIT
    }

    /// Append an encoded packet, honoring only the hard cap.
    pub fn push(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.len() + bytes.len() > HARD_LIMIT {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "client write buffer exceeded hard limit",
            ));
        }
        // Reclaim the flushed prefix before growing.
        if self.pos > 0 && (self.pos >= 4096 || self.pos == self.buf.len()) {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Flush as much as possible into `w`.
    ///
    /// Returns `Ok(true)` when the buffer was fully drained, `Ok(false)`
    /// on a would-block. A zero-length write is reported as `WriteZero`
    /// so the caller can treat the peer as gone.
    pub fn flush_to<W: Write>(&mut self, w: &mut W) -> io::Result<bool> {
        while self.pos < self.buf.len() {
            match w.write(&self.buf[self.pos..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "peer closed"));
                }
                Ok(n) => self.pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.buf.clear();
        self.pos = 0;
        Ok(true)
    }

    /// Remove and return everything buffered. Test support.
    pub fn drain_all(&mut self) -> Vec<u8> {
        let out = self.buf.split_off(self.pos);
        self.buf.clear();
        self.pos = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_drain() {
        let mut wb = WriteBuffer::new();
        assert!(wb.is_empty());
        wb.push(b"abc").unwrap();
        wb.push(b"def").unwrap();
        assert_eq!(wb.len(), 6);
        assert_eq!(wb.drain_all(), b"abcdef");
        assert!(wb.is_empty());
    }

    #[test]
    fn test_flush_to_writer() {
        let mut wb = WriteBuffer::new();
        wb.push(b"hello world").unwrap();
        let mut sink = Vec::new();
        assert!(wb.flush_to(&mut sink).unwrap());
        assert_eq!(sink, b"hello world");
        assert!(wb.is_empty());
    }

    #[test]
    fn test_partial_flush() {
        struct Two;
        impl Write for Two {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                if buf.len() > 2 {
                    Ok(2)
                } else {
                    Err(io::Error::new(io::ErrorKind::WouldBlock, "full"))
                }
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let mut wb = WriteBuffer::new();
        wb.push(b"abcd").unwrap();
        assert!(!wb.flush_to(&mut Two).unwrap());
        assert_eq!(wb.len(), 2);
        assert_eq!(wb.drain_all(), b"cd");
    }

    #[test]
    fn test_soft_limit_gates_writable() {
        let mut wb = WriteBuffer::new();
        wb.push(&vec![0u8; SOFT_LIMIT]).unwrap();
        assert!(!wb.writable());
        // Acks may still be pushed past the soft limit.
        wb.push(b"ack").unwrap();
    }

    #[test]
    fn test_hard_limit_is_an_error() {
        let mut wb = WriteBuffer::new();
        wb.push(&vec![0u8; HARD_LIMIT]).unwrap();
        assert!(wb.push(b"x").is_err());
    }
}
