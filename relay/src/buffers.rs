//! Fixed-capacity buffers for the relay's connections. Both are allocated once when a connection
//!  is accepted and never grow, which bounds the relay's memory usage by the number of
//!  connections.
//!
//! The buffers do their own non-blocking I/O through `Read` / `Write` so that the bookkeeping
//!  can be tested without sockets. A `WouldBlock` result ends a fill or drain and is not treated
//!  as an error.

use std::io::{ErrorKind, Read, Write};

/// Result of reading from a non-blocking source until it has no more data or the buffer is full
#[derive(Debug)]
pub enum FillOutcome {
    /// the reader returned `WouldBlock` after this many bytes
    Drained(usize),
    /// the buffer is full after this many bytes; the reader may have more data
    Full(usize),
    /// the peer closed the connection (after this many bytes)
    Closed(usize),
    Failed(std::io::Error),
}

/// Result of writing buffered data to a non-blocking destination
#[derive(Debug)]
pub enum DrainOutcome {
    /// everything was written, and the buffer is empty now
    Flushed(usize),
    /// the writer returned `WouldBlock` after this many bytes
    Blocked(usize),
    Failed(std::io::Error),
}

/// Receive buffer. Valid data always starts at offset 0: consuming data from the front moves the
///  remainder to the start of the buffer.
pub struct InboundBuffer {
    buf: Vec<u8>,
    bytes_in: usize,
}

impl InboundBuffer {
    pub fn new(capacity: usize) -> InboundBuffer {
        InboundBuffer {
            buf: vec![0; capacity],
            bytes_in: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.bytes_in
    }

    pub fn is_empty(&self) -> bool {
        self.bytes_in == 0
    }

    pub fn is_full(&self) -> bool {
        self.bytes_in == self.capacity()
    }

    /// Removes `len` bytes from the front, moving the remaining data to offset 0.
    pub fn consume(&mut self, len: usize) {
        assert!(len <= self.bytes_in, "consuming {} bytes with only {} buffered", len, self.bytes_in);
        self.buf.copy_within(len..self.bytes_in, 0);
        self.bytes_in -= len;
    }

    pub fn fill_from(&mut self, reader: &mut impl Read) -> FillOutcome {
        let mut total = 0;

        while self.bytes_in < self.capacity() {
            match reader.read(&mut self.buf[self.bytes_in..]) {
                Ok(0) => return FillOutcome::Closed(total),
                Ok(n) => {
                    self.bytes_in += n;
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return FillOutcome::Drained(total),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return FillOutcome::Failed(e),
            }
        }
        FillOutcome::Full(total)
    }

    #[cfg(test)]
    pub fn put_slice(&mut self, data: &[u8]) {
        self.buf[self.bytes_in..self.bytes_in + data.len()].copy_from_slice(data);
        self.bytes_in += data.len();
    }
}

impl AsRef<[u8]> for InboundBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.bytes_in]
    }
}

/// Send buffer. `bytes_out` is the number of bytes already written to the peer, `bytes_left`
///  the end of the buffered data. Both are reset to 0 once everything is written; if a frame
///  needs the space in front of `bytes_out` before that, the pending data is moved to offset 0.
pub struct OutboundBuffer {
    buf: Vec<u8>,
    bytes_out: usize,
    bytes_left: usize,
}

impl OutboundBuffer {
    pub fn new(capacity: usize) -> OutboundBuffer {
        OutboundBuffer {
            buf: vec![0; capacity],
            bytes_out: 0,
            bytes_left: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// number of buffered bytes that were not written yet
    pub fn pending(&self) -> usize {
        self.bytes_left - self.bytes_out
    }

    pub fn has_pending(&self) -> bool {
        self.bytes_left > 0
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.pending()
    }

    /// Appends a frame. The caller must have checked that there is enough free space.
    pub fn enqueue(&mut self, data: &[u8]) {
        assert!(data.len() <= self.free(), "enqueueing {} bytes with only {} free", data.len(), self.free());

        if self.bytes_left + data.len() > self.capacity() {
            self.buf.copy_within(self.bytes_out..self.bytes_left, 0);
            self.bytes_left -= self.bytes_out;
            self.bytes_out = 0;
        }

        self.buf[self.bytes_left..self.bytes_left + data.len()].copy_from_slice(data);
        self.bytes_left += data.len();
    }

    pub fn drain_into(&mut self, writer: &mut impl Write) -> DrainOutcome {
        let mut total = 0;

        while self.bytes_out < self.bytes_left {
            match writer.write(&self.buf[self.bytes_out..self.bytes_left]) {
                Ok(0) => return DrainOutcome::Failed(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.bytes_out += n;
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return DrainOutcome::Blocked(total),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return DrainOutcome::Failed(e),
            }
        }

        self.bytes_out = 0;
        self.bytes_left = 0;
        DrainOutcome::Flushed(total)
    }

    #[cfg(test)]
    pub fn pending_data(&self) -> &[u8] {
        &self.buf[self.bytes_out..self.bytes_left]
    }
}

#[cfg(test)]
pub mod test_io {
    use std::collections::VecDeque;
    use std::io::{ErrorKind, Read, Write};

    /// A reader that hands out scripted chunks, returning `WouldBlock` when it runs out
    pub struct ChunkedReader {
        pub chunks: VecDeque<Vec<u8>>,
        pub closed: bool,
    }
    impl ChunkedReader {
        pub fn new(chunks: Vec<Vec<u8>>) -> ChunkedReader {
            ChunkedReader { chunks: chunks.into(), closed: false }
        }
    }
    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let Some(chunk) = self.chunks.front_mut() else {
                return if self.closed { Ok(0) } else { Err(ErrorKind::WouldBlock.into()) };
            };

            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            chunk.drain(..n);
            if chunk.is_empty() {
                self.chunks.pop_front();
            }
            Ok(n)
        }
    }

    /// A writer that accepts at most `budget` bytes before returning `WouldBlock`, and at most
    ///  `max_per_write` per call
    pub struct ThrottledWriter {
        pub written: Vec<u8>,
        pub budget: usize,
        pub max_per_write: usize,
        pub fail: bool,
    }
    impl ThrottledWriter {
        pub fn new(budget: usize, max_per_write: usize) -> ThrottledWriter {
            ThrottledWriter { written: Vec::new(), budget, max_per_write, fail: false }
        }
    }
    impl Write for ThrottledWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.fail {
                return Err(ErrorKind::BrokenPipe.into());
            }
            if self.budget == 0 {
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget).min(self.max_per_write);
            self.written.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_io::*;
    use super::*;

    #[test]
    fn test_inbound_consume_compacts() {
        let mut buf = InboundBuffer::new(16);
        buf.put_slice(b"hello world");

        buf.consume(6);
        assert_eq!(buf.as_ref(), b"world");
        assert_eq!(buf.len(), 5);

        buf.consume(5);
        assert!(buf.is_empty());
    }

    #[test]
    #[should_panic]
    fn test_inbound_consume_too_much() {
        let mut buf = InboundBuffer::new(16);
        buf.put_slice(b"abc");
        buf.consume(4);
    }

    #[test]
    fn test_fill_drained() {
        let mut buf = InboundBuffer::new(16);
        let mut reader = ChunkedReader::new(vec![b"ab".to_vec(), b"cde".to_vec()]);

        assert!(matches!(buf.fill_from(&mut reader), FillOutcome::Drained(5)));
        assert_eq!(buf.as_ref(), b"abcde");
        assert!(matches!(buf.fill_from(&mut reader), FillOutcome::Drained(0)));
    }

    #[test]
    fn test_fill_full() {
        let mut buf = InboundBuffer::new(4);
        let mut reader = ChunkedReader::new(vec![b"abcdef".to_vec()]);

        assert!(matches!(buf.fill_from(&mut reader), FillOutcome::Full(4)));
        assert!(buf.is_full());
        assert!(matches!(buf.fill_from(&mut reader), FillOutcome::Full(0)));

        buf.consume(3);
        assert!(matches!(buf.fill_from(&mut reader), FillOutcome::Drained(2)));
        assert_eq!(buf.as_ref(), b"def");
    }

    #[test]
    fn test_fill_closed() {
        let mut buf = InboundBuffer::new(16);
        let mut reader = ChunkedReader::new(vec![b"xy".to_vec()]);
        reader.closed = true;

        assert!(matches!(buf.fill_from(&mut reader), FillOutcome::Closed(2)));
        assert_eq!(buf.as_ref(), b"xy");
    }

    #[test]
    fn test_outbound_drain() {
        let mut buf = OutboundBuffer::new(16);
        buf.enqueue(b"0123456789");
        assert_eq!(buf.pending(), 10);
        assert_eq!(buf.free(), 6);

        let mut writer = ThrottledWriter::new(4, 3);
        assert!(matches!(buf.drain_into(&mut writer), DrainOutcome::Blocked(4)));
        assert_eq!(writer.written, b"0123");
        assert_eq!(buf.pending_data(), b"456789");
        assert!(buf.has_pending());

        writer.budget = 100;
        assert!(matches!(buf.drain_into(&mut writer), DrainOutcome::Flushed(6)));
        assert_eq!(writer.written, b"0123456789");
        assert!(!buf.has_pending());
        assert_eq!(buf.free(), 16);
    }

    #[test]
    fn test_outbound_enqueue_reuses_written_space() {
        let mut buf = OutboundBuffer::new(10);
        buf.enqueue(b"abcdefgh");

        let mut writer = ThrottledWriter::new(6, 100);
        assert!(matches!(buf.drain_into(&mut writer), DrainOutcome::Blocked(6)));
        assert_eq!(buf.free(), 8);

        buf.enqueue(b"12345678");
        assert_eq!(buf.pending_data(), b"gh12345678");
        assert_eq!(buf.free(), 0);
    }

    #[test]
    #[should_panic]
    fn test_outbound_enqueue_overflow() {
        let mut buf = OutboundBuffer::new(4);
        buf.enqueue(b"12345");
    }

    #[test]
    fn test_outbound_drain_failure() {
        let mut buf = OutboundBuffer::new(16);
        buf.enqueue(b"abc");

        let mut writer = ThrottledWriter::new(100, 100);
        writer.fail = true;
        assert!(matches!(buf.drain_into(&mut writer), DrainOutcome::Failed(_)));
        assert_eq!(buf.pending(), 3);
    }
}
