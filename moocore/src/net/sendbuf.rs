//! Buffered sends with backpressure.
//!
//! Each socket owns a fixed-size byte buffer holding the in-flight tail.
//! A flush pass copies queued lines into the buffer and writes as much as
//! the socket accepts; on a partial write the unsent remainder is kept in
//! the buffer and the caller registers for write readiness.

use std::io::{self, Write};

use crate::line::LineQueue;
use crate::shared::{NetError, NetResult};

/// Size of the per-socket send buffer in bytes.
pub const NET_SBUFFER_LEN: usize = 102_400;

/// How a flush pass ended.
#[derive(Debug, Eq, PartialEq)]
pub enum Flush {
    /// Everything queued has hit the socket.
    Done,
    /// The socket would block; retry when it becomes writable.
    Blocked,
}

pub struct SendBuffer {
    buf: Box<[u8]>,
    fill: usize,
    /// The line currently being copied in, with the copy offset. A line
    /// can be longer than the free space in the buffer, so it may take
    /// several rounds to drain.
    current: Option<(Vec<u8>, usize)>,
}

impl SendBuffer {
    pub fn new() -> SendBuffer {
        SendBuffer {
            buf: vec![0u8; NET_SBUFFER_LEN].into_boxed_slice(),
            fill: 0,
            current: None,
        }
    }

    /// True if any bytes are waiting to go out.
    pub fn has_pending(&self) -> bool {
        self.fill > 0 || self.current.is_some()
    }

    /// Drop all in-flight bytes. Used when a connection is torn down.
    pub fn clear(&mut self) {
        self.fill = 0;
        self.current = None;
    }

    /// Copy lines from `queue` into the buffer and write to `writer`
    /// until everything is sent or the socket blocks.
    pub fn flush<W: Write>(&mut self, queue: &mut LineQueue, writer: &mut W) -> NetResult<Flush> {
        loop {
            // Top up the buffer from the queue.
            while self.fill < self.buf.len() {
                if let Some((text, offset)) = &mut self.current {
                    let n = (self.buf.len() - self.fill).min(text.len() - *offset);
                    self.buf[self.fill..self.fill + n]
                        .copy_from_slice(&text[*offset..*offset + n]);
                    self.fill += n;
                    *offset += n;
                    if *offset == text.len() {
                        self.current = None;
                    }
                } else if let Some(line) = queue.pop() {
                    self.current = Some((line.text, 0));
                } else {
                    break;
                }
            }

            if self.fill == 0 {
                return Ok(Flush::Done);
            }

            match writer.write(&self.buf[..self.fill]) {
                Ok(0) => return Err(NetError::Fatal(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.buf.copy_within(n..self.fill, 0);
                    self.fill -= n;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Flush::Blocked)
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Default for SendBuffer {
    fn default() -> SendBuffer {
        SendBuffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::Line;
    use std::cmp::min;

    /// Writer that accepts data in fixed-size chunks up to a cap, then
    /// blocks, like a socket with a slow peer.
    struct MockChannel {
        data: Vec<u8>,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data: Vec::new(),
                chunk,
                max_size,
            }
        }
    }

    impl Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() >= self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.chunk, buf.len()), self.max_size - self.data.len());
            self.data.extend(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn queue_of(texts: &[&str]) -> LineQueue {
        let mut queue = LineQueue::new();
        for t in texts {
            queue.append(Line::new(t.as_bytes().to_vec()));
        }
        queue
    }

    #[test]
    fn test_flush_everything() {
        let mut sendbuf = SendBuffer::new();
        let mut queue = queue_of(&["one\n", "two\n"]);
        let mut sink = MockChannel::new(3, usize::MAX);

        let result = sendbuf.flush(&mut queue, &mut sink).unwrap();

        assert_eq!(result, Flush::Done);
        assert_eq!(sink.data, b"one\ntwo\n");
        assert!(queue.is_empty());
        assert!(!sendbuf.has_pending());
    }

    #[test]
    fn test_backpressure_retains_tail() {
        let mut sendbuf = SendBuffer::new();
        let mut queue = queue_of(&["abcdefgh\n"]);
        let mut sink = MockChannel::new(4, 4);

        let result = sendbuf.flush(&mut queue, &mut sink).unwrap();

        assert_eq!(result, Flush::Blocked);
        assert_eq!(sink.data, b"abcd");
        assert!(sendbuf.has_pending());

        // The peer drains; the retained tail goes out on the next pass.
        sink.max_size = usize::MAX;
        let result = sendbuf.flush(&mut queue, &mut sink).unwrap();
        assert_eq!(result, Flush::Done);
        assert_eq!(sink.data, b"abcdefgh\n");
    }

    #[test]
    fn test_line_longer_than_buffer() {
        let big = vec![b'z'; NET_SBUFFER_LEN + 500];
        let mut queue = LineQueue::new();
        let mut line = big.clone();
        line.push(b'\n');
        queue.append(Line::new(line.clone()));

        let mut sendbuf = SendBuffer::new();
        let mut sink = MockChannel::new(8192, usize::MAX);

        let result = sendbuf.flush(&mut queue, &mut sink).unwrap();

        assert_eq!(result, Flush::Done);
        assert_eq!(sink.data, line);
    }

    #[test]
    fn test_write_zero_is_fatal() {
        struct ZeroSink;
        impl Write for ZeroSink {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut sendbuf = SendBuffer::new();
        let mut queue = queue_of(&["x\n"]);

        let result = sendbuf.flush(&mut queue, &mut ZeroSink);
        assert_eq!(result, Err(NetError::Fatal(io::ErrorKind::WriteZero)));
    }

    #[test]
    fn test_clear() {
        let mut sendbuf = SendBuffer::new();
        let mut queue = queue_of(&["pending\n"]);
        let mut sink = MockChannel::new(2, 2);

        sendbuf.flush(&mut queue, &mut sink).unwrap();
        assert!(sendbuf.has_pending());

        sendbuf.clear();
        assert!(!sendbuf.has_pending());
    }
}
