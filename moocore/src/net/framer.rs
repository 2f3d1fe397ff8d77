//! Turning a byte stream into logical lines.
//!
//! Each side of the proxy owns one framer: a fixed-size byte buffer and a
//! fill pointer. Bytes are read into the free tail, the buffer is scanned
//! for newlines, complete lines (newline included) are emitted, and any
//! residue is moved to the front. A buffer that fills without a newline
//! is emitted whole as one synthetic line with a newline appended, which
//! bounds the maximum line length.

use std::io::{self, Read};

use crate::line::{Line, LineQueue};
use crate::shared::NetResult;

/// Size of the blocks-to-lines buffer in bytes. This limits the maximum
/// line length.
pub const NET_BBUFFER_LEN: usize = 102_400;

/// How one ingest pass ended.
#[derive(Debug, Eq, PartialEq)]
pub enum Ingest {
    /// The socket has no more data for now; `usize` bytes were consumed.
    Drained(usize),
    /// The peer closed the connection after `usize` bytes.
    Eof(usize),
}

pub struct LineFramer {
    buf: Box<[u8]>,
    fill: usize,
}

impl LineFramer {
    pub fn new() -> LineFramer {
        LineFramer {
            buf: vec![0u8; NET_BBUFFER_LEN].into_boxed_slice(),
            fill: 0,
        }
    }

    /// Discard any buffered residue. Used when a connection is replaced.
    pub fn reset(&mut self) {
        self.fill = 0;
    }

    /// Bytes currently buffered without a terminating newline.
    #[inline]
    pub fn pending(&self) -> usize {
        self.fill
    }

    /// Read from `reader` until it blocks or closes, appending each
    /// complete line to `out`.
    pub fn ingest<R: Read>(&mut self, reader: &mut R, out: &mut LineQueue) -> NetResult<Ingest> {
        let mut total = 0;

        loop {
            match reader.read(&mut self.buf[self.fill..]) {
                Ok(0) => return Ok(Ingest::Eof(total)),
                Ok(n) => {
                    self.fill += n;
                    total += n;
                    self.extract(out);
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Ingest::Drained(total))
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Scan for newlines, emit complete lines, shift the residue down.
    fn extract(&mut self, out: &mut LineQueue) {
        let mut start = 0;

        for scan in 0..self.fill {
            if self.buf[scan] == b'\n' {
                out.append(Line::new(self.buf[start..=scan].to_vec()));
                start = scan + 1;
            }
        }

        if start > 0 {
            self.buf.copy_within(start..self.fill, 0);
            self.fill -= start;
        }

        // A full buffer with no newline becomes one synthetic line so the
        // framer can make progress.
        if self.fill == self.buf.len() {
            let mut text = self.buf.to_vec();
            text.push(b'\n');
            out.append(Line::new(text));
            self.fill = 0;
        }
    }

    /// Emit any residual bytes as a final newline-terminated line. Called
    /// when the peer closes.
    pub fn flush_residual(&mut self, out: &mut LineQueue) {
        if self.fill > 0 {
            let mut text = self.buf[..self.fill].to_vec();
            text.push(b'\n');
            out.append(Line::new(text));
            self.fill = 0;
        }
    }
}

impl Default for LineFramer {
    fn default() -> LineFramer {
        LineFramer::new()
    }
}
