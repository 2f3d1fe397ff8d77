//! The fundamental datum of the proxy: a logical line of text, and the
//! FIFO queues lines travel through.

use std::collections::LinkedList;
use std::mem;

use crate::util;

/* Line flags. */

/// Don't write the line to the MUD log.
pub const LINE_DONTLOG: u32 = 0x01;
/// Don't keep the line in the buffered queue while no client is attached.
pub const LINE_DONTBUF: u32 = 0x02;
/// Don't put the line in history.
pub const LINE_NOHIST: u32 = 0x04;

/// Regular server<->client lines.
pub const LINE_REGULAR: u32 = 0;
/// MCP lines: out-of-band, never logged, buffered or historized.
pub const LINE_MCP: u32 = LINE_DONTLOG | LINE_DONTBUF | LINE_NOHIST;
/// Checkpoint message (e.g. day rollover): logged, buffered and kept in
/// history like regular server output.
pub const LINE_CHECKPOINT: u32 = 0;
/// Normal proxy message (e.g. /listopts output).
pub const LINE_MESSAGE: u32 = LINE_DONTLOG | LINE_NOHIST;
/// A copy of a history line replayed by recall.
pub const LINE_RECALLED: u32 = LINE_DONTLOG | LINE_DONTBUF | LINE_NOHIST;

/// The estimated memory cost of a line beyond its text: the object
/// itself, the queue node links, and an allocator guess.
pub const LINE_BYTE_COST: usize = mem::size_of::<Line>() + 2 * mem::size_of::<usize>() + 8;

/// A single logical line. For lines that originated on the wire the
/// trailing newline is part of the text.
#[derive(Debug, Clone)]
pub struct Line {
    pub text: Vec<u8>,
    pub flags: u32,
    /// Wall-clock time of the line's creation.
    pub time: i64,
    /// Day ordinal of the line's creation. Used for log rollover.
    pub day: i64,
}

impl Line {
    /// Create a line stamped with the current time and day, flags set to
    /// [`LINE_REGULAR`].
    pub fn new(text: Vec<u8>) -> Line {
        let time = util::current_time();

        Line {
            text,
            flags: LINE_REGULAR,
            time,
            day: util::day_of(time),
        }
    }

    /// Create a line with explicit creation time.
    pub fn with_time(text: Vec<u8>, time: i64) -> Line {
        Line {
            text,
            flags: LINE_REGULAR,
            time,
            day: util::day_of(time),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Duplicate the line; all fields are equivalent.
    #[inline]
    pub fn dup(&self) -> Line {
        self.clone()
    }
}

/// A FIFO of lines with O(1) append, prepend, pop at both ends and O(1)
/// merge, maintaining a cached count and byte length.
///
/// The cached length is the sum of `line.len() + LINE_BYTE_COST` over all
/// members, so it tracks actual memory pressure rather than just payload
/// bytes.
#[derive(Debug, Default)]
pub struct LineQueue {
    lines: LinkedList<Line>,
    length: usize,
}

impl LineQueue {
    pub fn new() -> LineQueue {
        LineQueue {
            lines: LinkedList::new(),
            length: 0,
        }
    }

    /// Number of lines in the queue.
    #[inline]
    pub fn count(&self) -> usize {
        self.lines.len()
    }

    /// Total number of bytes this queue occupies (see [`LINE_BYTE_COST`]).
    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Append a line to the end of the queue.
    pub fn append(&mut self, line: Line) {
        self.length += line.len() + LINE_BYTE_COST;
        self.lines.push_back(line);
    }

    /// Prepend a line to the start of the queue.
    pub fn prepend(&mut self, line: Line) {
        self.length += line.len() + LINE_BYTE_COST;
        self.lines.push_front(line);
    }

    /// Remove and return the first line, or `None` if the queue is empty.
    pub fn pop(&mut self) -> Option<Line> {
        let line = self.lines.pop_front()?;
        self.length -= line.len() + LINE_BYTE_COST;
        Some(line)
    }

    /// Remove and return the last line, or `None` if the queue is empty.
    pub fn pop_end(&mut self) -> Option<Line> {
        let line = self.lines.pop_back()?;
        self.length -= line.len() + LINE_BYTE_COST;
        Some(line)
    }

    /// Destroy all lines in the queue.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.length = 0;
    }

    /// Drain `two` into the end of `self`, in order. Node links are
    /// respliced; no line text is copied.
    pub fn merge(&mut self, two: &mut LineQueue) {
        self.length += two.length;
        two.length = 0;
        self.lines.append(&mut two.lines);
    }

    /// Iterate the lines front to back. The iterator is double-ended.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Line> {
        self.lines.iter()
    }

    /// Iterate the lines mutably, front to back.
    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut Line> {
        self.lines.iter_mut()
    }

    /// Creation time of the oldest line, if any.
    pub fn head_time(&self) -> Option<i64> {
        self.lines.front().map(|line| line.time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> Line {
        Line::new(text.as_bytes().to_vec())
    }

    fn expected_length(queue: &LineQueue) -> usize {
        queue.iter().map(|l| l.len() + LINE_BYTE_COST).sum()
    }

    #[test]
    fn test_append_pop_fifo() {
        let mut q = LineQueue::new();

        q.append(line("one\n"));
        q.append(line("two\n"));
        q.append(line("three\n"));

        assert_eq!(q.count(), 3);
        assert_eq!(q.length(), expected_length(&q));

        assert_eq!(q.pop().unwrap().text, b"one\n");
        assert_eq!(q.pop().unwrap().text, b"two\n");
        assert_eq!(q.count(), 1);
        assert_eq!(q.length(), expected_length(&q));

        assert_eq!(q.pop().unwrap().text, b"three\n");
        assert!(q.pop().is_none());
        assert_eq!(q.length(), 0);
    }

    #[test]
    fn test_pop_end() {
        let mut q = LineQueue::new();

        q.append(line("one\n"));
        q.append(line("two\n"));

        assert_eq!(q.pop_end().unwrap().text, b"two\n");
        assert_eq!(q.pop_end().unwrap().text, b"one\n");
        assert!(q.pop_end().is_none());
        assert_eq!(q.count(), 0);
        assert_eq!(q.length(), 0);
    }

    #[test]
    fn test_prepend() {
        let mut q = LineQueue::new();

        q.append(line("b\n"));
        q.prepend(line("a\n"));

        assert_eq!(q.pop().unwrap().text, b"a\n");
        assert_eq!(q.pop().unwrap().text, b"b\n");
    }

    #[test]
    fn test_clear() {
        let mut q = LineQueue::new();

        q.append(line("one\n"));
        q.append(line("two\n"));
        q.clear();

        assert_eq!(q.count(), 0);
        assert_eq!(q.length(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn test_merge() {
        let mut one = LineQueue::new();
        let mut two = LineQueue::new();

        one.append(line("a\n"));
        two.append(line("b\n"));
        two.append(line("c\n"));

        one.merge(&mut two);

        assert_eq!(one.count(), 3);
        assert_eq!(one.length(), expected_length(&one));
        assert!(two.is_empty());
        assert_eq!(two.length(), 0);

        let order: Vec<_> = one.iter().map(|l| l.text.clone()).collect();
        assert_eq!(order, vec![b"a\n".to_vec(), b"b\n".to_vec(), b"c\n".to_vec()]);
    }

    #[test]
    fn test_merge_into_empty() {
        let mut one = LineQueue::new();
        let mut two = LineQueue::new();

        two.append(line("x\n"));
        one.merge(&mut two);

        assert_eq!(one.count(), 1);
        assert_eq!(one.length(), expected_length(&one));
    }

    #[test]
    fn test_merge_associative() {
        // merge(A, B); merge(A, C) must equal merge(A, D) where D is
        // B followed by C.
        let build = |texts: &[&str]| {
            let mut q = LineQueue::new();
            for t in texts {
                q.append(line(t));
            }
            q
        };

        let mut a1 = build(&["1\n"]);
        let mut b = build(&["2\n", "3\n"]);
        let mut c = build(&["4\n"]);
        a1.merge(&mut b);
        a1.merge(&mut c);

        let mut a2 = build(&["1\n"]);
        let mut d = build(&["2\n", "3\n", "4\n"]);
        a2.merge(&mut d);

        let left: Vec<_> = a1.iter().map(|l| l.text.clone()).collect();
        let right: Vec<_> = a2.iter().map(|l| l.text.clone()).collect();
        assert_eq!(left, right);
        assert_eq!(a1.length(), a2.length());
    }

    #[test]
    fn test_dup() {
        let mut original = line("hello\n");
        original.flags = LINE_MESSAGE;

        let copy = original.dup();
        assert_eq!(copy.text, original.text);
        assert_eq!(copy.flags, original.flags);
        assert_eq!(copy.time, original.time);
        assert_eq!(copy.day, original.day);
    }
}
