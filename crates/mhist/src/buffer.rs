//! Scrollback storage for a session.
//!
//! Two structures with different jobs: [`Scrollback`] keeps complete lines
//! for random-access history paging, [`ReplayRing`] keeps the last raw PTY
//! bytes so a reattach can redraw the exact screen state (colours, cursor
//! position, alternate screen) that line text alone cannot reproduce.

use std::collections::VecDeque;

/// Default number of complete lines a session retains.
pub const LINE_CAPACITY: usize = 10_000;

/// Default raw replay capacity in bytes.
pub const REPLAY_CAPACITY: usize = 65_536;

// ── Line ring ───────────────────────────────────────────────────────

/// Bounded ring of complete output lines plus one pending partial line.
///
/// Raw writes are split on LF. Bytes after the last LF are held as the
/// partial until a later write supplies the delimiter; the partial is not
/// counted by [`line_count`](Self::line_count) and is not reachable through
/// the line-indexed accessors.
pub struct Scrollback {
    lines: VecDeque<Vec<u8>>,
    capacity: usize,
    partial: Vec<u8>,
}

impl Scrollback {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            partial: Vec::new(),
        }
    }

    /// Consume raw PTY output. Each LF completes a line (LF excluded);
    /// the oldest line is evicted once the ring is full.
    pub fn write(&mut self, data: &[u8]) {
        let mut rest = data;
        while let Some(idx) = rest.iter().position(|&b| b == b'\n') {
            let mut line = std::mem::take(&mut self.partial);
            line.extend_from_slice(&rest[..idx]);
            self.push_line(line);
            rest = &rest[idx + 1..];
        }
        self.partial.extend_from_slice(rest);
    }

    fn push_line(&mut self, line: Vec<u8>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Number of complete lines currently stored.
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// The `index`-th oldest line, or None outside `[0, line_count())`.
    pub fn get_line(&self, index: usize) -> Option<&[u8]> {
        self.lines.get(index).map(|l| l.as_slice())
    }

    /// Up to `count` lines starting at `start`, truncated at the newest
    /// stored line. Empty if `start >= line_count()`.
    pub fn get_range(&self, start: usize, count: usize) -> Vec<&[u8]> {
        if start >= self.lines.len() {
            return Vec::new();
        }
        let end = (start + count).min(self.lines.len());
        self.lines
            .range(start..end)
            .map(|l| l.as_slice())
            .collect()
    }

    /// The pending partial line (possibly empty).
    pub fn partial(&self) -> &[u8] {
        &self.partial
    }
}

// ── Raw replay ring ─────────────────────────────────────────────────

/// Fixed-capacity byte ring recording the most recent PTY output verbatim.
pub struct ReplayRing {
    buf: Vec<u8>,
    write_pos: usize,
    filled: bool,
}

impl ReplayRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            write_pos: 0,
            filled: false,
        }
    }

    /// Append bytes, overwriting the oldest on wrap. Never fails.
    pub fn append(&mut self, data: &[u8]) {
        let capacity = self.buf.len();

        if data.len() >= capacity {
            // Larger than the whole ring -- keep the tail
            let start = data.len() - capacity;
            self.buf.copy_from_slice(&data[start..]);
            self.write_pos = 0;
            self.filled = true;
            return;
        }

        let space_left = capacity - self.write_pos;
        if data.len() <= space_left {
            self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
            self.write_pos += data.len();
        } else {
            // Wrap around
            self.buf[self.write_pos..].copy_from_slice(&data[..space_left]);
            let remaining = data.len() - space_left;
            self.buf[..remaining].copy_from_slice(&data[space_left..]);
            self.write_pos = remaining;
            self.filled = true;
        }

        if self.write_pos >= capacity {
            self.write_pos = 0;
            self.filled = true;
        }
    }

    pub fn len(&self) -> usize {
        if self.filled {
            self.buf.len()
        } else {
            self.write_pos
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.filled && self.write_pos == 0
    }

    /// The stored bytes in logical order: the last `len()` bytes ever
    /// appended.
    pub fn snapshot(&self) -> Vec<u8> {
        if !self.filled {
            return self.buf[..self.write_pos].to_vec();
        }
        let mut out = Vec::with_capacity(self.buf.len());
        out.extend_from_slice(&self.buf[self.write_pos..]);
        out.extend_from_slice(&self.buf[..self.write_pos]);
        out
    }
}

// ── Unit tests ──────────────────────────────────────────────────────
