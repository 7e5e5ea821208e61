//! Reassembly of newline-terminated lines from arbitrarily chunked reads.
//!
//! TCP delivers the cluster stream in whatever pieces it likes; a spot line can
//! be split across two reads, or one read can carry a dozen lines. The
//! [`LineAssembler`] keeps the incomplete tail between calls so that the lines
//! it yields do not depend on where the chunk boundaries fell.

use tracing::warn;

/// Default upper bound on a single line, in bytes.
pub const DEFAULT_MAX_LINE_LEN: usize = 4096;

/// Incremental line splitter.
#[derive(Debug)]
pub struct LineAssembler {
    /// Bytes of the current, not yet terminated line.
    partial: Vec<u8>,

    /// Lines longer than this are dropped.
    max_line_len: usize,

    /// Set while skipping the rest of an over-long line.
    discarding: bool,

    /// Number of over-long lines dropped so far.
    oversized_lines: u64,
}

impl LineAssembler {
    /// Create an assembler with the default line limit.
    pub fn new() -> Self {
        Self::with_max_line_len(DEFAULT_MAX_LINE_LEN)
    }

    /// Create an assembler that drops lines longer than `max_line_len` bytes.
    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            partial: Vec::with_capacity(256),
            max_line_len,
            discarding: false,
            oversized_lines: 0,
        }
    }

    /// Append newly received bytes and return every line they complete.
    ///
    /// The `\n` terminator and a trailing `\r` are stripped. Bytes after the
    /// last `\n` are kept for the next call. Invalid UTF-8 is replaced rather
    /// than rejected.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = bytes;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (segment, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding || self.partial.len() + segment.len() > self.max_line_len {
                self.drop_oversized();
                self.discarding = false;
                continue;
            }

            self.partial.extend_from_slice(segment);
            lines.push(decode_line(&self.partial));
            self.partial.clear();
        }

        if !self.discarding {
            if self.partial.len() + rest.len() > self.max_line_len {
                self.partial.clear();
                self.discarding = true;
            } else {
                self.partial.extend_from_slice(rest);
            }
        }

        lines
    }

    /// Bytes currently held waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    /// Number of lines dropped for exceeding the length limit.
    pub fn oversized_lines(&self) -> u64 {
        self.oversized_lines
    }

    /// Forget any partial line, e.g. after the connection was re-established.
    pub fn reset(&mut self) {
        self.partial.clear();
        self.discarding = false;
    }

    fn drop_oversized(&mut self) {
        self.oversized_lines += 1;
        warn!(
            "Dropping line longer than {} bytes (prefix: {:?})",
            self.max_line_len,
            String::from_utf8_lossy(&self.partial[..self.partial.len().min(40)])
        );
        self.partial.clear();
    }
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
