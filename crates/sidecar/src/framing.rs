//! Line framing for runner stdout.
//!
//! The OS hands out stdout in arbitrary chunks. [`split_lines`] turns the
//! carried-over fragment plus a new chunk into the complete lines and the
//! fragment to carry into the next read.

use memchr::memchr_iter;

/// Split `buffer ++ chunk` on `\n`.
///
/// Returns every complete line (trailing `\r` stripped, decoded lossily) and
/// the bytes after the last newline. Decoding happens only on whole lines, so
/// a multi-byte character split across chunks survives intact.
pub fn split_lines(buffer: &[u8], chunk: &[u8]) -> (Vec<String>, Vec<u8>) {
    let mut joined = Vec::with_capacity(buffer.len() + chunk.len());
    joined.extend_from_slice(buffer);
    joined.extend_from_slice(chunk);

    let mut lines = Vec::new();
    let mut start = 0;
    for end in memchr_iter(b'\n', &joined) {
        lines.push(decode_line(&joined[start..end]));
        start = end + 1;
    }

    let rest = joined.split_off(start);
    (lines, rest)
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Stateful wrapper around [`split_lines`] for a single stream.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning the lines it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let (lines, rest) = split_lines(&self.pending, chunk);
        self.pending = rest;
        lines
    }

    /// Flush the trailing fragment at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let pending = std::mem::take(&mut self.pending);
        let line = decode_line(&pending);
        (!line.is_empty()).then_some(line)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
