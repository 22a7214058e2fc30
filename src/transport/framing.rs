//! Newline-delimited JSON framing.
//!
//! Every logical message is one line of UTF-8 JSON terminated by `\n`.
//! [`LineFramer`] is a pure buffer: bytes go in as they arrive from the socket
//! (possibly split mid-frame, possibly several frames per read) and complete
//! lines come out in order.

use serde_json::Value;
use thiserror::Error;

/// Upper bound for a single frame. signal-cli messages with inline previews
/// stay far below this.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLong { len: usize, max: usize },
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed JSON: {0}")]
    InvalidJson(String),
}

/// Splits an incoming byte stream into lines.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    /// Bytes before this offset are known not to contain `\n`
    scanned: usize,
    max_frame_len: usize,
    /// Dropping the remainder of an over-long line
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl LineFramer {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(8192),
            scanned: 0,
            max_frame_len,
            discarding: false,
        }
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered without a terminating newline yet.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete line, if any. Blank lines are skipped and a
    /// trailing `\r` is stripped.
    pub fn next_line(&mut self) -> Option<Result<String, FramingError>> {
        loop {
            let found = self.buf[self.scanned..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|p| p + self.scanned);

            let Some(pos) = found else {
                self.scanned = self.buf.len();
                if self.buf.len() > self.max_frame_len {
                    let len = self.buf.len();
                    self.buf.clear();
                    self.scanned = 0;
                    let first = !self.discarding;
                    self.discarding = true;
                    if first {
                        return Some(Err(FramingError::TooLong {
                            len,
                            max: self.max_frame_len,
                        }));
                    }
                }
                return None;
            };

            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.scanned = 0;
            line.pop();

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            if line.len() > self.max_frame_len {
                return Some(Err(FramingError::TooLong {
                    len: line.len(),
                    max: self.max_frame_len,
                }));
            }
            return Some(String::from_utf8(line).map_err(|_| FramingError::InvalidUtf8));
        }
    }

    /// Pop the next line and parse it as JSON.
    pub fn next_frame(&mut self) -> Option<Result<Value, FramingError>> {
        self.next_line().map(|line| line.and_then(|l| decode_frame(&l)))
    }
}

pub fn decode_frame(line: &str) -> Result<Value, FramingError> {
    serde_json::from_str(line).map_err(|e| FramingError::InvalidJson(e.to_string()))
}

/// Serialize a value as one frame, newline included.
pub fn encode_frame(value: &Value) -> Result<Vec<u8>, serde_json::Error> {
    // compact output escapes every newline inside strings
    let mut bytes = serde_json::to_vec(value)?;
    debug_assert!(!bytes.contains(&b'\n'));
    bytes.push(b'\n');
    Ok(bytes)
}
