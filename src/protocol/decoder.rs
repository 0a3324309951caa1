//! Resumable RESP Decoder
//!
//! TCP delivers a byte stream, not messages: one read may carry half a
//! request, or three requests and the start of a fourth. [`RespDecoder`]
//! keeps the bytes it could not yet use in a residual buffer and picks up
//! from there on the next call.
//!
//! ## How the Decoder Works
//!
//! 1. The connection appends freshly read bytes to the decoder's buffer
//! 2. [`RespDecoder::next_frame`] consumes tokens off the front of the buffer
//! 3. Array headers push a partial array; each finished element is folded
//!    into the innermost one, and a frame is returned once the outermost
//!    array is full
//! 4. When a token is incomplete, `Ok(None)` is returned and everything
//!    parsed so far is kept: finished elements, a bulk length whose payload
//!    is still arriving, and how far the current line was searched for CRLF
//! 5. Malformed input yields a [`ProtocolError`] carrying the absolute byte
//!    offset of the offending byte within the connection's stream
//!
//! Every byte is therefore looked at a bounded number of times no matter how
//! the stream is split into reads.
//!
//! A protocol error is not recoverable: the decoder's buffer is left as-is
//! and the connection is expected to be closed.

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Largest accepted bulk string payload (512 MB)
pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Largest accepted array element count
pub const DEFAULT_MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Longest accepted header or simple line
pub const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;

/// Maximum array nesting depth (prevents unbounded recursion)
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Initial capacity of the residual buffer
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Upper bound on element slots reserved from an untrusted array header
const MAX_PREALLOCATED_ITEMS: usize = 1024;

/// Upper bound on buffer space reserved ahead of a pending bulk payload
const MAX_READ_RESERVE: usize = 64 * 1024;

/// Why a byte stream was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    #[error("unexpected type marker {0:#04x}")]
    UnexpectedMarker(u8),

    /// Length or count prefix that is not a decimal number
    #[error("invalid length prefix")]
    InvalidLength,

    #[error("invalid integer")]
    InvalidInteger,

    /// Negative bulk length other than -1
    #[error("invalid bulk string length: {0}")]
    NegativeBulkLength(i64),

    /// Negative array count other than -1
    #[error("invalid array length: {0}")]
    NegativeArrayLength(i64),

    #[error("bulk string length {len} exceeds maximum {max}")]
    BulkTooLarge { len: i64, max: usize },

    #[error("array length {len} exceeds maximum {max}")]
    ArrayTooLarge { len: i64, max: usize },

    #[error("bulk string missing trailing CRLF")]
    MissingCrlf,

    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("invalid UTF-8 in simple line")]
    InvalidUtf8,

    #[error("nesting depth exceeds {0}")]
    TooDeep(usize),
}

/// A malformed byte stream.
///
/// `offset` counts from the first byte the connection ever received, so it
/// stays meaningful no matter how many frames were decoded before.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind} at byte {offset}")]
pub struct ProtocolError {
    pub offset: u64,
    pub kind: ProtocolErrorKind,
}

/// Result type for decoding operations.
pub type DecodeResult<T> = Result<T, ProtocolError>;

/// Limits applied while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderConfig {
    pub max_bulk_len: usize,
    pub max_array_len: usize,
    pub max_line_len: usize,
    pub max_depth: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            max_array_len: DEFAULT_MAX_ARRAY_LEN,
            max_line_len: DEFAULT_MAX_LINE_LEN,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// A per-connection, resumable RESP decoder.
///
/// # Example
///
/// ```
/// use jollykv::protocol::{RespDecoder, RespValue};
/// use bytes::Bytes;
///
/// let mut decoder = RespDecoder::new();
///
/// // First read: half a request
/// assert!(decoder.decode(b"*2\r\n$3\r\nGET\r\n$4\r\nna").unwrap().is_empty());
///
/// // Second read: the rest
/// let frames = decoder.decode(b"me\r\n").unwrap();
/// assert_eq!(
///     frames,
///     vec![RespValue::array(vec![
///         RespValue::bulk_string(Bytes::from("GET")),
///         RespValue::bulk_string(Bytes::from("name")),
///     ])]
/// );
/// ```
#[derive(Debug)]
pub struct RespDecoder {
    /// Bytes received but not yet parsed
    buffer: BytesMut,

    /// Stream offset of `buffer[0]`
    consumed: u64,

    /// Stream offset of the first byte of the frame being assembled
    frame_start: u64,

    /// Arrays opened by the frame being assembled, innermost last
    open: Vec<PartialArray>,

    /// Payload length of a bulk string whose header is already consumed
    pending_bulk: Option<usize>,

    /// Leading bytes of `buffer` already searched for CRLF without success
    scanned: usize,

    config: DecoderConfig,

    /// Bytes inspected while looking for line terminators
    #[cfg(test)]
    examined: usize,
}

/// An array whose elements are still arriving.
#[derive(Debug)]
struct PartialArray {
    remaining: usize,
    items: Vec<RespValue>,
}

/// Outcome of one parsing step.
enum Step {
    Value(RespValue),
    /// An array header was consumed; its elements follow
    Opened,
}

impl Default for RespDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RespDecoder {
    /// Creates a decoder with default limits.
    pub fn new() -> Self {
        Self::with_config(DecoderConfig::default())
    }

    pub fn with_config(config: DecoderConfig) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            consumed: 0,
            frame_start: 0,
            open: Vec::new(),
            pending_bulk: None,
            scanned: 0,
            config,
            #[cfg(test)]
            examined: 0,
        }
    }

    /// Appends bytes to the residual buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Direct access to the residual buffer, for reading from a socket
    /// straight into it.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Number of bytes received that do not yet belong to a returned frame.
    pub fn buffered(&self) -> usize {
        (self.consumed + self.buffer.len() as u64 - self.frame_start) as usize
    }

    /// True when no partial frame is held.
    pub fn is_empty(&self) -> bool {
        self.buffered() == 0
    }

    /// Total bytes consumed by decoded frames so far.
    pub fn stream_offset(&self) -> u64 {
        self.frame_start
    }

    /// Feeds `input` and decodes every complete frame now available.
    ///
    /// Any trailing partial frame stays buffered for the next call.
    pub fn decode(&mut self, input: &[u8]) -> DecodeResult<Vec<RespValue>> {
        self.feed(input);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Decodes at most one frame from the buffer.
    ///
    /// Parsing picks up where the previous call stopped: elements of a
    /// partially received array are kept, and a header line that is still
    /// missing its CRLF is not searched again from the start.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(value))` - A complete frame
    /// - `Ok(None)` - Incomplete data, need more bytes
    /// - `Err(e)` - Malformed input; the decoder must not be used again
    pub fn next_frame(&mut self) -> DecodeResult<Option<RespValue>> {
        loop {
            let mut value = match self.step()? {
                Some(Step::Value(value)) => value,
                Some(Step::Opened) => continue,
                None => return Ok(None),
            };

            // Close every array this value completes
            loop {
                let Some(top) = self.open.last_mut() else {
                    self.frame_start = self.consumed;
                    return Ok(Some(value));
                };
                top.items.push(value);
                top.remaining -= 1;
                if top.remaining > 0 {
                    break;
                }
                let items = std::mem::take(&mut top.items);
                self.open.pop();
                value = RespValue::Array(items);
            }
        }
    }

    /// Consumes one token, or nothing if it is not complete yet.
    fn step(&mut self) -> DecodeResult<Option<Step>> {
        if let Some(len) = self.pending_bulk {
            return Ok(self.bulk_payload(len)?.map(Step::Value));
        }

        let marker = match self.buffer.first() {
            Some(&b) => b,
            None => return Ok(None),
        };
        let marker_at = self.consumed;

        match marker {
            prefix::SIMPLE_STRING => Ok(self.text()?.map(|s| Step::Value(RespValue::SimpleString(s)))),
            prefix::ERROR => Ok(self.text()?.map(|s| Step::Value(RespValue::Error(s)))),
            prefix::INTEGER => {
                let Some((line, at)) = self.line()? else {
                    return Ok(None);
                };
                let n = parse_decimal(&line)
                    .ok_or_else(|| error(at, ProtocolErrorKind::InvalidInteger))?;
                Ok(Some(Step::Value(RespValue::Integer(n))))
            }
            prefix::BULK_STRING => {
                let Some((len, at)) = self.length()? else {
                    return Ok(None);
                };
                if len == -1 {
                    return Ok(Some(Step::Value(RespValue::Null)));
                }
                if len < 0 {
                    return Err(error(at, ProtocolErrorKind::NegativeBulkLength(len)));
                }
                let max = self.config.max_bulk_len;
                if len as u64 > max as u64 {
                    return Err(error(at, ProtocolErrorKind::BulkTooLarge { len, max }));
                }

                self.pending_bulk = Some(len as usize);
                Ok(self.bulk_payload(len as usize)?.map(Step::Value))
            }
            prefix::ARRAY => {
                if self.open.len() >= self.config.max_depth {
                    return Err(error(
                        marker_at,
                        ProtocolErrorKind::TooDeep(self.config.max_depth),
                    ));
                }
                let Some((count, at)) = self.length()? else {
                    return Ok(None);
                };
                if count == -1 {
                    return Ok(Some(Step::Value(RespValue::NullArray)));
                }
                if count < 0 {
                    return Err(error(at, ProtocolErrorKind::NegativeArrayLength(count)));
                }
                let max = self.config.max_array_len;
                if count as u64 > max as u64 {
                    return Err(error(at, ProtocolErrorKind::ArrayTooLarge { len: count, max }));
                }
                if count == 0 {
                    return Ok(Some(Step::Value(RespValue::Array(Vec::new()))));
                }

                let count = count as usize;
                self.open.push(PartialArray {
                    remaining: count,
                    items: Vec::with_capacity(count.min(MAX_PREALLOCATED_ITEMS)),
                });
                Ok(Some(Step::Opened))
            }
            other => Err(error(marker_at, ProtocolErrorKind::UnexpectedMarker(other))),
        }
    }

    /// Takes `<marker><line>\r\n` off the front of the buffer.
    ///
    /// Returns the line without marker or CRLF, and the stream offset of its
    /// first byte.
    fn line(&mut self) -> DecodeResult<Option<(Bytes, u64)>> {
        let start = self.consumed + 1;
        let max = self.config.max_line_len;

        // Back up one byte: the last search may have stopped on a lone `\r`
        let from = self.scanned.saturating_sub(1).max(1);
        let window = &self.buffer[from..];

        match find_crlf(window) {
            Some(i) => {
                #[cfg(test)]
                {
                    self.examined += i + CRLF.len();
                }
                let end = from + i;
                if end - 1 > max {
                    return Err(error(start, ProtocolErrorKind::LineTooLong(max)));
                }

                let mut line = self.buffer.split_to(end + CRLF.len());
                self.consumed += line.len() as u64;
                self.scanned = 0;
                line.truncate(end);
                line.advance(1);
                Ok(Some((line.freeze(), start)))
            }
            None => {
                #[cfg(test)]
                {
                    self.examined += window.len();
                }
                if self.buffer.len() - 1 > max {
                    return Err(error(start, ProtocolErrorKind::LineTooLong(max)));
                }
                self.scanned = self.buffer.len();
                Ok(None)
            }
        }
    }

    /// `+<string>\r\n` and `-<string>\r\n`
    fn text(&mut self) -> DecodeResult<Option<String>> {
        let Some((line, at)) = self.line()? else {
            return Ok(None);
        };
        let s = std::str::from_utf8(&line).map_err(|e| {
            error(at + e.valid_up_to() as u64, ProtocolErrorKind::InvalidUtf8)
        })?;
        Ok(Some(s.to_string()))
    }

    /// Reads a length or count header and rejects non-numeric prefixes.
    fn length(&mut self) -> DecodeResult<Option<(i64, u64)>> {
        let Some((line, at)) = self.line()? else {
            return Ok(None);
        };
        let len = parse_decimal(&line).ok_or_else(|| error(at, ProtocolErrorKind::InvalidLength))?;
        Ok(Some((len, at)))
    }

    /// `<data>\r\n` of a bulk string whose header was already consumed.
    fn bulk_payload(&mut self, len: usize) -> DecodeResult<Option<RespValue>> {
        let needed = len + CRLF.len();
        if self.buffer.len() < needed {
            // Let the next socket read bring in a useful amount at once
            let missing = needed - self.buffer.len();
            self.buffer.reserve(missing.min(MAX_READ_RESERVE));
            return Ok(None);
        }
        if &self.buffer[len..needed] != CRLF {
            return Err(error(
                self.consumed + len as u64,
                ProtocolErrorKind::MissingCrlf,
            ));
        }

        let data = self.buffer.split_to(len).freeze();
        self.buffer.advance(CRLF.len());
        self.consumed += needed as u64;
        self.pending_bulk = None;
        self.scanned = 0;
        Ok(Some(RespValue::BulkString(data)))
    }
}

fn error(offset: u64, kind: ProtocolErrorKind) -> ProtocolError {
    ProtocolError { offset, kind }
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if found, or None if CRLF is not present.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Parses an optionally negative run of ASCII digits.
///
/// Stricter than `str::parse`: no leading `+`, no whitespace, no empty input.
fn parse_decimal(line: &[u8]) -> Option<i64> {
    let (negative, digits) = match line.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, line),
    };

    if digits.is_empty() {
        return None;
    }

    let mut n: i64 = 0;
    for &d in digits {
        if !d.is_ascii_digit() {
            return None;
        }
        let digit = i64::from(d - b'0');
        n = n.checked_mul(10)?;
        n = if negative {
            n.checked_sub(digit)?
        } else {
            n.checked_add(digit)?
        };
    }
    Some(n)
}
