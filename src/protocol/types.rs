//! Protocol Values
//!
//! [`RespValue`] is the one type both directions of a connection share: the
//! decoder builds requests out of it and the dispatcher answers with it.
//!
//! ## Wire Markers
//!
//! | Marker | Value                       | Example                    |
//! |--------|-----------------------------|----------------------------|
//! | `+`    | [`RespValue::SimpleString`] | `+OK\r\n`                  |
//! | `-`    | [`RespValue::Error`]        | `-ERR unknown command\r\n` |
//! | `:`    | [`RespValue::Integer`]      | `:1000\r\n`                |
//! | `$`    | [`RespValue::BulkString`]   | `$5\r\nhello\r\n`          |
//! | `*`    | [`RespValue::Array`]        | `*1\r\n$4\r\nPING\r\n`     |
//!
//! A length of `-1` after `$` or `*` is a null. Every header line ends in
//! `\r\n`; bulk payloads are followed by one more.

use bytes::Bytes;
use std::fmt;

/// Line terminator.
pub const CRLF: &[u8] = b"\r\n";

/// First byte of each encoded value.
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A request or reply, as a tree.
///
/// `Null` (`$-1`) and `NullArray` (`*-1`) stay distinct, so re-encoding a
/// decoded value reproduces its bytes exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Status text such as `OK`. Never holds CR or LF.
    SimpleString(String),

    /// Error text, conventionally led by a code like `ERR` or `OOM`.
    Error(String),

    Integer(i64),

    /// Length-prefixed, binary-safe payload. Keys and values travel as these.
    BulkString(Bytes),

    /// `$-1`, the reply for a missing key.
    Null,

    /// Elements in order. Commands arrive as arrays of bulk strings.
    Array(Vec<RespValue>),

    /// `*-1`
    NullArray,
}

impl RespValue {
    /// ```
    /// use jollykv::protocol::types::RespValue;
    /// assert_eq!(RespValue::simple_string("OK"), RespValue::ok());
    /// ```
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    /// ```
    /// use jollykv::protocol::types::RespValue;
    /// let reply = RespValue::error("ERR unknown command 'FOO'");
    /// assert!(reply.is_error());
    /// ```
    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    /// ```
    /// use jollykv::protocol::types::RespValue;
    /// let value = RespValue::bulk_string("hello");
    /// assert_eq!(value.as_bytes(), Some(&b"hello"[..]));
    /// ```
    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    pub fn null() -> Self {
        RespValue::Null
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn pong() -> Self {
        RespValue::SimpleString("PONG".to_string())
    }

    /// Encodes into a fresh buffer.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Appends the encoding to `buf`.
    ///
    /// The writer task batches several replies into one buffer this way.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => line(buf, prefix::SIMPLE_STRING, s.as_bytes()),
            RespValue::Error(s) => line(buf, prefix::ERROR, s.as_bytes()),
            RespValue::Integer(n) => line(buf, prefix::INTEGER, n.to_string().as_bytes()),
            RespValue::BulkString(data) => {
                line(buf, prefix::BULK_STRING, data.len().to_string().as_bytes());
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespValue::Null => line(buf, prefix::BULK_STRING, b"-1"),
            RespValue::Array(values) => {
                line(buf, prefix::ARRAY, values.len().to_string().as_bytes());
                for value in values {
                    value.serialize_into(buf);
                }
            }
            RespValue::NullArray => line(buf, prefix::ARRAY, b"-1"),
        }
    }

    /// True for either kind of null.
    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null | RespValue::NullArray)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// The payload of a bulk string; `None` for anything else.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }
}

/// Writes `<marker><body>\r\n`.
fn line(buf: &mut Vec<u8>, marker: u8, body: &[u8]) {
    buf.reserve(body.len() + 3);
    buf.push(marker);
    buf.extend_from_slice(body);
    buf.extend_from_slice(CRLF);
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "\"{}\"", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::BulkString(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "(binary data, {} bytes)", data.len()),
            },
            RespValue::Null | RespValue::NullArray => write!(f, "(nil)"),
            RespValue::Array(values) => {
                write!(f, "[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
        }
    }
}
