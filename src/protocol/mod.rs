//! RESP Protocol Implementation
//!
//! JollyKV speaks a RESP-compatible wire protocol. Requests are arrays of
//! bulk strings (`*2\r\n$3\r\nGET\r\n$4\r\nname\r\n`); replies may be any
//! token type.
//!
//! ## Modules
//!
//! - `types`: The `RespValue` token tree and its serialization
//! - `decoder`: Resumable per-connection decoder for incoming bytes
//!
//! ## Example
//!
//! ```
//! use jollykv::protocol::{RespDecoder, RespValue};
//! use bytes::Bytes;
//!
//! let mut decoder = RespDecoder::new();
//! let frames = decoder.decode(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n").unwrap();
//! assert_eq!(frames.len(), 1);
//!
//! let reply = RespValue::bulk_string(Bytes::from("Ariz"));
//! assert_eq!(reply.serialize(), b"$4\r\nAriz\r\n");
//! ```

pub mod decoder;
pub mod types;

pub use decoder::{DecodeResult, DecoderConfig, ProtocolError, ProtocolErrorKind, RespDecoder};
pub use types::RespValue;
