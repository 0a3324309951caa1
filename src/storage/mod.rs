//! Storage Module
//!
//! The command layer only ever talks to storage through the [`Store`]
//! trait: a handful of synchronous operations that never block on I/O.
//! [`MemoryStore`] is the in-process implementation used by the server.
//!
//! ## Example
//!
//! ```
//! use jollykv::storage::{MemoryStore, Store};
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! let store = MemoryStore::new();
//!
//! store.set(Bytes::from("name"), Bytes::from("Ariz"), None).unwrap();
//! assert_eq!(store.get(b"name"), Some(Bytes::from("Ariz")));
//!
//! store
//!     .set(Bytes::from("session"), Bytes::from("token123"), Some(Duration::from_secs(3600)))
//!     .unwrap();
//! assert!(store.delete(b"session"));
//! ```

pub mod memory;

use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

pub use memory::{MemoryStore, StoreStats};

/// Failures a storage operation can report.
///
/// The `Display` output is sent to clients verbatim as an error reply, so
/// each message starts with its error code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("OOM command not allowed when the store holds {max_keys} keys")]
    OutOfMemory { max_keys: usize },

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR increment or decrement would overflow")]
    Overflow,

    #[error("ERR invalid expire time in 'set' command")]
    InvalidExpire,
}

/// The storage collaborator the command dispatcher executes against.
///
/// Implementations must be fast and must not block on I/O: they are called
/// from the coordinator's single task.
pub trait Store: Send + Sync {
    /// Returns the value for `key`, or `None` if absent or expired.
    fn get(&self, key: &[u8]) -> Option<Bytes>;

    /// Stores `value` under `key`, replacing any previous value and TTL.
    fn set(&self, key: Bytes, value: Bytes, expire: Option<Duration>) -> Result<(), StoreError>;

    /// Removes `key`. Returns whether a live key was removed.
    fn delete(&self, key: &[u8]) -> bool;

    fn exists(&self, key: &[u8]) -> bool;

    /// Adds `delta` to the integer stored at `key` (missing keys count as 0).
    fn incr_by(&self, key: &[u8], delta: i64) -> Result<i64, StoreError>;

    /// Appends to the value at `key`, creating it if missing. Returns the new length.
    fn append(&self, key: &[u8], value: &[u8]) -> Result<usize, StoreError>;

    /// Number of keys, including expired keys not yet reclaimed.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every key.
    fn flush(&self);

    /// Fails if `new_keys` more keys would not fit.
    ///
    /// Lets a multi-key write check once before applying anything.
    fn ensure_capacity(&self, new_keys: usize) -> Result<(), StoreError> {
        let _ = new_keys;
        Ok(())
    }
}
