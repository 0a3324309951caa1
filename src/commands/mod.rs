//! Command Layer
//!
//! Receives decoded frames, validates them into typed [`Command`]s, runs
//! them against the storage collaborator, and produces reply tokens.
//!
//! ```text
//! Decoded frame
//!       │
//!       ▼
//! ┌─────────────────┐
//! │ Command         │  (command.rs: table lookup, arity, argument types)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ Dispatcher      │  (dispatcher.rs: execute, map errors to replies)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ dyn Store       │  (storage module)
//! └─────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! - `PING [message]`, `ECHO message`
//! - `GET key`, `SET key value [EX seconds | PX milliseconds] [NX | XX]`
//! - `DEL key [key ...]`, `EXISTS key [key ...]`
//! - `INCR`, `DECR`, `INCRBY`, `DECRBY`
//! - `APPEND key value`, `STRLEN key`
//! - `MGET key [key ...]`, `MSET key value [key value ...]`
//! - `DBSIZE`, `FLUSHDB`, `FLUSHALL`

pub mod command;
pub mod dispatcher;

pub use command::{Command, CommandError, SetCondition, COMMAND_TABLE};
pub use dispatcher::Dispatcher;
