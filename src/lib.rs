//! # JollyKV - An In-Memory Key-Value Server
//!
//! JollyKV speaks the RESP wire protocol over TCP. All shared server state
//! lives in a single coordinator task; connections talk to it only through
//! channels, so there are no locks around the peer registry.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              JollyKV                                    │
//! │                                                                         │
//! │  ┌─────────────┐  PeerHandle   ┌──────────────────────────────────────┐ │
//! │  │ TCP Server  │──────────────>│            Coordinator               │ │
//! │  │ (Listener)  │   add_peer    │  registry + running flag             │ │
//! │  └──────┬──────┘               │  select! { shutdown, add_peer,       │ │
//! │         │ spawn                │            inbound, peer_gone }      │ │
//! │         ▼                      └──────┬──────────────────────▲────────┘ │
//! │  ┌─────────────┐   Inbound            │ Dispatcher           │          │
//! │  │ read loop   │──────────────────────┼──────────────────────┘          │
//! │  │ RespDecoder │                      ▼                                 │
//! │  └─────────────┘               ┌─────────────┐    ┌─────────────────┐   │
//! │  ┌─────────────┐  reply queue  │  Command    │───>│  MemoryStore    │   │
//! │  │ write loop  │<──────────────│  execution  │    │  (64 shards)    │   │
//! │  └─────────────┘               └─────────────┘    └─────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use jollykv::{Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::bind(Config::default()).await?;
//!     server.run_until_ctrl_c().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP values and the resumable decoder
//! - [`commands`]: Command table, validation, and the dispatcher
//! - [`storage`]: The `Store` trait and the sharded in-memory store
//! - [`connection`]: Per-connection read and write loops
//! - [`coordinator`]: The single owner of server state
//! - [`server`]: Listener and accept loop
//! - [`config`]: Command-line configuration

pub mod commands;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::{Command, CommandError, Dispatcher};
pub use config::Config;
pub use connection::{ConnectionError, PeerHandle, PeerId};
pub use coordinator::{Coordinator, CoordinatorHandle, CoordinatorState, ShutdownSummary};
pub use protocol::{ProtocolError, RespDecoder, RespValue};
pub use server::Server;
pub use storage::{MemoryStore, Store, StoreError};

/// The default port JollyKV listens on
pub const DEFAULT_PORT: u16 = 5001;

/// The default host JollyKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of JollyKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
