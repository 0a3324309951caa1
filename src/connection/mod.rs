//! Connection Module
//!
//! Everything that touches a client socket. Each accepted connection gets
//! two tasks:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! │                    (server.rs)                              │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ accept(), into_split()
//!          ┌─────────────┴─────────────┐
//!          ▼                           ▼
//! ┌─────────────────┐         ┌─────────────────┐
//! │   run_reader    │         │   run_writer    │
//! │  bytes ─> RESP  │         │  RESP ─> bytes  │
//! └────────┬────────┘         └────────▲────────┘
//!          │ Inbound                   │ reply queue
//!          ▼                           │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Coordinator                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Pipelining**: every complete frame in a read is forwarded in order
//! - **Backpressure**: readers wait when the coordinator's inbound queue is full
//! - **Batched writes**: replies already queued go out in one write
//! - **Ordered close**: a closed peer still receives its queued replies

pub mod peer;

pub use peer::{
    read_loop, run_reader, run_writer, write_loop, ConnectionError, DeliveryError, Inbound,
    Payload, PeerChannels, PeerHandle, PeerId,
};
