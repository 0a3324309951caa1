//! Event Coordinator
//!
//! One task owns every piece of shared server state: the peer registry and
//! the running flag. Everything else talks to it through channels.
//!
//! ```text
//!   accept loop ──add_peer──┐        ┌────────────────────────────┐
//!   read loops ───inbound───┼──────> │  select! (biased)          │
//!   shutdown ────watch──────┘        │    1. shutdown             │
//!                                    │    2. add_peer             │
//!                                    │    3. inbound              │
//!                                    │       Frame ─> dispatch    │
//!                                    │       Malformed, Gone      │
//!                                    └─────────────┬──────────────┘
//!                                                  │ PeerHandle::send
//!                                                  ▼
//!                                           per-peer writers
//! ```
//!
//! The priority order means a peer's registration is always handled before
//! its first frame. A read loop's frames and its final `Gone` share one
//! FIFO channel, so trailing frames are handled before the removal and the
//! removal cannot be starved by other peers' traffic. Handlers
//! run to completion and never await, so a slow client can only ever fill
//! its own reply queue.

use crate::commands::Dispatcher;
use crate::connection::{ConnectionError, DeliveryError, Inbound, Payload, PeerHandle, PeerId};
use crate::protocol::{ProtocolError, RespValue};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Capacity of the peer-add channel.
const PEER_EVENT_CAPACITY: usize = 256;

/// The coordinator's lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Running,
    Stopped,
}

/// What the coordinator did over its lifetime, returned by [`Coordinator::run`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Peers closed by the shutdown, registered or still pending
    pub peers_closed: usize,
    /// Frames handed to the dispatcher
    pub frames_dispatched: u64,
    /// Replies that could not be delivered
    pub replies_dropped: u64,
    /// Events still queued when the coordinator stopped
    pub events_discarded: u64,
}

/// Cloneable entry point into a running coordinator.
///
/// Once every handle has been dropped, the coordinator shuts itself down.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    add_peer: mpsc::Sender<PeerHandle>,
    inbound: mpsc::Sender<Inbound>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl CoordinatorHandle {
    /// Hands a new peer to the coordinator.
    ///
    /// Fails if the coordinator has stopped; the peer is closed in that case.
    pub async fn register(&self, peer: PeerHandle) -> Result<(), ConnectionError> {
        self.add_peer
            .send(peer)
            .await
            .map_err(|_| ConnectionError::CoordinatorClosed)
    }

    /// The channel read loops forward decoded frames on.
    pub fn inbound(&self) -> &mpsc::Sender<Inbound> {
        &self.inbound
    }

    /// Reports that a peer's read side has finished.
    ///
    /// Queued behind the peer's own frames on the inbound channel.
    pub async fn peer_gone(&self, peer: PeerId) {
        let message = Inbound {
            peer,
            payload: Payload::Gone,
        };
        // A stopped coordinator has already forgotten every peer
        let _ = self.inbound.send(message).await;
    }

    /// Asks the coordinator to stop. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// The single owner of the peer registry.
pub struct Coordinator {
    state: CoordinatorState,
    peers: HashMap<PeerId, PeerHandle>,
    dispatcher: Dispatcher,
    add_peer_rx: mpsc::Receiver<PeerHandle>,
    inbound_rx: mpsc::Receiver<Inbound>,
    shutdown_rx: watch::Receiver<bool>,
    summary: ShutdownSummary,
}

impl Coordinator {
    /// Creates a coordinator and the handle used to reach it.
    ///
    /// `inbound_capacity` bounds how many decoded frames may wait across all
    /// peers before read loops stop reading.
    pub fn new(dispatcher: Dispatcher, inbound_capacity: usize) -> (Self, CoordinatorHandle) {
        let (add_peer_tx, add_peer_rx) = mpsc::channel(PEER_EVENT_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let coordinator = Self {
            state: CoordinatorState::Running,
            peers: HashMap::new(),
            dispatcher,
            add_peer_rx,
            inbound_rx,
            shutdown_rx,
            summary: ShutdownSummary::default(),
        };
        let handle = CoordinatorHandle {
            add_peer: add_peer_tx,
            inbound: inbound_tx,
            shutdown: Arc::new(shutdown_tx),
        };
        (coordinator, handle)
    }

    /// Processes events until shutdown.
    pub async fn run(mut self) -> ShutdownSummary {
        info!("Coordinator started");

        while self.state == CoordinatorState::Running {
            tokio::select! {
                biased;

                // Err means every handle is gone, which is a shutdown too
                _ = self.shutdown_rx.changed() => {
                    self.on_shutdown_requested();
                }

                Some(peer) = self.add_peer_rx.recv() => {
                    self.on_peer_registered(peer);
                }

                Some(message) = self.inbound_rx.recv() => match message.payload {
                    Payload::Frame(frame) => self.on_frame_received(message.peer, frame),
                    Payload::Malformed(error) => self.on_protocol_violation(message.peer, error),
                    Payload::Gone => self.on_peer_gone(message.peer),
                },
            }
        }

        info!(
            peers_closed = self.summary.peers_closed,
            frames_dispatched = self.summary.frames_dispatched,
            replies_dropped = self.summary.replies_dropped,
            events_discarded = self.summary.events_discarded,
            "Coordinator stopped"
        );
        self.summary
    }

    /// Adds a peer to the registry.
    pub fn on_peer_registered(&mut self, peer: PeerHandle) {
        if self.state == CoordinatorState::Stopped {
            self.summary.peers_closed += 1;
            peer.close();
            return;
        }

        let id = peer.id();
        trace!(peer = id, client = %peer.addr(), "Peer registered");

        if let Some(previous) = self.peers.insert(id, peer) {
            debug!(peer = id, "Duplicate registration replaced a live peer");
            previous.close();
        }
    }

    /// Dispatches one frame and queues the reply on the peer's write path.
    pub fn on_frame_received(&mut self, peer: PeerId, frame: RespValue) {
        if !self.peers.contains_key(&peer) {
            debug!(peer, "Frame from unregistered peer, dropping");
            self.summary.replies_dropped += 1;
            return;
        }

        trace!(peer, frame = %frame, "Dispatching frame");
        let reply = self.dispatcher.dispatch(frame);
        self.summary.frames_dispatched += 1;
        self.deliver(peer, reply);
    }

    /// Answers a malformed stream with an error reply, then closes the peer.
    pub fn on_protocol_violation(&mut self, peer: PeerId, error: ProtocolError) {
        warn!(peer, error = %error, "Protocol violation, closing connection");
        self.deliver(peer, RespValue::error(format!("ERR Protocol error: {}", error)));
        self.deregister(peer);
    }

    /// Forgets a peer whose read side has finished. Unknown ids are ignored.
    pub fn on_peer_gone(&mut self, peer: PeerId) {
        if self.deregister(peer) {
            trace!(peer, "Peer deregistered");
        }
    }

    /// Stops the coordinator: closes every peer and discards pending events.
    pub fn on_shutdown_requested(&mut self) {
        if self.state == CoordinatorState::Stopped {
            return;
        }
        self.state = CoordinatorState::Stopped;
        info!(peers = self.peers.len(), "Coordinator shutting down");

        for (_, peer) in self.peers.drain() {
            peer.close();
            self.summary.peers_closed += 1;
        }

        self.add_peer_rx.close();
        self.inbound_rx.close();

        while let Ok(peer) = self.add_peer_rx.try_recv() {
            peer.close();
            self.summary.peers_closed += 1;
            self.summary.events_discarded += 1;
        }
        while self.inbound_rx.try_recv().is_ok() {
            self.summary.events_discarded += 1;
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_registered(&self, peer: PeerId) -> bool {
        self.peers.contains_key(&peer)
    }

    pub fn summary(&self) -> ShutdownSummary {
        self.summary
    }

    /// Queues `reply` for `peer` without waiting.
    fn deliver(&mut self, peer: PeerId, reply: RespValue) {
        let Some(handle) = self.peers.get(&peer) else {
            debug!(peer, "Reply for unregistered peer dropped");
            self.summary.replies_dropped += 1;
            return;
        };
        let addr = handle.addr();

        match handle.send(reply) {
            Ok(()) => {}
            Err(DeliveryError::Full) => {
                warn!(peer, client = %addr, "Slow consumer, closing connection");
                self.summary.replies_dropped += 1;
                self.deregister(peer);
            }
            Err(DeliveryError::Closed) => {
                debug!(peer, client = %addr, "Writer already gone, dropping reply");
                self.summary.replies_dropped += 1;
                self.deregister(peer);
            }
        }
    }

    fn deregister(&mut self, peer: PeerId) -> bool {
        match self.peers.remove(&peer) {
            Some(handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("state", &self.state)
            .field("peers", &self.peers.len())
            .field("summary", &self.summary)
            .finish()
    }
}
