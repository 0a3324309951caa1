//! Peer: One Connected Client
//!
//! Each accepted socket is split in two halves, each driven by its own task:
//!
//! ```text
//!            ┌──────────────────────────── Coordinator ──────────────────┐
//!            │  registry: PeerId ──> PeerHandle                          │
//!            └─────▲─────────────────────────────────────┬───────────────┘
//!                  │ Inbound { peer, Frame }             │ PeerHandle::send(reply)
//!                  │ (bounded: backpressure)             ▼
//!  socket ──> read_loop ──> RespDecoder        reply queue ──> write_loop ──> socket
//! ```
//!
//! The read loop never writes and the write loop never reads. The
//! coordinator holds the only [`PeerHandle`]; dropping it closes the reply
//! queue (the writer flushes what is queued, then shuts the socket down)
//! and fires the close signal that stops the read loop.

use crate::coordinator::CoordinatorHandle;
use crate::protocol::{DecoderConfig, ProtocolError, RespDecoder, RespValue};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Identity of a connected client, unique for the life of the process.
pub type PeerId = u64;

/// Replies are batched into one write up to this many bytes.
const MAX_BATCH_BYTES: usize = 64 * 1024;

/// Initial capacity of the writer's serialization buffer.
const INITIAL_WRITE_BUFFER: usize = 4096;

/// A message from a peer's read loop to the coordinator.
#[derive(Debug)]
pub struct Inbound {
    pub peer: PeerId,
    pub payload: Payload,
}

#[derive(Debug)]
pub enum Payload {
    /// One complete decoded frame
    Frame(RespValue),
    /// The stream was malformed; the peer must be answered and closed
    Malformed(ProtocolError),
    /// The read side has finished; always the peer's last message
    Gone,
}

/// Why a reply could not be queued for a peer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The peer is not draining its replies fast enough
    #[error("reply queue full")]
    Full,

    /// The peer's writer has already exited
    #[error("peer writer closed")]
    Closed,
}

/// Errors that end a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The stream ended in the middle of a frame
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    #[error("Coordinator closed")]
    CoordinatorClosed,
}

/// The coordinator's handle on one connected client.
///
/// Owned by the coordinator's registry. Not `Clone`: while the handle
/// lives, the peer is live.
#[derive(Debug)]
pub struct PeerHandle {
    id: PeerId,
    addr: SocketAddr,
    replies: mpsc::Sender<RespValue>,
    /// Never sent on; dropping it is the close signal
    _close: oneshot::Sender<()>,
}

/// The task-side ends of a [`PeerHandle`].
#[derive(Debug)]
pub struct PeerChannels {
    /// Drained by the write loop
    pub replies: mpsc::Receiver<RespValue>,
    /// Resolves once the handle is dropped
    pub closed: oneshot::Receiver<()>,
}

impl PeerHandle {
    /// Creates a handle together with the channels its tasks drive.
    ///
    /// `reply_capacity` bounds how many replies may wait for the writer.
    pub fn new(id: PeerId, addr: SocketAddr, reply_capacity: usize) -> (Self, PeerChannels) {
        let (replies_tx, replies_rx) = mpsc::channel(reply_capacity.max(1));
        let (close_tx, close_rx) = oneshot::channel();

        let handle = Self {
            id,
            addr,
            replies: replies_tx,
            _close: close_tx,
        };
        let channels = PeerChannels {
            replies: replies_rx,
            closed: close_rx,
        };
        (handle, channels)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queues a reply for the writer without waiting.
    pub fn send(&self, reply: RespValue) -> Result<(), DeliveryError> {
        self.replies.try_send(reply).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Closes the connection.
    ///
    /// Replies already queued are still written before the socket is shut
    /// down; the read loop stops at its next suspension point.
    pub fn close(self) {
        trace!(peer = self.id, client = %self.addr, "Closing peer");
    }
}

/// Reads from `reader` and forwards decoded frames to the coordinator.
///
/// Returns `Ok(())` on a clean end of stream or when the peer is closed.
pub async fn read_loop<R>(
    peer: PeerId,
    reader: &mut R,
    decoder: &mut RespDecoder,
    inbound: &mpsc::Sender<Inbound>,
    closed: &mut oneshot::Receiver<()>,
) -> Result<(), ConnectionError>
where
    R: AsyncRead + Unpin,
{
    loop {
        // Forward every complete frame already buffered
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    trace!(peer, remaining = decoder.buffered(), "Decoded frame");
                    let message = Inbound {
                        peer,
                        payload: Payload::Frame(frame),
                    };
                    inbound
                        .send(message)
                        .await
                        .map_err(|_| ConnectionError::CoordinatorClosed)?;
                }
                Ok(None) => break,
                Err(e) => {
                    let message = Inbound {
                        peer,
                        payload: Payload::Malformed(e.clone()),
                    };
                    // The connection is over either way
                    let _ = inbound.send(message).await;
                    return Err(ConnectionError::Protocol(e));
                }
            }
        }

        let n = tokio::select! {
            _ = &mut *closed => return Ok(()),
            read = reader.read_buf(decoder.buffer_mut()) => read?,
        };

        if n == 0 {
            return if decoder.is_empty() {
                Ok(())
            } else {
                Err(ConnectionError::UnexpectedEof)
            };
        }

        trace!(peer, bytes = n, "Read data");
    }
}

/// Runs a peer's read side to completion, then reports the peer gone.
pub async fn run_reader<R>(
    peer: PeerId,
    addr: SocketAddr,
    mut reader: R,
    decoder_config: DecoderConfig,
    coordinator: CoordinatorHandle,
    mut closed: oneshot::Receiver<()>,
) -> Result<(), ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = RespDecoder::with_config(decoder_config);
    let result = read_loop(
        peer,
        &mut reader,
        &mut decoder,
        coordinator.inbound(),
        &mut closed,
    )
    .await;

    match &result {
        Ok(()) => debug!(peer, client = %addr, "Client disconnected"),
        Err(ConnectionError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
            debug!(peer, client = %addr, "Connection reset by client")
        }
        Err(ConnectionError::CoordinatorClosed) => {
            debug!(peer, client = %addr, "Coordinator stopped, dropping connection")
        }
        Err(e) => warn!(peer, client = %addr, error = %e, "Connection error"),
    }

    coordinator.peer_gone(peer).await;
    result
}

/// Writes queued replies to `writer` in order until the queue closes.
///
/// Returns the number of bytes written.
pub async fn write_loop<W>(
    peer: PeerId,
    mut writer: W,
    mut replies: mpsc::Receiver<RespValue>,
) -> Result<u64, ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(INITIAL_WRITE_BUFFER);
    let mut written = 0u64;

    while let Some(reply) = replies.recv().await {
        buf.clear();
        reply.serialize_into(&mut buf);

        // Pipelined clients: fold replies already waiting into one write
        while buf.len() < MAX_BATCH_BYTES {
            match replies.try_recv() {
                Ok(next) => next.serialize_into(&mut buf),
                Err(_) => break,
            }
        }

        writer.write_all(&buf).await?;
        writer.flush().await?;
        written += buf.len() as u64;
        trace!(peer, bytes = buf.len(), "Sent replies");
    }

    writer.shutdown().await?;
    Ok(written)
}

/// Runs a peer's write side to completion.
pub async fn run_writer<W>(peer: PeerId, writer: W, replies: mpsc::Receiver<RespValue>)
where
    W: AsyncWrite + Unpin,
{
    match write_loop(peer, writer, replies).await {
        Ok(bytes) => trace!(peer, bytes, "Writer finished"),
        Err(ConnectionError::Io(e))
            if matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
            ) =>
        {
            debug!(peer, "Client went away before replies were written")
        }
        Err(e) => warn!(peer, error = %e, "Write error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolErrorKind;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::duplex;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:5001".parse().unwrap()
    }

    fn command(args: &[&str]) -> RespValue {
        RespValue::Array(
            args.iter()
                .map(|s| RespValue::bulk_string(Bytes::from(s.to_string())))
                .collect(),
        )
    }

    fn drain(rx: &mut mpsc::Receiver<Inbound>) -> Vec<Payload> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            assert_eq!(message.peer, 7);
            out.push(message.payload);
        }
        out
    }

    #[tokio::test]
    async fn test_fragmented_reads_yield_frames_in_order() {
        let mut reader = tokio_test::io::Builder::new()
            .read(b"*1\r\n$4\r\nPI")
            .read(b"NG\r\n*2\r\n$3\r\nGET\r\n$1")
            .read(b"\r\nk\r\n")
            .build();
        let (tx, mut rx) = mpsc::channel(16);
        let (_close_tx, mut close_rx) = oneshot::channel();
        let mut decoder = RespDecoder::new();

        read_loop(7, &mut reader, &mut decoder, &tx, &mut close_rx)
            .await
            .unwrap();

        let payloads = drain(&mut rx);
        assert_eq!(payloads.len(), 2);
        assert!(matches!(&payloads[0], Payload::Frame(f) if *f == command(&["PING"])));
        assert!(matches!(&payloads[1], Payload::Frame(f) if *f == command(&["GET", "k"])));
    }

    #[tokio::test]
    async fn test_malformed_input_is_forwarded_and_ends_the_loop() {
        let mut reader = tokio_test::io::Builder::new()
            .read(b"*1\r\n$4\r\nPING\r\n*1\r\n$-5\r\n")
            .build();
        let (tx, mut rx) = mpsc::channel(16);
        let (_close_tx, mut close_rx) = oneshot::channel();
        let mut decoder = RespDecoder::new();

        let result = read_loop(7, &mut reader, &mut decoder, &tx, &mut close_rx).await;
        assert!(matches!(result, Err(ConnectionError::Protocol(_))));

        let payloads = drain(&mut rx);
        assert_eq!(payloads.len(), 2);
        assert!(matches!(&payloads[0], Payload::Frame(_)));
        match &payloads[1] {
            Payload::Malformed(e) => {
                assert_eq!(e.kind, ProtocolErrorKind::NegativeBulkLength(-5));
                assert_eq!(e.offset, 19);
            }
            other => panic!("expected malformed payload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_eof_mid_frame() {
        let mut reader = tokio_test::io::Builder::new().read(b"*2\r\n$3\r\nGET\r\n").build();
        let (tx, _rx) = mpsc::channel(16);
        let (_close_tx, mut close_rx) = oneshot::channel();
        let mut decoder = RespDecoder::new();

        let result = read_loop(7, &mut reader, &mut decoder, &tx, &mut close_rx).await;
        assert!(matches!(result, Err(ConnectionError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_coordinator_gone() {
        let mut reader = tokio_test::io::Builder::new().read(b"*1\r\n$4\r\nPING\r\n").build();
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let (_close_tx, mut close_rx) = oneshot::channel();
        let mut decoder = RespDecoder::new();

        let result = read_loop(7, &mut reader, &mut decoder, &tx, &mut close_rx).await;
        assert!(matches!(result, Err(ConnectionError::CoordinatorClosed)));
    }

    #[tokio::test]
    async fn test_dropping_the_handle_stops_the_reader() {
        let (mut client, server) = duplex(1024);
        let (handle, mut channels) = PeerHandle::new(7, test_addr(), 4);
        let (tx, _rx) = mpsc::channel(16);

        let reader = tokio::spawn(async move {
            let mut server = server;
            let mut decoder = RespDecoder::new();
            read_loop(7, &mut server, &mut decoder, &tx, &mut channels.closed).await
        });

        // The client stays connected but silent
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.close();

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader should stop once closed")
            .unwrap();
        assert!(result.is_ok());

        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_writer_flushes_queue_then_shuts_down() {
        let (mut client, server) = duplex(1024);
        let (handle, channels) = PeerHandle::new(7, test_addr(), 8);

        handle.send(RespValue::ok()).unwrap();
        handle
            .send(RespValue::bulk_string(Bytes::from("v")))
            .unwrap();
        handle.send(RespValue::error("ERR boom")).unwrap();

        let writer = tokio::spawn(write_loop(7, server, channels.replies));
        drop(handle);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();

        assert_eq!(received, b"+OK\r\n$1\r\nv\r\n-ERR boom\r\n");
        assert_eq!(writer.await.unwrap().unwrap(), received.len() as u64);
    }

    #[tokio::test]
    async fn test_send_reports_full_and_closed() {
        let (handle, channels) = PeerHandle::new(7, test_addr(), 1);

        assert_eq!(handle.send(RespValue::ok()), Ok(()));
        assert_eq!(handle.send(RespValue::ok()), Err(DeliveryError::Full));

        drop(channels);
        assert_eq!(handle.send(RespValue::ok()), Err(DeliveryError::Closed));
    }
}
