//! TCP Server
//!
//! Binds the listener, starts the coordinator, and turns every accepted
//! socket into a peer: a registered [`PeerHandle`] plus its reader and
//! writer tasks.
//!
//! ## Example
//!
//! ```no_run
//! use jollykv::{Config, Server};
//!
//! # async fn start() -> anyhow::Result<()> {
//! let server = Server::bind(Config::default()).await?;
//! let summary = server.run_until_ctrl_c().await?;
//! println!("closed {} peers", summary.peers_closed);
//! # Ok(())
//! # }
//! ```

use crate::commands::Dispatcher;
use crate::config::Config;
use crate::connection::{run_reader, run_writer, PeerChannels, PeerHandle, PeerId};
use crate::coordinator::{Coordinator, CoordinatorHandle, ShutdownSummary};
use crate::protocol::DecoderConfig;
use crate::storage::{MemoryStore, Store};
use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// A bound server that has not started accepting yet.
pub struct Server {
    listener: TcpListener,
    coordinator: Coordinator,
    handle: CoordinatorHandle,
    config: Config,
}

impl Server {
    /// Binds the listener and builds the coordinator over a fresh store.
    pub async fn bind(config: Config) -> Result<Self> {
        let address = config.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("failed to bind {}", address))?;

        let store: Arc<dyn Store> = Arc::new(MemoryStore::with_max_keys(config.max_keys));
        let (coordinator, handle) =
            Coordinator::new(Dispatcher::new(store), config.inbound_capacity);

        info!(address = %listener.local_addr()?, "Listening");

        Ok(Self {
            listener,
            coordinator,
            handle,
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A handle on the coordinator; [`CoordinatorHandle::shutdown`] stops the server.
    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    /// Accepts connections until `shutdown` resolves or the coordinator stops.
    pub async fn run_until<F>(self, shutdown: F) -> Result<ShutdownSummary>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            coordinator,
            handle,
            config,
        } = self;

        let mut coordinator_task = tokio::spawn(coordinator.run());
        let decoder_config = config.decoder_config();
        let mut next_id: PeerId = 1;
        tokio::pin!(shutdown);

        let summary = loop {
            tokio::select! {
                finished = &mut coordinator_task => {
                    break finished.context("coordinator task failed")?;
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping server...");
                    handle.shutdown();
                    break (&mut coordinator_task)
                        .await
                        .context("coordinator task failed")?;
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        spawn_peer(next_id, stream, addr, &config, decoder_config, &handle);
                        next_id += 1;
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
            }
        };

        info!("Server shutdown complete");
        Ok(summary)
    }

    /// Runs until Ctrl+C.
    pub async fn run_until_ctrl_c(self) -> Result<ShutdownSummary> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listener", &self.listener.local_addr().ok())
            .field("config", &self.config)
            .finish()
    }
}

/// Starts the writer, then registers the peer and runs its reader.
fn spawn_peer(
    id: PeerId,
    stream: TcpStream,
    addr: SocketAddr,
    config: &Config,
    decoder_config: DecoderConfig,
    coordinator: &CoordinatorHandle,
) {
    info!(peer = id, client = %addr, "Client connected");

    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = id, error = %e, "Failed to set TCP_NODELAY");
    }

    let (reader, writer) = stream.into_split();
    let (peer, channels) = PeerHandle::new(id, addr, config.reply_capacity);
    let PeerChannels { replies, closed } = channels;

    tokio::spawn(run_writer(id, writer, replies));

    let coordinator = coordinator.clone();
    tokio::spawn(async move {
        if coordinator.register(peer).await.is_err() {
            debug!(peer = id, client = %addr, "Coordinator stopped before registration");
            return;
        }
        // Errors are logged by the reader itself
        let _ = run_reader(id, addr, reader, decoder_config, coordinator, closed).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn start_server(
        config: Config,
    ) -> (SocketAddr, CoordinatorHandle, JoinHandle<Result<ShutdownSummary>>) {
        let server = Server::bind(Config { port: 0, ..config }).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        let task = tokio::spawn(server.run_until(std::future::pending()));
        (addr, handle, task)
    }

    async fn expect_reply(stream: &mut TcpStream, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        tokio::time::timeout(TIMEOUT, stream.read_exact(&mut buf))
            .await
            .expect("timed out waiting for reply")
            .unwrap();
        assert_eq!(
            String::from_utf8_lossy(&buf),
            String::from_utf8_lossy(expected)
        );
    }

    async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut buf))
            .await
            .expect("timed out waiting for close")
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (addr, handle, task) = start_server(Config::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n")
            .await
            .unwrap();
        expect_reply(&mut client, b"+OK\r\n").await;

        client.write_all(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").await.unwrap();
        expect_reply(&mut client, b"$1\r\nv\r\n").await;

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pipelined_requests_reply_in_order() {
        let (addr, handle, task) = start_server(Config::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(
                b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n\
                  *2\r\n$3\r\nGET\r\n$1\r\nk\r\n\
                  *2\r\n$3\r\nGET\r\n$7\r\nmissing\r\n\
                  *1\r\n$4\r\nPING\r\n",
            )
            .await
            .unwrap();
        expect_reply(&mut client, b"+OK\r\n$1\r\nv\r\n$-1\r\n+PONG\r\n").await;

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_frame_split_across_writes() {
        let (addr, handle, task) = start_server(Config::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.set_nodelay(true).unwrap();

        client.write_all(b"*2\r\n$4\r\nEC").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"HO\r\n$5\r\nhel").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"lo\r\n").await.unwrap();

        expect_reply(&mut client, b"$5\r\nhello\r\n").await;

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_only_that_connection() {
        let (addr, handle, task) = start_server(Config::default()).await;
        let mut bad = TcpStream::connect(addr).await.unwrap();
        let mut good = TcpStream::connect(addr).await.unwrap();

        good.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        expect_reply(&mut good, b"+PONG\r\n").await;

        bad.write_all(b"*1\r\n$-5\r\n").await.unwrap();
        let reply = read_until_closed(&mut bad).await;
        let reply = String::from_utf8(reply).unwrap();
        assert!(reply.starts_with("-ERR Protocol error"), "{}", reply);
        assert!(reply.ends_with("\r\n"));

        good.write_all(b"*2\r\n$4\r\nECHO\r\n$5\r\nstill\r\n").await.unwrap();
        expect_reply(&mut good, b"$5\r\nstill\r\n").await;

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_command_errors_keep_the_connection_open() {
        let (addr, handle, task) = start_server(Config::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"*2\r\n$3\r\nSET\r\n$1\r\nk\r\n").await.unwrap();
        expect_reply(
            &mut client,
            b"-ERR wrong number of arguments for 'set' command\r\n",
        )
        .await;

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        expect_reply(&mut client, b"+PONG\r\n").await;

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_connected_clients() {
        let (addr, handle, task) = start_server(Config::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // A reply proves the peer is registered
        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        expect_reply(&mut client, b"+PONG\r\n").await;

        handle.shutdown();

        assert!(read_until_closed(&mut client).await.is_empty());
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.peers_closed, 1);
        assert_eq!(summary.frames_dispatched, 1);
    }

    #[tokio::test]
    async fn test_disconnected_client_is_removed_under_load() {
        let (addr, handle, task) = start_server(Config::default()).await;
        let mut leaving = TcpStream::connect(addr).await.unwrap();
        let mut busy = TcpStream::connect(addr).await.unwrap();

        leaving.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        expect_reply(&mut leaving, b"+PONG\r\n").await;
        drop(leaving);

        // Keep the inbound channel busy while the departure is processed
        let batch = b"*1\r\n$4\r\nPING\r\n".repeat(50);
        let replies = b"+PONG\r\n".repeat(50);
        for _ in 0..200 {
            busy.write_all(&batch).await.unwrap();
            expect_reply(&mut busy, &replies).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        handle.shutdown();
        assert!(read_until_closed(&mut busy).await.is_empty());
        let summary = task.await.unwrap().unwrap();

        // Only the busy client was still registered at shutdown
        assert_eq!(summary.peers_closed, 1);
        assert_eq!(summary.frames_dispatched, 1 + 200 * 50);
    }

    #[tokio::test]
    async fn test_run_until_future() {
        let server = Server::bind(Config {
            port: 0,
            ..Config::default()
        })
        .await
        .unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = rx.await;
        }));

        tx.send(()).unwrap();
        let summary = tokio::time::timeout(TIMEOUT, task)
            .await
            .expect("server should stop")
            .unwrap()
            .unwrap();
        assert_eq!(summary, ShutdownSummary::default());
    }

    #[tokio::test]
    async fn test_store_limit_from_config() {
        let (addr, handle, task) = start_server(Config {
            max_keys: 1,
            ..Config::default()
        })
        .await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n")
            .await
            .unwrap();
        expect_reply(&mut client, b"+OK\r\n").await;

        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nb\r\n$1\r\n2\r\n")
            .await
            .unwrap();
        expect_reply(&mut client, b"-OOM").await;

        handle.shutdown();
        task.await.unwrap().unwrap();
    }
}
