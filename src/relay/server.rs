//! Notification relay
//!
//! Two listening endpoints: hooks connect to `notify` and send a single
//! frame, replicas connect to `subscribe` and only ever receive frames. One
//! control task owns the subscriber [`Registry`]; everything else talks to it
//! through channels.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::registry::{Registry, SubscriberId};
use crate::error::{write_error, RelayError, Result};
use crate::protocol::codec::{self, DEFAULT_MAX_FRAME_LEN};

const COMMAND_CAPACITY: usize = 32;
const NOTIFY_QUEUE_CAPACITY: usize = 256;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Relay endpoints and deadlines
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Where hooks deliver notifications
    pub notify_addr: SocketAddr,

    /// Where replicas subscribe
    pub subscribe_addr: SocketAddr,

    /// Deadline for a hook to deliver its one frame
    pub notify_read_timeout: Duration,

    /// Deadline for a full frame write to one subscriber
    pub subscriber_write_timeout: Duration,

    /// Largest notification payload accepted from a hook
    pub max_frame_len: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            notify_addr: SocketAddr::from(([0, 0, 0, 0], 9001)),
            subscribe_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            notify_read_timeout: Duration::from_secs(5),
            subscriber_write_timeout: Duration::from_secs(2),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl RelayConfig {
    /// Loopback relay on ephemeral ports
    pub fn local() -> Self {
        Self {
            notify_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            subscribe_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        }
    }
}

/// Counters reported by a running relay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub subscribers: usize,
    pub notifications: u64,
    pub rejected_notifications: u64,
    pub frames_delivered: u64,
    pub subscribers_pruned: u64,
}

/// Outcome of writing one message to every registered subscriber
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<SubscriberId>,
    pub pruned: Vec<SubscriberId>,
    pub retained_after_error: Vec<SubscriberId>,
}

enum RelayCommand {
    Stats(oneshot::Sender<RelayStats>),
    Shutdown,
}

type NotifyOutcome = (SocketAddr, Result<Bytes>);

pub struct RelayServer {
    config: RelayConfig,
    notify: TcpListener,
    subscribe: TcpListener,
    notify_addr: SocketAddr,
    subscribe_addr: SocketAddr,
    registry: Registry,
    stats: RelayStats,
    commands_tx: mpsc::Sender<RelayCommand>,
    commands: mpsc::Receiver<RelayCommand>,
}

impl RelayServer {
    /// Bind both endpoints. Port 0 picks an ephemeral port.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let notify = TcpListener::bind(config.notify_addr).await?;
        let subscribe = TcpListener::bind(config.subscribe_addr).await?;
        let notify_addr = notify.local_addr()?;
        let subscribe_addr = subscribe.local_addr()?;
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);

        info!(%notify_addr, %subscribe_addr, "relay listening");

        Ok(Self {
            config,
            notify,
            subscribe,
            notify_addr,
            subscribe_addr,
            registry: Registry::new(),
            stats: RelayStats::default(),
            commands_tx,
            commands,
        })
    }

    pub fn notify_addr(&self) -> SocketAddr {
        self.notify_addr
    }

    pub fn subscribe_addr(&self) -> SocketAddr {
        self.subscribe_addr
    }

    /// Control handle usable while the relay runs
    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            commands: self.commands_tx.clone(),
            notify_addr: self.notify_addr,
            subscribe_addr: self.subscribe_addr,
        }
    }

    /// Run the relay on its own task
    pub fn spawn(self) -> RunningRelay {
        let handle = self.handle();
        let task = tokio::spawn(self.run());
        RunningRelay { handle, task }
    }

    /// Serve until a shutdown is requested through a [`RelayHandle`].
    pub async fn run(mut self) -> Result<()> {
        let (notify_tx, mut notify_rx) = mpsc::channel::<NotifyOutcome>(NOTIFY_QUEUE_CAPACITY);

        loop {
            tokio::select! {
                accepted = self.subscribe.accept() => match accepted {
                    Ok((stream, peer)) => self.add_subscriber(stream, peer),
                    Err(e) => {
                        warn!(error = %e, "subscriber accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },

                accepted = self.notify.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "notify connection accepted");
                        tokio::spawn(read_notification(
                            stream,
                            peer,
                            self.config.notify_read_timeout,
                            self.config.max_frame_len,
                            notify_tx.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "notify accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },

                Some((peer, outcome)) = notify_rx.recv() => match outcome {
                    Ok(message) => self.publish(peer, message).await,
                    Err(e) => {
                        self.stats.rejected_notifications += 1;
                        warn!(%peer, error = %e, "dropping notification");
                    }
                },

                command = self.commands.recv() => match command {
                    Some(RelayCommand::Stats(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(RelayCommand::Shutdown) | None => break,
                },
            }
        }

        info!(subscribers = self.registry.len(), "relay shutting down");
        self.registry.clear();
        Ok(())
    }

    fn add_subscriber(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "could not disable nagle");
        }
        let id = self.registry.insert(stream, peer);
        info!(%id, %peer, subscribers = self.registry.len(), "subscriber added");
    }

    async fn publish(&mut self, peer: SocketAddr, message: Bytes) {
        self.stats.notifications += 1;
        info!(
            %peer,
            len = message.len(),
            payload = %String::from_utf8_lossy(&message),
            subscribers = self.registry.len(),
            "received notification"
        );

        match broadcast(
            &mut self.registry,
            &message,
            self.config.subscriber_write_timeout,
        )
        .await
        {
            Ok(report) => {
                self.stats.frames_delivered += report.delivered.len() as u64;
                self.stats.subscribers_pruned += report.pruned.len() as u64;
            }
            Err(e) => warn!(error = %e, "broadcast aborted"),
        }
    }

    fn snapshot(&self) -> RelayStats {
        RelayStats {
            subscribers: self.registry.len(),
            ..self.stats.clone()
        }
    }
}

/// Read the single frame a hook sends, then close its connection.
async fn read_notification(
    mut stream: TcpStream,
    peer: SocketAddr,
    read_timeout: Duration,
    max_frame_len: usize,
    outcomes: mpsc::Sender<NotifyOutcome>,
) {
    let read = codec::decode_blocking_limited(&mut stream, max_frame_len);
    let outcome = match tokio::time::timeout(read_timeout, read).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::ReadTimeout(read_timeout)),
    };
    drop(stream);

    let _ = outcomes.send((peer, outcome)).await;
}

/// Write `message` as one frame to every subscriber in `registry`.
///
/// Subscribers whose peer is gone, or whose write misses the deadline, are
/// removed and closed. Other write errors are logged and the subscriber kept.
pub async fn broadcast<S>(
    registry: &mut Registry<S>,
    message: &[u8],
    write_timeout: Duration,
) -> Result<BroadcastReport>
where
    S: AsyncWrite + Unpin,
{
    let frame = codec::encode(message)?;
    let frame = &frame;

    let writes = registry.iter_mut().map(|subscriber| async move {
        let id = subscriber.id();
        let peer = subscriber.peer();
        let connected_at = subscriber.connected_at();
        let result = write_frame(&mut subscriber.stream, frame, write_timeout).await;
        (id, peer, connected_at, result)
    });
    let results = join_all(writes).await;

    let mut report = BroadcastReport::default();
    for (id, peer, connected_at, result) in results {
        match result {
            Ok(()) => {
                debug!(%id, %peer, "frame delivered");
                report.delivered.push(id);
            }
            // A timed-out write may have left a partial frame on the stream.
            Err(e @ (RelayError::WriteFailedTerminal(_) | RelayError::WriteTimeout(_))) => {
                info!(
                    %id,
                    %peer,
                    connected_for = ?connected_at.elapsed(),
                    error = %e,
                    "removing subscriber"
                );
                registry.remove(id);
                report.pruned.push(id);
            }
            Err(e) => {
                warn!(%id, %peer, error = %e, "write to subscriber failed");
                report.retained_after_error.push(id);
            }
        }
    }

    Ok(report)
}

async fn write_frame<S>(stream: &mut S, frame: &[u8], write_timeout: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let write = async {
        stream.write_all(frame).await?;
        stream.flush().await
    };
    match tokio::time::timeout(write_timeout, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(write_error(e)),
        Err(_) => Err(RelayError::WriteTimeout(write_timeout)),
    }
}

/// Cloneable control channel to a running relay
#[derive(Debug, Clone)]
pub struct RelayHandle {
    commands: mpsc::Sender<RelayCommand>,
    notify_addr: SocketAddr,
    subscribe_addr: SocketAddr,
}

impl RelayHandle {
    pub fn notify_addr(&self) -> SocketAddr {
        self.notify_addr
    }

    pub fn subscribe_addr(&self) -> SocketAddr {
        self.subscribe_addr
    }

    pub async fn stats(&self) -> Result<RelayStats> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RelayCommand::Stats(reply))
            .await
            .map_err(|_| RelayError::Disconnected)?;
        rx.await.map_err(|_| RelayError::Disconnected)
    }

    /// Ask the relay to stop; returns once the request is queued
    pub async fn shutdown(&self) {
        let _ = self.commands.send(RelayCommand::Shutdown).await;
    }
}

impl std::fmt::Debug for RelayCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayCommand::Stats(_) => f.write_str("Stats"),
            RelayCommand::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// A relay running on a background task
pub struct RunningRelay {
    handle: RelayHandle,
    task: JoinHandle<Result<()>>,
}

impl RunningRelay {
    pub fn handle(&self) -> &RelayHandle {
        &self.handle
    }

    pub fn notify_addr(&self) -> SocketAddr {
        self.handle.notify_addr
    }

    pub fn subscribe_addr(&self) -> SocketAddr {
        self.handle.subscribe_addr
    }

    pub async fn stats(&self) -> Result<RelayStats> {
        self.handle.stats().await
    }

    /// Stop the relay and wait for its task to finish
    pub async fn shutdown(self) -> Result<()> {
        self.handle.shutdown().await;
        self.join().await
    }

    /// Wait for the relay task to exit
    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(RelayError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                e,
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let mut registry: Registry<DuplexStream> = Registry::new();
        let mut readers = Vec::new();
        for _ in 0..3 {
            let (relay_side, replica_side) = duplex(1024);
            registry.insert(relay_side, peer());
            readers.push(replica_side);
        }

        let report = broadcast(&mut registry, b"main", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.delivered.len(), 3);
        assert!(report.pruned.is_empty());

        for reader in &mut readers {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"\x00\x00\x00\x04main");
        }
    }

    #[tokio::test]
    async fn broadcast_prunes_closed_subscribers() {
        let mut registry: Registry<DuplexStream> = Registry::new();
        let (live_side, mut live_reader) = duplex(1024);
        let (dead_side, dead_reader) = duplex(1024);
        let live = registry.insert(live_side, peer());
        let dead = registry.insert(dead_side, peer());
        drop(dead_reader);

        let report = broadcast(&mut registry, b"one", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.pruned, vec![dead]);
        assert_eq!(report.delivered, vec![live]);
        assert!(!registry.contains(dead));

        let report = broadcast(&mut registry, b"two", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.delivered, vec![live]);
        assert!(report.pruned.is_empty());

        let mut buf = vec![0u8; 14];
        live_reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x00\x00\x00\x03one\x00\x00\x00\x03two");
    }

    #[tokio::test]
    async fn broadcast_drops_stalled_subscriber() {
        let mut registry: Registry<DuplexStream> = Registry::new();
        // Buffer smaller than one frame and nobody reading: the write stalls.
        let (stalled_side, _stalled_reader) = duplex(2);
        let (live_side, mut live_reader) = duplex(1024);
        let stalled = registry.insert(stalled_side, peer());
        let live = registry.insert(live_side, peer());

        let report = broadcast(&mut registry, b"payload", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(report.pruned, vec![stalled]);
        assert_eq!(report.delivered, vec![live]);

        let mut buf = [0u8; 11];
        live_reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[4..], b"payload");
    }

    #[tokio::test]
    async fn relay_reports_stats_and_shuts_down() {
        let relay = RelayServer::bind(RelayConfig::local()).await.unwrap().spawn();
        let stats = relay.stats().await.unwrap();
        assert_eq!(stats, RelayStats::default());
        relay.shutdown().await.unwrap();
    }
}
