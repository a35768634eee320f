//! Replica side of the relay: pull-before-serve.
//!
//! A [`SyncClient`] keeps one subscribe connection to the relay. Filesystem
//! operations call [`SyncClient::check_and_sync`] first; it polls the
//! connection without blocking and runs the pull action only when a
//! notification has arrived. A lost relay link never fails the filesystem
//! operation: the client drops to offline mode and a background task
//! reconnects with exponential backoff.

use std::net::TcpStream as StdTcpStream;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result, RetryPolicy};
use crate::protocol::codec::{FrameReader, DEFAULT_MAX_FRAME_LEN};
use crate::vcs::SyncAction;

/// Connection and reconnect behaviour of a [`SyncClient`]
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Deadline for establishing the subscribe connection
    pub connect_timeout: Duration,

    /// Largest notification accepted from the relay
    pub max_frame_len: usize,

    /// Background reconnect policy; `None` stays offline once the link drops
    pub reconnect: Option<RetryPolicy>,

    /// Pull once after a lost link is re-established
    pub pull_after_reconnect: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            reconnect: Some(RetryPolicy::default()),
            pull_after_reconnect: true,
        }
    }
}

/// Relay link lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LinkState::Connecting,
            2 => LinkState::Connected,
            _ => LinkState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LinkState::Disconnected => 0,
            LinkState::Connecting => 1,
            LinkState::Connected => 2,
        }
    }
}

/// What a call to [`SyncClient::check_and_sync`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Connected, nothing pending
    Idle,

    /// No relay link; served from the current working tree
    Offline,

    /// Notifications drained (`frames`, possibly 0 after a reconnect) and the pull succeeded
    Pulled { frames: usize },

    /// Notifications drained but the pull failed; served from the current working tree
    PullFailed { frames: usize },
}

struct Link {
    stream: Option<StdTcpStream>,
    frames: FrameReader,
    catch_up: bool,
}

struct Shared {
    relay_addr: String,
    options: SyncOptions,
    link: Mutex<Link>,
    handoff: Mutex<Option<StdTcpStream>>,
    state: AtomicU8,
    wake: Notify,
    pulls: AtomicU64,
    notifications: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: LinkState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Subscriber handle shared by every filesystem operation of one mount
pub struct SyncClient {
    shared: Arc<Shared>,
    action: Arc<dyn SyncAction>,
    reconnector: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// Connect to the relay's subscribe endpoint.
    ///
    /// Fails with [`RelayError::RelayUnreachable`] if the connection cannot be
    /// established within `options.connect_timeout`.
    pub async fn connect(
        relay_addr: impl Into<String>,
        options: SyncOptions,
        action: Arc<dyn SyncAction>,
    ) -> Result<Self> {
        let relay_addr = relay_addr.into();
        let stream = open_link(&relay_addr, options.connect_timeout).await?;
        info!(relay = %relay_addr, "subscribed to relay");
        Ok(Self::start(relay_addr, options, action, Some(stream)))
    }

    /// Connect if possible, otherwise start offline and keep retrying in the
    /// background.
    pub async fn connect_or_offline(
        relay_addr: impl Into<String>,
        options: SyncOptions,
        action: Arc<dyn SyncAction>,
    ) -> Self {
        let relay_addr = relay_addr.into();
        match open_link(&relay_addr, options.connect_timeout).await {
            Ok(stream) => {
                info!(relay = %relay_addr, "subscribed to relay");
                Self::start(relay_addr, options, action, Some(stream))
            }
            Err(e) => {
                warn!(error = %e, "relay unreachable, starting offline");
                Self::start(relay_addr, options, action, None)
            }
        }
    }

    fn start(
        relay_addr: String,
        options: SyncOptions,
        action: Arc<dyn SyncAction>,
        stream: Option<StdTcpStream>,
    ) -> Self {
        let state = if stream.is_some() {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
        let reconnect = options.reconnect.is_some();
        let shared = Arc::new(Shared {
            link: Mutex::new(Link {
                stream,
                frames: FrameReader::new(options.max_frame_len),
                catch_up: false,
            }),
            relay_addr,
            options,
            handoff: Mutex::new(None),
            state: AtomicU8::new(state.as_u8()),
            wake: Notify::new(),
            pulls: AtomicU64::new(0),
            notifications: AtomicU64::new(0),
        });

        let reconnector = reconnect.then(|| tokio::spawn(maintain_link(shared.clone())));

        Self {
            shared,
            action,
            reconnector,
        }
    }

    pub fn relay_addr(&self) -> &str {
        &self.shared.relay_addr
    }

    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    /// Number of pulls this client has run
    pub fn pulls(&self) -> u64 {
        self.shared.pulls.load(Ordering::Relaxed)
    }

    /// Number of relay notifications drained
    pub fn notifications(&self) -> u64 {
        self.shared.notifications.load(Ordering::Relaxed)
    }

    /// Poll the relay link and pull if anything changed.
    ///
    /// Never blocks on the relay: with nothing pending it returns after one
    /// non-blocking read. All notifications available at the time of the call
    /// are coalesced into a single pull, which runs synchronously so the
    /// caller observes the updated tree. Errors are logged, never returned.
    pub fn check_and_sync(&self) -> SyncOutcome {
        let mut link = self.shared.link.lock();

        if link.stream.is_none() {
            match self.shared.handoff.lock().take() {
                Some(stream) => {
                    link.stream = Some(stream);
                    link.frames = FrameReader::new(self.shared.options.max_frame_len);
                    link.catch_up = self.shared.options.pull_after_reconnect;
                }
                None => return SyncOutcome::Offline,
            }
        }

        let (frames, lost) = drain(&mut link);
        if frames > 0 {
            self.shared
                .notifications
                .fetch_add(frames as u64, Ordering::Relaxed);
        }

        if let Some(e) = lost {
            if e.is_disconnect() {
                info!(relay = %self.shared.relay_addr, error = %e, "relay closed the link, serving offline");
            } else {
                warn!(relay = %self.shared.relay_addr, error = %e, "dropping faulty relay link, serving offline");
            }
            link.stream = None;
            self.shared.set_state(LinkState::Disconnected);
            self.shared.wake.notify_one();
        }

        let catch_up = std::mem::take(&mut link.catch_up);
        if frames == 0 && !catch_up {
            return if link.stream.is_some() {
                SyncOutcome::Idle
            } else {
                SyncOutcome::Offline
            };
        }

        self.shared.pulls.fetch_add(1, Ordering::Relaxed);
        match self.action.pull() {
            Ok(()) => {
                debug!(frames, catch_up, "pulled before serving");
                SyncOutcome::Pulled { frames }
            }
            Err(e) => {
                warn!(frames, error = %e, "pull failed, serving current tree");
                SyncOutcome::PullFailed { frames }
            }
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(task) = self.reconnector.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("relay_addr", &self.shared.relay_addr)
            .field("state", &self.state())
            .field("action", &"<dyn SyncAction>")
            .finish()
    }
}

/// Read every frame currently available. Returns the frame count and the
/// error that ended the link, if any.
fn drain(link: &mut Link) -> (usize, Option<RelayError>) {
    let Link { stream, frames, .. } = link;
    let Some(stream) = stream.as_mut() else {
        return (0, None);
    };

    let mut count = 0;
    loop {
        match frames.decode_nonblocking(stream) {
            Ok(Some(message)) => {
                count += 1;
                log_notification(&message);
            }
            Ok(None) => return (count, None),
            Err(e) => return (count, Some(e)),
        }
    }
}

fn log_notification(message: &Bytes) {
    debug!(
        len = message.len(),
        payload = %String::from_utf8_lossy(message),
        "relay notification"
    );
}

async fn open_link(relay_addr: &str, connect_timeout: Duration) -> Result<StdTcpStream> {
    let unreachable = |source: std::io::Error| RelayError::RelayUnreachable {
        addr: relay_addr.to_string(),
        source,
    };

    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(relay_addr)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(unreachable(e)),
        Err(_) => return Err(unreachable(std::io::ErrorKind::TimedOut.into())),
    };

    let _ = stream.set_nodelay(true);
    let stream = stream.into_std()?;
    stream.set_nonblocking(true)?;
    Ok(stream)
}

/// Re-establish the relay link whenever it drops.
async fn maintain_link(shared: Arc<Shared>) {
    let Some(policy) = shared.options.reconnect.clone() else {
        return;
    };

    loop {
        if shared.state() == LinkState::Connected {
            shared.wake.notified().await;
            continue;
        }

        let mut delays = policy.delays();
        let mut attempts = 0;
        loop {
            shared.set_state(LinkState::Connecting);
            attempts += 1;

            match open_link(&shared.relay_addr, shared.options.connect_timeout).await {
                Ok(stream) => {
                    *shared.handoff.lock() = Some(stream);
                    shared.set_state(LinkState::Connected);
                    info!(relay = %shared.relay_addr, attempts, "reconnected to relay");
                    break;
                }
                Err(e) => {
                    shared.set_state(LinkState::Disconnected);
                    if !policy.allows(attempts) {
                        warn!(relay = %shared.relay_addr, attempts, error = %e, "giving up on relay");
                        return;
                    }
                    let delay = delays.next().unwrap_or(policy.max_delay);
                    debug!(relay = %shared.relay_addr, attempts, ?delay, error = %e, "relay reconnect failed");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
