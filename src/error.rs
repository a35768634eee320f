//! Relay Error Handling and Retry Logic
//!
//! Error taxonomy for the relay protocol, classification of socket write
//! failures, and the backoff policy used when a replica reconnects to the
//! relay.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result alias for relay and sync operations
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Errors raised by the wire codec, relay, sync client and notify sender
#[derive(Debug, Error)]
pub enum RelayError {
    /// The initial subscribe or notify connection could not be established
    #[error("relay unreachable at {addr}: {source}")]
    RelayUnreachable {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The peer closed the stream in the middle of a frame
    #[error("stream closed mid-frame ({received} of {expected} bytes)")]
    ShortRead { expected: usize, received: usize },

    /// The peer closed the stream cleanly between frames
    #[error("peer disconnected")]
    Disconnected,

    /// A notify write did not put the whole frame on the wire
    #[error("incomplete write to relay: {0}")]
    WriteIncomplete(#[source] io::Error),

    /// Broadcast write failed because the subscriber is gone
    #[error("subscriber disconnected: {0}")]
    WriteFailedTerminal(#[source] io::Error),

    /// Broadcast write failed for a reason that may clear up
    #[error("transient write failure: {0}")]
    WriteFailedTransient(#[source] io::Error),

    /// Broadcast write did not complete within the subscriber deadline
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// A notify sender did not deliver its frame within the read deadline
    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),

    /// Payload does not fit the 32-bit length field, or exceeds the configured cap
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    /// An external pull/commit/push action returned a failure
    #[error("{action} failed: {detail}")]
    SyncActionFailed { action: &'static str, detail: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Whether this error ends the connection it happened on
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            RelayError::ShortRead { .. }
                | RelayError::Disconnected
                | RelayError::WriteFailedTerminal(_)
        )
    }
}

impl From<RelayError> for io::Error {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Io(e) => e,
            RelayError::ReadTimeout(_) | RelayError::WriteTimeout(_) => {
                io::Error::new(io::ErrorKind::TimedOut, err)
            }
            RelayError::Disconnected | RelayError::ShortRead { .. } => {
                io::Error::new(io::ErrorKind::UnexpectedEof, err)
            }
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

/// How a failed subscriber write should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailure {
    /// The peer is gone; remove the subscriber
    Terminal,

    /// Something else went wrong; keep the subscriber
    Transient,
}

/// Classify a socket write error as terminal (peer gone) or transient
pub fn classify_write_error(err: &io::Error) -> WriteFailure {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::WriteZero => WriteFailure::Terminal,
        _ => WriteFailure::Transient,
    }
}

/// Wrap a write error into the matching taxonomy variant
pub fn write_error(err: io::Error) -> RelayError {
    match classify_write_error(&err) {
        WriteFailure::Terminal => RelayError::WriteFailedTerminal(err),
        WriteFailure::Transient => RelayError::WriteFailedTransient(err),
    }
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts; `None` retries forever
    pub max_attempts: Option<u32>,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_millis(250),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_attempts: Some(1),
            ..Default::default()
        }
    }

    /// Create an aggressive retry policy
    pub fn aggressive() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_millis(50),
            backoff_multiplier: 1.5,
            max_delay: Duration::from_secs(3),
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }

    /// Delay to wait after a failed attempt, given the previous delay
    pub fn next_delay(&self, previous: Duration) -> Duration {
        Duration::from_secs_f64(
            (previous.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }

    /// Iterator over successive delays, capped at `max_delay`
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.initial_delay.min(self.max_delay)), move |d| {
            Some(self.next_delay(*d))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_error_classification() {
        let pipe = io::Error::from(io::ErrorKind::BrokenPipe);
        assert_eq!(classify_write_error(&pipe), WriteFailure::Terminal);

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(classify_write_error(&reset), WriteFailure::Terminal);

        let other = io::Error::from(io::ErrorKind::Interrupted);
        assert_eq!(classify_write_error(&other), WriteFailure::Transient);

        assert!(write_error(pipe).is_disconnect());
        assert!(!write_error(other).is_disconnect());
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy::default();
        assert!(policy.allows(1_000));

        let no_retry = RetryPolicy::no_retry();
        assert!(no_retry.allows(0));
        assert!(!no_retry.allows(1));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: None,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(500),
        };
        let delays: Vec<u128> = policy.delays().take(5).map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_io_conversion_keeps_message() {
        let err: io::Error = RelayError::SyncActionFailed {
            action: "push",
            detail: "non-fast-forward".into(),
        }
        .into();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert!(err.to_string().contains("non-fast-forward"));

        let err: io::Error = RelayError::Disconnected.into();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
