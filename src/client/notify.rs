use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::protocol::codec;

/// Default deadline for reaching the relay's notify endpoint
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Send one notification to the relay and hang up.
///
/// Nothing is read back. Failures are terminal for this call; retrying is up
/// to the caller.
pub async fn notify(relay_addr: &str, payload: &[u8]) -> Result<()> {
    notify_with_timeout(relay_addr, payload, DEFAULT_NOTIFY_TIMEOUT).await
}

pub async fn notify_with_timeout(
    relay_addr: &str,
    payload: &[u8],
    connect_timeout: Duration,
) -> Result<()> {
    let frame = codec::encode(payload)?;

    let mut stream =
        match tokio::time::timeout(connect_timeout, TcpStream::connect(relay_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(RelayError::RelayUnreachable {
                    addr: relay_addr.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(RelayError::RelayUnreachable {
                    addr: relay_addr.to_string(),
                    source: std::io::ErrorKind::TimedOut.into(),
                })
            }
        };

    stream
        .write_all(&frame)
        .await
        .map_err(RelayError::WriteIncomplete)?;
    stream
        .shutdown()
        .await
        .map_err(RelayError::WriteIncomplete)?;

    debug!(relay = relay_addr, len = payload.len(), "notification sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn sends_one_frame_then_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let sender = tokio::spawn(async move { notify(&addr, b"hello").await });
        let (mut conn, _) = listener.accept().await.unwrap();

        let mut received = Vec::new();
        conn.read_to_end(&mut received).await.unwrap();
        sender.await.unwrap().unwrap();

        assert_eq!(received, b"\x00\x00\x00\x05hello");
    }

    #[tokio::test]
    async fn unreachable_relay_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = notify(&addr, b"main").await.unwrap_err();
        assert!(matches!(err, RelayError::RelayUnreachable { .. }));
    }
}
