//! Length-prefixed frame codec
//!
//! Every message on the wire is a 4-byte big-endian length followed by that
//! many opaque payload bytes. Sockets are never read or written without going
//! through this module.

use std::io::{self, Read};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{RelayError, Result};

/// Size of the length prefix in bytes
pub const LEN_PREFIX: usize = 4;

/// Largest payload the length field can describe
pub const MAX_PAYLOAD: usize = u32::MAX as usize;

/// Default cap applied when decoding frames from untrusted peers
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Frame a payload: big-endian `u32` length, then the payload bytes.
pub fn encode(payload: &[u8]) -> Result<Bytes> {
    let len = u32::try_from(payload.len()).map_err(|_| RelayError::FrameTooLarge {
        len: payload.len(),
        max: MAX_PAYLOAD,
    })?;

    let mut frame = BytesMut::with_capacity(LEN_PREFIX + payload.len());
    frame.put_u32(len);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Read exactly one frame, waiting as long as the stream keeps delivering.
///
/// Fails with [`RelayError::ShortRead`] if the stream ends before the prefix
/// or the payload is complete.
pub async fn decode_blocking<R>(reader: &mut R) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    decode_blocking_limited(reader, MAX_PAYLOAD).await
}

/// Like [`decode_blocking`], rejecting prefixes larger than `max_frame_len`
/// before any payload is allocated.
pub async fn decode_blocking_limited<R>(reader: &mut R, max_frame_len: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LEN_PREFIX];
    read_full(reader, &mut prefix).await?;

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_frame_len {
        return Err(RelayError::FrameTooLarge {
            len,
            max: max_frame_len,
        });
    }

    let mut payload = vec![0u8; len];
    read_full(reader, &mut payload).await?;
    Ok(Bytes::from(payload))
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => {
                return Err(RelayError::ShortRead {
                    expected: buf.len(),
                    received: filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(RelayError::ShortRead {
                    expected: buf.len(),
                    received: filled,
                })
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Incremental frame decoder for non-blocking streams.
///
/// Bytes that arrive ahead of a complete frame are kept between polls, so a
/// sender that stalls after the length prefix never blocks the caller.
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    max_frame_len: usize,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameReader {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_frame_len,
        }
    }

    /// Number of bytes received but not yet returned as a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Attempt to decode one frame without blocking.
    ///
    /// `reader` must be in non-blocking mode. Returns `Ok(None)` when no
    /// complete frame is available yet, [`RelayError::ShortRead`] when the
    /// peer closed with a partial frame buffered, and
    /// [`RelayError::Disconnected`] when it closed on a frame boundary.
    pub fn decode_nonblocking<R: Read>(&mut self, reader: &mut R) -> Result<Option<Bytes>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.split_frame()? {
                return Ok(Some(frame));
            }

            match reader.read(&mut chunk) {
                Ok(0) if self.buf.is_empty() => return Err(RelayError::Disconnected),
                Ok(0) => {
                    return Err(RelayError::ShortRead {
                        expected: self.expected_len(),
                        received: self.buf.len(),
                    })
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn peek_len(&self) -> Option<usize> {
        let prefix: [u8; LEN_PREFIX] = self.buf.get(..LEN_PREFIX)?.try_into().ok()?;
        Some(u32::from_be_bytes(prefix) as usize)
    }

    fn expected_len(&self) -> usize {
        LEN_PREFIX + self.peek_len().unwrap_or(0)
    }

    fn split_frame(&mut self) -> Result<Option<Bytes>> {
        let Some(len) = self.peek_len() else {
            return Ok(None);
        };
        if len > self.max_frame_len {
            return Err(RelayError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }

        self.buf.advance(LEN_PREFIX);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}
