//! Frame-level I/O over a byte stream.
//!
//! [`FrameReader`] and [`FrameWriter`] wrap the two halves of a connection.
//! They are generic over tokio's `AsyncRead`/`AsyncWrite` so the same code
//! drives TCP sockets in production and `tokio::io::duplex` pipes in tests.

use std::io;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::frame::{self, FrameError, HEADER_SIZE, Message};

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The peer ended the stream. `received` counts the bytes of the
    /// interrupted read that did arrive.
    #[error("connection closed by peer ({received} of {expected} bytes received)")]
    Closed { expected: usize, received: usize },
    #[error("connection i/o failed")]
    Io(#[from] io::Error),
    #[error("protocol violation")]
    Protocol(#[from] FrameError),
}

impl ConnectionError {
    /// True when the peer hung up, either cleanly between frames or by
    /// resetting the socket.
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Closed { .. } => true,
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            Self::Protocol(_) => false,
        }
    }
}

pub struct FrameReader<R> {
    inner: R,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads exactly `n` bytes, retrying short reads until the buffer is full.
    ///
    /// Returns [`ConnectionError::Closed`] as soon as the peer closes before
    /// `n` bytes have arrived; a short buffer is never returned.
    pub async fn read_exact(&mut self, n: usize) -> Result<BytesMut, ConnectionError> {
        let mut buf = BytesMut::zeroed(n);
        let mut filled = 0;
        while filled < n {
            match self.inner.read(&mut buf[filled..]).await {
                Ok(0) => {
                    return Err(ConnectionError::Closed {
                        expected: n,
                        received: filled,
                    });
                }
                Ok(read) => filled += read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(buf)
    }

    /// Reads one complete frame. The body is only read once the header has
    /// been validated.
    pub async fn read_message(&mut self) -> Result<Message, ConnectionError> {
        let raw = self.read_exact(HEADER_SIZE).await?;
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&raw);

        let length = frame::decode_header(header)?;
        let body = self.read_exact(length).await?;
        Ok(Message::new(body.freeze()))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

pub struct FrameWriter<W> {
    inner: W,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes the whole buffer and flushes it before returning.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), ConnectionError> {
        self.inner.write_all(buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Encodes `message` and writes it as one contiguous frame.
    pub async fn write_message(&mut self, message: &Message) -> Result<(), ConnectionError> {
        self.write_all(&message.encode()).await
    }

    pub async fn shutdown(&mut self) -> Result<(), ConnectionError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
