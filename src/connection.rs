//! Byte-stream adapter used by the framing layer.
//!
//! [`Connection`] wraps any ordered reliable byte stream and exposes the
//! two read shapes framing needs — exactly-n bytes and until-a-sentinel —
//! with an overall deadline per operation and a hard per-line byte
//! ceiling. All reads go through an internal buffer so a sentinel search
//! never consumes bytes that belong to the next read.

use std::{io, time::Duration};

use bytes::BytesMut;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, ToSocketAddrs},
    time::timeout,
};

/// Default ceiling for a single received line, in bytes.
pub const DEFAULT_LINE_LIMIT: usize = 1024;

/// Errors surfaced by stream operations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream is closed for writing.
    #[error("stream is not connected")]
    NotConnected,
    /// Lower-layer transport failure.
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),
    /// The stream closed before the expected bytes arrived.
    #[error("stream ended before the expected bytes arrived")]
    EndOfStream,
    /// The operation's overall deadline elapsed.
    #[error("stream deadline elapsed")]
    Timeout,
    /// No sentinel byte appeared within the byte ceiling.
    #[error("no sentinel within {limit} bytes")]
    FrameOverflow {
        /// The ceiling that was exceeded.
        limit: usize,
    },
}

fn read_error(err: io::Error) -> StreamError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => StreamError::EndOfStream,
        _ => StreamError::Transport(err),
    }
}

fn write_error(err: io::Error) -> StreamError {
    match err.kind() {
        io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => StreamError::NotConnected,
        _ => StreamError::Transport(err),
    }
}

/// An ordered reliable byte stream with buffered, bounded reads.
pub struct Connection<S> {
    io: S,
    buf: BytesMut,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a raw stream.
    pub fn new(io: S) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Write all bytes, honoring the deadline when one is given.
    ///
    /// # Errors
    /// [`StreamError::NotConnected`] when the peer is gone,
    /// [`StreamError::Timeout`] past the deadline, [`StreamError::Transport`]
    /// for other I/O failures.
    pub async fn send(
        &mut self,
        bytes: &[u8],
        deadline: Option<Duration>,
    ) -> Result<(), StreamError> {
        let io = &mut self.io;
        let write = async move {
            io.write_all(bytes).await.map_err(write_error)?;
            io.flush().await.map_err(write_error)
        };
        with_deadline(deadline, write).await
    }

    /// Read exactly `n` bytes. The deadline covers the whole operation,
    /// not each byte.
    ///
    /// # Errors
    /// [`StreamError::EndOfStream`] when the stream closes early,
    /// [`StreamError::Timeout`] past the deadline.
    pub async fn recv_exact(
        &mut self,
        n: usize,
        deadline: Option<Duration>,
    ) -> Result<Vec<u8>, StreamError> {
        let io = &mut self.io;
        let buf = &mut self.buf;
        let read = async move {
            while buf.len() < n {
                let got = io.read_buf(buf).await.map_err(read_error)?;
                if got == 0 {
                    return Err(StreamError::EndOfStream);
                }
            }
            Ok(buf.split_to(n).to_vec())
        };
        with_deadline(deadline, read).await
    }

    /// Read up to the first occurrence of `sentinel`, returning the bytes
    /// before it (and the sentinel itself when `include` is set). The
    /// sentinel is always consumed.
    ///
    /// # Errors
    /// [`StreamError::FrameOverflow`] when more than `limit` bytes arrive
    /// without the sentinel, plus the errors of [`Connection::recv_exact`].
    pub async fn recv_until(
        &mut self,
        sentinel: u8,
        limit: usize,
        deadline: Option<Duration>,
        include: bool,
    ) -> Result<Vec<u8>, StreamError> {
        let io = &mut self.io;
        let buf = &mut self.buf;
        let read = async move {
            loop {
                if let Some(at) = buf.iter().position(|b| *b == sentinel) {
                    if at > limit {
                        return Err(StreamError::FrameOverflow { limit });
                    }
                    let mut data = buf.split_to(at + 1).to_vec();
                    if !include {
                        data.truncate(at);
                    }
                    return Ok(data);
                }
                if buf.len() > limit {
                    return Err(StreamError::FrameOverflow { limit });
                }
                let got = io.read_buf(buf).await.map_err(read_error)?;
                if got == 0 {
                    return Err(StreamError::EndOfStream);
                }
            }
        };
        with_deadline(deadline, read).await
    }

    /// Read one 0x0A-terminated line as UTF-8 text, without the terminator.
    ///
    /// # Errors
    /// The errors of [`Connection::recv_until`]; non-UTF-8 line bytes are a
    /// transport error.
    pub async fn recv_line(
        &mut self,
        limit: usize,
        deadline: Option<Duration>,
    ) -> Result<String, StreamError> {
        let bytes = self.recv_until(b'\n', limit, deadline, false).await?;
        String::from_utf8(bytes).map_err(|e| {
            StreamError::Transport(io::Error::new(io::ErrorKind::InvalidData, e))
        })
    }

    /// Consume the adapter and return the underlying stream.
    pub fn into_inner(self) -> S { self.io }
}

async fn with_deadline<F, T>(limit: Option<Duration>, fut: F) -> Result<T, StreamError>
where
    F: Future<Output = Result<T, StreamError>>,
{
    match limit {
        Some(d) => timeout(d, fut).await.map_err(|_| StreamError::Timeout)?,
        None => fut.await,
    }
}

/// Connect to a TCP peer, retrying up to `attempts` times with `delay`
/// between tries.
///
/// # Errors
/// Returns the last connection error once the attempts are exhausted.
pub async fn connect_with_retry<A>(
    addr: A,
    attempts: u32,
    delay: Duration,
) -> Result<TcpStream, StreamError>
where
    A: ToSocketAddrs + Clone,
{
    let mut last = None;
    for attempt in 0..attempts.max(1) {
        if attempt > 0 {
            tokio::time::sleep(delay).await;
        }
        match TcpStream::connect(addr.clone()).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                tracing::debug!(attempt, error = %err, "connect attempt failed");
                last = Some(err);
            }
        }
    }
    Err(last.map_or(StreamError::NotConnected, StreamError::Transport))
}
