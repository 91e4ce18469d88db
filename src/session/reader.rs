//! Chunk reader for the command loop.
//!
//! Every read replaces the previous contents of a fixed-size buffer.
//! Whatever arrived in one read is treated as one command line; only its
//! first four bytes are looked at for dispatch.

use bytes::BytesMut;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::commands::VERB_LEN;

/// Read buffer size
pub const BUFFER_SIZE: usize = 4096;

/// Fixed-size chunk reader with an optional read deadline.
pub struct LineReader {
    buffer: BytesMut,
    timeout: Option<Duration>,
}

impl LineReader {
    pub fn new(timeout: Option<Duration>) -> Self {
        LineReader {
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            timeout,
        }
    }

    /// Read the next chunk from `stream`, discarding the previous one.
    ///
    /// Returns the number of bytes read; zero means the peer closed the
    /// connection. With a read timeout configured, a silent peer yields
    /// `ErrorKind::TimedOut`.
    pub async fn read<R>(&mut self, stream: &mut R) -> io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        self.buffer.clear();
        self.buffer.reserve(BUFFER_SIZE);

        let mut limited = (&mut *stream).take(BUFFER_SIZE as u64);
        let read = limited.read_buf(&mut self.buffer);

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))?,
            None => read.await,
        }
    }

    /// Bytes from the last read.
    pub fn chunk(&self) -> &[u8] {
        &self.buffer
    }

    /// The verb prefix of the last read, if it was long enough to hold one.
    pub fn verb(&self) -> Option<&[u8]> {
        self.buffer.get(..VERB_LEN)
    }
}
