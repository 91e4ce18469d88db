//! Follow-up behavior for verbs that do more than reply.
//!
//! - DATA: swallow the message body until `\r\n.\r\n`, then reply `250 OK`
//! - BDAT: nothing; chunked transfer is acknowledged but never read
//! - STARTTLS: handled by the command loop, see `SessionStream::starttls`

use clap::ValueEnum;
use serde::Deserialize;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::Session;
use crate::commands::OK;

/// End-of-data marker.
pub const TERMINATOR: &[u8] = b"\r\n.\r\n";

/// How the DATA body is scanned for its terminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DataScan {
    /// Keep the tail of each chunk so a terminator split across reads is
    /// still found. The tail of the DATA command line seeds the window, so
    /// an empty body (`.\r\n`) after `DATA\r\n` ends the transfer.
    #[default]
    Carryover,
    /// Look at each chunk on its own. A terminator split across two reads
    /// is never seen and the transfer only ends when the peer goes away.
    Legacy,
}

/// Incremental terminator search over successive chunks.
#[derive(Debug)]
pub struct DataScanner {
    policy: DataScan,
    tail: Vec<u8>,
}

impl DataScanner {
    /// `seed` is the last chunk read before the body, normally the DATA
    /// command line itself.
    pub fn new(policy: DataScan, seed: &[u8]) -> Self {
        let tail = match policy {
            DataScan::Carryover => {
                let keep = TERMINATOR.len() - 1;
                seed[seed.len().saturating_sub(keep)..].to_vec()
            }
            DataScan::Legacy => Vec::new(),
        };
        DataScanner { policy, tail }
    }

    /// Feed the next chunk; returns true once the terminator has been seen.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        if contains(chunk, TERMINATOR) {
            return true;
        }
        if self.policy == DataScan::Legacy {
            return false;
        }

        // Only the seam between the old tail and the new chunk is unscanned
        let head = &chunk[..chunk.len().min(TERMINATOR.len() - 1)];
        let mut seam = Vec::with_capacity(self.tail.len() + head.len());
        seam.extend_from_slice(&self.tail);
        seam.extend_from_slice(head);
        if contains(&seam, TERMINATOR) {
            return true;
        }

        let keep = TERMINATOR.len() - 1;
        if chunk.len() >= keep {
            self.tail.clear();
            self.tail.extend_from_slice(&chunk[chunk.len() - keep..]);
        } else {
            self.tail.extend_from_slice(chunk);
            let excess = self.tail.len().saturating_sub(keep);
            self.tail.drain(..excess);
        }
        false
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

impl Session {
    /// Consume the message body. Returns `false` if the peer closed the
    /// connection before the terminator arrived; no reply is sent then.
    pub(super) async fn data<S>(&mut self, stream: &mut S) -> io::Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut scanner = DataScanner::new(self.config.data_scan, self.reader.chunk());

        loop {
            let n = self.reader.read(stream).await?;
            if n == 0 {
                debug!("Connection closed inside DATA");
                return Ok(false);
            }

            if self.config.verbose {
                info!("-- Received {} bytes", n);
            }

            if scanner.feed(self.reader.chunk()) {
                self.config.latency.inject().await;
                self.send(stream, OK).await?;
                return Ok(true);
            }
        }
    }

    /// BDAT is acknowledged by its table entry and nothing else happens:
    /// the chunk is neither read nor checked against its declared size.
    pub(super) fn bdat(&self) {
        debug!("BDAT acknowledged, chunk left unread");
    }
}
