//! Session transport that can be upgraded to TLS in place.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// The duplex byte stream a session talks over.
///
/// Starts out as `Plain`. STARTTLS consumes it and hands back the `Tls`
/// variant, which owns the underlying socket.
pub enum SessionStream<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
}

impl<S> SessionStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the server side of a TLS handshake over the plaintext stream.
    pub async fn starttls(self, acceptor: &TlsAcceptor) -> io::Result<Self> {
        match self {
            SessionStream::Plain(io) => {
                let tls = acceptor.accept(io).await?;
                Ok(SessionStream::Tls(Box::new(tls)))
            }
            SessionStream::Tls(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "STARTTLS on a session that is already encrypted",
            )),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, SessionStream::Tls(_))
    }
}

impl<S> AsyncRead for SessionStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SessionStream::Plain(io) => Pin::new(io).poll_read(cx, buf),
            SessionStream::Tls(io) => Pin::new(io).poll_read(cx, buf),
        }
    }
}

impl<S> AsyncWrite for SessionStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SessionStream::Plain(io) => Pin::new(io).poll_write(cx, buf),
            SessionStream::Tls(io) => Pin::new(io).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SessionStream::Plain(io) => Pin::new(io).poll_flush(cx),
            SessionStream::Tls(io) => Pin::new(io).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SessionStream::Plain(io) => Pin::new(io).poll_shutdown(cx),
            SessionStream::Tls(io) => Pin::new(io).poll_shutdown(cx),
        }
    }
}
