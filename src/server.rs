//! TCP listener for SMTP sessions.
//!
//! Accepts connections and runs one session task per connection. Sessions
//! share the command table and session settings read-only; nothing else
//! crosses between them.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info, info_span, Instrument};

use crate::commands::CommandTable;
use crate::session::{Session, SessionConfig};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    listener: TcpListener,
    commands: Arc<CommandTable>,
    config: Arc<SessionConfig>,
}

impl Server {
    /// Bind the listening socket. Must be called from within a runtime.
    pub async fn bind(
        listen: &str,
        commands: Arc<CommandTable>,
        config: Arc<SessionConfig>,
    ) -> io::Result<Self> {
        let addr: SocketAddr = listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = TcpListener::from_std(create_listener(addr)?)?;

        Ok(Server {
            listener,
            commands,
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until Ctrl-C.
    pub async fn run(self) -> io::Result<()> {
        self.serve(async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Accept connections until `shutdown` completes. Sessions already
    /// running are left to finish on their own.
    pub async fn serve<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            address = %self.local_addr()?,
            starttls = self.commands.starttls(),
            "Server listening"
        );

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "New connection");

                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }

                        let session = Session::new(Arc::clone(&self.commands), Arc::clone(&self.config));
                        tokio::spawn(
                            async move {
                                match session.run(stream).await {
                                    Ok(()) => debug!("Session closed"),
                                    Err(e) => debug!(error = %e, "Session ended"),
                                }
                            }
                            .instrument(info_span!("session", peer = %peer)),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutting down");
                    return Ok(());
                }
            }
        }
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}
