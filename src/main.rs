//! smtp-blackhole: an SMTP server that delivers nothing
//!
//! Accepts SMTP sessions from any client and answers every command the way
//! a real mail server would, then throws the message away. Meant as a
//! target for testing MTAs, mail libraries and monitoring probes.
//!
//! Features:
//! - Canonical replies for EHLO/LHLO, HELO, MAIL, RCPT, DATA, BDAT, RSET, QUIT
//! - Opportunistic STARTTLS when a certificate is configured
//! - Artificial per-reply latency
//! - Configuration via CLI arguments or TOML file

mod commands;
mod config;
mod server;
mod session;
mod tls;

use commands::CommandTable;
use config::Config;
use server::Server;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let acceptor = match (&config.cert, &config.key) {
        (Some(cert), Some(key)) => Some(tls::load_acceptor(cert, key)?),
        (None, Some(key)) => {
            warn!(key = %key.display(), "Private key given without a certificate, STARTTLS disabled");
            None
        }
        _ => None,
    };

    let commands = Arc::new(CommandTable::new(acceptor.is_some()));
    let session = Arc::new(config.session(acceptor));
    let workers = config.worker_threads();

    info!(
        listen = %config.listen(),
        latency_ms = session.latency.delay().as_millis() as u64,
        verbose = session.verbose,
        starttls = commands.starttls(),
        data_scan = ?session.data_scan,
        workers,
        "Starting smtp-blackhole"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let server = Server::bind(&config.listen(), commands, session).await?;
        server.run().await
    })?;

    Ok(())
}
