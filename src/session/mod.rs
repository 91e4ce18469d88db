//! Per-connection SMTP session.
//!
//! A session greets the client, then loops: read a chunk, wait out the
//! configured latency, look the verb up in the command table, send the
//! canonical reply and run the verb's continuation if it has one. It ends
//! on EOF or on the first I/O error; nothing is ever stored.
//!
//! ```text
//! Greeting -> CommandLoop -> (DATA scan | STARTTLS | BDAT) -> CommandLoop -> ... -> Closed
//! ```

mod continuation;
mod latency;
mod reader;
mod stream;

pub use continuation::DataScan;
pub use latency::Latency;

use reader::LineReader;
use stream::SessionStream;

use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace};

use crate::commands::{CommandTable, Continuation, GREETING, UNRECOGNIZED};

/// Settings shared read-only by every session.
#[derive(Clone, Default)]
pub struct SessionConfig {
    pub latency: Latency,
    pub verbose: bool,
    pub data_scan: DataScan,
    pub read_timeout: Option<Duration>,
    /// Certificate material for STARTTLS, if any was loaded.
    pub tls: Option<TlsAcceptor>,
}

/// State for a single client connection.
pub struct Session {
    commands: Arc<CommandTable>,
    config: Arc<SessionConfig>,
    reader: LineReader,
}

impl Session {
    pub fn new(commands: Arc<CommandTable>, config: Arc<SessionConfig>) -> Self {
        let reader = LineReader::new(config.read_timeout);
        Session {
            commands,
            config,
            reader,
        }
    }

    /// Drive the session until the client goes away.
    ///
    /// EOF ends the session with `Ok`; read, write and handshake failures
    /// are returned to the caller, which only logs them.
    pub async fn run<S>(mut self, io: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let commands = Arc::clone(&self.commands);
        let mut stream = SessionStream::Plain(io);

        self.send(&mut stream, GREETING).await?;

        loop {
            let n = self.reader.read(&mut stream).await?;
            if n == 0 {
                trace!("Connection closed by client");
                return Ok(());
            }

            if self.config.verbose {
                let line = String::from_utf8_lossy(self.reader.chunk());
                info!("-> [{}]", line.trim_matches(|c: char| c == '\r' || c == '\n' || c == ' '));
            }

            self.config.latency.inject().await;

            let Some(entry) = self.reader.verb().and_then(|verb| commands.lookup(verb)) else {
                self.send(&mut stream, UNRECOGNIZED).await?;
                continue;
            };

            self.send(&mut stream, &entry.response).await?;

            match entry.continuation {
                None => {}
                Some(Continuation::Data) => {
                    if !self.data(&mut stream).await? {
                        return Ok(());
                    }
                }
                Some(Continuation::Bdat) => self.bdat(),
                Some(Continuation::StartTls) => {
                    let acceptor = self.config.tls.clone().ok_or_else(|| {
                        io::Error::new(io::ErrorKind::Unsupported, "no certificate loaded")
                    })?;
                    stream = stream.starttls(&acceptor).await?;
                    debug!(tls = stream.is_tls(), "STARTTLS handshake complete");
                }
            }
        }
    }

    /// Write a reply and flush it, logging each line in verbose mode.
    async fn send<W>(&self, stream: &mut W, response: &[u8]) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        stream.write_all(response).await?;
        stream.flush().await?;

        if self.config.verbose {
            let text = String::from_utf8_lossy(response);
            for line in text.split("\r\n").filter(|line| !line.is_empty()) {
                info!("<- [{}]", line);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::{fixture, load_acceptor};
    use rustls::pki_types::ServerName;
    use rustls::RootCertStore;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;
    use tokio_rustls::TlsConnector;

    const EHLO_PLAIN: &[u8] =
        b"250-Pleased to meet you!\r\n250-PIPELINING\r\n250-CHUNKING\r\n250 OK\r\n";
    const EHLO_TLS: &[u8] =
        b"250-Pleased to meet you!\r\n250-PIPELINING\r\n250-CHUNKING\r\n250-STARTTLS\r\n250 OK\r\n";

    fn start(config: SessionConfig) -> (DuplexStream, JoinHandle<io::Result<()>>) {
        let commands = Arc::new(CommandTable::new(config.tls.is_some()));
        let config = Arc::new(config);
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(Session::new(commands, config).run(server));
        (client, handle)
    }

    async fn expect<R: AsyncRead + Unpin>(client: &mut R, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .expect("timed out waiting for reply")
            .unwrap();
        assert_eq!(
            String::from_utf8_lossy(&buf),
            String::from_utf8_lossy(expected)
        );
    }

    async fn expect_silence<R: AsyncRead + Unpin>(client: &mut R) {
        let mut buf = [0u8; 64];
        let res = timeout(Duration::from_millis(100), client.read(&mut buf)).await;
        assert!(res.is_err(), "unexpected reply: {:?}", res);
    }

    async fn send<W: AsyncWrite + Unpin>(client: &mut W, data: &[u8]) {
        client.write_all(data).await.unwrap();
        client.flush().await.unwrap();
    }

    async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(client: &mut S, data: &[u8], reply: &[u8]) {
        send(client, data).await;
        expect(client, reply).await;
    }

    #[tokio::test]
    async fn test_full_session() {
        let (mut client, handle) = start(SessionConfig::default());

        expect(&mut client, b"220 Welcome to Blackhole SMTP!\r\n").await;
        exchange(&mut client, b"EHLO test\r\n", EHLO_PLAIN).await;
        exchange(&mut client, b"MAIL FROM:<a@b>\r\n", b"250 OK\r\n").await;
        exchange(&mut client, b"RCPT TO:<c@d>\r\n", b"250 OK\r\n").await;
        exchange(
            &mut client,
            b"DATA\r\n",
            b"354 End data with <CR><LF>.<CR><LF>\r\n",
        )
        .await;
        exchange(&mut client, b"Subject: x\r\n\r\nbody\r\n.\r\n", b"250 OK\r\n").await;
        exchange(&mut client, b"QUIT\r\n", b"221 Goodbye\r\n").await;

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_every_verb_any_case() {
        let (mut client, _handle) = start(SessionConfig::default());
        expect(&mut client, GREETING).await;

        let cases: &[(&[u8], &[u8])] = &[
            (b"ehlo example.org\r\n", EHLO_PLAIN),
            (b"Lhlo example.org\r\n", EHLO_PLAIN),
            (b"helo example.org\r\n", b"250 Pleased to meet you!\r\n"),
            (b"mail FROM:<x>\r\n", b"250 OK\r\n"),
            (b"rCpT TO:<y>\r\n", b"250 OK\r\n"),
            (b"rset\r\n", b"250 OK\r\n"),
            (b"bdat 10 LAST\r\n", b"250 OK\r\n"),
            (b"quit\r\n", b"221 Goodbye\r\n"),
        ];
        for (command, reply) in cases {
            exchange(&mut client, command, reply).await;
        }
    }

    #[tokio::test]
    async fn test_unrecognized_keeps_session_open() {
        let (mut client, handle) = start(SessionConfig::default());
        expect(&mut client, GREETING).await;

        exchange(&mut client, b"NOOP\r\n", b"500 Command unrecognized\r\n").await;
        exchange(&mut client, b"VRFY someone\r\n", b"500 Command unrecognized\r\n").await;
        exchange(&mut client, b"X\r\n", b"500 Command unrecognized\r\n").await;
        // No certificate: STARTTLS is not on offer
        exchange(&mut client, b"STARTTLS\r\n", b"500 Command unrecognized\r\n").await;
        exchange(&mut client, b"HELO again\r\n", b"250 Pleased to meet you!\r\n").await;

        assert!(!handle.is_finished());
    }

    #[tokio::test]
    async fn test_data_waits_for_terminator() {
        let (mut client, _handle) = start(SessionConfig::default());
        expect(&mut client, GREETING).await;

        exchange(&mut client, b"DATA\r\n", b"354 End data with <CR><LF>.<CR><LF>\r\n").await;
        send(&mut client, b"Subject: partial\r\n\r\nstill writing\r\n").await;
        expect_silence(&mut client).await;

        // Commands are body text while DATA is open
        send(&mut client, b"QUIT\r\n").await;
        expect_silence(&mut client).await;

        exchange(&mut client, b"done\r\n.\r\n", b"250 OK\r\n").await;
        exchange(&mut client, b"QUIT\r\n", b"221 Goodbye\r\n").await;
    }

    #[tokio::test]
    async fn test_data_split_terminator() {
        let (mut client, _handle) = start(SessionConfig::default());
        expect(&mut client, GREETING).await;

        exchange(&mut client, b"DATA\r\n", b"354 End data with <CR><LF>.<CR><LF>\r\n").await;
        send(&mut client, b"body\r\n").await;
        expect_silence(&mut client).await;
        exchange(&mut client, b".\r\n", b"250 OK\r\n").await;
    }

    #[tokio::test]
    async fn test_data_split_terminator_legacy() {
        let (mut client, _handle) = start(SessionConfig {
            data_scan: DataScan::Legacy,
            ..Default::default()
        });
        expect(&mut client, GREETING).await;

        exchange(&mut client, b"DATA\r\n", b"354 End data with <CR><LF>.<CR><LF>\r\n").await;
        send(&mut client, b"body\r\n").await;
        expect_silence(&mut client).await;
        send(&mut client, b".\r\n").await;
        expect_silence(&mut client).await;
        exchange(&mut client, b"\r\n.\r\n", b"250 OK\r\n").await;
    }

    #[tokio::test]
    async fn test_data_bare_lf_is_not_a_terminator() {
        let (mut client, _handle) = start(SessionConfig::default());
        expect(&mut client, GREETING).await;

        exchange(&mut client, b"DATA\n", b"354 End data with <CR><LF>.<CR><LF>\r\n").await;
        send(&mut client, b".\r\n").await;
        expect_silence(&mut client).await;
        exchange(&mut client, b"\r\n.\r\n", b"250 OK\r\n").await;
    }

    #[tokio::test]
    async fn test_data_empty_body() {
        let (mut client, _handle) = start(SessionConfig::default());
        expect(&mut client, GREETING).await;

        exchange(&mut client, b"DATA\r\n", b"354 End data with <CR><LF>.<CR><LF>\r\n").await;
        exchange(&mut client, b".\r\n", b"250 OK\r\n").await;
    }

    #[tokio::test]
    async fn test_verbose_session() {
        let subscriber = tracing_subscriber::fmt().with_test_writer().finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (mut client, handle) = start(SessionConfig {
            verbose: true,
            ..Default::default()
        });

        expect(&mut client, GREETING).await;
        exchange(&mut client, b"EHLO test\r\n", EHLO_PLAIN).await;
        exchange(&mut client, b"MAIL FROM:<a@b>\r\n", b"250 OK\r\n").await;
        exchange(&mut client, b"RCPT TO:<c@d>\r\n", b"250 OK\r\n").await;
        exchange(&mut client, b"DATA\r\n", b"354 End data with <CR><LF>.<CR><LF>\r\n").await;
        send(&mut client, b"Subject: x\r\n\r\n").await;
        expect_silence(&mut client).await;
        exchange(&mut client, b"body\r\n.\r\n", b"250 OK\r\n").await;
        exchange(&mut client, b"QUIT\r\n", b"221 Goodbye\r\n").await;

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_eof_inside_data() {
        let (mut client, handle) = start(SessionConfig::default());
        expect(&mut client, GREETING).await;

        exchange(&mut client, b"DATA\r\n", b"354 End data with <CR><LF>.<CR><LF>\r\n").await;
        send(&mut client, b"half a message").await;
        drop(client);

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bdat_is_inert() {
        let (mut client, _handle) = start(SessionConfig::default());
        expect(&mut client, GREETING).await;

        exchange(&mut client, b"BDAT 1000 LAST\r\n", b"250 OK\r\n").await;
        // Nothing was consumed on behalf of the chunk
        exchange(&mut client, b"MAIL FROM:<a@b>\r\n", b"250 OK\r\n").await;
    }

    #[tokio::test]
    async fn test_latency() {
        let latency = Duration::from_millis(50);
        let (mut client, _handle) = start(SessionConfig {
            latency: Latency::new(latency),
            ..Default::default()
        });
        expect(&mut client, GREETING).await;

        let start = Instant::now();
        exchange(&mut client, b"HELO x\r\n", b"250 Pleased to meet you!\r\n").await;
        assert!(start.elapsed() >= latency);

        let start = Instant::now();
        exchange(&mut client, b"WHAT\r\n", b"500 Command unrecognized\r\n").await;
        assert!(start.elapsed() >= latency);

        exchange(&mut client, b"DATA\r\n", b"354 End data with <CR><LF>.<CR><LF>\r\n").await;
        let start = Instant::now();
        exchange(&mut client, b"body\r\n.\r\n", b"250 OK\r\n").await;
        assert!(start.elapsed() >= latency);
    }

    #[tokio::test]
    async fn test_read_timeout_closes_session() {
        let (mut client, handle) = start(SessionConfig {
            read_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        expect(&mut client, GREETING).await;

        let err = timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let commands = Arc::new(CommandTable::new(false));
        let config = Arc::new(SessionConfig::default());

        let (mut a, server_a) = tokio::io::duplex(4096);
        let (mut b, server_b) = tokio::io::duplex(4096);
        tokio::spawn(Session::new(Arc::clone(&commands), Arc::clone(&config)).run(server_a));
        tokio::spawn(Session::new(commands, config).run(server_b));

        expect(&mut a, GREETING).await;
        expect(&mut b, GREETING).await;

        exchange(&mut a, b"DATA\r\n", b"354 End data with <CR><LF>.<CR><LF>\r\n").await;
        send(&mut a, b"first part\r\n").await;

        exchange(&mut b, b"RSET\r\n", b"250 OK\r\n").await;
        exchange(&mut b, b"DATA\r\n", b"354 End data with <CR><LF>.<CR><LF>\r\n").await;

        // A is still inside its body
        send(&mut a, b"RSET\r\n").await;
        expect_silence(&mut a).await;

        exchange(&mut a, b"end\r\n.\r\n", b"250 OK\r\n").await;
        exchange(&mut b, b"other body\r\n.\r\n", b"250 OK\r\n").await;
    }

    fn tls_config() -> SessionConfig {
        let acceptor = load_acceptor(&fixture("cert.pem"), &fixture("key.pem")).unwrap();
        SessionConfig {
            tls: Some(acceptor),
            ..Default::default()
        }
    }

    fn connector() -> TlsConnector {
        let ca = std::fs::read(fixture("ca.pem")).unwrap();
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut ca.as_slice()) {
            roots.add(cert.unwrap()).unwrap();
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    #[tokio::test]
    async fn test_starttls() {
        let (mut client, _handle) = start(tls_config());
        expect(&mut client, GREETING).await;

        exchange(&mut client, b"EHLO test\r\n", EHLO_TLS).await;
        exchange(&mut client, b"STARTTLS\r\n", b"220 Ready to start TLS\r\n").await;

        let domain = ServerName::try_from("localhost").unwrap();
        let mut tls = connector().connect(domain, client).await.unwrap();

        exchange(&mut tls, b"EHLO test\r\n", EHLO_TLS).await;
        exchange(&mut tls, b"MAIL FROM:<a@b>\r\n", b"250 OK\r\n").await;
        exchange(&mut tls, b"RCPT TO:<c@d>\r\n", b"250 OK\r\n").await;
        exchange(&mut tls, b"DATA\r\n", b"354 End data with <CR><LF>.<CR><LF>\r\n").await;
        exchange(&mut tls, b"Subject: x\r\n\r\nbody\r\n.\r\n", b"250 OK\r\n").await;
        exchange(&mut tls, b"NOPE\r\n", b"500 Command unrecognized\r\n").await;
        exchange(&mut tls, b"QUIT\r\n", b"221 Goodbye\r\n").await;
    }

    #[tokio::test]
    async fn test_starttls_handshake_failure() {
        let (mut client, handle) = start(tls_config());
        expect(&mut client, GREETING).await;

        exchange(&mut client, b"STARTTLS\r\n", b"220 Ready to start TLS\r\n").await;
        send(&mut client, b"this is not a client hello\r\n").await;

        let res = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_second_starttls_ends_session() {
        let (mut client, handle) = start(tls_config());
        expect(&mut client, GREETING).await;
        exchange(&mut client, b"STARTTLS\r\n", b"220 Ready to start TLS\r\n").await;

        let domain = ServerName::try_from("localhost").unwrap();
        let mut tls = connector().connect(domain, client).await.unwrap();
        exchange(&mut tls, b"STARTTLS\r\n", b"220 Ready to start TLS\r\n").await;

        let err = timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
