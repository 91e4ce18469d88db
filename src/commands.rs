//! SMTP command table.
//!
//! Maps the first four bytes of a command line to the canonical reply a
//! real mail server would give, plus the follow-up behavior (if any) the
//! session runs after sending it. Arguments are never parsed.
//!
//! ```text
//! EHLO/LHLO  250-Pleased to meet you! ... 250 OK
//! HELO       250 Pleased to meet you!
//! MAIL/RCPT  250 OK
//! DATA       354 End data with <CR><LF>.<CR><LF>   -> DATA scan
//! BDAT       250 OK                                -> no-op
//! RSET       250 OK
//! QUIT       221 Goodbye
//! STARTTLS   220 Ready to start TLS                -> TLS upgrade
//! (other)    500 Command unrecognized
//! ```

use bytes::Bytes;
use std::collections::HashMap;

/// Length of the verb prefix used as table key.
pub const VERB_LEN: usize = 4;

/// Banner sent as soon as a connection is accepted.
pub const GREETING: &[u8] = b"220 Welcome to Blackhole SMTP!\r\n";

/// Reply for any verb not present in the table.
pub const UNRECOGNIZED: &[u8] = b"500 Command unrecognized\r\n";

/// Final reply once a DATA payload has been received.
pub const OK: &[u8] = b"250 OK\r\n";

const EHLO_TLS: &[u8] =
    b"250-Pleased to meet you!\r\n250-PIPELINING\r\n250-CHUNKING\r\n250-STARTTLS\r\n250 OK\r\n";
const EHLO_PLAIN: &[u8] = b"250-Pleased to meet you!\r\n250-PIPELINING\r\n250-CHUNKING\r\n250 OK\r\n";
const HELO: &[u8] = b"250 Pleased to meet you!\r\n";
const DATA: &[u8] = b"354 End data with <CR><LF>.<CR><LF>\r\n";
const QUIT: &[u8] = b"221 Goodbye\r\n";
const STARTTLS: &[u8] = b"220 Ready to start TLS\r\n";

/// Follow-up run by the session after a reply has been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Consume the message body until the end-of-data marker.
    Data,
    /// Chunked transfer is acknowledged but not implemented: no further I/O.
    Bdat,
    /// Wrap the connection in TLS.
    StartTls,
}

/// A single table entry.
#[derive(Debug, Clone)]
pub struct Entry {
    pub response: Bytes,
    pub continuation: Option<Continuation>,
}

/// Immutable verb table, built once at startup and shared by all sessions.
#[derive(Debug)]
pub struct CommandTable {
    entries: HashMap<[u8; VERB_LEN], Entry>,
}

impl CommandTable {
    /// Build the table. STARTTLS is only advertised and accepted when
    /// certificate material is available.
    pub fn new(starttls: bool) -> Self {
        let ehlo = if starttls { EHLO_TLS } else { EHLO_PLAIN };

        let mut entries = HashMap::new();
        let mut add = |verb: &[u8; VERB_LEN], response: &'static [u8], continuation| {
            entries.insert(
                *verb,
                Entry {
                    response: Bytes::from_static(response),
                    continuation,
                },
            );
        };

        add(b"EHLO", ehlo, None);
        add(b"LHLO", ehlo, None);
        add(b"HELO", HELO, None);
        add(b"MAIL", OK, None);
        add(b"RCPT", OK, None);
        add(b"DATA", DATA, Some(Continuation::Data));
        add(b"BDAT", OK, Some(Continuation::Bdat));
        add(b"RSET", OK, None);
        add(b"QUIT", QUIT, None);
        if starttls {
            add(b"STAR", STARTTLS, Some(Continuation::StartTls));
        }

        CommandTable { entries }
    }

    /// Look up a verb prefix, ignoring ASCII case.
    pub fn lookup(&self, verb: &[u8]) -> Option<&Entry> {
        let key: [u8; VERB_LEN] = verb.try_into().ok()?;
        self.entries.get(&key.map(|b| b.to_ascii_uppercase()))
    }

    /// Whether STARTTLS is part of this table.
    pub fn starttls(&self) -> bool {
        self.entries.contains_key(b"STAR")
    }
}
