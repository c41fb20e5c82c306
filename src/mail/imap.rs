//! IMAP fetcher: raw IMAP over TCP or rustls, run on a blocking thread.
//!
//! Fetching never marks anything read: the session opens the inbox with
//! `EXAMINE` and fetches `BODY.PEEK[]`. Marking is a separate call that
//! re-finds each message by its `Message-Id`, because sequence numbers do not
//! survive across connections.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::config::ImapConfig;
use crate::error::{ImapError, ParseError};
use crate::mail::parser::parse_email;
use crate::mail::types::IncomingEmail;

const INBOX: &str = "INBOX";

/// A whole session may take this many network timeouts before it is cut off.
const SESSION_TIMEOUT_FACTOR: u32 = 4;

/// Largest `{n}` literal accepted from the server.
const MAX_LITERAL_LEN: usize = 64 * 1024 * 1024;

/// Everything one fetch produced.
#[derive(Debug, Default)]
pub struct FetchBatch {
    pub emails: Vec<IncomingEmail>,
    /// Messages that came back but could not be read.
    pub failures: Vec<ParseError>,
}

impl FetchBatch {
    /// Number of messages the server handed over, readable or not.
    pub fn fetched(&self) -> usize {
        self.emails.len() + self.failures.len()
    }
}

/// A tenant's inbox as seen by the poll orchestrator.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Fetch and parse every unseen message. Leaves them unseen.
    async fn fetch_unseen(&self) -> Result<FetchBatch, ImapError>;

    /// Set `\Seen` on the messages with the given `Message-Id`s.
    async fn mark_seen(&self, message_ids: &[String]) -> Result<(), ImapError>;
}

/// [`Mailbox`] backed by a real IMAP server. Opens a fresh connection per call.
#[derive(Debug, Clone)]
pub struct ImapMailbox {
    config: ImapConfig,
    timeout: Duration,
}

impl ImapMailbox {
    pub fn new(config: ImapConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn fetch_unseen(&self) -> Result<FetchBatch, ImapError> {
        let cfg = self.config.clone();
        let timeout = self.timeout;
        run_blocking(timeout, move |deadline| {
            let mut session = connect(&cfg, timeout, deadline)?;
            fetch_with(&mut session, &cfg.username, cfg.password.expose_secret())
        })
        .await
    }

    async fn mark_seen(&self, message_ids: &[String]) -> Result<(), ImapError> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let cfg = self.config.clone();
        let timeout = self.timeout;
        let ids = message_ids.to_vec();
        run_blocking(timeout, move |deadline| {
            let mut session = connect(&cfg, timeout, deadline)?;
            mark_seen_with(&mut session, &cfg.username, cfg.password.expose_secret(), &ids)
        })
        .await
    }
}

/// Run a blocking session on the blocking pool, bounded as a whole by
/// `SESSION_TIMEOUT_FACTOR` network timeouts. The closure gets the session
/// deadline. Socket timeouts and the deadline surface as
/// [`ImapError::Timeout`].
async fn run_blocking<T, F>(timeout: Duration, f: F) -> Result<T, ImapError>
where
    T: Send + 'static,
    F: FnOnce(Instant) -> Result<T, ImapError> + Send + 'static,
{
    let budget = timeout * SESSION_TIMEOUT_FACTOR;
    let deadline = Instant::now() + budget;
    let task = tokio::task::spawn_blocking(move || f(deadline));

    let result = match tokio::time::timeout(budget, task).await {
        Ok(joined) => joined.unwrap_or_else(|e| {
            Err(ImapError::Protocol {
                command: "task".into(),
                reason: format!("IMAP task panicked: {e}"),
            })
        }),
        Err(_) => {
            warn!(?budget, "IMAP session exceeded its deadline");
            return Err(ImapError::Timeout(budget));
        }
    };
    result.map_err(|e| match e {
        ImapError::Io(io)
            if matches!(
                io.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ) =>
        {
            ImapError::Timeout(timeout)
        }
        other => other,
    })
}

/// Log in, fetch every unseen message, log out.
pub(crate) fn fetch_with<S: Read + Write>(
    session: &mut ImapSession<S>,
    username: &str,
    password: &str,
) -> Result<FetchBatch, ImapError> {
    session.read_greeting()?;
    session.login(username, password)?;
    let batch = session.fetch_unseen()?;
    session.logout();
    Ok(batch)
}

/// Log in, flag each message id `\Seen`, log out.
pub(crate) fn mark_seen_with<S: Read + Write>(
    session: &mut ImapSession<S>,
    username: &str,
    password: &str,
    message_ids: &[String],
) -> Result<(), ImapError> {
    session.read_greeting()?;
    session.login(username, password)?;
    let result = session.mark_seen(message_ids);
    session.logout();
    result
}

// ── Connection ──────────────────────────────────────────────────────

/// Byte stream an IMAP session can run over.
pub(crate) trait ImapStream: Read + Write + Send {}

impl<T: Read + Write + Send> ImapStream for T {}

/// Socket wrapper that fails every read and write once the session deadline
/// has passed, so a server trickling bytes cannot hold the session open.
struct Deadline<S> {
    inner: S,
    at: Instant,
}

impl<S> Deadline<S> {
    fn check(&self) -> std::io::Result<()> {
        if Instant::now() >= self.at {
            Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "IMAP session deadline passed",
            ))
        } else {
            Ok(())
        }
    }
}

impl<S: Read> Read for Deadline<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.check()?;
        self.inner.read(buf)
    }
}

impl<S: Write> Write for Deadline<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.check()?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Open a plain or TLS connection with bounded connect/read/write timeouts.
fn connect(
    config: &ImapConfig,
    timeout: Duration,
    deadline: Instant,
) -> Result<ImapSession<Box<dyn ImapStream>>, ImapError> {
    let connect_err = |reason: String| ImapError::Connect {
        host: config.host.clone(),
        port: config.port,
        reason,
    };

    let addrs = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| connect_err(format!("address lookup failed: {e}")))?;

    let mut last_err = None;
    let mut tcp = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let tcp = tcp.ok_or_else(|| {
        connect_err(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses resolved".into()),
        )
    })?;
    tcp.set_read_timeout(Some(timeout))?;
    tcp.set_write_timeout(Some(timeout))?;
    let tcp = Deadline {
        inner: tcp,
        at: deadline,
    };

    if !config.use_tls {
        debug!(host = %config.host, port = config.port, "IMAP connected (plain)");
        return Ok(ImapSession::new(Box::new(tcp)));
    }

    let tls_err = |reason: String| ImapError::Tls {
        host: config.host.clone(),
        reason,
    };

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| tls_err(e.to_string()))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
        .map_err(|e| tls_err(e.to_string()))?;
    let conn = rustls::ClientConnection::new(Arc::new(tls_config), server_name)
        .map_err(|e| tls_err(e.to_string()))?;

    debug!(host = %config.host, port = config.port, "IMAP connected (TLS)");
    Ok(ImapSession::new(Box::new(rustls::StreamOwned::new(conn, tcp))))
}

// ── Protocol session ────────────────────────────────────────────────

/// One untagged server response, with any `{n}` literals pulled out.
#[derive(Debug, Clone, Default)]
pub(crate) struct Untagged {
    /// The response text with literal payloads removed.
    pub line: String,
    pub literals: Vec<Vec<u8>>,
}

/// Raw message body as returned by FETCH.
#[derive(Debug, Default)]
struct RawMessage {
    internal_date: Option<DateTime<Utc>>,
    body: Option<Vec<u8>>,
}

/// A synchronous IMAP4rev1 client session.
pub(crate) struct ImapSession<S: Read + Write> {
    stream: BufReader<S>,
    next_tag: u32,
}

impl<S: Read + Write> ImapSession<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            next_tag: 1,
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    pub fn read_greeting(&mut self) -> Result<(), ImapError> {
        let greeting = self.read_response()?;
        if greeting.line.starts_with("* OK") || greeting.line.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(ImapError::Protocol {
                command: "greeting".into(),
                reason: greeting.line,
            })
        }
    }

    pub fn login(&mut self, username: &str, password: &str) -> Result<(), ImapError> {
        let cmd = format!("LOGIN {} {}", quote(username)?, quote(password)?);
        self.command(&cmd, "LOGIN").map_err(|e| match e {
            ImapError::Protocol { reason, .. } => ImapError::Auth {
                username: username.to_string(),
                reason,
            },
            other => other,
        })?;
        Ok(())
    }

    /// Open a mailbox read-only. Returns its message count.
    pub fn examine(&mut self, mailbox: &str) -> Result<u32, ImapError> {
        let responses = self.command(&format!("EXAMINE {}", quote(mailbox)?), "EXAMINE")?;
        Ok(exists_count(&responses))
    }

    /// Open a mailbox read-write. Returns its message count.
    pub fn select(&mut self, mailbox: &str) -> Result<u32, ImapError> {
        let responses = self.command(&format!("SELECT {}", quote(mailbox)?), "SELECT")?;
        Ok(exists_count(&responses))
    }

    pub fn search(&mut self, criteria: &str) -> Result<Vec<u32>, ImapError> {
        let responses = self.command(&format!("SEARCH {criteria}"), "SEARCH")?;
        Ok(responses
            .iter()
            .filter_map(|r| r.line.strip_prefix("* SEARCH"))
            .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
            .collect())
    }

    /// Fetch and parse every unseen message in the inbox.
    pub fn fetch_unseen(&mut self) -> Result<FetchBatch, ImapError> {
        let exists = self.examine(INBOX)?;
        if exists == 0 {
            return Ok(FetchBatch::default());
        }

        let seqs = self.search("UNSEEN")?;
        if seqs.is_empty() {
            return Ok(FetchBatch::default());
        }
        debug!(count = seqs.len(), "Unseen messages found");

        let mut raw = self.fetch_bodies(&seqs)?;
        let mut batch = FetchBatch::default();
        for seq in seqs {
            let message = raw.remove(&seq).unwrap_or_default();
            let Some(body) = message.body else {
                warn!(seq, "Fetch returned no body");
                batch.failures.push(ParseError::MissingBody { seq });
                continue;
            };
            match parse_email(&body, message.internal_date) {
                Ok(email) => batch.emails.push(email),
                Err(e) => {
                    warn!(seq, error = %e, "Skipping unreadable email");
                    batch.failures.push(e);
                }
            }
        }
        Ok(batch)
    }

    fn fetch_bodies(&mut self, seqs: &[u32]) -> Result<HashMap<u32, RawMessage>, ImapError> {
        let set = sequence_set(seqs);
        let responses = self.command(
            &format!("FETCH {set} (INTERNALDATE BODY.PEEK[])"),
            "FETCH",
        )?;

        let mut out: HashMap<u32, RawMessage> = HashMap::new();
        for response in responses {
            let Some(seq) = fetch_seq(&response.line) else {
                continue;
            };
            let entry = out.entry(seq).or_default();
            if let Some(date) = internal_date(&response.line) {
                entry.internal_date = Some(date);
            }
            if response.line.contains("BODY[]")
                && let Some(body) = response.literals.into_iter().next()
            {
                entry.body = Some(body);
            }
        }
        Ok(out)
    }

    /// Find each id by header search and flag it `\Seen`.
    ///
    /// Every id is attempted; ids that match nothing are reported together.
    pub fn mark_seen(&mut self, message_ids: &[String]) -> Result<(), ImapError> {
        self.select(INBOX)?;

        let mut missing = Vec::new();
        for id in message_ids {
            let seqs = self.search(&format!("HEADER Message-ID {}", quote(id)?))?;
            if seqs.is_empty() {
                missing.push(id.clone());
                continue;
            }
            self.command(
                &format!("STORE {} +FLAGS (\\Seen)", sequence_set(&seqs)),
                "STORE",
            )?;
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ImapError::Protocol {
                command: "STORE".into(),
                reason: format!("no message found for {}", missing.join(", ")),
            })
        }
    }

    /// Best-effort LOGOUT; the connection is dropped either way.
    pub fn logout(&mut self) {
        if let Err(e) = self.command("LOGOUT", "LOGOUT") {
            debug!(error = %e, "IMAP logout failed");
        }
    }

    /// Send one tagged command and collect its untagged responses.
    fn command(&mut self, cmd: &str, label: &str) -> Result<Vec<Untagged>, ImapError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let stream = self.stream.get_mut();
        stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        stream.flush()?;

        let tag_prefix = format!("{tag} ");
        let mut untagged = Vec::new();
        loop {
            let response = self.read_response()?;
            if let Some(status) = response.line.strip_prefix(&tag_prefix) {
                if status.starts_with("OK") {
                    return Ok(untagged);
                }
                return Err(ImapError::Protocol {
                    command: label.to_string(),
                    reason: status.trim().to_string(),
                });
            }
            if response.line.starts_with('+') {
                return Err(ImapError::Protocol {
                    command: label.to_string(),
                    reason: "unexpected continuation request".into(),
                });
            }
            untagged.push(response);
        }
    }

    /// Read one logical response line, consuming any `{n}` literals it announces.
    fn read_response(&mut self) -> Result<Untagged, ImapError> {
        let mut response = Untagged::default();
        loop {
            let mut buf = Vec::new();
            if self.stream.read_until(b'\n', &mut buf)? == 0 {
                return Err(ImapError::Closed);
            }
            let chunk = String::from_utf8_lossy(&buf);
            let chunk = chunk.trim_end_matches(['\r', '\n']);
            response.line.push_str(chunk);

            match literal_len(chunk) {
                Some(len) => {
                    if len > MAX_LITERAL_LEN {
                        return Err(ImapError::Protocol {
                            command: "literal".into(),
                            reason: format!(
                                "server announced a {len}-byte literal (limit {MAX_LITERAL_LEN})"
                            ),
                        });
                    }
                    let mut literal = vec![0u8; len];
                    self.stream.read_exact(&mut literal)?;
                    response.literals.push(literal);
                }
                None => return Ok(response),
            }
        }
    }
}

// ── Response helpers ────────────────────────────────────────────────

/// Quote a string argument, escaping `\` and `"`. CR/LF cannot be quoted.
fn quote(value: &str) -> Result<String, ImapError> {
    if value.contains(['\r', '\n']) {
        return Err(ImapError::Protocol {
            command: "quote".into(),
            reason: "argument contains a line break".into(),
        });
    }
    Ok(format!(
        "\"{}\"",
        value.replace('\\', "\\\\").replace('"', "\\\"")
    ))
}

fn sequence_set(seqs: &[u32]) -> String {
    seqs.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// `{123}` at the end of a line announces a 123-byte literal.
fn literal_len(line: &str) -> Option<usize> {
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

fn exists_count(responses: &[Untagged]) -> u32 {
    responses
        .iter()
        .filter_map(|r| {
            let mut parts = r.line.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some("*"), Some(n), Some(kw)) if kw.eq_ignore_ascii_case("EXISTS") => {
                    n.parse().ok()
                }
                _ => None,
            }
        })
        .last()
        .unwrap_or(0)
}

fn fetch_seq(line: &str) -> Option<u32> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("*"), Some(n), Some(kw)) if kw.eq_ignore_ascii_case("FETCH") => n.parse().ok(),
        _ => None,
    }
}

fn internal_date_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r#"INTERNALDATE "([^"]+)""#).expect("valid INTERNALDATE regex"))
}

/// Parse `INTERNALDATE "03-Mar-2026 10:15:00 +0000"`.
fn internal_date(line: &str) -> Option<DateTime<Utc>> {
    let raw = internal_date_regex().captures(line)?.get(1)?.as_str().trim();
    DateTime::parse_from_str(raw, "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// In-memory duplex stream: scripted server bytes in, client bytes captured.
    struct ScriptedServer {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl ScriptedServer {
        fn new(script: impl Into<Vec<u8>>) -> Self {
            Self {
                input: Cursor::new(script.into()),
                output: Vec::new(),
            }
        }

        fn sent(&self) -> String {
            String::from_utf8_lossy(&self.output).to_string()
        }
    }

    impl Read for ScriptedServer {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for ScriptedServer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn raw_email(from: &str, id: &str, body: &str) -> String {
        format!(
            "From: {from}\r\nTo: shop@example.com\r\nSubject: Re: hello\r\nMessage-ID: {id}\r\n\r\n{body}\r\n"
        )
    }

    fn fetch_line(seq: u32, date: &str, raw: &str) -> String {
        format!(
            "* {seq} FETCH (INTERNALDATE \"{date}\" BODY[] {{{}}}\r\n{raw})\r\n",
            raw.len()
        )
    }

    #[test]
    fn fetch_reads_unseen_messages_without_marking() {
        let first = raw_email("alice@example.com", "<m1@example.com>", "First reply");
        let second = raw_email("bob@example.com", "<m2@example.com>", "Second reply");
        let script = format!(
            "* OK IMAP4rev1 ready\r\n\
             A1 OK LOGIN completed\r\n\
             * 4 EXISTS\r\n* 0 RECENT\r\n* OK [UIDVALIDITY 7] ok\r\nA2 OK [READ-ONLY] EXAMINE completed\r\n\
             * SEARCH 2 4\r\nA3 OK SEARCH completed\r\n\
             {}{}A4 OK FETCH completed\r\n\
             * BYE bye\r\nA5 OK LOGOUT completed\r\n",
            fetch_line(2, " 3-Mar-2026 10:15:00 +0100", &first),
            fetch_line(4, "04-Mar-2026 08:00:00 +0000", &second),
        );

        let mut session = ImapSession::new(ScriptedServer::new(script));
        let batch = fetch_with(&mut session, "inbox@shop.test", "pa\"ss").unwrap();

        assert_eq!(batch.fetched(), 2);
        assert!(batch.failures.is_empty());
        assert_eq!(batch.emails[0].from, "alice@example.com");
        assert_eq!(batch.emails[0].body, "First reply");
        assert_eq!(
            batch.emails[0].received_at.to_rfc3339(),
            "2026-03-03T09:15:00+00:00"
        );
        assert_eq!(batch.emails[1].message_id.as_deref(), Some("<m2@example.com>"));

        let sent = session.into_inner().sent();
        assert!(sent.contains("A1 LOGIN \"inbox@shop.test\" \"pa\\\"ss\"\r\n"));
        assert!(sent.contains("A2 EXAMINE \"INBOX\"\r\n"));
        assert!(sent.contains("A3 SEARCH UNSEEN\r\n"));
        assert!(sent.contains("A4 FETCH 2,4 (INTERNALDATE BODY.PEEK[])\r\n"));
        assert!(!sent.contains("STORE"));
    }

    #[test]
    fn empty_mailbox_skips_search() {
        let script = "* OK ready\r\n\
                      A1 OK LOGIN completed\r\n\
                      * 0 EXISTS\r\nA2 OK EXAMINE completed\r\n\
                      A3 OK LOGOUT completed\r\n";
        let mut session = ImapSession::new(ScriptedServer::new(script));
        let batch = fetch_with(&mut session, "u", "p").unwrap();
        assert_eq!(batch.fetched(), 0);
        let sent = session.into_inner().sent();
        assert!(!sent.contains("SEARCH"));
        assert!(sent.contains("A3 LOGOUT"));
    }

    #[test]
    fn no_unseen_messages_skips_fetch() {
        let script = "* OK ready\r\n\
                      A1 OK LOGIN completed\r\n\
                      * 3 EXISTS\r\nA2 OK EXAMINE completed\r\n\
                      * SEARCH\r\nA3 OK SEARCH completed\r\n\
                      A4 OK LOGOUT completed\r\n";
        let mut session = ImapSession::new(ScriptedServer::new(script));
        let batch = fetch_with(&mut session, "u", "p").unwrap();
        assert_eq!(batch.fetched(), 0);
        assert!(!session.into_inner().sent().contains("FETCH"));
    }

    #[test]
    fn missing_body_counts_as_failure() {
        let good = raw_email("alice@example.com", "<m1@example.com>", "hi");
        let script = format!(
            "* OK ready\r\n\
             A1 OK LOGIN completed\r\n\
             * 2 EXISTS\r\nA2 OK EXAMINE completed\r\n\
             * SEARCH 1 2\r\nA3 OK SEARCH completed\r\n\
             {}* 2 FETCH (INTERNALDATE \"04-Mar-2026 08:00:00 +0000\" BODY[] NIL)\r\nA4 OK FETCH completed\r\n\
             A5 OK LOGOUT completed\r\n",
            fetch_line(1, "04-Mar-2026 08:00:00 +0000", &good),
        );
        let mut session = ImapSession::new(ScriptedServer::new(script));
        let batch = fetch_with(&mut session, "u", "p").unwrap();
        assert_eq!(batch.fetched(), 2);
        assert_eq!(batch.emails.len(), 1);
        assert_eq!(batch.failures, vec![ParseError::MissingBody { seq: 2 }]);
    }

    #[test]
    fn rejected_login_is_auth_error() {
        let script = "* OK ready\r\nA1 NO [AUTHENTICATIONFAILED] Invalid credentials\r\n";
        let mut session = ImapSession::new(ScriptedServer::new(script));
        let err = fetch_with(&mut session, "u", "wrong").unwrap_err();
        assert!(matches!(err, ImapError::Auth { .. }), "got {err:?}");
    }

    #[test]
    fn bye_greeting_is_protocol_error() {
        let mut session = ImapSession::new(ScriptedServer::new("* BYE too busy\r\n"));
        assert!(matches!(
            fetch_with(&mut session, "u", "p").unwrap_err(),
            ImapError::Protocol { .. }
        ));
    }

    #[test]
    fn dropped_connection_is_closed_error() {
        let script = "* OK ready\r\nA1 OK LOGIN completed\r\n* 2 EXISTS\r\n";
        let mut session = ImapSession::new(ScriptedServer::new(script));
        assert!(matches!(
            fetch_with(&mut session, "u", "p").unwrap_err(),
            ImapError::Closed
        ));
    }

    #[test]
    fn mark_seen_searches_each_message_id() {
        let script = "* OK ready\r\n\
                      A1 OK LOGIN completed\r\n\
                      * 3 EXISTS\r\nA2 OK [READ-WRITE] SELECT completed\r\n\
                      * SEARCH 2\r\nA3 OK SEARCH completed\r\n\
                      * 2 FETCH (FLAGS (\\Seen))\r\nA4 OK STORE completed\r\n\
                      * SEARCH 3\r\nA5 OK SEARCH completed\r\n\
                      A6 OK STORE completed\r\n\
                      A7 OK LOGOUT completed\r\n";
        let mut session = ImapSession::new(ScriptedServer::new(script));
        let ids = vec!["<m1@example.com>".to_string(), "<m2@example.com>".to_string()];
        mark_seen_with(&mut session, "u", "p", &ids).unwrap();

        let sent = session.into_inner().sent();
        assert!(sent.contains("A2 SELECT \"INBOX\"\r\n"));
        assert!(sent.contains("A3 SEARCH HEADER Message-ID \"<m1@example.com>\"\r\n"));
        assert!(sent.contains("A4 STORE 2 +FLAGS (\\Seen)\r\n"));
        assert!(sent.contains("A6 STORE 3 +FLAGS (\\Seen)\r\n"));
    }

    #[test]
    fn mark_seen_reports_unmatched_ids_after_trying_all() {
        let script = "* OK ready\r\n\
                      A1 OK LOGIN completed\r\n\
                      * 3 EXISTS\r\nA2 OK SELECT completed\r\n\
                      * SEARCH\r\nA3 OK SEARCH completed\r\n\
                      * SEARCH 1\r\nA4 OK SEARCH completed\r\n\
                      A5 OK STORE completed\r\n\
                      A6 OK LOGOUT completed\r\n";
        let mut session = ImapSession::new(ScriptedServer::new(script));
        let ids = vec!["<gone@x>".to_string(), "<here@x>".to_string()];
        let err = mark_seen_with(&mut session, "u", "p", &ids).unwrap_err();
        assert!(err.to_string().contains("<gone@x>"));
        assert!(session.into_inner().sent().contains("A5 STORE 1 +FLAGS (\\Seen)"));
    }

    #[test]
    fn oversized_literal_is_rejected() {
        let script = "* OK ready\r\n\
                      A1 OK LOGIN completed\r\n\
                      * 1 EXISTS\r\nA2 OK EXAMINE completed\r\n\
                      * SEARCH 1\r\nA3 OK SEARCH completed\r\n\
                      * 1 FETCH (BODY[] {100000000000}\r\n";
        let mut session = ImapSession::new(ScriptedServer::new(script));
        let err = fetch_with(&mut session, "u", "p").unwrap_err();
        assert!(
            matches!(&err, ImapError::Protocol { command, .. } if command == "literal"),
            "got {err:?}"
        );
    }

    #[test]
    fn deadline_stream_fails_once_expired() {
        let mut open = Deadline {
            inner: Cursor::new(b"abc".to_vec()),
            at: Instant::now() + Duration::from_secs(60),
        };
        let mut buf = [0u8; 3];
        assert_eq!(open.read(&mut buf).unwrap(), 3);

        let mut expired = Deadline {
            inner: Cursor::new(b"abc".to_vec()),
            at: Instant::now(),
        };
        let err = expired.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn trickling_server_hits_session_deadline() {
        use std::net::TcpListener;
        use secrecy::SecretString;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let Ok((mut socket, _)) = listener.accept() else {
                return;
            };
            // One byte at a time, never finishing the greeting line.
            for _ in 0..200 {
                if socket.write_all(b"*").is_err() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        });

        let config = ImapConfig {
            host: "127.0.0.1".into(),
            port,
            username: "u".into(),
            password: SecretString::from("p".to_string()),
            use_tls: false,
        };
        let timeout = Duration::from_millis(250);
        let mailbox = ImapMailbox::new(config, timeout);

        let started = Instant::now();
        let err = mailbox.fetch_unseen().await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, ImapError::Timeout(_)), "got {err:?}");
        assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    }

    #[test]
    fn quote_escapes_and_rejects_line_breaks() {
        assert_eq!(quote(r#"a"b\c"#).unwrap(), r#""a\"b\\c""#);
        assert!(quote("evil\r\nA9 DELETE INBOX").is_err());
    }

    #[test]
    fn literal_len_parsing() {
        assert_eq!(literal_len("* 1 FETCH (BODY[] {42}"), Some(42));
        assert_eq!(literal_len("* 1 FETCH (BODY[] {42+}"), Some(42));
        assert_eq!(literal_len("* OK done"), None);
    }

    #[test]
    fn exists_uses_last_report() {
        let responses = vec![
            Untagged {
                line: "* 3 EXISTS".into(),
                literals: vec![],
            },
            Untagged {
                line: "* 5 EXISTS".into(),
                literals: vec![],
            },
        ];
        assert_eq!(exists_count(&responses), 5);
        assert_eq!(exists_count(&[]), 0);
    }
}
