//! IMAP mailbox: raw IMAP over rustls, parsing with mail-parser.
//!
//! Fetching uses `UID FETCH … BODY.PEEK[]` so reading a message never sets
//! `\Seen`; only `mark_processed` does, via `UID STORE … +FLAGS (\Seen)`.
//! The protocol is blocking and runs in `spawn_blocking`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::channels::email_types::parse_raw_message;
use crate::error::ChannelError;
use crate::pipeline::types::{Mailbox, RawMessage};

const CHANNEL_NAME: &str = "email";

// ── Configuration ───────────────────────────────────────────────────

/// IMAP mailbox configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: SecretString,
    /// Folder to read, usually `INBOX`.
    pub folder: String,
    /// Upper bound on messages fetched per run (0 = no limit).
    pub max_messages: usize,
    pub timeout: Duration,
}

impl EmailConfig {
    /// Build config from environment variables.
    /// Returns `None` if `EMAIL_IMAP_HOST` is not set (mailbox disabled).
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("EMAIL_IMAP_HOST").ok()?;

        let imap_port: u16 = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let folder = std::env::var("EMAIL_FOLDER").unwrap_or_else(|_| "INBOX".into());

        let max_messages: usize = std::env::var("EMAIL_MAX_MESSAGES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let timeout_secs: u64 = std::env::var("EMAIL_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Some(Self {
            imap_host,
            imap_port,
            username,
            password,
            folder,
            max_messages,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────

pub struct ImapMailbox {
    config: EmailConfig,
    /// Message-ID → UID, filled by `fetch_unread`.
    uids: Arc<Mutex<HashMap<String, u32>>>,
}

impl ImapMailbox {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            uids: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn known_uid(&self, id: &str) -> Option<u32> {
        self.uids.lock().ok().and_then(|m| m.get(id).copied())
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    async fn fetch_unread(&self) -> Result<Vec<RawMessage>, ChannelError> {
        let config = self.config.clone();
        let fetched = tokio::task::spawn_blocking(move || fetch_unseen(&config))
            .await
            .map_err(|e| fetch_failed(format!("IMAP task panicked: {e}")))??;

        let mut messages = Vec::with_capacity(fetched.len());
        let mut uids = self.uids.lock().ok();
        for (uid, message) in fetched {
            if let Some(map) = uids.as_mut() {
                map.insert(message.id.clone(), uid);
            }
            messages.push(message);
        }
        drop(uids);
        info!(count = messages.len(), host = %self.config.imap_host, "Fetched unread messages");
        Ok(messages)
    }

    async fn mark_processed(&self, id: &str) -> Result<(), ChannelError> {
        let config = self.config.clone();
        let known = self.known_uid(id);
        let message_id = id.to_string();
        tokio::task::spawn_blocking(move || mark_seen(&config, &message_id, known))
            .await
            .map_err(|e| ChannelError::MarkFailed {
                name: CHANNEL_NAME.into(),
                id: id.into(),
                reason: format!("IMAP task panicked: {e}"),
            })??;

        if let Ok(mut uids) = self.uids.lock() {
            uids.remove(id);
        }
        debug!(id, "Marked message seen");
        Ok(())
    }
}

// ── Blocking IMAP operations ────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

fn fetch_failed(reason: impl Into<String>) -> ChannelError {
    ChannelError::FetchFailed {
        name: CHANNEL_NAME.into(),
        reason: reason.into(),
    }
}

fn connect(config: &EmailConfig) -> Result<ImapSession<TlsStream>, ChannelError> {
    let connect_failed = |reason: String| ChannelError::ConnectFailed {
        name: CHANNEL_NAME.into(),
        reason,
    };

    let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))
        .map_err(|e| connect_failed(format!("{}:{}: {e}", config.imap_host, config.imap_port)))?;
    tcp.set_read_timeout(Some(config.timeout))
        .and_then(|_| tcp.set_write_timeout(Some(config.timeout)))
        .map_err(|e| connect_failed(e.to_string()))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls_pki_types::ServerName::try_from(config.imap_host.clone())
        .map_err(|e| connect_failed(format!("invalid server name: {e}")))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| connect_failed(format!("TLS setup failed: {e}")))?;

    let mut session = ImapSession::new(rustls::StreamOwned::new(conn, tcp));
    session
        .greeting()
        .map_err(|e| connect_failed(format!("no greeting: {e}")))?;

    let login = format!(
        "LOGIN {} {}",
        quote(&config.username),
        quote(config.password.expose_secret())
    );
    session
        .command(&login)
        .map_err(|e| ChannelError::AuthFailed {
            name: CHANNEL_NAME.into(),
            reason: e,
        })?;

    session
        .command(&format!("SELECT {}", quote(&config.folder)))
        .map_err(|e| fetch_failed(format!("SELECT {}: {e}", config.folder)))?;

    Ok(session)
}

/// Fetch every unseen message without setting `\Seen`.
fn fetch_unseen(config: &EmailConfig) -> Result<Vec<(u32, RawMessage)>, ChannelError> {
    let mut session = connect(config)?;

    let search = session
        .command("UID SEARCH UNSEEN")
        .map_err(|e| fetch_failed(format!("SEARCH: {e}")))?;
    let mut uids = parse_search(&search);
    if config.max_messages > 0 {
        uids.truncate(config.max_messages);
    }

    let mut results = Vec::with_capacity(uids.len());
    for uid in uids {
        let response = session
            .command(&format!("UID FETCH {uid} BODY.PEEK[]"))
            .map_err(|e| fetch_failed(format!("FETCH {uid}: {e}")))?;

        let Some(raw) = response.iter().find_map(|line| line.literal.as_deref()) else {
            warn!(uid, "FETCH returned no message body");
            continue;
        };
        match parse_raw_message(raw) {
            Some(message) => results.push((uid, message)),
            None => warn!(uid, "Unparseable message skipped"),
        }
    }

    session.logout();
    Ok(results)
}

/// Set `\Seen` on one message, looking its UID up by Message-ID if needed.
fn mark_seen(config: &EmailConfig, message_id: &str, known: Option<u32>) -> Result<(), ChannelError> {
    let mark_failed = |reason: String| ChannelError::MarkFailed {
        name: CHANNEL_NAME.into(),
        id: message_id.into(),
        reason,
    };

    let mut session = connect(config)?;

    let uid = match known {
        Some(uid) => uid,
        None => {
            let search = session
                .command(&format!("UID SEARCH HEADER Message-ID {}", quote(message_id)))
                .map_err(|e| mark_failed(format!("SEARCH: {e}")))?;
            parse_search(&search)
                .into_iter()
                .next()
                .ok_or_else(|| mark_failed("message not found".into()))?
        }
    };

    session
        .command(&format!("UID STORE {uid} +FLAGS (\\Seen)"))
        .map_err(|e| mark_failed(format!("STORE {uid}: {e}")))?;
    session.logout();
    Ok(())
}

// ── Protocol ────────────────────────────────────────────────────────

/// One response line, with the literal that followed it if the line ended
/// in `{n}`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ResponseLine {
    text: String,
    literal: Option<Vec<u8>>,
}

struct ImapSession<S: Read + Write> {
    stream: S,
    next_tag: u32,
}

impl<S: Read + Write> ImapSession<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            next_tag: 1,
        }
    }

    fn read_line(&mut self) -> Result<String, String> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => return Err("IMAP connection closed".into()),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).into_owned());
                    }
                }
                Err(e) => return Err(e.to_string()),
            }
        }
    }

    fn greeting(&mut self) -> Result<(), String> {
        let line = self.read_line()?;
        if line.starts_with("* OK") || line.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(line.trim_end().to_string())
        }
    }

    /// Send a tagged command and collect its response. Fails unless the
    /// tagged status is `OK`.
    fn command(&mut self, cmd: &str) -> Result<Vec<ResponseLine>, String> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        self.stream
            .write_all(format!("{tag} {cmd}\r\n").as_bytes())
            .and_then(|_| self.stream.flush())
            .map_err(|e| e.to_string())?;

        let mut lines = Vec::new();
        loop {
            let text = self.read_line()?;
            if let Some(status) = text.strip_prefix(&format!("{tag} ")) {
                let status = status.trim_end();
                if status.starts_with("OK") {
                    return Ok(lines);
                }
                return Err(status.to_string());
            }
            let literal = match literal_len(&text) {
                Some(len) => {
                    let mut buf = vec![0u8; len];
                    self.stream.read_exact(&mut buf).map_err(|e| e.to_string())?;
                    Some(buf)
                }
                None => None,
            };
            lines.push(ResponseLine { text, literal });
        }
    }

    fn logout(&mut self) {
        let _ = self.command("LOGOUT");
    }
}

/// Length of the literal announced at the end of a line (`... {123}\r\n`).
fn literal_len(line: &str) -> Option<usize> {
    let trimmed = line.trim_end_matches("\r\n");
    let inner = trimmed.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

/// UIDs from `* SEARCH` lines.
fn parse_search(lines: &[ResponseLine]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|l| l.text.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect()
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Scripted server: reads come from `input`, writes land in `output`.
    struct FakeStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl FakeStream {
        fn new(server: &[u8]) -> Self {
            Self {
                input: Cursor::new(server.to_vec()),
                output: Vec::new(),
            }
        }
    }

    impl Read for FakeStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for FakeStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn line(text: &str) -> ResponseLine {
        ResponseLine {
            text: text.into(),
            literal: None,
        }
    }

    // ── Parsing ─────────────────────────────────────────────────────

    #[test]
    fn literal_length_parsed() {
        assert_eq!(literal_len("* 1 FETCH (UID 7 BODY[] {342}\r\n"), Some(342));
        assert_eq!(literal_len("* 1 FETCH (UID 7 BODY[] {12+}\r\n"), Some(12));
        assert_eq!(literal_len("* OK done\r\n"), None);
        assert_eq!(literal_len("* 1 FETCH {abc}\r\n"), None);
    }

    #[test]
    fn search_uids_parsed() {
        let lines = vec![line("* SEARCH 3 9 12\r\n"), line("* 4 EXISTS\r\n")];
        assert_eq!(parse_search(&lines), vec![3, 9, 12]);
        assert!(parse_search(&[line("* SEARCH\r\n")]).is_empty());
    }

    #[test]
    fn quote_escapes() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("pa\"ss\\word"), "\"pa\\\"ss\\\\word\"");
    }

    #[test]
    fn config_from_env_returns_none_when_no_host() {
        // SAFETY: no other test reads EMAIL_IMAP_HOST concurrently.
        unsafe { std::env::remove_var("EMAIL_IMAP_HOST") };
        assert!(EmailConfig::from_env().is_none());
    }

    // ── Session ─────────────────────────────────────────────────────

    #[test]
    fn command_collects_untagged_lines() {
        let server = b"* SEARCH 1 2\r\nA1 OK SEARCH completed\r\n";
        let mut session = ImapSession::new(FakeStream::new(server));
        let lines = session.command("UID SEARCH UNSEEN").unwrap();
        assert_eq!(parse_search(&lines), vec![1, 2]);
        assert_eq!(session.stream.output, b"A1 UID SEARCH UNSEEN\r\n");
    }

    #[test]
    fn command_reads_literal_bytes() {
        let body = "Subject: Hi\r\n\r\nBody\r\n";
        let server = format!(
            "* 1 FETCH (UID 5 BODY[] {{{}}}\r\n{body})\r\nA1 OK FETCH completed\r\n",
            body.len()
        );
        let mut session = ImapSession::new(FakeStream::new(server.as_bytes()));
        let lines = session.command("UID FETCH 5 BODY.PEEK[]").unwrap();
        assert_eq!(lines[0].literal.as_deref(), Some(body.as_bytes()));
        assert_eq!(lines[1].text, ")\r\n");
    }

    #[test]
    fn command_fails_on_no_status() {
        let server = b"A1 NO [AUTHENTICATIONFAILED] Invalid credentials\r\n";
        let mut session = ImapSession::new(FakeStream::new(server));
        let err = session.command("LOGIN \"u\" \"p\"").unwrap_err();
        assert!(err.starts_with("NO"));
    }

    #[test]
    fn tags_increment() {
        let server = b"A1 OK\r\nA2 OK\r\n";
        let mut session = ImapSession::new(FakeStream::new(server));
        session.command("NOOP").unwrap();
        session.command("NOOP").unwrap();
        assert_eq!(session.stream.output, b"A1 NOOP\r\nA2 NOOP\r\n");
    }

    #[test]
    fn closed_connection_is_an_error() {
        let mut session = ImapSession::new(FakeStream::new(b"* OK partial"));
        assert!(session.command("NOOP").is_err());
    }

    #[test]
    fn greeting_accepts_ok() {
        let mut session = ImapSession::new(FakeStream::new(b"* OK IMAP4rev1 ready\r\n"));
        assert!(session.greeting().is_ok());
        let mut bad = ImapSession::new(FakeStream::new(b"* BYE go away\r\n"));
        assert!(bad.greeting().is_err());
    }

    #[test]
    fn mailbox_name() {
        let mailbox = ImapMailbox::new(EmailConfig {
            imap_host: "imap.test.com".into(),
            imap_port: 993,
            username: "me@test.com".into(),
            password: SecretString::from("secret".to_string()),
            folder: "INBOX".into(),
            max_messages: 0,
            timeout: Duration::from_secs(5),
        });
        assert_eq!(mailbox.name(), "email");
        assert!(mailbox.known_uid("nope").is_none());
    }
}
