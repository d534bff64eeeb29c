//! Mailbox collaborator: trait plus the IMAP implementation.
//!
//! The daemon only ever needs five operations (list, fetch, delete, empty
//! trash, wait for change), so that is the whole trait. The IMAP client
//! behind it is a small blocking session over rustls, driven through
//! `spawn_blocking`, with an explicit connection state machine
//! (`Disconnected → Connected → Selected`) and reconnect-on-demand: any
//! connection-level fault drops the session and the next operation builds
//! a fresh one.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::FrameConfig;
use crate::error::MailboxError;

/// Server-assigned message identifier, stable within one mailbox folder.
pub type Uid = u32;

/// Socket read timeout for ordinary commands. IDLE temporarily widens it.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// The mailbox seam used by the poll loop and the pipeline.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// All uids currently in the folder, ascending.
    async fn list_pending(&self) -> Result<Vec<Uid>, MailboxError>;

    /// Raw RFC 822 bytes of one message.
    async fn fetch(&self, uid: Uid) -> Result<Vec<u8>, MailboxError>;

    /// Flag deleted and expunge.
    async fn delete(&self, uid: Uid) -> Result<(), MailboxError>;

    /// Expunge the trash folder, restoring the inbox selection afterwards.
    async fn empty_trash(&self) -> Result<(), MailboxError>;

    /// Block until the folder changes or `timeout` elapses. `Ok(true)`
    /// means something changed, `Ok(false)` means the timeout hit.
    /// `Err(MailboxError::IdleUnsupported)` tells the caller to poll on a
    /// fixed interval instead.
    async fn wait_for_change(&self, timeout: Duration) -> Result<bool, MailboxError>;
}

// ── IMAP mailbox ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ImapEndpoint {
    host: String,
    port: u16,
    user: String,
    password: String,
    mailbox: String,
    trash: String,
}

/// IMAP-backed [`Mailbox`]. All network work happens on blocking threads;
/// the session state is shared behind a mutex that is uncontended in
/// practice because the pipeline is strictly sequential.
pub struct ImapMailbox {
    endpoint: ImapEndpoint,
    state: Arc<Mutex<SessionState>>,
}

impl ImapMailbox {
    pub fn new(config: &FrameConfig) -> Self {
        Self {
            endpoint: ImapEndpoint {
                host: config.imap_host.clone(),
                port: config.imap_port,
                user: config.imap_user.clone(),
                password: config.imap_password.clone(),
                mailbox: config.mailbox.clone(),
                trash: config.trash.clone(),
            },
            state: Arc::new(Mutex::new(SessionState::Disconnected)),
        }
    }

    async fn run_blocking<T, F>(&self, op: F) -> Result<T, MailboxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession, &ImapEndpoint) -> Result<T, MailboxError> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let endpoint = self.endpoint.clone();
        tokio::task::spawn_blocking(move || {
            // A poisoned lock means an op panicked mid-transition; the
            // state machine parks itself in Disconnected before every
            // transition, so recovering the inner value is safe.
            let mut guard = state.lock().unwrap_or_else(|p| p.into_inner());
            run_selected(&mut guard, &endpoint, op)
        })
        .await
        .map_err(|e| MailboxError::Protocol(format!("IMAP task failed: {e}")))?
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn list_pending(&self) -> Result<Vec<Uid>, MailboxError> {
        self.run_blocking(|session, _| session.list_all()).await
    }

    async fn fetch(&self, uid: Uid) -> Result<Vec<u8>, MailboxError> {
        self.run_blocking(move |session, _| session.fetch_raw(uid))
            .await
    }

    async fn delete(&self, uid: Uid) -> Result<(), MailboxError> {
        self.run_blocking(move |session, _| {
            session.store_deleted(uid)?;
            session.expunge()
        })
        .await
    }

    async fn empty_trash(&self) -> Result<(), MailboxError> {
        self.run_blocking(|session, endpoint| {
            let emptied = session
                .select(&endpoint.trash)
                .and_then(|()| session.expunge());
            // Reselect the inbox even when the expunge failed; ending up
            // parked in the trash folder would corrupt every later op, so
            // a reselect failure counts as a connection fault.
            let reselected = session.select(&endpoint.mailbox).map_err(|e| {
                MailboxError::Protocol(format!(
                    "failed to reselect {:?} after trash expunge: {e}",
                    endpoint.mailbox
                ))
            });
            emptied.and(reselected)
        })
        .await
    }

    async fn wait_for_change(&self, timeout: Duration) -> Result<bool, MailboxError> {
        self.run_blocking(move |session, _| session.idle_wait(timeout))
            .await
    }
}

// ── Connection state machine ────────────────────────────────────────

/// `Disconnected → Connected → Selected`, advanced on demand. Transitions
/// park the state in `Disconnected` first, so an error (or panic) partway
/// through leaves a state the next operation can recover from.
enum SessionState {
    Disconnected,
    Connected { session: ImapSession },
    Selected { session: ImapSession },
}

fn run_selected<T>(
    state: &mut SessionState,
    endpoint: &ImapEndpoint,
    op: impl FnOnce(&mut ImapSession, &ImapEndpoint) -> Result<T, MailboxError>,
) -> Result<T, MailboxError> {
    ensure_selected(state, endpoint)?;
    let SessionState::Selected { session } = state else {
        return Err(MailboxError::Protocol(
            "session not selected after ensure".into(),
        ));
    };
    match op(session, endpoint) {
        Ok(value) => Ok(value),
        Err(e) => {
            if is_connection_fault(&e) {
                debug!(error = %e, "dropping IMAP session after connection fault");
                *state = SessionState::Disconnected;
            }
            Err(e)
        }
    }
}

fn ensure_selected(
    state: &mut SessionState,
    endpoint: &ImapEndpoint,
) -> Result<(), MailboxError> {
    let mut session = match std::mem::replace(state, SessionState::Disconnected) {
        SessionState::Selected { session } => {
            *state = SessionState::Selected { session };
            return Ok(());
        }
        SessionState::Connected { session } => session,
        SessionState::Disconnected => ImapSession::connect(endpoint)?,
    };
    session.select(&endpoint.mailbox)?;
    *state = SessionState::Selected { session };
    Ok(())
}

/// Server-said-no keeps the session; broken-pipe kinds do not.
fn is_connection_fault(e: &MailboxError) -> bool {
    matches!(e, MailboxError::Io(_) | MailboxError::Protocol(_))
}

// ── Blocking IMAP session ───────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// One untagged response line; `literal` carries the preceding `{N}` blob
/// when the server sent one (message bodies arrive this way).
struct ImapLine {
    text: String,
    literal: Option<Vec<u8>>,
}

struct ImapResponse {
    lines: Vec<ImapLine>,
    ok: bool,
    tagged: String,
}

struct ImapSession {
    stream: TlsStream,
    tag_seq: u32,
    idle_supported: bool,
}

impl ImapSession {
    fn connect(endpoint: &ImapEndpoint) -> Result<Self, MailboxError> {
        let connect_err = |reason: String| MailboxError::Connect {
            host: endpoint.host.clone(),
            port: endpoint.port,
            reason,
        };

        let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .map_err(|e| connect_err(e.to_string()))?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| connect_err(e.to_string()))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name: rustls::pki_types::ServerName<'_> =
            rustls::pki_types::ServerName::try_from(endpoint.host.clone())
                .map_err(|e| connect_err(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| connect_err(e.to_string()))?;

        let mut session = Self {
            stream: rustls::StreamOwned::new(conn, tcp),
            tag_seq: 0,
            idle_supported: false,
        };

        let greeting = session.read_line()?;
        debug!(greeting = %greeting, "IMAP greeting");

        let login = session.command(&format!(
            "LOGIN {} {}",
            imap_quote(&endpoint.user),
            imap_quote(&endpoint.password)
        ))?;
        if !login.ok {
            return Err(MailboxError::Auth {
                user: endpoint.user.clone(),
                reason: login.tagged,
            });
        }

        let caps = session.command("CAPABILITY")?;
        session.idle_supported = capabilities_include_idle(&caps.lines);
        info!(
            host = %endpoint.host,
            idle = session.idle_supported,
            "IMAP session established"
        );
        Ok(session)
    }

    fn next_tag(&mut self) -> String {
        self.tag_seq += 1;
        format!("A{}", self.tag_seq)
    }

    fn write_line(&mut self, line: &str) -> Result<(), MailboxError> {
        self.stream.write_all(line.as_bytes())?;
        self.stream.write_all(b"\r\n")?;
        self.stream.flush()?;
        Ok(())
    }

    /// One CRLF-terminated line, terminator stripped.
    fn read_line(&mut self) -> Result<String, MailboxError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match std::io::Read::read(&mut self.stream, &mut byte) {
                Ok(0) => {
                    return Err(MailboxError::Protocol(
                        "connection closed mid-response".into(),
                    ))
                }
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        buf.truncate(buf.len() - 2);
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(MailboxError::Io(e)),
            }
        }
    }

    fn read_literal(&mut self, len: usize) -> Result<Vec<u8>, MailboxError> {
        let mut buf = vec![0u8; len];
        std::io::Read::read_exact(&mut self.stream, &mut buf)?;
        Ok(buf)
    }

    /// One logical response line. Message bodies arrive as IMAP literals
    /// (`{N}` followed by N raw bytes); joining them as text the way a
    /// line-oriented reader would corrupts binary payloads, so the blob is
    /// captured verbatim and the textual line continues after it.
    fn read_response_line(&mut self) -> Result<ImapLine, MailboxError> {
        let mut text = self.read_line()?;
        let mut literal = None;
        while let Some(len) = parse_literal_len(&text) {
            literal = Some(self.read_literal(len)?);
            let continuation = self.read_line()?;
            text.push_str(&continuation);
        }
        Ok(ImapLine { text, literal })
    }

    fn command(&mut self, cmd: &str) -> Result<ImapResponse, MailboxError> {
        let tag = self.next_tag();
        self.write_line(&format!("{tag} {cmd}"))?;

        let done_prefix = format!("{tag} ");
        let mut lines = Vec::new();
        loop {
            let line = self.read_response_line()?;
            if let Some(rest) = line.text.strip_prefix(&done_prefix) {
                return Ok(ImapResponse {
                    lines,
                    ok: rest.trim_start().starts_with("OK"),
                    tagged: line.text,
                });
            }
            lines.push(line);
        }
    }

    fn expect_ok(&self, command: &str, resp: ImapResponse) -> Result<ImapResponse, MailboxError> {
        if resp.ok {
            Ok(resp)
        } else {
            Err(MailboxError::Command {
                command: command.to_string(),
                reason: resp.tagged,
            })
        }
    }

    fn select(&mut self, folder: &str) -> Result<(), MailboxError> {
        let resp = self.command(&format!("SELECT {}", imap_quote(folder)))?;
        self.expect_ok("SELECT", resp)?;
        Ok(())
    }

    /// Every uid in the folder. Processed messages get deleted, so listing
    /// everything rather than only unseen ones is deliberate.
    fn list_all(&mut self) -> Result<Vec<Uid>, MailboxError> {
        let resp = self.command("UID SEARCH ALL")?;
        let resp = self.expect_ok("UID SEARCH", resp)?;
        let mut uids: Vec<Uid> = Vec::new();
        for line in &resp.lines {
            uids.extend(parse_search_line(&line.text));
        }
        uids.sort_unstable();
        uids.dedup();
        Ok(uids)
    }

    fn fetch_raw(&mut self, uid: Uid) -> Result<Vec<u8>, MailboxError> {
        let resp = self.command(&format!("UID FETCH {uid} (RFC822)"))?;
        let resp = self.expect_ok("UID FETCH", resp)?;
        resp.lines
            .into_iter()
            .find_map(|line| line.literal)
            .ok_or(MailboxError::NotFound { uid })
    }

    fn store_deleted(&mut self, uid: Uid) -> Result<(), MailboxError> {
        let resp = self.command(&format!(r"UID STORE {uid} +FLAGS.SILENT (\Deleted)"))?;
        self.expect_ok("UID STORE", resp)?;
        Ok(())
    }

    fn expunge(&mut self) -> Result<(), MailboxError> {
        let resp = self.command("EXPUNGE")?;
        self.expect_ok("EXPUNGE", resp)?;
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), MailboxError> {
        self.stream.sock.set_read_timeout(Some(timeout))?;
        Ok(())
    }

    /// RFC 2177 IDLE, bounded by `timeout`. The bound must stay safely
    /// below the 29-minute session limit; the caller's config enforces
    /// that. Keepalive chatter ("* OK still here") does not extend the
    /// deadline.
    fn idle_wait(&mut self, timeout: Duration) -> Result<bool, MailboxError> {
        if !self.idle_supported {
            return Err(MailboxError::IdleUnsupported);
        }

        let tag = self.next_tag();
        self.write_line(&format!("{tag} IDLE"))?;
        let done_prefix = format!("{tag} ");
        loop {
            let line = self.read_line()?;
            if line.starts_with('+') {
                break;
            }
            if line.starts_with(&done_prefix) {
                return Err(MailboxError::Command {
                    command: "IDLE".into(),
                    reason: line,
                });
            }
        }

        let deadline = Instant::now() + timeout;
        let mut changed = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            self.set_read_timeout(remaining)?;
            match self.read_line() {
                Ok(line) => {
                    if is_change_event(&line) {
                        debug!(line = %line, "IDLE change notification");
                        changed = true;
                        break;
                    }
                }
                Err(MailboxError::Io(e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    break;
                }
                Err(e) => {
                    let _ = self.set_read_timeout(READ_TIMEOUT);
                    return Err(e);
                }
            }
        }
        self.set_read_timeout(READ_TIMEOUT)?;

        self.write_line("DONE")?;
        loop {
            let line = self.read_line()?;
            if line.starts_with(&done_prefix) {
                break;
            }
            // Changes can race the DONE; count them too.
            if is_change_event(&line) {
                changed = true;
            }
        }
        Ok(changed)
    }
}

// ── Wire helpers ────────────────────────────────────────────────────

/// Quote a string for IMAP, escaping backslash and double quote.
fn imap_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Length of a trailing `{N}` literal marker, if the line ends with one.
fn parse_literal_len(line: &str) -> Option<usize> {
    let trimmed = line.trim_end();
    if !trimmed.ends_with('}') {
        return None;
    }
    let open = trimmed.rfind('{')?;
    trimmed[open + 1..trimmed.len() - 1].parse().ok()
}

/// Uids out of an untagged `* SEARCH 4 7 9` line.
fn parse_search_line(line: &str) -> Vec<Uid> {
    let Some(rest) = line.strip_prefix("* SEARCH") else {
        return Vec::new();
    };
    if !rest.is_empty() && !rest.starts_with(' ') {
        return Vec::new();
    }
    rest.split_whitespace()
        .filter_map(|tok| tok.parse().ok())
        .collect()
}

fn capabilities_include_idle(lines: &[ImapLine]) -> bool {
    lines.iter().any(|line| {
        line.text.starts_with("* CAPABILITY")
            && line
                .text
                .split_whitespace()
                .any(|tok| tok.eq_ignore_ascii_case("IDLE"))
    })
}

/// Untagged lines that mean the folder contents moved under us.
fn is_change_event(line: &str) -> bool {
    let mut tokens = line.split_whitespace();
    if tokens.next() != Some("*") {
        return false;
    }
    let Some(count) = tokens.next() else {
        return false;
    };
    if count.parse::<u32>().is_err() {
        return false;
    }
    matches!(
        tokens.next(),
        Some(kind)
            if kind.eq_ignore_ascii_case("EXISTS")
                || kind.eq_ignore_ascii_case("RECENT")
                || kind.eq_ignore_ascii_case("EXPUNGE")
    )
}
