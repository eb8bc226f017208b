//! POP3 mailbox client (RFC 1939) with STLS (RFC 2595) and CAPA (RFC 2449)
//!
//! One `Pop3Client` drives exactly one session:
//!
//! ```text
//! Disconnected -> Connected -> Authorized -> Transaction -> Closed
//!    connect     authenticate  open_mailbox                 quit
//! ```
//!
//! Mailbox operations are only valid in `Transaction`. `quit` is valid
//! from any state and may be called repeatedly.

use crate::config::{Endpoint, SessionOptions};
use crate::connection::{Connection, RequestContext};
use crate::error::{Error, Result};
use crate::message::{MailboxStat, Message, MessageSummary};
use bytes::Bytes;
use md5::{Digest, Md5};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Session stage of a [`Pop3Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pop3State {
    Disconnected,
    Connected,
    Authorized,
    Transaction,
    Closed,
}

impl Pop3State {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Authorized => "authorized",
            Self::Transaction => "transaction",
            Self::Closed => "closed",
        }
    }
}

/// Credential exchange mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pop3Auth {
    /// `USER`/`PASS` over TLS; `APOP` on a plaintext stream when the
    /// greeting offers a timestamp; `USER`/`PASS` otherwise.
    #[default]
    Auto,
    /// Plaintext `USER` then `PASS`.
    UserPass,
    /// Challenge/response: MD5 of the greeting timestamp and the secret.
    Apop,
}

/// A parsed `+OK` / `-ERR` status line.
#[derive(Debug)]
struct StatusLine {
    ok: bool,
    text: String,
    raw: String,
}

impl StatusLine {
    fn parse(line: &[u8]) -> Result<Self> {
        let raw = String::from_utf8_lossy(line).into_owned();
        let (ok, rest) = if let Some(rest) = strip_status(line, b"+OK") {
            (true, rest)
        } else if let Some(rest) = strip_status(line, b"-ERR") {
            (false, rest)
        } else {
            return Err(Error::protocol(raw));
        };
        Ok(Self {
            ok,
            text: String::from_utf8_lossy(rest).trim().to_string(),
            raw,
        })
    }

    fn unexpected(self) -> Error {
        Error::protocol(self.raw)
    }

    fn ok_or_protocol(self) -> Result<String> {
        if self.ok { Ok(self.text) } else { Err(self.unexpected()) }
    }
}

/// `prefix` followed by nothing or by a space.
fn strip_status<'a>(line: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    let rest = line.strip_prefix(prefix)?;
    match rest.first() {
        None => Some(rest),
        Some(b' ') => Some(&rest[1..]),
        Some(_) => None,
    }
}

/// The `<...>` timestamp of an APOP-capable greeting.
fn greeting_timestamp(text: &str) -> Option<String> {
    let start = text.find('<')?;
    let len = text[start..].find('>')?;
    Some(text[start..=start + len].to_string())
}

/// `APOP` digest: lowercase hex MD5 of the timestamp followed by the
/// shared secret.
#[must_use]
pub fn apop_digest(timestamp: &str, secret: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Parse a `LIST`, `UIDL` or `STAT` body: `<number> <value> [...]`.
fn parse_pair(line: &[u8]) -> Result<(u32, String)> {
    let text = String::from_utf8_lossy(line);
    let mut parts = text.split_whitespace();
    match (parts.next().map(str::parse::<u32>), parts.next()) {
        (Some(Ok(number)), Some(value)) => Ok((number, value.to_string())),
        _ => Err(Error::protocol(text)),
    }
}

fn parse_size(value: &str, line: &[u8]) -> Result<u64> {
    value
        .parse()
        .map_err(|_| Error::protocol(String::from_utf8_lossy(line)))
}

/// Keep the header block plus at most `body_lines` body lines.
fn limit_body(mut lines: Vec<Bytes>, body_lines: u32) -> Vec<Bytes> {
    if let Some(blank) = lines.iter().position(Bytes::is_empty) {
        let keep = usize::try_from(body_lines)
            .unwrap_or(usize::MAX)
            .saturating_add(blank + 1);
        lines.truncate(keep);
    }
    lines
}

/// POP3 client session.
pub struct Pop3Client {
    endpoint: Endpoint,
    options: SessionOptions,
    ctx: RequestContext,
    conn: Option<Connection>,
    state: Pop3State,
    timestamp: Option<String>,
}

impl Pop3Client {
    #[must_use]
    pub const fn new(endpoint: Endpoint, options: SessionOptions, ctx: RequestContext) -> Self {
        Self {
            endpoint,
            options,
            ctx,
            conn: None,
            state: Pop3State::Disconnected,
            timestamp: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> Pop3State {
        self.state
    }

    /// Whether the session currently runs over TLS.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::is_tls)
    }

    /// The APOP timestamp from the greeting, if the server sent one.
    #[must_use]
    pub fn apop_timestamp(&self) -> Option<&str> {
        self.timestamp.as_deref()
    }

    /// Open the transport and validate the greeting.
    ///
    /// With implicit TLS the stream is encrypted from the first byte.
    /// Otherwise, when the endpoint requires TLS, the session is
    /// upgraded with `STLS` before this returns.
    ///
    /// # Errors
    ///
    /// - [`Error::Handshake`] if the server is unreachable or the
    ///   greeting is not `+OK`
    /// - [`Error::Security`] if TLS is required but `STLS` is not
    ///   offered or the upgrade fails
    /// - [`Error::Timeout`] / [`Error::Cancelled`]
    pub async fn connect(&mut self) -> Result<()> {
        self.expect_state(Pop3State::Disconnected)?;
        let result = self.establish().await.map_err(|e| match e {
            Error::Io(err) => Error::Handshake(format!("connection failed: {err}")),
            Error::ConnectionClosed => {
                Error::Handshake("connection closed during greeting".to_string())
            }
            other => other,
        });
        if result.is_err() {
            self.teardown().await;
        }
        result
    }

    async fn establish(&mut self) -> Result<()> {
        let conn = Connection::open(&self.endpoint, &self.options, &self.ctx).await?;
        self.conn = Some(conn);
        let greeting = self.conn_mut()?.read_line().await?;

        let status = match StatusLine::parse(&greeting) {
            Ok(status) if status.ok => status,
            Ok(status) => return Err(Error::Handshake(status.raw)),
            Err(Error::Protocol { line }) => return Err(Error::Handshake(line)),
            Err(e) => return Err(e),
        };
        self.timestamp = greeting_timestamp(&status.text);

        if self.endpoint.tls_required && !self.is_tls() {
            self.start_tls().await?;
        }

        self.state = Pop3State::Connected;
        info!(
            "POP3 session open with {} (tls: {})",
            self.endpoint.address(),
            self.is_tls()
        );
        Ok(())
    }

    async fn start_tls(&mut self) -> Result<()> {
        let caps = self.read_capabilities().await?;
        if !caps.iter().any(|c| c.eq_ignore_ascii_case("STLS")) {
            return Err(Error::Security(
                "TLS required but server does not offer STLS".to_string(),
            ));
        }

        let status = self.command(b"STLS").await?;
        if !status.ok {
            return Err(Error::Security(format!("STLS refused: {}", status.raw)));
        }

        let conn = self.take_conn()?;
        let upgraded = conn.upgrade().await.map_err(|e| match e {
            Error::Tls(msg) => Error::Security(format!("TLS upgrade failed: {msg}")),
            other => other,
        })?;
        self.conn = Some(upgraded);
        debug!("STLS upgrade complete");
        Ok(())
    }

    /// Capability names advertised by `CAPA` (first word of each line).
    /// A server without `CAPA` support yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns an error outside an open session or on I/O failure.
    pub async fn capabilities(&mut self) -> Result<Vec<String>> {
        self.expect_open()?;
        let result = self.read_capabilities().await;
        self.settle(result).await
    }

    async fn read_capabilities(&mut self) -> Result<Vec<String>> {
        let status = self.command(b"CAPA").await?;
        if !status.ok {
            debug!("CAPA not supported: {}", status.text);
            return Ok(Vec::new());
        }
        let lines = self.conn_mut()?.read_block().await?;
        Ok(lines
            .iter()
            .filter_map(|l| {
                String::from_utf8_lossy(l)
                    .split_whitespace()
                    .next()
                    .map(str::to_string)
            })
            .collect())
    }

    /// Exchange credentials.
    ///
    /// # Errors
    ///
    /// - [`Error::Auth`] with the server text on any `-ERR`, or when
    ///   `APOP` is requested and the greeting carried no timestamp
    /// - [`Error::InvalidState`] unless the session is `Connected`
    pub async fn authenticate(
        &mut self,
        username: &str,
        secret: &str,
        mode: Pop3Auth,
    ) -> Result<()> {
        self.expect_state(Pop3State::Connected)?;
        let result = self.login(username, secret, mode).await;
        self.settle(result).await
    }

    async fn login(&mut self, username: &str, secret: &str, mode: Pop3Auth) -> Result<()> {
        let mode = match mode {
            Pop3Auth::Auto if self.is_tls() => Pop3Auth::UserPass,
            Pop3Auth::Auto if self.timestamp.is_some() => Pop3Auth::Apop,
            Pop3Auth::Auto => Pop3Auth::UserPass,
            explicit => explicit,
        };

        if mode == Pop3Auth::Apop {
            let timestamp = self.timestamp.clone().ok_or_else(|| {
                Error::Auth("server greeting carries no APOP timestamp".to_string())
            })?;
            debug!("APOP {}", username);
            let line = Zeroizing::new(format!(
                "APOP {username} {}",
                apop_digest(&timestamp, secret)
            ));
            self.expect_auth_ok(line.as_bytes()).await?;
        } else {
            debug!("USER {}", username);
            self.expect_auth_ok(format!("USER {username}").as_bytes())
                .await?;
            let line = Zeroizing::new(format!("PASS {secret}"));
            self.expect_auth_ok(line.as_bytes()).await?;
        }

        self.state = Pop3State::Authorized;
        info!("Authenticated as {}", username);
        Ok(())
    }

    async fn expect_auth_ok(&mut self, line: &[u8]) -> Result<()> {
        let status = self.command(line).await?;
        if status.ok {
            Ok(())
        } else {
            Err(Error::Auth(status.text))
        }
    }

    /// Enter the transaction state with `STAT`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the server refuses `STAT` or
    /// answers with something unparseable.
    pub async fn open_mailbox(&mut self) -> Result<MailboxStat> {
        self.expect_state(Pop3State::Authorized)?;
        let result = self.stat().await;
        self.settle(result).await
    }

    async fn stat(&mut self) -> Result<MailboxStat> {
        let text = self.command(b"STAT").await?.ok_or_protocol()?;
        let (count, size) = parse_pair(text.as_bytes())?;
        let stat = MailboxStat {
            count,
            size: parse_size(&size, text.as_bytes())?,
        };
        self.state = Pop3State::Transaction;
        info!("Mailbox holds {} messages ({} bytes)", stat.count, stat.size);
        Ok(stat)
    }

    /// List every message with its size and, when `UIDL` is supported,
    /// its unique id. An empty mailbox yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] carrying the raw line on any
    /// unexpected or malformed response.
    pub async fn list(&mut self) -> Result<Vec<MessageSummary>> {
        self.expect_state(Pop3State::Transaction)?;
        let result = self.list_inner().await;
        self.settle(result).await
    }

    async fn list_inner(&mut self) -> Result<Vec<MessageSummary>> {
        self.command(b"LIST").await?.ok_or_protocol()?;
        let mut summaries = Vec::new();
        for line in self.conn_mut()?.read_block().await? {
            let (ordinal, size) = parse_pair(&line)?;
            summaries.push(MessageSummary {
                ordinal,
                size: parse_size(&size, &line)?,
                uid: None,
            });
        }
        debug!("LIST returned {} messages", summaries.len());

        if summaries.is_empty() {
            return Ok(summaries);
        }

        let status = self.command(b"UIDL").await?;
        if !status.ok {
            debug!("UIDL not supported: {}", status.text);
            return Ok(summaries);
        }
        let uids: HashMap<u32, String> = self
            .conn_mut()?
            .read_block()
            .await?
            .iter()
            .map(|line| parse_pair(line))
            .collect::<Result<_>>()?;
        for summary in &mut summaries {
            summary.uid = uids.get(&summary.ordinal).cloned();
        }
        Ok(summaries)
    }

    /// Fetch the header block plus the first `body_lines` body lines.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the server rejects the ordinal.
    pub async fn fetch_headers(&mut self, ordinal: u32, body_lines: u32) -> Result<Message> {
        self.expect_state(Pop3State::Transaction)?;
        let result = self
            .fetch(ordinal, &format!("TOP {ordinal} {body_lines}"))
            .await
            .map(|lines| Message::from_lines(ordinal, &limit_body(lines, body_lines)));
        self.settle(result).await
    }

    /// Fetch a complete message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the server rejects the ordinal.
    pub async fn fetch_full(&mut self, ordinal: u32) -> Result<Message> {
        self.expect_state(Pop3State::Transaction)?;
        let result = self
            .fetch(ordinal, &format!("RETR {ordinal}"))
            .await
            .map(|lines| Message::from_lines(ordinal, &lines));
        self.settle(result).await
    }

    async fn fetch(&mut self, ordinal: u32, command: &str) -> Result<Vec<Bytes>> {
        if ordinal == 0 {
            return Err(Error::NotFound("message 0".to_string()));
        }
        let status = self.command(command.as_bytes()).await?;
        if !status.ok {
            return Err(Error::NotFound(format!("message {ordinal}: {}", status.text)));
        }
        self.conn_mut()?.read_block().await
    }

    /// Mark a message for deletion at `quit`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the server rejects the ordinal.
    pub async fn delete(&mut self, ordinal: u32) -> Result<()> {
        self.expect_state(Pop3State::Transaction)?;
        let result = match self.command(format!("DELE {ordinal}").as_bytes()).await {
            Ok(status) if status.ok => Ok(()),
            Ok(status) => Err(Error::NotFound(format!("message {ordinal}: {}", status.text))),
            Err(e) => Err(e),
        };
        self.settle(result).await
    }

    /// Unmark every message marked for deletion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the server refuses.
    pub async fn reset(&mut self) -> Result<()> {
        self.simple(b"RSET").await
    }

    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the server refuses.
    pub async fn noop(&mut self) -> Result<()> {
        self.simple(b"NOOP").await
    }

    async fn simple(&mut self, command: &[u8]) -> Result<()> {
        self.expect_state(Pop3State::Transaction)?;
        let result = match self.command(command).await {
            Ok(status) => status.ok_or_protocol().map(drop),
            Err(e) => Err(e),
        };
        self.settle(result).await
    }

    /// End the session. Messages marked with [`delete`](Self::delete)
    /// are removed by the server at this point.
    ///
    /// Always leaves the client `Closed` and releases the stream; a
    /// second call is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the transport error or [`Error::Protocol`] when `QUIT`
    /// is not acknowledged. The session is closed regardless.
    pub async fn quit(&mut self) -> Result<()> {
        self.state = Pop3State::Closed;
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let result = match conn.request(b"QUIT").await {
            Ok(line) => StatusLine::parse(&line).and_then(StatusLine::ok_or_protocol).map(drop),
            Err(e) => Err(e),
        };
        conn.close().await;
        debug!("POP3 session closed");
        result
    }

    // -- private helpers --

    async fn command(&mut self, line: &[u8]) -> Result<StatusLine> {
        let reply = self.conn_mut()?.request(line).await?;
        StatusLine::parse(&reply)
    }

    fn conn_mut(&mut self) -> Result<&mut Connection> {
        self.conn.as_mut().ok_or(Error::InvalidState {
            expected: "connected",
            actual: self.state.as_str(),
        })
    }

    fn take_conn(&mut self) -> Result<Connection> {
        self.conn.take().ok_or(Error::InvalidState {
            expected: "connected",
            actual: self.state.as_str(),
        })
    }

    fn expect_state(&self, expected: Pop3State) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                expected: expected.as_str(),
                actual: self.state.as_str(),
            })
        }
    }

    fn expect_open(&self) -> Result<()> {
        match self.state {
            Pop3State::Connected | Pop3State::Authorized | Pop3State::Transaction => Ok(()),
            other => Err(Error::InvalidState {
                expected: "connected",
                actual: other.as_str(),
            }),
        }
    }

    /// Close the session when `result` left it out of sync.
    async fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result
            && err.breaks_session()
        {
            warn!("POP3 session abandoned: {}", err);
            self.teardown().await;
        }
        result
    }

    async fn teardown(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.abandon(b"QUIT").await;
        }
        self.state = Pop3State::Closed;
    }
}
