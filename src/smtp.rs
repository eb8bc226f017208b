//! SMTP submission client (RFC 5321) with STARTTLS (RFC 3207) and AUTH
//! (RFC 4954)
//!
//! ```text
//! Disconnected -> Connected -> Ready -> Authenticated -> Closed
//!    connect      handshake   authenticate              quit
//! ```
//!
//! `upgrade` runs in `Ready` and leaves the state unchanged. `send` is
//! valid in `Ready` (servers that relay without credentials) and in
//! `Authenticated`.

use crate::codec::{self, Reply};
use crate::config::{Endpoint, SessionOptions};
use crate::connection::{Connection, RequestContext};
use crate::error::{Error, Result};
use crate::message::{OutgoingMessage, RecipientStatus, SendResult};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use lettre::message::{Mailbox, header::ContentType};
use md5::Md5;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

type HmacMd5 = Hmac<Md5>;

/// Session stage of an [`SmtpClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    Disconnected,
    Connected,
    Ready,
    Authenticated,
    Closed,
}

impl SmtpState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Ready => "ready",
            Self::Authenticated => "authenticated",
            Self::Closed => "closed",
        }
    }
}

/// SASL mechanisms this client can drive, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    CramMd5,
    Plain,
    Login,
}

impl AuthMechanism {
    const PREFERENCE: [Self; 3] = [Self::CramMd5, Self::Plain, Self::Login];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CramMd5 => "CRAM-MD5",
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

/// Extensions advertised in the `EHLO` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `EHLO` was accepted; `false` after a `HELO` fallback.
    pub extended: bool,
    pub starttls: bool,
    /// Upper-cased SASL mechanism names.
    pub auth: Vec<String>,
    pub size: Option<u64>,
    pub pipelining: bool,
    pub eight_bit_mime: bool,
    pub smtp_utf8: bool,
}

impl Capabilities {
    /// Parse an `EHLO` reply. The first line is the server's greeting
    /// and carries no extension.
    #[must_use]
    pub fn from_ehlo(reply: &Reply) -> Self {
        let mut caps = Self {
            extended: true,
            ..Self::default()
        };
        for line in reply.lines().iter().skip(1) {
            let mut words = line.split_whitespace();
            let Some(keyword) = words.next() else {
                continue;
            };
            let keyword = keyword.to_ascii_uppercase();
            // Some servers still send the pre-standard `AUTH=LOGIN` form.
            if let Some(mechanism) = keyword.strip_prefix("AUTH=") {
                caps.push_auth(mechanism);
                caps.auth.extend(words.map(str::to_ascii_uppercase));
                continue;
            }
            match keyword.as_str() {
                "STARTTLS" => caps.starttls = true,
                "AUTH" => caps.auth.extend(words.map(str::to_ascii_uppercase)),
                "SIZE" => caps.size = words.next().and_then(|s| s.parse().ok()),
                "PIPELINING" => caps.pipelining = true,
                "8BITMIME" => caps.eight_bit_mime = true,
                "SMTPUTF8" => caps.smtp_utf8 = true,
                _ => {}
            }
        }
        caps.auth.dedup();
        caps
    }

    fn push_auth(&mut self, mechanism: &str) {
        if !mechanism.is_empty() {
            self.auth.push(mechanism.to_string());
        }
    }

    #[must_use]
    pub fn supports_auth(&self, mechanism: AuthMechanism) -> bool {
        self.auth.iter().any(|m| m == mechanism.name())
    }

    /// The preferred mechanism both sides support.
    #[must_use]
    pub fn preferred_auth(&self) -> Option<AuthMechanism> {
        AuthMechanism::PREFERENCE
            .into_iter()
            .find(|m| self.supports_auth(*m))
    }
}

/// `CRAM-MD5` response: the username, a space, and the lowercase hex
/// HMAC-MD5 of the decoded challenge keyed with the secret.
///
/// # Errors
///
/// Returns [`Error::Auth`] if the MAC cannot be keyed.
pub fn cram_md5_response(username: &str, secret: &str, challenge: &[u8]) -> Result<String> {
    let mut mac = HmacMd5::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Auth(format!("CRAM-MD5 key rejected: {e}")))?;
    mac.update(challenge);
    Ok(format!(
        "{username} {}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Reject values that could break out of a header or command line.
fn check_field(label: &str, value: &str) -> Result<()> {
    if value.contains(['\r', '\n']) {
        return Err(Error::InvalidInput(format!("{label} contains CR or LF")));
    }
    Ok(())
}

fn check_address(label: &str, address: &str) -> Result<()> {
    check_field(label, address)?;
    if address.trim().is_empty() || address.contains(['<', '>']) {
        return Err(Error::InvalidInput(format!(
            "{label} is not a bare address: {address:?}"
        )));
    }
    Ok(())
}

fn validate(message: &OutgoingMessage) -> Result<()> {
    check_address("sender", &message.from)?;
    if message.to.is_empty() {
        return Err(Error::InvalidInput("no recipients".to_string()));
    }
    for rcpt in &message.to {
        check_address("recipient", rcpt)?;
    }
    check_field("subject", &message.subject)
}

fn mailbox(label: &str, address: &str) -> Result<Mailbox> {
    address
        .parse()
        .map_err(|e| Error::InvalidInput(format!("{label} {address:?}: {e}")))
}

/// Render an outgoing message as RFC 5322 bytes. Non-ASCII subjects
/// become RFC 2047 encoded-words and the body gets a transfer encoding
/// that fits a 7-bit channel.
fn compose(message: &OutgoingMessage, date: DateTime<Utc>, message_id: &str) -> Result<Vec<u8>> {
    let mut builder = lettre::Message::builder()
        .from(mailbox("sender", &message.from)?)
        .subject(message.subject.as_str())
        .date(date.into())
        .message_id(Some(format!("<{message_id}>")))
        .header(ContentType::TEXT_PLAIN);
    for rcpt in &message.to {
        builder = builder.to(mailbox("recipient", rcpt)?);
    }
    let email = builder
        .body(message.body.clone())
        .map_err(|e| Error::InvalidInput(format!("cannot build message: {e}")))?;
    Ok(email.formatted())
}

fn message_id(from: &str, fallback_domain: &str) -> String {
    let domain = from
        .rsplit_once('@')
        .map_or(fallback_domain, |(_, domain)| domain);
    format!("{}@{domain}", uuid::Uuid::new_v4())
}

/// SMTP client session.
pub struct SmtpClient {
    endpoint: Endpoint,
    options: SessionOptions,
    ctx: RequestContext,
    conn: Option<Connection>,
    state: SmtpState,
    capabilities: Capabilities,
}

impl SmtpClient {
    #[must_use]
    pub fn new(endpoint: Endpoint, options: SessionOptions, ctx: RequestContext) -> Self {
        Self {
            endpoint,
            options,
            ctx,
            conn: None,
            state: SmtpState::Disconnected,
            capabilities: Capabilities::default(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> SmtpState {
        self.state
    }

    /// Extensions from the most recent `EHLO`.
    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::is_tls)
    }

    /// Open the transport and read the `220` greeting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] if the server is unreachable or the
    /// greeting is anything but `220`.
    pub async fn connect(&mut self) -> Result<()> {
        self.expect_state(&[SmtpState::Disconnected])?;
        let result = self.open().await.map_err(|e| match e {
            Error::Io(err) => Error::Handshake(format!("connection failed: {err}")),
            Error::ConnectionClosed => {
                Error::Handshake("connection closed during greeting".to_string())
            }
            Error::Protocol { line } => Error::Handshake(line),
            other => other,
        });
        if result.is_err() {
            self.teardown().await;
        }
        result
    }

    async fn open(&mut self) -> Result<()> {
        let conn = Connection::open(&self.endpoint, &self.options, &self.ctx).await?;
        self.conn = Some(conn);
        let greeting = self.conn_mut()?.read_reply().await?;
        if greeting.code() != 220 {
            return Err(Error::Handshake(greeting.to_string()));
        }
        self.state = SmtpState::Connected;
        info!(
            "SMTP session open with {} (tls: {})",
            self.endpoint.address(),
            self.is_tls()
        );
        Ok(())
    }

    /// Identify with `EHLO`, falling back to `HELO` when the server
    /// rejects extended mode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] when neither greeting is accepted.
    pub async fn handshake(&mut self) -> Result<()> {
        self.expect_state(&[SmtpState::Connected])?;
        let result = self.ehlo().await;
        if result.is_ok() {
            self.state = SmtpState::Ready;
        }
        self.settle(result).await
    }

    async fn ehlo(&mut self) -> Result<()> {
        let domain = self.options.client_domain.clone();
        let reply = self
            .conn_mut()?
            .request_reply(format!("EHLO {domain}").as_bytes())
            .await?;
        if reply.is_positive() {
            self.capabilities = Capabilities::from_ehlo(&reply);
            debug!("EHLO capabilities: {:?}", self.capabilities);
            return Ok(());
        }
        if reply.code() < 500 {
            return Err(Error::Handshake(reply.to_string()));
        }

        debug!("EHLO refused, falling back to HELO");
        let reply = self
            .conn_mut()?
            .request_reply(format!("HELO {domain}").as_bytes())
            .await?;
        if !reply.is_positive() {
            return Err(Error::Handshake(reply.to_string()));
        }
        self.capabilities = Capabilities::default();
        Ok(())
    }

    /// Switch to TLS with `STARTTLS`.
    ///
    /// Required when the endpoint demands TLS and the stream is still
    /// plain; performed opportunistically when merely advertised. After
    /// the handshake the capabilities are discarded and `EHLO` is sent
    /// again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Security`] if TLS is required but not offered,
    /// refused, or the handshake fails, and [`Error::Handshake`] if the
    /// server does not accept `EHLO` over the new channel. A failed TLS
    /// handshake or a refused `EHLO` leaves the session `Closed`.
    pub async fn upgrade(&mut self) -> Result<()> {
        self.expect_state(&[SmtpState::Ready])?;
        if self.is_tls() {
            return Ok(());
        }
        if !self.capabilities.starttls {
            if self.endpoint.tls_required {
                return Err(Error::Security(
                    "TLS required but server does not offer STARTTLS".to_string(),
                ));
            }
            debug!("STARTTLS not offered, continuing in plaintext");
            return Ok(());
        }
        let result = self.start_tls().await;
        self.settle(result).await
    }

    async fn start_tls(&mut self) -> Result<()> {
        let reply = self.conn_mut()?.request_reply(b"STARTTLS").await?;
        if reply.code() != 220 {
            return Err(Error::Security(format!("STARTTLS refused: {reply}")));
        }

        let conn = self.take_conn()?;
        let upgraded = conn.upgrade().await.map_err(|e| match e {
            Error::Tls(msg) => Error::Security(format!("TLS upgrade failed: {msg}")),
            other => other,
        });
        let upgraded = match upgraded {
            Ok(conn) => conn,
            Err(e) => {
                self.state = SmtpState::Closed;
                return Err(e);
            }
        };
        self.conn = Some(upgraded);
        self.capabilities = Capabilities::default();
        debug!("STARTTLS upgrade complete");
        if let Err(e) = self.ehlo().await {
            self.teardown().await;
            return Err(match e {
                Error::Timeout(_) | Error::Cancelled(_) | Error::Handshake(_) => e,
                other => Error::Handshake(format!("EHLO after STARTTLS failed: {other}")),
            });
        }
        Ok(())
    }

    /// Authenticate with the strongest advertised mechanism:
    /// `CRAM-MD5`, then `PLAIN`, then `LOGIN`.
    ///
    /// # Errors
    ///
    /// - [`Error::Auth`] if no usable mechanism is advertised or the
    ///   server does not answer `235`
    /// - [`Error::Security`] if TLS is required and the stream is plain
    pub async fn authenticate(&mut self, username: &str, secret: &str) -> Result<()> {
        self.expect_state(&[SmtpState::Ready])?;
        if self.endpoint.tls_required && !self.is_tls() {
            return Err(Error::Security(
                "refusing to send credentials over plaintext".to_string(),
            ));
        }
        if self.capabilities.auth.is_empty() {
            return Err(Error::Auth("server does not advertise AUTH".to_string()));
        }
        let mechanism = self.capabilities.preferred_auth().ok_or_else(|| {
            Error::Auth(format!(
                "no supported mechanism among {}",
                self.capabilities.auth.join(" ")
            ))
        })?;

        debug!("AUTH {} as {}", mechanism.name(), username);
        let result = self.login(mechanism, username, secret).await;
        if result.is_ok() {
            self.state = SmtpState::Authenticated;
            info!("Authenticated as {}", username);
        }
        self.settle(result).await
    }

    async fn login(&mut self, mechanism: AuthMechanism, username: &str, secret: &str) -> Result<()> {
        let reply = match mechanism {
            AuthMechanism::CramMd5 => {
                let challenge = self.challenge(b"AUTH CRAM-MD5").await?;
                let response = Zeroizing::new(cram_md5_response(username, secret, &challenge)?);
                self.respond(response.as_bytes()).await?
            }
            AuthMechanism::Plain => {
                let token = Zeroizing::new(format!("\0{username}\0{secret}"));
                let line = Zeroizing::new(format!("AUTH PLAIN {}", STANDARD.encode(token.as_bytes())));
                self.conn_mut()?.request_reply(line.as_bytes()).await?
            }
            AuthMechanism::Login => {
                self.challenge(b"AUTH LOGIN").await?;
                let user = STANDARD.encode(username);
                let reply = self.conn_mut()?.request_reply(user.as_bytes()).await?;
                if reply.code() != 334 {
                    return Err(Error::Auth(reply.text()));
                }
                self.respond(secret.as_bytes()).await?
            }
        };
        if reply.code() == 235 {
            Ok(())
        } else {
            Err(Error::Auth(reply.text()))
        }
    }

    /// Send an `AUTH` command and decode the `334` challenge.
    async fn challenge(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let reply = self.conn_mut()?.request_reply(command).await?;
        if reply.code() != 334 {
            return Err(Error::Auth(reply.text()));
        }
        match STANDARD.decode(reply.text().trim()) {
            Ok(challenge) => Ok(challenge),
            Err(_) => {
                // Abort the exchange so the session stays in sync.
                self.conn_mut()?.request_reply(b"*").await?;
                Err(reply.unexpected())
            }
        }
    }

    /// Answer a challenge with base64 of `response`.
    async fn respond(&mut self, response: &[u8]) -> Result<Reply> {
        let line = Zeroizing::new(STANDARD.encode(response));
        self.conn_mut()?.request_reply(line.as_bytes()).await
    }

    /// Submit one message.
    ///
    /// Every recipient gets its own `RCPT TO`; rejected recipients are
    /// recorded and the transaction continues with the rest.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] before anything is sent if an address
    ///   or the subject contains CR/LF, an address does not parse, or
    ///   there are no recipients
    /// - [`Error::Submission`] if the sender is rejected, every
    ///   recipient is rejected, or the data is refused; carries the
    ///   per-recipient detail gathered so far
    pub async fn send(&mut self, message: &OutgoingMessage) -> Result<SendResult> {
        self.expect_state(&[SmtpState::Ready, SmtpState::Authenticated])?;
        validate(message)?;
        let domain = self.options.client_domain.clone();
        let text = compose(message, Utc::now(), &message_id(&message.from, &domain))?;
        let result = self.transaction(message, &text).await;
        self.settle(result).await
    }

    async fn transaction(&mut self, message: &OutgoingMessage, text: &[u8]) -> Result<SendResult> {
        let reply = self
            .conn_mut()?
            .request_reply(format!("MAIL FROM:<{}>", message.from).as_bytes())
            .await?;
        if !reply.is_positive() {
            return Err(Error::Submission {
                reason: format!("sender rejected: {reply}"),
                recipients: Vec::new(),
            });
        }

        let mut recipients = Vec::with_capacity(message.to.len());
        for address in &message.to {
            let reply = self
                .conn_mut()?
                .request_reply(format!("RCPT TO:<{address}>").as_bytes())
                .await?;
            let accepted = reply.is_positive();
            if !accepted {
                warn!("Recipient {} rejected: {}", address, reply);
            }
            recipients.push(RecipientStatus {
                address: address.clone(),
                accepted,
                code: reply.code(),
                reply: reply.text(),
            });
        }

        if !recipients.iter().any(|r| r.accepted) {
            self.rset_quietly().await?;
            return Err(Error::Submission {
                reason: "all recipients rejected".to_string(),
                recipients,
            });
        }

        let reply = self.conn_mut()?.request_reply(b"DATA").await?;
        if reply.code() != 354 {
            self.rset_quietly().await?;
            return Err(Error::Submission {
                reason: format!("DATA refused: {reply}"),
                recipients,
            });
        }

        let conn = self.conn_mut()?;
        conn.write_block(&codec::stuff_lines(text)).await?;
        let reply = conn.read_reply().await?;
        if !reply.is_positive() {
            return Err(Error::Submission {
                reason: format!("message rejected: {reply}"),
                recipients,
            });
        }

        let result = SendResult {
            recipients,
            accepted: true,
            reply: reply.to_string(),
        };
        info!(
            "Message submitted to {} of {} recipients",
            result.accepted_count(),
            result.recipients.len()
        );
        Ok(result)
    }

    /// `RSET` after an aborted transaction; only transport errors matter.
    async fn rset_quietly(&mut self) -> Result<()> {
        let reply = self.conn_mut()?.request_reply(b"RSET").await?;
        if !reply.is_positive() {
            debug!("RSET not accepted: {}", reply);
        }
        Ok(())
    }

    /// Abort any transaction in progress.
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
        self.expect_state(&[SmtpState::Ready, SmtpState::Authenticated])?;
        let result = match self.conn_mut()?.request_reply(command).await {
            Ok(reply) if reply.is_positive() => Ok(()),
            Ok(reply) => Err(reply.unexpected()),
            Err(e) => Err(e),
        };
        self.settle(result).await
    }

    /// End the session with `QUIT`.
    ///
    /// Always leaves the client `Closed`; a second call is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the transport error or [`Error::Protocol`] when the
    /// server does not answer `221`. The session is closed regardless.
    pub async fn quit(&mut self) -> Result<()> {
        self.state = SmtpState::Closed;
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let result = match conn.request_reply(b"QUIT").await {
            Ok(reply) if reply.code() == 221 => Ok(()),
            Ok(reply) => Err(reply.unexpected()),
            Err(e) => Err(e),
        };
        conn.close().await;
        debug!("SMTP session closed");
        result
    }

    // -- private helpers --

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

    fn expect_state(&self, allowed: &[SmtpState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                expected: allowed.first().map_or("", |s| s.as_str()),
                actual: self.state.as_str(),
            })
        }
    }

    /// Close the session when `result` left it out of sync.
    async fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result
            && err.breaks_session()
        {
            warn!("SMTP session abandoned: {}", err);
            self.teardown().await;
        }
        result
    }

    async fn teardown(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.abandon(b"QUIT").await;
        }
        self.state = SmtpState::Closed;
    }
}
