//! Mail bridge orchestrator
//!
//! Resolves an account's sealed credentials, opens the secret, drives
//! one POP3 or SMTP session and always ends it with `quit`. Anything
//! persisted goes through the vault sealed.

use crate::config::{AccountCredentials, BridgeConfig, SessionOptions};
use crate::connection::RequestContext;
use crate::crypto::Envelope;
use crate::error::{Error, Result};
use crate::message::{Message, MessageSummary, OutgoingMessage, SendResult};
use crate::pop3::{Pop3Auth, Pop3Client};
use crate::smtp::SmtpClient;
use crate::vault::{VaultKey, VaultStorage, open_vault};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Which server of an account a credential set is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Pop3,
    Smtp,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pop3 => "pop3",
            Self::Smtp => "smtp",
        })
    }
}

/// Source of sealed account credentials (the metadata store).
#[async_trait]
pub trait CredentialsSource: Send + Sync {
    /// Credentials of `account_id` for `service`; [`Error::NotFound`]
    /// if the account has none.
    async fn credentials(&self, account_id: &str, service: Service) -> Result<AccountCredentials>;
}

/// Both credential sets of one account.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountRecord {
    pub pop3: Option<AccountCredentials>,
    pub smtp: Option<AccountCredentials>,
}

/// Credentials held in memory, e.g. loaded from a JSON file.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCredentials {
    accounts: HashMap<String, AccountRecord>,
}

impl InMemoryCredentials {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `{"<account>": {"pop3": {...}, "smtp": {...}}}`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the JSON does not match.
    pub fn from_json(json: &str) -> Result<Self> {
        let accounts = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Invalid credentials file: {e}")))?;
        Ok(Self { accounts })
    }

    pub fn insert(
        &mut self,
        account_id: impl Into<String>,
        service: Service,
        credentials: AccountCredentials,
    ) {
        let record = self.accounts.entry(account_id.into()).or_default();
        match service {
            Service::Pop3 => record.pop3 = Some(credentials),
            Service::Smtp => record.smtp = Some(credentials),
        }
    }
}

#[async_trait]
impl CredentialsSource for InMemoryCredentials {
    async fn credentials(&self, account_id: &str, service: Service) -> Result<AccountCredentials> {
        let record = self.accounts.get(account_id);
        let found = match service {
            Service::Pop3 => record.and_then(|r| r.pop3.clone()),
            Service::Smtp => record.and_then(|r| r.smtp.clone()),
        };
        found.ok_or_else(|| Error::NotFound(format!("{service} credentials for {account_id}")))
    }
}

/// Log a failed `quit` without letting it replace the operation's
/// own outcome.
fn finish<T>(service: Service, quit: Result<()>, result: Result<T>) -> Result<T> {
    if let Err(e) = quit {
        warn!("{} quit failed: {}", service, e);
    }
    result
}

/// Vault key for an archived message: `messages/<account>/<name>`.
/// The name is the unique id when it is usable as a single key segment
/// as-is, and its hex encoding otherwise.
fn archive_key(account_id: &str, summary: &MessageSummary) -> Result<VaultKey> {
    let name = match &summary.uid {
        Some(uid) if is_plain_segment(uid) => uid.clone(),
        Some(uid) => hex::encode(uid),
        None => summary.ordinal.to_string(),
    };
    VaultKey::parse("messages")?.join(account_id)?.join(&name)
}

fn is_plain_segment(name: &str) -> bool {
    !name.contains('/') && VaultKey::parse(name).is_ok_and(|key| key.as_str() == name)
}

/// Composes credentials, the envelope, the vault and the protocol
/// clients.
pub struct MailBridge {
    envelope: Envelope,
    vault: Arc<dyn VaultStorage>,
    credentials: Arc<dyn CredentialsSource>,
    options: SessionOptions,
}

impl MailBridge {
    #[must_use]
    pub fn new(
        envelope: Envelope,
        vault: Arc<dyn VaultStorage>,
        credentials: Arc<dyn CredentialsSource>,
        options: SessionOptions,
    ) -> Self {
        Self {
            envelope,
            vault,
            credentials,
            options,
        }
    }

    /// Build a bridge from process configuration, opening the vault.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured vault cannot be opened.
    pub async fn from_config(
        config: &BridgeConfig,
        credentials: Arc<dyn CredentialsSource>,
    ) -> Result<Self> {
        let vault = open_vault(&config.vault).await?;
        Ok(Self::new(
            Envelope::new(&config.key),
            vault,
            credentials,
            config.session.clone(),
        ))
    }

    #[must_use]
    pub const fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    #[must_use]
    pub fn vault(&self) -> &Arc<dyn VaultStorage> {
        &self.vault
    }

    /// Seal an account secret for storage in the metadata store.
    ///
    /// # Errors
    ///
    /// See [`Envelope::seal`].
    pub fn seal_secret(&self, secret: &str) -> Result<String> {
        self.envelope.seal_str(secret)
    }

    /// List the mailbox of `account_id`.
    ///
    /// # Errors
    ///
    /// Any error of the credential lookup, [`Error::Decrypt`] for a
    /// secret that does not open, or any session error.
    pub async fn list_messages(
        &self,
        account_id: &str,
        ctx: &RequestContext,
    ) -> Result<Vec<MessageSummary>> {
        self.with_pop3(account_id, ctx, async |pop: &mut Pop3Client| pop.list().await)
            .await
    }

    /// Fetch the headers and first `body_lines` lines of one message.
    ///
    /// # Errors
    ///
    /// As [`list_messages`](Self::list_messages), plus
    /// [`Error::NotFound`] for an unknown ordinal.
    pub async fn fetch_headers(
        &self,
        account_id: &str,
        ordinal: u32,
        body_lines: u32,
        ctx: &RequestContext,
    ) -> Result<Message> {
        self.with_pop3(account_id, ctx, async |pop: &mut Pop3Client| {
            pop.fetch_headers(ordinal, body_lines).await
        })
        .await
    }

    /// Fetch one complete message.
    ///
    /// # Errors
    ///
    /// As [`fetch_headers`](Self::fetch_headers).
    pub async fn fetch_message(
        &self,
        account_id: &str,
        ordinal: u32,
        ctx: &RequestContext,
    ) -> Result<Message> {
        self.with_pop3(account_id, ctx, async |pop: &mut Pop3Client| {
            pop.fetch_full(ordinal).await
        })
        .await
    }

    /// Fetch a message and store it sealed in the vault under
    /// `messages/<account>/<uid>` (the ordinal when the server has no
    /// `UIDL`). Returns the key.
    ///
    /// # Errors
    ///
    /// As [`fetch_headers`](Self::fetch_headers), plus vault errors.
    pub async fn archive_message(
        &self,
        account_id: &str,
        ordinal: u32,
        ctx: &RequestContext,
    ) -> Result<VaultKey> {
        let (summary, message) = self
            .with_pop3(account_id, ctx, async |pop: &mut Pop3Client| {
                let summary = pop
                    .list()
                    .await?
                    .into_iter()
                    .find(|s| s.ordinal == ordinal)
                    .ok_or_else(|| Error::NotFound(format!("message {ordinal}")))?;
                let message = pop.fetch_full(ordinal).await?;
                Ok((summary, message))
            })
            .await?;

        let key = archive_key(account_id, &summary)?;
        let sealed = self.envelope.seal(message.raw())?;
        self.vault.put(&key, sealed.as_bytes()).await?;
        info!("Archived message {} of {} as {}", ordinal, account_id, key);
        Ok(key)
    }

    /// Read back a message stored by
    /// [`archive_message`](Self::archive_message). The returned message
    /// has ordinal 0: it no longer belongs to a session.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for a missing key, [`Error::Decrypt`] for a
    /// blob that does not open.
    pub async fn load_archived(&self, key: &VaultKey) -> Result<Message> {
        let raw = self.open_blob(key).await?;
        Ok(Message::new(0, raw.to_vec()))
    }

    /// Seal `secret` and store it under `key`.
    ///
    /// # Errors
    ///
    /// Returns vault errors.
    pub async fn store_secret(&self, key: &VaultKey, secret: &str) -> Result<()> {
        let sealed = self.envelope.seal_str(secret)?;
        self.vault.put(key, sealed.as_bytes()).await
    }

    /// Load and open a secret stored with
    /// [`store_secret`](Self::store_secret).
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for a missing key, [`Error::Decrypt`] for a
    /// blob that does not open or is not UTF-8.
    pub async fn load_secret(&self, key: &VaultKey) -> Result<Zeroizing<String>> {
        let blob = self.vault.get(key).await?;
        let blob = std::str::from_utf8(&blob).map_err(|_| Error::Decrypt)?;
        self.envelope.open_string(blob)
    }

    async fn open_blob(&self, key: &VaultKey) -> Result<Zeroizing<Vec<u8>>> {
        let blob = self.vault.get(key).await?;
        let blob = std::str::from_utf8(&blob).map_err(|_| Error::Decrypt)?;
        self.envelope.open(blob)
    }

    /// Submit `message` through the account's SMTP server.
    ///
    /// Never retried here: a retry could deliver twice to recipients
    /// that already accepted.
    ///
    /// # Errors
    ///
    /// As [`list_messages`](Self::list_messages), plus
    /// [`Error::Submission`] carrying per-recipient detail.
    pub async fn send(
        &self,
        account_id: &str,
        message: &OutgoingMessage,
        ctx: &RequestContext,
    ) -> Result<SendResult> {
        let account = self.credentials.credentials(account_id, Service::Smtp).await?;
        let secret = self.envelope.open_string(&account.encrypted_secret)?;
        let mut client = SmtpClient::new(account.endpoint(), self.options.clone(), ctx.clone());

        let result = async {
            client.connect().await?;
            client.handshake().await?;
            client.upgrade().await?;
            client.authenticate(&account.username, &secret).await?;
            client.send(message).await
        }
        .await;

        finish(Service::Smtp, client.quit().await, result)
    }

    async fn with_pop3<T>(
        &self,
        account_id: &str,
        ctx: &RequestContext,
        op: impl AsyncFnOnce(&mut Pop3Client) -> Result<T>,
    ) -> Result<T> {
        let account = self.credentials.credentials(account_id, Service::Pop3).await?;
        let secret = self.envelope.open_string(&account.encrypted_secret)?;
        let mut client = Pop3Client::new(account.endpoint(), self.options.clone(), ctx.clone());

        let result = async {
            client.connect().await?;
            client
                .authenticate(&account.username, &secret, Pop3Auth::Auto)
                .await?;
            client.open_mailbox().await?;
            op(&mut client).await
        }
        .await;

        finish(Service::Pop3, client.quit().await, result)
    }
}
