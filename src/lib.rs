//! Mail bridge library
//!
//! Speaks POP3 and SMTP to legacy mail accounts on behalf of users and
//! keeps their secrets and archived messages in a pluggable blob
//! [`vault`], sealed with an [`Envelope`] before they leave memory.
//!
//! Sessions ([`Pop3Client`], [`SmtpClient`]) run over plain TCP, implicit
//! TLS or an in-band upgrade (`STLS` / `STARTTLS`), honour per-request
//! deadlines and cancellation through a [`RequestContext`], and never
//! send credentials over an unencrypted stream when the account requires
//! TLS. [`MailBridge`] ties the pieces together.

pub mod bridge;
pub mod codec;
mod config;
pub mod connection;
mod crypto;
mod error;
mod message;
pub mod pop3;
pub mod smtp;
pub mod vault;

pub use bridge::{AccountRecord, CredentialsSource, InMemoryCredentials, MailBridge, Service};
pub use config::{
    AccountCredentials, BridgeConfig, Endpoint, RemoteVaultConfig, SessionOptions, Timeouts,
    VaultConfig,
};
pub use connection::RequestContext;
pub use crypto::{EncryptionKey, Envelope};
pub use error::{Error, ErrorKind, Result};
pub use message::{
    Header, MailboxStat, Message, MessageSummary, OutgoingMessage, RecipientStatus, SendResult,
};
pub use pop3::{Pop3Auth, Pop3Client, Pop3State};
pub use smtp::{AuthMechanism, Capabilities, SmtpClient, SmtpState};
pub use vault::{LocalVault, RemoteVault, VaultKey, VaultStorage};
