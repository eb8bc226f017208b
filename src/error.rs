//! Error types for mail-bridge

use crate::message::RecipientStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Transport security error: {0}")]
    Security(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Unexpected server response: {line}")]
    Protocol { line: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Submission rejected: {reason}")]
    Submission {
        reason: String,
        recipients: Vec<RecipientStatus>,
    },

    #[error("Decryption failed")]
    Decrypt,

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Cancelled during {0}")]
    Cancelled(&'static str),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("Operation requires state {expected}, session is {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid vault key: {0}")]
    InvalidKey(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of [`Error`], stable for callers that map
/// failures onto their own status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Handshake,
    Security,
    Auth,
    Protocol,
    NotFound,
    Submission,
    Decrypt,
    Timeout,
    Cancelled,
    Validation,
    Config,
    Transport,
    Storage,
}

impl Error {
    pub(crate) fn protocol(line: impl Into<String>) -> Self {
        Self::Protocol { line: line.into() }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Handshake(_) => ErrorKind::Handshake,
            Self::Security(_) | Self::Tls(_) => ErrorKind::Security,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Protocol { .. } | Self::LineTooLong(_) => ErrorKind::Protocol,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Submission { .. } => ErrorKind::Submission,
            Self::Decrypt => ErrorKind::Decrypt,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::InvalidState { .. } | Self::InvalidInput(_) | Self::InvalidKey(_) => {
                ErrorKind::Validation
            }
            Self::Config(_) => ErrorKind::Config,
            Self::ConnectionClosed | Self::Io(_) => ErrorKind::Transport,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether the session that produced this error can no longer be
    /// trusted to be in sync with the server.
    pub(crate) const fn breaks_session(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Cancelled(_)
                | Self::ConnectionClosed
                | Self::LineTooLong(_)
                | Self::Io(_)
                | Self::Tls(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
