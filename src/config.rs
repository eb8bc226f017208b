//! Account, session and process configuration

use crate::codec::DEFAULT_MAX_LINE_LENGTH;
use crate::crypto::EncryptionKey;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use zeroize::Zeroizing;

/// Credentials for one remote mail account, as stored by the metadata
/// store. The secret is a sealed blob and only ever opened through an
/// [`Envelope`](crate::Envelope).
#[derive(Clone, Deserialize)]
pub struct AccountCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub encrypted_secret: String,
    /// Refuse to exchange credentials over an unencrypted stream.
    #[serde(default = "default_true")]
    pub tls_required: bool,
    /// Wrap the stream in TLS from the first byte (POP3S / SMTPS).
    #[serde(default)]
    pub implicit_tls: bool,
}

const fn default_true() -> bool {
    true
}

impl fmt::Debug for AccountCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("encrypted_secret", &"<redacted>")
            .field("tls_required", &self.tls_required)
            .field("implicit_tls", &self.implicit_tls)
            .finish()
    }
}

impl AccountCredentials {
    /// Load one account from `{prefix}_*` environment variables.
    ///
    /// Reads from `.env` file if present. Required variables:
    /// - `{prefix}_HOST`
    /// - `{prefix}_USERNAME`
    /// - `{prefix}_SECRET` (a sealed blob, see `mailbridge-cli seal`)
    ///
    /// Optional:
    /// - `{prefix}_PORT` (default: `default_port`)
    /// - `{prefix}_TLS`: `implicit`, `starttls` or `none` (default:
    ///   `starttls`)
    pub fn from_env(prefix: &str, default_port: u16) -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(prefix, default_port, |name| env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable
    /// source.
    pub fn from_lookup(
        prefix: &str,
        default_port: u16,
        get: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let var = |suffix: &str| get(&format!("{prefix}_{suffix}"));
        let required = |suffix: &str| {
            var(suffix).ok_or_else(|| Error::Config(format!("{prefix}_{suffix} not set")))
        };

        let port = match var("PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|e| Error::Config(format!("Invalid {prefix}_PORT: {e}")))?,
            None => default_port,
        };

        let (implicit_tls, tls_required) = match var("TLS").as_deref() {
            None | Some("starttls") => (false, true),
            Some("implicit") => (true, true),
            Some("none") => (false, false),
            Some(other) => {
                return Err(Error::Config(format!(
                    "Invalid {prefix}_TLS '{other}' (expected implicit, starttls or none)"
                )));
            }
        };

        Ok(Self {
            host: required("HOST")?,
            port,
            username: required("USERNAME")?,
            encrypted_secret: required("SECRET")?,
            tls_required,
            implicit_tls,
        })
    }

    /// Where and how to connect for this account.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
            implicit_tls: self.implicit_tls,
            tls_required: self.tls_required,
        }
    }
}

/// Network location of a mail server plus its transport security
/// requirements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub implicit_tls: bool,
    pub tls_required: bool,
}

impl Endpoint {
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Upper bounds for each class of network step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// DNS resolution, TCP connect and TLS handshake.
    pub connect: Duration,
    /// Any single read or write.
    pub io: Duration,
    /// Best-effort QUIT after a timeout or cancellation.
    pub quit_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            io: Duration::from_secs(60),
            quit_grace: Duration::from_secs(5),
        }
    }
}

/// Settings shared by every protocol session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub timeouts: Timeouts,
    /// Skip certificate verification (self-signed local bridges).
    pub accept_invalid_certs: bool,
    /// Domain announced in `EHLO`.
    pub client_domain: String,
    pub max_line_length: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            accept_invalid_certs: false,
            client_domain: "localhost".to_string(),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Which vault backend is active, chosen once per process.
#[derive(Debug, Clone)]
pub enum VaultConfig {
    Local { dir: PathBuf },
    Remote(RemoteVaultConfig),
}

/// S3-compatible object store settings.
#[derive(Clone)]
pub struct RemoteVaultConfig {
    /// Base URL, e.g. `https://s3.eu-west-1.amazonaws.com`.
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<Zeroizing<String>>,
}

impl fmt::Debug for RemoteVaultConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteVaultConfig")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Process-wide configuration for the bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub key: EncryptionKey,
    pub vault: VaultConfig,
    pub session: SessionOptions,
}

impl BridgeConfig {
    /// Load bridge configuration from environment variables
    ///
    /// Reads from `.env` file if present. Required variables:
    /// - `MAILBRIDGE_ENCRYPTION_KEY` (32 characters or 64 hex digits)
    ///
    /// Optional (with defaults):
    /// - `MAILBRIDGE_VAULT_BACKEND` (default: `local`; or `remote`)
    /// - `MAILBRIDGE_VAULT_DIR` (default: `vault`)
    /// - `MAILBRIDGE_VAULT_ENDPOINT`, `MAILBRIDGE_VAULT_BUCKET`
    ///   (required for `remote`)
    /// - `MAILBRIDGE_VAULT_REGION` (default: `us-east-1`)
    /// - `MAILBRIDGE_VAULT_ACCESS_KEY`, `MAILBRIDGE_VAULT_SECRET_KEY`
    /// - `MAILBRIDGE_CONNECT_TIMEOUT_SECS` (default: `30`)
    /// - `MAILBRIDGE_IO_TIMEOUT_SECS` (default: `60`)
    /// - `MAILBRIDGE_ACCEPT_INVALID_CERTS` (default: `false`)
    /// - `MAILBRIDGE_CLIENT_DOMAIN` (default: `localhost`)
    ///
    /// A missing or malformed key is fatal: there is no fallback key.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable
    /// source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let material = get("MAILBRIDGE_ENCRYPTION_KEY")
            .ok_or_else(|| Error::Config("MAILBRIDGE_ENCRYPTION_KEY not set".into()))?;
        let key = EncryptionKey::from_material(&material)?;

        let vault = match get("MAILBRIDGE_VAULT_BACKEND").as_deref() {
            None | Some("local") => VaultConfig::Local {
                dir: get("MAILBRIDGE_VAULT_DIR")
                    .unwrap_or_else(|| "vault".to_string())
                    .into(),
            },
            Some("remote") => VaultConfig::Remote(remote_vault_from_lookup(&get)?),
            Some(other) => {
                return Err(Error::Config(format!(
                    "Invalid MAILBRIDGE_VAULT_BACKEND '{other}' (expected local or remote)"
                )));
            }
        };

        let defaults = Timeouts::default();
        let timeouts = Timeouts {
            connect: secs_var(&get, "MAILBRIDGE_CONNECT_TIMEOUT_SECS")?.unwrap_or(defaults.connect),
            io: secs_var(&get, "MAILBRIDGE_IO_TIMEOUT_SECS")?.unwrap_or(defaults.io),
            quit_grace: defaults.quit_grace,
        };

        let accept_invalid_certs = match get("MAILBRIDGE_ACCEPT_INVALID_CERTS").as_deref() {
            None | Some("false" | "0") => false,
            Some("true" | "1") => true,
            Some(other) => {
                return Err(Error::Config(format!(
                    "Invalid MAILBRIDGE_ACCEPT_INVALID_CERTS '{other}'"
                )));
            }
        };

        let session = SessionOptions {
            timeouts,
            accept_invalid_certs,
            client_domain: get("MAILBRIDGE_CLIENT_DOMAIN").unwrap_or_else(|| "localhost".into()),
            ..SessionOptions::default()
        };

        Ok(Self {
            key,
            vault,
            session,
        })
    }
}

fn remote_vault_from_lookup(get: &impl Fn(&str) -> Option<String>) -> Result<RemoteVaultConfig> {
    let access_key = get("MAILBRIDGE_VAULT_ACCESS_KEY");
    let secret_key = get("MAILBRIDGE_VAULT_SECRET_KEY").map(Zeroizing::new);
    if access_key.is_some() != secret_key.is_some() {
        return Err(Error::Config(
            "MAILBRIDGE_VAULT_ACCESS_KEY and MAILBRIDGE_VAULT_SECRET_KEY must be set together"
                .into(),
        ));
    }

    Ok(RemoteVaultConfig {
        endpoint: get("MAILBRIDGE_VAULT_ENDPOINT")
            .ok_or_else(|| Error::Config("MAILBRIDGE_VAULT_ENDPOINT not set".into()))?,
        bucket: get("MAILBRIDGE_VAULT_BUCKET")
            .ok_or_else(|| Error::Config("MAILBRIDGE_VAULT_BUCKET not set".into()))?,
        region: get("MAILBRIDGE_VAULT_REGION").unwrap_or_else(|| "us-east-1".into()),
        access_key,
        secret_key,
    })
}

fn secs_var(get: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<Duration>> {
    get(name)
        .map(|raw| {
            raw.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| Error::Config(format!("Invalid {name}: {e}")))
        })
        .transpose()
}
