//! Authenticated encryption for data at rest
//!
//! Uses XChaCha20-Poly1305 (192-bit nonce).
//! Key size: 32 bytes.  Nonce: 24 bytes (random).  Tag: 16 bytes.
//!
//! Sealed blob format, base64 (standard alphabet, padded):
//!   [ nonce (24 bytes) | ciphertext | tag (16 bytes) ]

use crate::error::{Error, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chacha20poly1305::{
    Key, XChaCha20Poly1305, XNonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use std::fmt;
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

/// The process-wide data key. Constructed once at startup and never
/// mutated afterwards.
#[derive(Clone)]
pub struct EncryptionKey(Zeroizing<[u8; KEY_LEN]>);

impl EncryptionKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Build a key from configured material: either exactly 32
    /// characters used verbatim, or 64 hex digits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for any other length or invalid hex.
    pub fn from_material(material: &str) -> Result<Self> {
        let material = material.trim();
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        match material.len() {
            KEY_LEN => key.copy_from_slice(material.as_bytes()),
            len if len == KEY_LEN * 2 => {
                hex::decode_to_slice(material, &mut key[..])
                    .map_err(|e| Error::Config(format!("Invalid hex encryption key: {e}")))?;
            }
            len => {
                return Err(Error::Config(format!(
                    "Encryption key must be {KEY_LEN} bytes or {} hex digits, got {len} characters",
                    KEY_LEN * 2
                )));
            }
        }
        Ok(Self(key))
    }

    fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Seals and opens blobs with one fixed key.
#[derive(Clone)]
pub struct Envelope {
    cipher: XChaCha20Poly1305,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Envelope(<redacted>)")
    }
}

impl Envelope {
    #[must_use]
    pub fn new(key: &EncryptionKey) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
        }
    }

    /// Encrypt `plaintext` under a fresh random nonce and return the
    /// raw `nonce | ciphertext | tag` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the cipher refuses the input,
    /// which only happens for plaintexts beyond the AEAD size limit.
    pub fn seal_bytes(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::Storage("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt raw `nonce | ciphertext | tag` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decrypt`] for input shorter than a nonce plus a
    /// tag and for any authentication failure.
    pub fn open_bytes(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Decrypt);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| Error::Decrypt)
    }

    /// Encrypt and encode as printable base64.
    ///
    /// # Errors
    ///
    /// See [`seal_bytes`](Self::seal_bytes).
    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        Ok(STANDARD.encode(self.seal_bytes(plaintext)?))
    }

    /// # Errors
    ///
    /// See [`seal_bytes`](Self::seal_bytes).
    pub fn seal_str(&self, plaintext: &str) -> Result<String> {
        self.seal(plaintext.as_bytes())
    }

    /// Decode and decrypt a blob produced by [`seal`](Self::seal).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decrypt`] for empty input, non-canonical
    /// base64, truncated blobs and authentication failures.
    pub fn open(&self, blob: &str) -> Result<Zeroizing<Vec<u8>>> {
        if blob.is_empty() {
            return Err(Error::Decrypt);
        }
        let raw = Zeroizing::new(STANDARD.decode(blob).map_err(|_| Error::Decrypt)?);
        self.open_bytes(&raw)
    }

    /// Open a blob that must hold UTF-8 text, such as an account secret.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decrypt`] if the blob does not open or the
    /// plaintext is not UTF-8.
    pub fn open_string(&self, blob: &str) -> Result<Zeroizing<String>> {
        let plaintext = self.open(blob)?;
        std::str::from_utf8(&plaintext)
            .map(|s| Zeroizing::new(s.to_string()))
            .map_err(|_| Error::Decrypt)
    }
}
