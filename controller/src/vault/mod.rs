//! Credential vault
//!
//! Host secrets (SSH passwords and keys, git tokens) are only ever stored as
//! [`Ciphertext`]. The text form is `v1:` followed by base64 of
//! `nonce || ciphertext || tag` under AES-256-GCM with a random 96-bit nonce.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use secrecy::{ExposeSecret, SecretBox, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::DockyardError;

/// Environment variable holding the master key unless settings override it
pub const DEFAULT_MASTER_KEY_ENV: &str = "DOCKYARD_MASTER_KEY";

const CIPHERTEXT_PREFIX: &str = "v1:";
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Vault-encrypted secret as persisted at rest
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ciphertext(String);

impl Ciphertext {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ciphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-wide master key
pub struct MasterKey(SecretBox<[u8; KEY_LEN]>);

impl MasterKey {
    /// Build a key from configured material.
    ///
    /// Material that base64-decodes to exactly 32 bytes is used as-is; anything
    /// else is treated as a passphrase and stretched with SHA-256.
    pub fn from_material(material: &SecretString) -> Result<Self, DockyardError> {
        let material = material.expose_secret().trim();
        if material.is_empty() {
            return Err(DockyardError::ConfigError("master key is empty".to_string()));
        }

        let mut key = [0u8; KEY_LEN];
        match BASE64.decode(material) {
            Ok(raw) if raw.len() == KEY_LEN => key.copy_from_slice(&raw),
            _ => key.copy_from_slice(&Sha256::digest(material.as_bytes())),
        }
        Ok(Self(SecretBox::new(Box::new(key))))
    }

    /// Read the key material from the environment variable `var`
    pub fn from_env(var: &str) -> Result<Self, DockyardError> {
        let material = std::env::var(var).map_err(|_| {
            DockyardError::ConfigError(format!(
                "master key environment variable {} is not set",
                var
            ))
        })?;
        Self::from_material(&SecretString::from(material))
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Symmetric vault for secrets at rest
pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    /// Create a vault, failing when no master key was supplied
    pub fn new(master_key: Option<MasterKey>) -> Result<Self, DockyardError> {
        let master_key = master_key.ok_or_else(|| {
            DockyardError::ConfigError("no master key supplied to the vault".to_string())
        })?;
        let key = Key::<Aes256Gcm>::from_slice(master_key.0.expose_secret());
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypt `plaintext` under the master key
    pub fn encrypt(&self, plaintext: &str) -> Result<Ciphertext, DockyardError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| DockyardError::Internal("secret encryption failed".to_string()))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&sealed);

        Ok(Ciphertext(format!("{}{}", CIPHERTEXT_PREFIX, BASE64.encode(payload))))
    }

    /// Decrypt a secret; any tampering or key mismatch is a [`DockyardError::DecryptionError`]
    pub fn decrypt(&self, ciphertext: &Ciphertext) -> Result<SecretString, DockyardError> {
        let encoded = ciphertext
            .as_str()
            .strip_prefix(CIPHERTEXT_PREFIX)
            .ok_or_else(|| DockyardError::DecryptionError("unknown ciphertext format".to_string()))?;

        let payload = BASE64
            .decode(encoded)
            .map_err(|_| DockyardError::DecryptionError("ciphertext is not valid base64".to_string()))?;

        if payload.len() <= NONCE_LEN {
            return Err(DockyardError::DecryptionError("ciphertext too short".to_string()));
        }

        let (nonce, sealed) = payload.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| DockyardError::DecryptionError("authentication tag mismatch".to_string()))?;

        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| DockyardError::DecryptionError("plaintext is not UTF-8".to_string()))?;
        Ok(SecretString::from(plaintext))
    }
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}
