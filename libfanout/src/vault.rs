//! Credential encryption at rest
//!
//! Connection secrets are stored as base64-encoded age ciphertext. The
//! engine only ever sees plaintext inside a [`SecretString`] that lives for
//! the duration of one publish attempt.

use std::io::{Read, Write};
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{ConfigError, CredentialError, Result};

/// Encrypt/decrypt connection secrets
pub trait CredentialVault: Send + Sync {
    /// Encrypt a plaintext secret into its stored form
    fn encrypt(&self, plaintext: &SecretString) -> Result<String>;

    /// Decrypt a stored secret
    fn decrypt(&self, ciphertext: &str) -> Result<SecretString>;
}

/// Vault backed by a single age x25519 identity
pub struct AgeVault {
    identity: age::x25519::Identity,
}

impl AgeVault {
    pub fn new(identity: age::x25519::Identity) -> Self {
        Self { identity }
    }

    /// Vault with a freshly generated identity (tests and first-time setup)
    pub fn generate() -> Self {
        Self::new(age::x25519::Identity::generate())
    }

    /// Parse an identity in `age-keygen` format
    ///
    /// Blank lines and `#` comments are skipped; the first remaining line must
    /// be an `AGE-SECRET-KEY-1...` string.
    pub fn from_identity_str(contents: &str) -> Result<Self> {
        let line = contents
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .ok_or_else(|| CredentialError::InvalidIdentity("no identity found".to_string()))?;

        let identity = age::x25519::Identity::from_str(line)
            .map_err(|e| CredentialError::InvalidIdentity(e.to_string()))?;

        Ok(Self::new(identity))
    }

    /// Load the identity file named in the configuration
    pub fn from_file(path: &str) -> Result<Self> {
        let expanded = shellexpand::tilde(path).to_string();
        let contents = std::fs::read_to_string(&expanded).map_err(ConfigError::ReadError)?;
        Self::from_identity_str(&contents)
    }
}

impl CredentialVault for AgeVault {
    fn encrypt(&self, plaintext: &SecretString) -> Result<String> {
        let recipients: Vec<Box<dyn age::Recipient + Send>> =
            vec![Box::new(self.identity.to_public())];
        let encryptor = age::Encryptor::with_recipients(recipients)
            .ok_or_else(|| CredentialError::Encryption("no recipients".to_string()))?;

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        writer
            .write_all(plaintext.expose_secret().as_bytes())
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        writer
            .finish()
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        Ok(STANDARD.encode(encrypted))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<SecretString> {
        let data = STANDARD
            .decode(ciphertext.trim())
            .map_err(|_| CredentialError::DecryptionFailed)?;

        let decryptor = match age::Decryptor::new(&data[..]) {
            Ok(age::Decryptor::Recipients(d)) => d,
            Ok(_) => {
                return Err(CredentialError::Encryption(
                    "Invalid encryption format (expected recipient-encrypted data)".to_string(),
                )
                .into())
            }
            Err(e) => return Err(CredentialError::Encryption(e.to_string()).into()),
        };

        let mut reader = decryptor
            .decrypt(std::iter::once(&self.identity as &dyn age::Identity))
            .map_err(|_| CredentialError::DecryptionFailed)?;

        let mut decrypted = vec![];
        reader
            .read_to_end(&mut decrypted)
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        let plaintext = String::from_utf8(decrypted)
            .map_err(|e| CredentialError::Encryption(format!("Invalid UTF-8: {}", e)))?;

        Ok(SecretString::from(plaintext))
    }
}
