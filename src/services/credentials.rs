use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, bail, Context, Result};

use crate::model::{BranchError, ConnectionSettings};

/// Marks a credential that is stored encrypted.
pub const ENCRYPTED_PREFIX: &str = "enc:";

const NONCE_LEN: usize = 12;

pub trait CredentialDecryptor: Send + Sync {
    /// Decrypt a value with the `enc:` prefix already removed.
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Used when no decryption key is configured: plain values pass, encrypted
/// values are a configuration error.
#[derive(Debug, Clone, Default)]
pub struct PlainCredentials;

impl CredentialDecryptor for PlainCredentials {
    fn decrypt(&self, _ciphertext: &str) -> Result<String> {
        Err(BranchError::Configuration(
            "Encrypted credentials found but no decryption key is configured".to_string(),
        )
        .into())
    }
}

/// AES-256-GCM with a key from the configuration.
///
/// An encrypted value is `enc:` followed by the hex encoding of the 12-byte
/// nonce and the sealed bytes.
pub struct AesGcmCredentials {
    cipher: Aes256Gcm,
}

impl AesGcmCredentials {
    /// `key` is 32 bytes as 64 hex digits.
    pub fn from_hex_key(key: &str) -> Result<Self> {
        let bytes = hex::decode(key.trim()).map_err(|e| {
            BranchError::Configuration(format!("The credential key is not valid hex: {}", e))
        })?;
        let cipher = Aes256Gcm::new_from_slice(&bytes).map_err(|_| {
            BranchError::Configuration(format!(
                "The credential key must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { cipher })
    }

    /// Encrypt `plaintext` into a value with the `enc:` prefix.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Failed to encrypt credential: {}", e))?;
        let mut bytes = nonce.to_vec();
        bytes.extend_from_slice(&sealed);
        Ok(format!("{}{}", ENCRYPTED_PREFIX, hex::encode(bytes)))
    }
}

impl CredentialDecryptor for AesGcmCredentials {
    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let bytes = hex::decode(ciphertext.trim()).context("Encrypted credential is not valid hex")?;
        if bytes.len() <= NONCE_LEN {
            bail!("Encrypted credential is too short");
        }
        let (nonce, sealed) = bytes.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| anyhow!("Failed to decrypt credential, it was sealed with another key"))?;
        String::from_utf8(plain).context("Decrypted credential is not UTF-8")
    }
}

pub fn resolve_secret(value: &str, decryptor: &dyn CredentialDecryptor) -> Result<String> {
    match value.strip_prefix(ENCRYPTED_PREFIX) {
        Some(ciphertext) => decryptor.decrypt(ciphertext),
        None => Ok(value.to_string()),
    }
}

/// Copy of `settings` with its username and password decrypted.
pub fn decrypt_connection(
    settings: &ConnectionSettings,
    decryptor: &dyn CredentialDecryptor,
) -> Result<ConnectionSettings> {
    let mut decrypted = settings.clone();
    if let Some(username) = &settings.username {
        decrypted.username = Some(resolve_secret(username, decryptor)?);
    }
    if let Some(password) = &settings.password {
        decrypted.password = Some(resolve_secret(password, decryptor)?);
    }
    Ok(decrypted)
}
