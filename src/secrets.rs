//! At-rest protection for BYOM upstream credentials.
//!
//! Stored credentials use the form `aes256:<base64(nonce || ciphertext)>` with a 96-bit random
//! nonce per value. The plaintext only ever exists in memory for the duration of one dispatch.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

const NONCE_SIZE: usize = 12;
const PREFIX: &str = "aes256:";

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("credential key must be 32 bytes of base64, got {0} bytes")]
    KeyLength(usize),
    #[error("credential key is not valid base64")]
    KeyEncoding,
    #[error("stored credential is not encrypted")]
    MissingPrefix,
    #[error("stored credential is malformed")]
    Malformed,
    #[error("credential could not be decrypted")]
    Decrypt,
    #[error("credential could not be encrypted")]
    Encrypt,
}

/// Recover a plaintext credential from its stored form.
pub trait CredentialDecryptor: Send + Sync {
    fn decrypt(&self, stored: &str) -> Result<String, SecretError>;
}

/// AES-256-GCM credential cipher.
#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialCipher(..)")
    }
}

impl CredentialCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Build a cipher from a base64 encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self, SecretError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|_| SecretError::KeyEncoding)?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SecretError::KeyLength(bytes.len()))?;
        Ok(Self { key })
    }

    /// Fresh random key, base64 encoded.
    pub fn generate_key() -> String {
        let key = Aes256Gcm::generate_key(OsRng);
        STANDARD.encode(key.as_slice())
    }

    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(PREFIX)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| SecretError::Encrypt)?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(nonce.as_slice());
        combined.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", PREFIX, STANDARD.encode(combined)))
    }
}

impl CredentialDecryptor for CredentialCipher {
    fn decrypt(&self, stored: &str) -> Result<String, SecretError> {
        let encoded = stored.strip_prefix(PREFIX).ok_or(SecretError::MissingPrefix)?;
        let combined = STANDARD.decode(encoded).map_err(|_| SecretError::Malformed)?;
        if combined.len() <= NONCE_SIZE {
            return Err(SecretError::Malformed);
        }

        let (nonce, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecretError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| SecretError::Malformed)
    }
}

/// Decryptor used when no credential key is configured. Every BYOM dispatch fails closed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentialKey;

impl CredentialDecryptor for NoCredentialKey {
    fn decrypt(&self, _stored: &str) -> Result<String, SecretError> {
        Err(SecretError::KeyEncoding)
    }
}
