//! Encryption of stored credentials (repository passwords, S3 keys,
//! database passwords).
//!
//! Ciphertext is base64 of `nonce (12 bytes) || AES-256-GCM ciphertext+tag`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const KEY_CONTEXT: &[u8] = b"backup-service/credential-encryption/aes-256-gcm/v1";

#[derive(thiserror::Error, Debug)]
pub enum SecretError {
    #[error("ciphertext is not valid base64")]
    Encoding,

    #[error("ciphertext is too short")]
    TooShort,

    #[error("decryption failed: wrong key or corrupted data")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,

    #[error("decrypted secret is not valid UTF-8")]
    Utf8,

    #[error("encryption passphrase must not be empty")]
    Key,
}

/// Opaque encrypt/decrypt capability for secrets at rest.
pub trait SecretCodec: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, SecretError>;
    fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError>;
}

pub struct AesGcmCodec {
    key: [u8; 32],
}

impl AesGcmCodec {
    /// Derives the key as HMAC-SHA256(passphrase, context).
    pub fn from_passphrase(passphrase: &str) -> Result<Self, SecretError> {
        if passphrase.is_empty() {
            return Err(SecretError::Key);
        }
        let mut mac = <HmacSha256 as Mac>::new_from_slice(passphrase.as_bytes())
            .map_err(|_| SecretError::Key)?;
        mac.update(KEY_CONTEXT);
        Ok(Self { key: mac.finalize().into_bytes().into() })
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }
}

impl SecretCodec for AesGcmCodec {
    fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| SecretError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError> {
        let raw = STANDARD
            .decode(ciphertext.trim())
            .map_err(|_| SecretError::Encoding)?;
        if raw.len() <= NONCE_LEN {
            return Err(SecretError::TooShort);
        }
        let (nonce, body) = raw.split_at(NONCE_LEN);
        let plain = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| SecretError::Decrypt)?;
        String::from_utf8(plain).map_err(|_| SecretError::Utf8)
    }
}
