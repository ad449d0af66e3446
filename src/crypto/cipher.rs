//! Symmetric encryption of provider credentials.
//!
//! Ciphertext layout, hex encoded for storage in a text column:
//!
//! ```text
//! nonce (12 bytes) || AES-256-GCM ciphertext || tag (16 bytes)
//! ```
//!
//! Every call to [`CredentialCipher::encrypt`] draws a fresh nonce from the OS
//! RNG, so two encryptions of the same plaintext never produce the same output.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use std::fmt;
use thiserror::Error;

/// Required secret length; selects AES-256
pub const SECRET_LEN: usize = 32;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption secret must be {expected} bytes, got {actual}")]
    KeyLength { expected: usize, actual: usize },
    #[error("ciphertext could not be decoded: {0}")]
    Decode(&'static str),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("no randomness available for nonce")]
    Entropy,
}

/// Process-wide credential cipher, built once from the configured secret and
/// shared read-only
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    pub fn new(secret: &[u8]) -> Result<Self, CryptoError> {
        if secret.len() != SECRET_LEN {
            return Err(CryptoError::KeyLength {
                expected: SECRET_LEN,
                actual: secret.len(),
            });
        }

        let cipher = Aes256Gcm::new_from_slice(secret).map_err(|_| CryptoError::KeyLength {
            expected: SECRET_LEN,
            actual: secret.len(),
        })?;

        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(|_| CryptoError::Entropy)?;

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);

        Ok(hex::encode(out))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let raw = hex::decode(ciphertext).map_err(|_| CryptoError::Decode("not valid hexadecimal"))?;

        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Decode("shorter than nonce and tag"));
        }

        let (nonce, body) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| CryptoError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Decode("plaintext is not utf-8"))
    }
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}
