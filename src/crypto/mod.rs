//! At-rest protection for provider credentials.
//!
//! [`CredentialCipher`] is the primitive; [`CredentialVault`] applies it at the
//! credential repository boundary so callers only ever see plaintext.

pub mod cipher;
pub mod vault;

pub use cipher::{CredentialCipher, CryptoError, SECRET_LEN};
pub use vault::CredentialVault;
