/// Encrypting decorator over a credential repository
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use super::{CredentialCipher, CryptoError};
use crate::error::Result;
use crate::metrics::METRICS;
use crate::store::CredentialRepository;
use crate::types::{Credential, Id, NewCredential};
use crate::validation;

/// Wraps a [`CredentialRepository`], encrypting both tokens just before every
/// write and decrypting them just after every read.
///
/// The inner repository only ever holds ciphertext. A vault cannot be built
/// without a cipher.
#[derive(Clone)]
pub struct CredentialVault<R> {
    inner: R,
    cipher: Arc<CredentialCipher>,
}

impl<R: CredentialRepository> CredentialVault<R> {
    pub fn new(inner: R, cipher: Arc<CredentialCipher>) -> Self {
        Self { inner, cipher }
    }

    /// The undecorated repository. Rows read through it hold ciphertext.
    pub fn inner(&self) -> &R {
        &self.inner
    }

    fn seal_token(&self, token: &str) -> std::result::Result<String, CryptoError> {
        if token.is_empty() {
            return Ok(String::new());
        }
        self.cipher.encrypt(token).inspect_err(|e| {
            METRICS
                .credential_crypto_failures_total
                .with_label_values(&["encrypt"])
                .inc();
            warn!("Credential encryption failed: {}", e);
        })
    }

    fn open_token(&self, token: &str) -> std::result::Result<String, CryptoError> {
        if token.is_empty() {
            return Ok(String::new());
        }
        self.cipher.decrypt(token).inspect_err(|e| {
            METRICS
                .credential_crypto_failures_total
                .with_label_values(&["decrypt"])
                .inc();
            warn!("Credential decryption failed: {}", e);
        })
    }

    /// Both tokens are sealed before anything is handed to the store
    fn seal_new(&self, credential: NewCredential) -> Result<NewCredential> {
        let access_token = self.seal_token(&credential.access_token)?;
        let refresh_token = self.seal_token(&credential.refresh_token)?;
        Ok(NewCredential {
            access_token,
            refresh_token,
            ..credential
        })
    }

    fn seal(&self, credential: Credential) -> Result<Credential> {
        let access_token = self.seal_token(&credential.access_token)?;
        let refresh_token = self.seal_token(&credential.refresh_token)?;
        Ok(Credential {
            access_token,
            refresh_token,
            ..credential
        })
    }

    fn open(&self, credential: Credential) -> Result<Credential> {
        let access_token = self.open_token(&credential.access_token)?;
        let refresh_token = self.open_token(&credential.refresh_token)?;
        Ok(Credential {
            access_token,
            refresh_token,
            ..credential
        })
    }

    fn open_all(&self, credentials: Vec<Credential>) -> Result<Vec<Credential>> {
        credentials.into_iter().map(|c| self.open(c)).collect()
    }
}

#[async_trait]
impl<R: CredentialRepository> CredentialRepository for CredentialVault<R> {
    async fn create_credential(&self, new_credential: NewCredential) -> Result<Credential> {
        validation::validate_new_credential(&new_credential)?;
        let sealed = self.seal_new(new_credential)?;
        let stored = self.inner.create_credential(sealed).await?;
        self.open(stored)
    }

    async fn get_credential(&self, id: Id) -> Result<Credential> {
        self.open(self.inner.get_credential(id).await?)
    }

    async fn get_credentials_by_user(&self, user_id: Id) -> Result<Vec<Credential>> {
        self.open_all(self.inner.get_credentials_by_user(user_id).await?)
    }

    async fn get_credentials_by_session(&self, session_id: Id) -> Result<Vec<Credential>> {
        self.open_all(self.inner.get_credentials_by_session(session_id).await?)
    }

    async fn get_credential_for(&self, user_id: Id, session_id: Id) -> Result<Option<Credential>> {
        self.inner
            .get_credential_for(user_id, session_id)
            .await?
            .map(|c| self.open(c))
            .transpose()
    }

    async fn update_credential(&self, credential: Credential) -> Result<Credential> {
        validation::validate_credential(
            credential.user_id,
            credential.session_id,
            &credential.access_token,
            &credential.refresh_token,
            credential.expires_at,
        )?;
        let sealed = self.seal(credential)?;
        let stored = self.inner.update_credential(sealed).await?;
        self.open(stored)
    }

    async fn delete_credential(&self, id: Id) -> Result<()> {
        self.inner.delete_credential(id).await
    }

    async fn delete_credentials_by_session(&self, session_id: Id) -> Result<usize> {
        self.inner.delete_credentials_by_session(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::{MemoryStore, SessionRepository, UserRepository};
    use crate::types::{NewSession, NewUser};
    use chrono::{Duration, Utc};

    const SECRET: &[u8] = b"abcdefghijklmnopqrstuvwxyz123456";

    async fn setup() -> (CredentialVault<MemoryStore>, NewCredential) {
        let store = MemoryStore::new();
        let user = store
            .create_user(NewUser {
                spotify_user_id: Some("spotify123".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let session = store
            .create_session(NewSession {
                slug: "party".to_string(),
                host_id: user.id,
            })
            .await
            .unwrap();

        let cipher = Arc::new(CredentialCipher::new(SECRET).unwrap());
        let credential = NewCredential {
            user_id: user.id,
            session_id: session.id,
            access_token: "access-plain".to_string(),
            refresh_token: "refresh-plain".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        };
        (CredentialVault::new(store, cipher), credential)
    }

    #[tokio::test]
    async fn test_vault_is_transparent_and_stores_ciphertext() {
        let (vault, new) = setup().await;

        let created = vault.create_credential(new.clone()).await.unwrap();
        assert_eq!(created.access_token, "access-plain");
        assert_eq!(created.refresh_token, "refresh-plain");

        let fetched = vault.get_credential(created.id).await.unwrap();
        assert_eq!(fetched.access_token, "access-plain");
        assert_eq!(fetched.refresh_token, "refresh-plain");

        let raw = vault.inner().get_credential(created.id).await.unwrap();
        assert_ne!(raw.access_token, "access-plain");
        assert_ne!(raw.refresh_token, "refresh-plain");
        assert!(hex::decode(&raw.access_token).is_ok());
    }

    #[tokio::test]
    async fn test_every_read_path_decrypts() {
        let (vault, new) = setup().await;
        let created = vault.create_credential(new.clone()).await.unwrap();

        let by_user = vault.get_credentials_by_user(new.user_id).await.unwrap();
        let by_session = vault.get_credentials_by_session(new.session_id).await.unwrap();
        let by_pair = vault
            .get_credential_for(new.user_id, new.session_id)
            .await
            .unwrap()
            .unwrap();

        for credential in by_user.iter().chain(by_session.iter()).chain([&by_pair]) {
            assert_eq!(credential.id, created.id);
            assert_eq!(credential.access_token, "access-plain");
        }
    }

    #[tokio::test]
    async fn test_update_reencrypts() {
        let (vault, new) = setup().await;
        let created = vault.create_credential(new).await.unwrap();
        let raw_before = vault.inner().get_credential(created.id).await.unwrap();

        let mut refreshed = created.clone();
        refreshed.access_token = "access-rotated".to_string();
        let updated = vault.update_credential(refreshed).await.unwrap();
        assert_eq!(updated.access_token, "access-rotated");

        let raw_after = vault.inner().get_credential(created.id).await.unwrap();
        assert_ne!(raw_after.access_token, "access-rotated");
        assert_ne!(raw_after.access_token, raw_before.access_token);
    }

    #[tokio::test]
    async fn test_decrypt_failure_surfaces_crypto_error() {
        let (vault, new) = setup().await;
        let created = vault.create_credential(new).await.unwrap();

        // Same rows, different key
        let other = CredentialVault::new(
            vault.inner().clone(),
            Arc::new(CredentialCipher::new(&[9u8; 32]).unwrap()),
        );
        let err = other.get_credential(created.id).await.unwrap_err();
        assert!(matches!(err, Error::Crypto(CryptoError::Decrypt)));
    }

    #[tokio::test]
    async fn test_invalid_credential_never_reaches_store() {
        let (vault, mut new) = setup().await;
        new.refresh_token.clear();

        let err = vault.create_credential(new.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Validation { field: "refresh_token", .. }));
        assert!(vault
            .inner()
            .get_credentials_by_user(new.user_id)
            .await
            .unwrap()
            .is_empty());
    }
}
