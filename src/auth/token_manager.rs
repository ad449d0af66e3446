/// Provider token manager with auto-refresh capabilities
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use super::provider::IdentityProvider;
use crate::error::{Error, Result};
use crate::metrics::METRICS;
use crate::store::CredentialRepository;
use crate::types::{Credential, Id};

#[derive(Clone)]
pub struct TokenManager {
    credentials: Arc<dyn CredentialRepository>,
    provider: Arc<dyn IdentityProvider>,
    refresh_buffer_secs: i64,
}

impl TokenManager {
    /// `credentials` should be the vault so tokens are handled in plaintext
    pub fn new(
        credentials: Arc<dyn CredentialRepository>,
        provider: Arc<dyn IdentityProvider>,
        refresh_buffer_secs: i64,
    ) -> Self {
        Self {
            credentials,
            provider,
            refresh_buffer_secs,
        }
    }

    async fn credential(&self, user_id: Id, session_id: Id) -> Result<Credential> {
        self.credentials
            .get_credential_for(user_id, session_id)
            .await?
            .ok_or_else(|| Error::not_found("credential", format!("{}:{}", user_id, session_id)))
    }

    /// Get valid access token, automatically refreshing if expired
    pub async fn get_access_token(&self, user_id: Id, session_id: Id) -> Result<String> {
        let credential = self.credential(user_id, session_id).await?;

        if credential.expires_within(self.refresh_buffer_secs) {
            // Token is expired or about to, attempt to refresh
            self.refresh_token(credential).await
        } else {
            Ok(credential.access_token)
        }
    }

    /// Refresh through the provider and persist the new pair
    async fn refresh_token(&self, credential: Credential) -> Result<String> {
        let tokens = match self.provider.refresh(&credential.refresh_token).await {
            Ok(tokens) => tokens,
            Err(e) => {
                METRICS
                    .token_refreshes_total
                    .with_label_values(&["failure"])
                    .inc();
                warn!(
                    "Token refresh failed for user {} session {}: {}",
                    credential.user_id, credential.session_id, e
                );
                return Err(e);
            }
        };

        // Providers may keep the refresh token unchanged
        let refresh_token = tokens
            .refresh_token
            .unwrap_or_else(|| credential.refresh_token.clone());

        let updated = self
            .credentials
            .update_credential(Credential {
                access_token: tokens.access_token,
                refresh_token,
                expires_at: tokens.expires_at,
                ..credential
            })
            .await?;

        sync_user_credentials(self.credentials.as_ref(), &updated).await?;

        METRICS
            .token_refreshes_total
            .with_label_values(&["success"])
            .inc();
        info!(
            "Refreshed provider token for user {} session {}",
            updated.user_id, updated.session_id
        );

        Ok(updated.access_token)
    }

    /// Check if token is expired
    pub async fn is_token_expired(&self, user_id: Id, session_id: Id) -> Result<bool> {
        let credential = self.credential(user_id, session_id).await?;
        Ok(credential.expires_within(0))
    }

    /// Get time until expiration in seconds
    pub async fn time_until_expiration(&self, user_id: Id, session_id: Id) -> Result<i64> {
        let credential = self.credential(user_id, session_id).await?;
        Ok(credential.expires_at.timestamp() - Utc::now().timestamp())
    }
}

/// Copy `source`'s token pair onto every other credential of the same user,
/// so each session the user hosts holds the latest provider tokens.
pub async fn sync_user_credentials(
    credentials: &dyn CredentialRepository,
    source: &Credential,
) -> Result<usize> {
    let mut synced = 0;
    for other in credentials.get_credentials_by_user(source.user_id).await? {
        if other.id == source.id {
            continue;
        }
        credentials
            .update_credential(Credential {
                access_token: source.access_token.clone(),
                refresh_token: source.refresh_token.clone(),
                expires_at: source.expires_at,
                ..other
            })
            .await?;
        synced += 1;
    }
    Ok(synced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::provider::{MockIdentityProvider, ProviderTokens};
    use crate::crypto::{CredentialCipher, CredentialVault};
    use crate::store::{MemoryStore, SessionRepository, UserRepository};
    use crate::types::{NewCredential, NewSession, NewUser};
    use chrono::Duration;

    async fn setup(expires_in: Duration, mock: MockIdentityProvider) -> (TokenManager, CredentialVault<MemoryStore>, Id, Id) {
        let store = MemoryStore::new();
        let user = store
            .create_user(NewUser {
                spotify_user_id: Some("host".to_string()),
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

        let cipher = Arc::new(CredentialCipher::new(b"abcdefghijklmnopqrstuvwxyz123456").unwrap());
        let vault = CredentialVault::new(store, cipher);
        vault
            .create_credential(NewCredential {
                user_id: user.id,
                session_id: session.id,
                access_token: "old-access".to_string(),
                refresh_token: "old-refresh".to_string(),
                expires_at: Utc::now() + expires_in,
            })
            .await
            .unwrap();

        let manager = TokenManager::new(Arc::new(vault.clone()), Arc::new(mock), 300);
        (manager, vault, user.id, session.id)
    }

    #[tokio::test]
    async fn test_valid_token_returned_without_refresh() {
        let mut mock = MockIdentityProvider::new();
        mock.expect_refresh().never();
        let (manager, _, user_id, session_id) = setup(Duration::hours(1), mock).await;

        assert_eq!(manager.get_access_token(user_id, session_id).await.unwrap(), "old-access");
        assert!(!manager.is_token_expired(user_id, session_id).await.unwrap());
        assert!(manager.time_until_expiration(user_id, session_id).await.unwrap() > 3500);
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed_and_persisted() {
        let mut mock = MockIdentityProvider::new();
        mock.expect_refresh()
            .withf(|refresh| refresh == "old-refresh")
            .times(1)
            .returning(|_| {
                Ok(ProviderTokens {
                    access_token: "new-access".to_string(),
                    refresh_token: None,
                    expires_at: Utc::now() + Duration::hours(1),
                })
            });
        let (manager, vault, user_id, session_id) = setup(Duration::seconds(60), mock).await;

        assert_eq!(manager.get_access_token(user_id, session_id).await.unwrap(), "new-access");

        let stored = vault.get_credential_for(user_id, session_id).await.unwrap().unwrap();
        assert_eq!(stored.access_token, "new-access");
        assert_eq!(stored.refresh_token, "old-refresh");

        // Now fresh, no second refresh
        assert_eq!(manager.get_access_token(user_id, session_id).await.unwrap(), "new-access");
    }

    #[tokio::test]
    async fn test_refresh_updates_every_session_of_the_user() {
        let mut mock = MockIdentityProvider::new();
        mock.expect_refresh().times(1).returning(|_| {
            Ok(ProviderTokens {
                access_token: "new-access".to_string(),
                refresh_token: Some("new-refresh".to_string()),
                expires_at: Utc::now() + Duration::hours(1),
            })
        });
        let (manager, vault, user_id, session_id) = setup(Duration::seconds(60), mock).await;

        let other = vault
            .inner()
            .create_session(NewSession {
                slug: "afterparty".to_string(),
                host_id: user_id,
            })
            .await
            .unwrap();
        vault
            .create_credential(NewCredential {
                user_id,
                session_id: other.id,
                access_token: "old-access".to_string(),
                refresh_token: "old-refresh".to_string(),
                expires_at: Utc::now() + Duration::seconds(60),
            })
            .await
            .unwrap();

        assert_eq!(manager.get_access_token(user_id, session_id).await.unwrap(), "new-access");

        let synced = vault.get_credential_for(user_id, other.id).await.unwrap().unwrap();
        assert_eq!(synced.access_token, "new-access");
        assert_eq!(synced.refresh_token, "new-refresh");

        // Already fresh, so no second provider call
        assert_eq!(manager.get_access_token(user_id, other.id).await.unwrap(), "new-access");
    }

    #[tokio::test]
    async fn test_refresh_failure_propagates() {
        let mut mock = MockIdentityProvider::new();
        mock.expect_refresh()
            .returning(|_| Err(Error::Provider("invalid_grant".to_string())));
        let (manager, _, user_id, session_id) = setup(Duration::seconds(-10), mock).await;

        assert!(manager.is_token_expired(user_id, session_id).await.unwrap());
        assert!(matches!(
            manager.get_access_token(user_id, session_id).await,
            Err(Error::Provider(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_credential_is_not_found() {
        let (manager, _, user_id, _) = setup(Duration::hours(1), MockIdentityProvider::new()).await;
        assert!(matches!(
            manager.get_access_token(user_id, 999).await,
            Err(Error::NotFound { .. })
        ));
    }
}
