//! Login orchestration around the OAuth coordinator.
//!
//! A completed callback provisions the local account: the user is found or
//! created from the provider identity, gets a hosted session if they have
//! none, and the provider tokens are stored for that (user, session) through
//! the credential vault. Any other session the user hosts gets the same
//! tokens. The browser is then sent to the destination bound at login time
//! with a signed session token.

use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use super::coordinator::{CompletedLogin, OAuthCoordinator};
use super::provider::{IdentityProvider, ProviderIdentity};
use super::token::SessionTokens;
use super::token_manager::sync_user_credentials;
use crate::config::OAuthConfig;
use crate::error::{Error, Result};
use crate::metrics::METRICS;
use crate::sessions::SessionService;
use crate::store::{CredentialRepository, UserRepository};
use crate::types::{Credential, Id, NewCredential, NewUser, User};

/// Where logins may land
#[derive(Debug, Clone)]
pub struct RedirectPolicy {
    pub success_url: String,
    pub failure_url: String,
    pub allowed_redirects: Vec<String>,
}

impl RedirectPolicy {
    pub fn from_config(config: &OAuthConfig) -> Self {
        Self {
            success_url: config.success_url.clone(),
            failure_url: config.failure_url.clone(),
            allowed_redirects: config.allowed_redirects.clone(),
        }
    }

    /// Exact `success_url`, or same origin as an allowed entry with a path
    /// inside that entry's path. URLs carrying credentials never match.
    pub fn is_allowed(&self, url: &str) -> bool {
        if url == self.success_url {
            return true;
        }

        let Ok(target) = Url::parse(url) else {
            return false;
        };
        if !target.username().is_empty() || target.password().is_some() {
            return false;
        }

        self.allowed_redirects
            .iter()
            .filter_map(|allowed| Url::parse(allowed).ok())
            .any(|allowed| {
                allowed.origin() == target.origin() && path_within(allowed.path(), target.path())
            })
    }

    /// The caller's requested destination, or the default when none is given
    pub fn resolve(&self, requested: Option<String>) -> Result<String> {
        match requested.filter(|r| !r.is_empty()) {
            None => Ok(self.success_url.clone()),
            Some(url) if self.is_allowed(&url) => Ok(url),
            Some(_) => Err(Error::validation("redirect_url", "is not an allowed destination")),
        }
    }
}

#[derive(Clone)]
pub struct LoginService {
    coordinator: OAuthCoordinator,
    provider: Arc<dyn IdentityProvider>,
    users: Arc<dyn UserRepository>,
    sessions: SessionService,
    credentials: Arc<dyn CredentialRepository>,
    tokens: SessionTokens,
    policy: RedirectPolicy,
}

impl LoginService {
    pub fn new(
        coordinator: OAuthCoordinator,
        provider: Arc<dyn IdentityProvider>,
        users: Arc<dyn UserRepository>,
        sessions: SessionService,
        credentials: Arc<dyn CredentialRepository>,
        tokens: SessionTokens,
        policy: RedirectPolicy,
    ) -> Self {
        Self {
            coordinator,
            provider,
            users,
            sessions,
            credentials,
            tokens,
            policy,
        }
    }

    /// Safe fallback for every failed login
    pub fn failure_url(&self) -> &str {
        &self.policy.failure_url
    }

    /// Provider authorization URL for a new login attempt
    pub fn start(&self, client_state: Option<String>, redirect_url: Option<String>) -> Result<String> {
        let redirect_url = self.policy.resolve(redirect_url)?;
        self.coordinator.begin_login(redirect_url, client_state)
    }

    /// Handle the provider callback; returns where to send the browser
    pub async fn finish(&self, code: Option<&str>, state: &str) -> Result<String> {
        let completed = self
            .coordinator
            .complete_login(code, state)
            .await
            .inspect_err(|e| Self::record_failure(stage_of(e), e))?;

        let identity = self
            .provider
            .identity(&completed.tokens.access_token)
            .await
            .inspect_err(|e| Self::record_failure("identity", e))?;

        let destination = self
            .provision(&identity, completed)
            .await
            .inspect_err(|e| Self::record_failure("provision", e))?;

        METRICS.logins_completed_total.inc();
        Ok(destination)
    }

    async fn provision(&self, identity: &ProviderIdentity, completed: CompletedLogin) -> Result<String> {
        let user = self.find_or_create_user(identity).await?;
        let session = self.sessions.ensure_hosted(user.id).await?;
        let stored = self.store_tokens(user.id, session.id, &completed).await?;
        sync_user_credentials(self.credentials.as_ref(), &stored).await?;

        let token = self.tokens.issue(user.id)?;

        let mut destination = Url::parse(&completed.redirect_url)
            .map_err(|_| Error::validation("redirect_url", "is not a valid URL"))?;
        {
            let mut query = destination.query_pairs_mut();
            query.append_pair("token", &token);
            if let Some(client_state) = &completed.client_state {
                query.append_pair("client_state", client_state);
            }
        }

        info!("User {} logged in (session {})", user.id, session.slug);
        Ok(destination.into())
    }

    /// Match by provider id first, then by email, else create
    async fn find_or_create_user(&self, identity: &ProviderIdentity) -> Result<User> {
        match self.users.get_user_by_spotify_id(&identity.id).await {
            Ok(user) => return Ok(user),
            Err(Error::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        if let Some(email) = identity.email.as_deref().filter(|e| !e.is_empty()) {
            match self.users.get_user_by_email(email).await {
                Ok(mut user) => {
                    user.spotify_user_id = Some(identity.id.clone());
                    if user.display_name.is_none() {
                        user.display_name = identity.display_name.clone();
                    }
                    return self.users.update_user(user).await;
                }
                Err(Error::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let user = self
            .users
            .create_user(NewUser {
                spotify_user_id: Some(identity.id.clone()),
                email: identity.email.clone().filter(|e| !e.is_empty()),
                display_name: identity.display_name.clone(),
            })
            .await?;
        info!("Created user {} from provider identity", user.id);
        Ok(user)
    }

    async fn store_tokens(&self, user_id: Id, session_id: Id, completed: &CompletedLogin) -> Result<Credential> {
        let tokens = &completed.tokens;

        match self.credentials.get_credential_for(user_id, session_id).await? {
            Some(existing) => {
                let refresh_token = tokens
                    .refresh_token
                    .clone()
                    .unwrap_or_else(|| existing.refresh_token.clone());
                self.credentials
                    .update_credential(Credential {
                        access_token: tokens.access_token.clone(),
                        refresh_token,
                        expires_at: tokens.expires_at,
                        ..existing
                    })
                    .await
            }
            None => {
                let refresh_token = tokens
                    .refresh_token
                    .clone()
                    .ok_or_else(|| Error::Provider("no refresh token issued".to_string()))?;
                self.credentials
                    .create_credential(NewCredential {
                        user_id,
                        session_id,
                        access_token: tokens.access_token.clone(),
                        refresh_token,
                        expires_at: tokens.expires_at,
                    })
                    .await
            }
        }
    }

    fn record_failure(stage: &'static str, error: &Error) {
        METRICS
            .login_failures_total
            .with_label_values(&[stage])
            .inc();
        warn!("Login failed at {}: {}", stage, error);
    }
}

/// `/app` covers `/app` and `/app/...` but not `/application`
fn path_within(base: &str, path: &str) -> bool {
    if base.ends_with('/') {
        return path.starts_with(base);
    }
    path == base
        || path
            .strip_prefix(base)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn stage_of(error: &Error) -> &'static str {
    match error {
        Error::BadState | Error::InvalidState => "state",
        _ => "exchange",
    }
}
