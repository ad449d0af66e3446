/// Two legs of the authorization-code flow, correlated by a single-use state
use std::sync::Arc;
use tracing::{debug, warn};

use super::provider::{IdentityProvider, ProviderTokens};
use super::state::{generate_nonce, PendingLogin, StateData, StateStore, NONCE_LEN};
use crate::error::{Error, Result};
use crate::metrics::METRICS;

/// Outcome of a validated callback
#[derive(Debug, Clone)]
pub struct CompletedLogin {
    pub tokens: ProviderTokens,
    pub redirect_url: String,
    pub client_state: Option<String>,
}

#[derive(Clone)]
pub struct OAuthCoordinator {
    provider: Arc<dyn IdentityProvider>,
    states: Arc<StateStore>,
}

impl OAuthCoordinator {
    pub fn new(provider: Arc<dyn IdentityProvider>, states: Arc<StateStore>) -> Self {
        Self { provider, states }
    }

    pub fn states(&self) -> &Arc<StateStore> {
        &self.states
    }

    /// Issue a nonce bound to `redirect_url` and return the provider URL to
    /// send the browser to
    pub fn begin_login(&self, redirect_url: String, client_state: Option<String>) -> Result<String> {
        let nonce = generate_nonce(NONCE_LEN)?;

        let state = StateData {
            state: nonce.clone(),
            redirect_url: redirect_url.clone(),
            client_state: client_state.clone(),
        }
        .encode()?;

        let request = self.provider.authorization_request(&state);
        self.states.insert(
            nonce,
            PendingLogin::new(redirect_url, client_state, request.pkce_verifier),
        );

        METRICS.logins_started_total.inc();
        debug!("Login started, {} pending", self.states.len());
        Ok(request.url)
    }

    /// Validate the callback's state, consume it, and exchange the code.
    ///
    /// The state is consumed even when `code` is missing, so a denied
    /// authorization cannot be replayed.
    pub async fn complete_login(&self, code: Option<&str>, state: &str) -> Result<CompletedLogin> {
        let data = StateData::decode(state).inspect_err(|_| {
            warn!("Callback carried a malformed state");
        })?;

        let pending = self.states.consume(&data).inspect_err(|_| {
            warn!("Callback state rejected");
        })?;

        let code = code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::validation("code", "is required"))?;

        let tokens = self.provider.exchange_code(code, pending.pkce_verifier).await?;

        Ok(CompletedLogin {
            tokens,
            redirect_url: pending.redirect_url,
            client_state: pending.client_state,
        })
    }
}
