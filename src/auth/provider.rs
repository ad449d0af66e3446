/// Identity provider client (authorization-code flow with PKCE)
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oauth2::{
    basic::{BasicClient, BasicTokenResponse},
    reqwest::async_http_client,
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::Deserialize;
use tracing::debug;

use crate::config::OAuthConfig;
use crate::error::{Error, Result};

/// Used when the token endpoint omits `expires_in`
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Tokens returned by a code exchange or a refresh
#[derive(Clone, PartialEq)]
pub struct ProviderTokens {
    pub access_token: String,
    /// Absent when a refresh does not rotate the refresh token
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for ProviderTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderTokens")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Account profile from the provider's userinfo endpoint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderIdentity {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Where to send the browser, plus the PKCE verifier to keep for the callback
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub pkce_verifier: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Build the provider authorization URL carrying `state`
    fn authorization_request(&self, state: &str) -> AuthorizationRequest;

    async fn exchange_code(&self, code: &str, pkce_verifier: Option<String>) -> Result<ProviderTokens>;

    async fn refresh(&self, refresh_token: &str) -> Result<ProviderTokens>;

    async fn identity(&self, access_token: &str) -> Result<ProviderIdentity>;
}

/// OAuth2 provider backed by the `oauth2` client and a userinfo GET
pub struct OAuthProvider {
    client: BasicClient,
    scopes: Vec<String>,
    userinfo_url: String,
    http: reqwest::Client,
}

impl OAuthProvider {
    pub fn new(config: &OAuthConfig) -> anyhow::Result<Self> {
        let client = BasicClient::new(
            ClientId::new(config.client_id.clone()),
            Some(ClientSecret::new(config.client_secret.clone())),
            AuthUrl::new(config.auth_url.clone())?,
            Some(TokenUrl::new(config.token_url.clone())?),
        )
        .set_redirect_uri(RedirectUrl::new(config.redirect_url.clone())?)
        .set_auth_type(AuthType::RequestBody);

        Ok(Self {
            client,
            scopes: config.scopes.clone(),
            userinfo_url: config.userinfo_url.clone(),
            http: reqwest::Client::new(),
        })
    }

    fn into_tokens(token: &BasicTokenResponse) -> ProviderTokens {
        let lifetime = token
            .expires_in()
            .and_then(|d| Duration::from_std(d).ok())
            .unwrap_or_else(|| Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS));

        ProviderTokens {
            access_token: token.access_token().secret().clone(),
            refresh_token: token.refresh_token().map(|r| r.secret().clone()),
            expires_at: Utc::now() + lifetime,
        }
    }
}

#[async_trait]
impl IdentityProvider for OAuthProvider {
    fn authorization_request(&self, state: &str) -> AuthorizationRequest {
        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        let state = state.to_string();

        let (url, _) = self
            .client
            .authorize_url(move || CsrfToken::new(state))
            .add_scopes(self.scopes.iter().cloned().map(Scope::new))
            .set_pkce_challenge(challenge)
            .url();

        AuthorizationRequest {
            url: url.to_string(),
            pkce_verifier: Some(verifier.secret().clone()),
        }
    }

    async fn exchange_code(&self, code: &str, pkce_verifier: Option<String>) -> Result<ProviderTokens> {
        let mut request = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()));
        if let Some(verifier) = pkce_verifier {
            request = request.set_pkce_verifier(PkceCodeVerifier::new(verifier));
        }

        let token = request
            .request_async(async_http_client)
            .await
            .map_err(|e| Error::Provider(format!("code exchange failed: {}", e)))?;

        debug!("Authorization code exchanged");
        Ok(Self::into_tokens(&token))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<ProviderTokens> {
        let token = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| Error::Provider(format!("token refresh failed: {}", e)))?;

        Ok(Self::into_tokens(&token))
    }

    async fn identity(&self, access_token: &str) -> Result<ProviderIdentity> {
        let res = self
            .http
            .get(&self.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("userinfo request failed: {}", e)))?;

        if !res.status().is_success() {
            let status = res.status();
            let error_text = res.text().await.unwrap_or_default();
            return Err(Error::Provider(format!(
                "userinfo returned {}: {}",
                status, error_text
            )));
        }

        res.json()
            .await
            .map_err(|e| Error::Provider(format!("userinfo response invalid: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: &str) -> OAuthConfig {
        OAuthConfig {
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            redirect_url: "http://localhost:8080/auth/callback".to_string(),
            auth_url: format!("{}/authorize", base),
            token_url: format!("{}/api/token", base),
            userinfo_url: format!("{}/v1/me", base),
            scopes: vec!["user-read-email".to_string()],
            ..OAuthConfig::default()
        }
    }

    #[test]
    fn test_authorization_request_carries_state_and_pkce() {
        let provider = OAuthProvider::new(&config("https://accounts.example.com")).unwrap();
        let request = provider.authorization_request("opaque-state");

        let url = url::Url::parse(&request.url).unwrap();
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params.get("state").map(String::as_str), Some("opaque-state"));
        assert_eq!(params.get("client_id").map(String::as_str), Some("client-id"));
        assert_eq!(params.get("code_challenge_method").map(String::as_str), Some("S256"));
        assert_eq!(params.get("scope").map(String::as_str), Some("user-read-email"));
        assert!(request.pkce_verifier.is_some());
    }

    #[tokio::test]
    async fn test_exchange_code_against_token_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::Regex("grant_type=authorization_code".to_string()),
                mockito::Matcher::Regex("code=the-code".to_string()),
                mockito::Matcher::Regex("code_verifier=the-verifier".to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"access_token":"at","token_type":"Bearer","expires_in":3600,"refresh_token":"rt"}"#,
            )
            .create_async()
            .await;

        let provider = OAuthProvider::new(&config(&server.url())).unwrap();
        let tokens = provider
            .exchange_code("the-code", Some("the-verifier".to_string()))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(tokens.access_token, "at");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt"));
        assert!(tokens.expires_at > Utc::now() + Duration::seconds(3500));
    }

    #[tokio::test]
    async fn test_exchange_code_provider_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/token")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let provider = OAuthProvider::new(&config(&server.url())).unwrap();
        let err = provider.exchange_code("stale", None).await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }

    #[tokio::test]
    async fn test_identity_from_userinfo() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/me")
            .match_header("authorization", "Bearer at")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"spotify123","email":"user@example.com","display_name":"User","country":"SE"}"#)
            .create_async()
            .await;

        let provider = OAuthProvider::new(&config(&server.url())).unwrap();
        let identity = provider.identity("at").await.unwrap();
        assert_eq!(identity.id, "spotify123");
        assert_eq!(identity.email.as_deref(), Some("user@example.com"));
    }
}
