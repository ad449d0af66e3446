use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, time::Duration};

use crate::crypto::SECRET_LEN;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_bind")]
    pub bind: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Interval of the background sweep over pending login states
    #[serde(default = "default_state_sweep_secs")]
    pub state_sweep_secs: u64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Credential encryption key, exactly 32 bytes
    #[serde(default)]
    pub encryption_secret: String,
    /// HMAC key for session tokens
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default = "default_jwt_lifespan")]
    pub jwt_lifespan_minutes: i64,
    #[serde(default = "default_jwt_issuer")]
    pub jwt_issuer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Provider callback, pointing at `/auth/callback`
    #[serde(default)]
    pub redirect_url: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_userinfo_url")]
    pub userinfo_url: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Where a login lands when the caller names no destination
    #[serde(default)]
    pub success_url: String,
    /// Safe fallback for every failed login
    #[serde(default)]
    pub failure_url: String,
    /// URL prefixes a caller-requested destination must match
    #[serde(default)]
    pub allowed_redirects: Vec<String>,
    #[serde(default = "default_state_ttl")]
    pub state_ttl_secs: u64,
    #[serde(default = "default_max_pending_states")]
    pub max_pending_states: usize,
    #[serde(default = "default_refresh_buffer")]
    pub refresh_buffer_secs: i64,
}

// Defaults
fn default_http_bind() -> String { "0.0.0.0:8080".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_state_sweep_secs() -> u64 { 60 }
fn default_jwt_lifespan() -> i64 { 60 }
fn default_jwt_issuer() -> String { "orbit".to_string() }
fn default_auth_url() -> String { "https://accounts.spotify.com/authorize".to_string() }
fn default_token_url() -> String { "https://accounts.spotify.com/api/token".to_string() }
fn default_userinfo_url() -> String { "https://api.spotify.com/v1/me".to_string() }
fn default_scopes() -> Vec<String> {
    vec![
        "user-read-email".to_string(),
        "user-read-private".to_string(),
        "user-read-playback-state".to_string(),
        "user-modify-playback-state".to_string(),
    ]
}
fn default_state_ttl() -> u64 { 600 }
fn default_max_pending_states() -> usize { 10_000 }
fn default_refresh_buffer() -> i64 { 300 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
            log_level: default_log_level(),
            state_sweep_secs: default_state_sweep_secs(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            encryption_secret: String::new(),
            jwt_secret: String::new(),
            jwt_lifespan_minutes: default_jwt_lifespan(),
            jwt_issuer: default_jwt_issuer(),
        }
    }
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("jwt_lifespan_minutes", &self.jwt_lifespan_minutes)
            .field("jwt_issuer", &self.jwt_issuer)
            .finish_non_exhaustive()
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_url: String::new(),
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            userinfo_url: default_userinfo_url(),
            scopes: default_scopes(),
            success_url: String::new(),
            failure_url: String::new(),
            allowed_redirects: vec![],
            state_ttl_secs: default_state_ttl(),
            max_pending_states: default_max_pending_states(),
            refresh_buffer_secs: default_refresh_buffer(),
        }
    }
}

impl OAuthConfig {
    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        // Try to find config file
        let config_path = env::var("ORBIT_CONFIG").unwrap_or_else(|_| {
            // Check common locations
            let home_config = format!(
                "{}/.config/orbit/config.toml",
                env::var("HOME").unwrap_or_default()
            );
            let locations = vec![
                "./config.toml",
                "./orbit.toml",
                "/etc/orbit/config.toml",
                home_config.as_str(),
            ];

            for path in locations {
                if Path::new(path).exists() {
                    return path.to_string();
                }
            }

            // Default
            "./config.toml".to_string()
        });

        // Validate config file permissions on Unix systems
        #[cfg(unix)]
        Self::validate_file_permissions(&config_path)?;

        let config_content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;

        Self::from_toml_str(&config_content)
            .with_context(|| format!("Invalid config file: {}", config_path))
    }

    /// Parse and validate an in-memory TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        // Substitute environment variables
        let content = Self::substitute_env_vars(content);

        let config: Config = toml::from_str(&content).context("Failed to parse config")?;
        config.validate()?;

        Ok(config)
    }

    /// Substitute ${VAR_NAME} with environment variable values.
    ///
    /// Substituted values are copied through as-is, never scanned again.
    fn substitute_env_vars(content: &str) -> String {
        let mut result = String::with_capacity(content.len());
        let mut rest = content;

        while let Some(start) = rest.find("${") {
            let Some(len) = rest[start..].find('}') else {
                break;
            };
            result.push_str(&rest[..start]);
            let var_name = &rest[start + 2..start + len];
            result.push_str(&env::var(var_name).unwrap_or_default());
            rest = &rest[start + len + 1..];
        }

        result.push_str(rest);
        result
    }

    /// Reject any missing or malformed value before the server starts
    pub fn validate(&self) -> Result<()> {
        let secret_len = self.security.encryption_secret.len();
        if secret_len != SECRET_LEN {
            anyhow::bail!(
                "security.encryption_secret must be exactly {} bytes (got {}). Generate one with `orbit secret`",
                SECRET_LEN,
                secret_len
            );
        }
        if self.security.jwt_secret.is_empty() {
            anyhow::bail!("security.jwt_secret is required");
        }
        if self.security.jwt_lifespan_minutes <= 0 {
            anyhow::bail!("security.jwt_lifespan_minutes must be positive");
        }

        let oauth = &self.oauth;
        for (name, value) in [
            ("oauth.client_id", &oauth.client_id),
            ("oauth.client_secret", &oauth.client_secret),
        ] {
            if value.is_empty() {
                anyhow::bail!("{} is required", name);
            }
        }

        for (name, value) in [
            ("oauth.redirect_url", &oauth.redirect_url),
            ("oauth.auth_url", &oauth.auth_url),
            ("oauth.token_url", &oauth.token_url),
            ("oauth.userinfo_url", &oauth.userinfo_url),
            ("oauth.success_url", &oauth.success_url),
            ("oauth.failure_url", &oauth.failure_url),
        ] {
            url::Url::parse(value).with_context(|| format!("{} is not a valid URL: {:?}", name, value))?;
        }
        for value in &oauth.allowed_redirects {
            url::Url::parse(value)
                .with_context(|| format!("oauth.allowed_redirects entry is not a valid URL: {:?}", value))?;
        }

        if oauth.state_ttl_secs == 0 {
            anyhow::bail!("oauth.state_ttl_secs must be positive");
        }
        if oauth.max_pending_states == 0 {
            anyhow::bail!("oauth.max_pending_states must be positive");
        }
        if self.server.state_sweep_secs == 0 {
            anyhow::bail!("server.state_sweep_secs must be positive");
        }

        if oauth.allowed_redirects.is_empty() {
            tracing::debug!("No allowed_redirects configured; logins can only land on success_url");
        }

        Ok(())
    }

    /// Validate config file permissions (Unix only)
    #[cfg(unix)]
    fn validate_file_permissions(path: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let path_obj = Path::new(path);

        // Skip validation if file doesn't exist yet (first run)
        if !path_obj.exists() {
            tracing::debug!("Config file does not exist yet: {}", path);
            return Ok(());
        }

        let metadata = fs::metadata(path_obj)
            .with_context(|| format!("Failed to read metadata for config file: {}", path))?;

        let mode = metadata.permissions().mode();

        // Check if file is readable by group or others (we want 0600 or 0400)
        let group_readable = (mode & 0o040) != 0;
        let others_readable = (mode & 0o004) != 0;
        let group_writable = (mode & 0o020) != 0;
        let others_writable = (mode & 0o002) != 0;

        if group_readable || others_readable {
            tracing::warn!(
                "Config file {} has insecure permissions: {:o}",
                path,
                mode & 0o777
            );
            tracing::warn!(
                "This file holds the encryption and OAuth client secrets. Recommended: chmod 600 {}",
                path
            );
        }

        if group_writable || others_writable {
            anyhow::bail!(
                "Config file {} is writable by group or others (mode: {:o}). \
                This is a security risk. Run: chmod 600 {}",
                path,
                mode & 0o777,
                path
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
[server]
bind = "127.0.0.1:9000"

[security]
encryption_secret = "abcdefghijklmnopqrstuvwxyz123456"
jwt_secret = "jwt-secret"

[oauth]
client_id = "client-id"
client_secret = "client-secret"
redirect_url = "http://localhost:9000/auth/callback"
success_url = "http://localhost:3000/"
failure_url = "http://localhost:3000/login-failed"
allowed_redirects = ["http://localhost:3000/"]
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("ORBIT_TEST_VAR", "test_value");

        let input = "client_secret = \"${ORBIT_TEST_VAR}\"";
        let output = Config::substitute_env_vars(input);

        assert_eq!(output, "client_secret = \"test_value\"");

        env::remove_var("ORBIT_TEST_VAR");
    }

    #[test]
    fn test_env_var_substitution_multiple() {
        env::set_var("ORBIT_VAR1", "value1");
        env::set_var("ORBIT_VAR2", "value2");

        let input = "key1 = \"${ORBIT_VAR1}\"\nkey2 = \"${ORBIT_VAR2}\"";
        let output = Config::substitute_env_vars(input);

        assert!(output.contains("value1"));
        assert!(output.contains("value2"));

        env::remove_var("ORBIT_VAR1");
        env::remove_var("ORBIT_VAR2");
    }

    #[test]
    fn test_env_var_values_are_not_rescanned() {
        env::set_var("ORBIT_SELF_REF", "${ORBIT_SELF_REF}");
        env::set_var("ORBIT_LITERAL", "pa${ss");

        let input = "a = \"${ORBIT_SELF_REF}\"\nb = \"${ORBIT_LITERAL}\"\nc = \"${unterminated\"";
        let output = Config::substitute_env_vars(input);

        assert_eq!(
            output,
            "a = \"${ORBIT_SELF_REF}\"\nb = \"pa${ss\"\nc = \"${unterminated\""
        );

        env::remove_var("ORBIT_SELF_REF");
        env::remove_var("ORBIT_LITERAL");
    }

    #[test]
    fn test_rejects_malformed_allowed_redirect() {
        let doc = VALID.replace("allowed_redirects = [\"http://localhost:3000/\"]", "allowed_redirects = [\"not a url\"]");
        let err = Config::from_toml_str(&doc).unwrap_err();
        assert!(format!("{:#}", err).contains("oauth.allowed_redirects"));
    }

    #[test]
    fn test_valid_config_with_defaults() {
        let config = Config::from_toml_str(VALID).unwrap();

        assert_eq!(config.server.bind, "127.0.0.1:9000");
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.security.jwt_issuer, "orbit");
        assert_eq!(config.security.jwt_lifespan_minutes, 60);
        assert_eq!(config.oauth.token_url, "https://accounts.spotify.com/api/token");
        assert_eq!(config.oauth.state_ttl(), Duration::from_secs(600));
        assert_eq!(config.oauth.max_pending_states, 10_000);
        assert_eq!(config.oauth.refresh_buffer_secs, 300);
    }

    #[test]
    fn test_rejects_short_encryption_secret() {
        let doc = VALID.replace("abcdefghijklmnopqrstuvwxyz123456", "tooshort");
        let err = Config::from_toml_str(&doc).unwrap_err();
        assert!(format!("{:#}", err).contains("32 bytes"));
    }

    #[test]
    fn test_rejects_missing_client_id() {
        let doc = VALID.replace("client_id = \"client-id\"", "");
        let err = Config::from_toml_str(&doc).unwrap_err();
        assert!(format!("{:#}", err).contains("oauth.client_id"));
    }

    #[test]
    fn test_rejects_malformed_url() {
        let doc = VALID.replace("http://localhost:3000/login-failed", "not a url");
        let err = Config::from_toml_str(&doc).unwrap_err();
        assert!(format!("{:#}", err).contains("oauth.failure_url"));
    }

    #[test]
    fn test_security_debug_hides_secrets() {
        let config = Config::from_toml_str(VALID).unwrap();
        let rendered = format!("{:?}", config.security);
        assert!(!rendered.contains("jwt-secret"));
        assert!(!rendered.contains("abcdefghijklmnopqrstuvwxyz123456"));
    }
}
