/// Session lifecycle: hosting, membership and teardown
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::{CredentialRepository, SessionRepository};
use crate::types::{Id, NewCredential, NewSession, Session, User};

const SLUG_LEN: usize = 8;
const SLUG_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SLUG_ATTEMPTS: usize = 5;

/// Short public handle for a session
pub fn generate_slug() -> String {
    let mut rng = rand::thread_rng();
    (0..SLUG_LEN)
        .map(|_| SLUG_CHARSET[rng.gen_range(0..SLUG_CHARSET.len())] as char)
        .collect()
}

/// A session together with its joined members
#[derive(Debug, Clone, Serialize)]
pub struct SessionDetails {
    #[serde(flatten)]
    pub session: Session,
    pub members: Vec<User>,
}

#[derive(Clone)]
pub struct SessionService {
    sessions: Arc<dyn SessionRepository>,
    credentials: Arc<dyn CredentialRepository>,
}

impl SessionService {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        credentials: Arc<dyn CredentialRepository>,
    ) -> Self {
        Self {
            sessions,
            credentials,
        }
    }

    /// Start a new session hosted by `host_id` under a fresh slug
    pub async fn create(&self, host_id: Id) -> Result<Session> {
        for _ in 0..SLUG_ATTEMPTS {
            let slug = generate_slug();
            match self
                .sessions
                .create_session(NewSession {
                    slug: slug.clone(),
                    host_id,
                })
                .await
            {
                Ok(session) => {
                    info!("Session {} created by user {}", session.slug, host_id);
                    if let Err(e) = self.inherit_credential(&session).await {
                        warn!(
                            "Session {} has no provider credential yet: {}",
                            session.slug, e
                        );
                    }
                    return Ok(session);
                }
                Err(Error::Conflict { .. }) => {
                    warn!("Slug collision on {}, retrying", slug);
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Store("could not allocate a unique session slug".to_string()))
    }

    /// Copy the host's latest provider tokens onto a session they just opened.
    /// Nothing to copy before the host's first completed login.
    async fn inherit_credential(&self, session: &Session) -> Result<()> {
        let latest = self
            .credentials
            .get_credentials_by_user(session.host_id)
            .await?
            .into_iter()
            .max_by_key(|c| c.updated_at);

        if let Some(source) = latest {
            self.credentials
                .create_credential(NewCredential {
                    user_id: session.host_id,
                    session_id: session.id,
                    access_token: source.access_token,
                    refresh_token: source.refresh_token,
                    expires_at: source.expires_at,
                })
                .await?;
            debug!("Session {} inherited the host's provider credential", session.slug);
        }
        Ok(())
    }

    /// The first session `host_id` hosts, creating one if there is none
    pub async fn ensure_hosted(&self, host_id: Id) -> Result<Session> {
        match self.sessions.sessions_hosted_by(host_id).await?.into_iter().next() {
            Some(session) => Ok(session),
            None => self.create(host_id).await,
        }
    }

    pub async fn get(&self, slug: &str) -> Result<Session> {
        self.sessions.get_session_by_slug(slug).await
    }

    pub async fn details(&self, slug: &str) -> Result<SessionDetails> {
        let session = self.sessions.get_session_by_slug(slug).await?;
        let members = self.sessions.members(session.id).await?;
        Ok(SessionDetails { session, members })
    }

    pub async fn join(&self, slug: &str, user_id: Id) -> Result<Session> {
        let session = self.sessions.get_session_by_slug(slug).await?;
        if session.host_id != user_id {
            self.sessions.add_member(session.id, user_id).await?;
        }
        Ok(session)
    }

    pub async fn leave(&self, slug: &str, user_id: Id) -> Result<()> {
        let session = self.sessions.get_session_by_slug(slug).await?;
        if session.host_id == user_id {
            return Err(Error::Forbidden("the host cannot leave their own session"));
        }
        self.sessions.remove_member(session.id, user_id).await
    }

    /// Host-only. Revokes stored credentials, then deletes the session and
    /// everything that hangs off it.
    pub async fn teardown(&self, slug: &str, user_id: Id) -> Result<()> {
        let session = self.sessions.get_session_by_slug(slug).await?;
        if session.host_id != user_id {
            return Err(Error::Forbidden("only the host can end a session"));
        }

        let revoked = self.credentials.delete_credentials_by_session(session.id).await?;
        self.sessions.delete_session(session.id).await?;

        info!(
            "Session {} torn down by host ({} credentials revoked)",
            session.slug, revoked
        );
        Ok(())
    }
}
