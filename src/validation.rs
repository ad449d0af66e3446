/// Required-field checks run before any entity reaches the store
use crate::error::{Error, Result};
use crate::types::{NewCredential, NewQueueItem, NewSession, NewUser, NewVote};

fn is_blank(value: Option<&str>) -> bool {
    value.map(str::is_empty).unwrap_or(true)
}

/// A user needs at least one verifiable identity: a provider id or an email
pub fn validate_user(spotify_user_id: Option<&str>, email: Option<&str>) -> Result<()> {
    if is_blank(spotify_user_id) && is_blank(email) {
        return Err(Error::validation(
            "identity",
            "requires a provider id or an email",
        ));
    }
    Ok(())
}

pub fn validate_new_user(user: &NewUser) -> Result<()> {
    validate_user(user.spotify_user_id.as_deref(), user.email.as_deref())
}

pub fn validate_session(slug: &str, host_id: u64) -> Result<()> {
    if slug.is_empty() {
        return Err(Error::validation("slug", "is required"));
    }
    if host_id == 0 {
        return Err(Error::validation("host_id", "is required"));
    }
    Ok(())
}

pub fn validate_new_session(session: &NewSession) -> Result<()> {
    validate_session(&session.slug, session.host_id)
}

pub fn validate_queue_item(track_uri: &str, session_id: u64, user_id: u64) -> Result<()> {
    if track_uri.is_empty() {
        return Err(Error::validation("track_uri", "is required"));
    }
    if session_id == 0 {
        return Err(Error::validation("session_id", "is required"));
    }
    if user_id == 0 {
        return Err(Error::validation("user_id", "is required"));
    }
    Ok(())
}

pub fn validate_new_queue_item(item: &NewQueueItem) -> Result<()> {
    validate_queue_item(&item.track_uri, item.session_id, item.user_id)
}

pub fn validate_new_vote(vote: &NewVote) -> Result<()> {
    if vote.user_id == 0 {
        return Err(Error::validation("user_id", "is required"));
    }
    if vote.queue_item_id == 0 {
        return Err(Error::validation("queue_item_id", "is required"));
    }
    Ok(())
}

pub fn validate_credential(
    user_id: u64,
    session_id: u64,
    access_token: &str,
    refresh_token: &str,
    expires_at: chrono::DateTime<chrono::Utc>,
) -> Result<()> {
    if user_id == 0 {
        return Err(Error::validation("user_id", "is required"));
    }
    if session_id == 0 {
        return Err(Error::validation("session_id", "is required"));
    }
    if access_token.is_empty() {
        return Err(Error::validation("access_token", "is required"));
    }
    if refresh_token.is_empty() {
        return Err(Error::validation("refresh_token", "is required"));
    }
    // Epoch stands in for an unset expiry
    if expires_at.timestamp() <= 0 {
        return Err(Error::validation("expires_at", "is required"));
    }
    Ok(())
}

pub fn validate_new_credential(credential: &NewCredential) -> Result<()> {
    validate_credential(
        credential.user_id,
        credential.session_id,
        &credential.access_token,
        &credential.refresh_token,
        credential.expires_at,
    )
}
