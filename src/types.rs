use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Primary key of every persisted entity. Zero is never issued.
pub type Id = u64;

/// An identity linked to a provider account and/or an email
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Id,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spotify_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub spotify_user_id: Option<String>,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

/// A hosted queue instance, addressed publicly by its slug
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Id,
    pub slug: String,
    pub host_id: Id,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub slug: String,
    pub host_id: Id,
}

/// One track enqueued into a session.
///
/// `weight` is the net score of the item's votes. It is owned by the vote
/// layer: updates to a queue item never change it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Id,
    pub track_uri: String,
    pub session_id: Id,
    pub user_id: Id,
    pub weight: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub track_uri: String,
    pub session_id: Id,
    pub user_id: Id,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteType {
    Up,
    Down,
}

impl VoteType {
    /// Contribution of one vote of this type to an item's weight
    pub fn delta(self) -> i64 {
        match self {
            VoteType::Up => 1,
            VoteType::Down => -1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VoteType::Up => "up",
            VoteType::Down => "down",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub id: Id,
    pub user_id: Id,
    pub queue_item_id: Id,
    pub vote_type: VoteType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewVote {
    pub user_id: Id,
    pub queue_item_id: Id,
    pub vote_type: VoteType,
}

/// Provider access/refresh token pair for one (user, session).
///
/// Inside the store both tokens are ciphertext; everywhere else they are
/// plaintext.
#[derive(Clone, PartialEq)]
pub struct Credential {
    pub id: Id,
    pub user_id: Id,
    pub session_id: Id,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// True when the access token expires within `buffer_secs`
    pub fn expires_within(&self, buffer_secs: i64) -> bool {
        self.expires_at.timestamp() - buffer_secs < Utc::now().timestamp()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Clone)]
pub struct NewCredential {
    pub user_id: Id,
    pub session_id: Id,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for NewCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewCredential")
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_type_delta() {
        assert_eq!(VoteType::Up.delta(), 1);
        assert_eq!(VoteType::Down.delta(), -1);
    }

    #[test]
    fn test_vote_type_serialization() {
        assert_eq!(serde_json::to_string(&VoteType::Up).unwrap(), r#""up""#);
        assert_eq!(serde_json::to_string(&VoteType::Down).unwrap(), r#""down""#);
        let parsed: VoteType = serde_json::from_str(r#""down""#).unwrap();
        assert_eq!(parsed, VoteType::Down);
    }

    #[test]
    fn test_credential_debug_redacts_tokens() {
        let now = Utc::now();
        let credential = Credential {
            id: 1,
            user_id: 2,
            session_id: 3,
            access_token: "plain-access".to_string(),
            refresh_token: "plain-refresh".to_string(),
            expires_at: now,
            created_at: now,
            updated_at: now,
        };

        let rendered = format!("{:?}", credential);
        assert!(!rendered.contains("plain-access"));
        assert!(!rendered.contains("plain-refresh"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_credential_expires_within() {
        let now = Utc::now();
        let mut credential = Credential {
            id: 1,
            user_id: 1,
            session_id: 1,
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires_at: now + chrono::Duration::seconds(120),
            created_at: now,
            updated_at: now,
        };

        assert!(credential.expires_within(300));
        credential.expires_at = now + chrono::Duration::seconds(3600);
        assert!(!credential.expires_within(300));
    }
}
