// Repository interfaces over the relational store

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    Credential, Id, NewCredential, NewQueueItem, NewSession, NewUser, NewVote, QueueItem,
    Session, User, Vote,
};

/// Which slice of the queue to list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueFilter {
    Session(Id),
    User(Id),
    SessionUser { session_id: Id, user_id: Id },
}

impl QueueFilter {
    pub fn new(session_id: Option<Id>, user_id: Option<Id>) -> Option<Self> {
        match (session_id, user_id) {
            (Some(session_id), Some(user_id)) => Some(Self::SessionUser { session_id, user_id }),
            (Some(session_id), None) => Some(Self::Session(session_id)),
            (None, Some(user_id)) => Some(Self::User(user_id)),
            (None, None) => None,
        }
    }

    pub fn matches(&self, item: &QueueItem) -> bool {
        match *self {
            QueueFilter::Session(session_id) => item.session_id == session_id,
            QueueFilter::User(user_id) => item.user_id == user_id,
            QueueFilter::SessionUser { session_id, user_id } => {
                item.session_id == session_id && item.user_id == user_id
            }
        }
    }
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create_user(&self, new_user: NewUser) -> Result<User>;
    async fn get_user(&self, id: Id) -> Result<User>;
    async fn get_user_by_spotify_id(&self, spotify_user_id: &str) -> Result<User>;
    async fn get_user_by_email(&self, email: &str) -> Result<User>;
    /// Sessions the user hosts or has joined
    async fn get_user_sessions(&self, user_id: Id) -> Result<Vec<Session>>;
    async fn update_user(&self, user: User) -> Result<User>;
    async fn delete_user(&self, id: Id) -> Result<()>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create_session(&self, new_session: NewSession) -> Result<Session>;
    async fn get_session(&self, id: Id) -> Result<Session>;
    async fn get_session_by_slug(&self, slug: &str) -> Result<Session>;
    async fn list_sessions(&self) -> Result<Vec<Session>>;
    async fn sessions_hosted_by(&self, host_id: Id) -> Result<Vec<Session>>;
    async fn update_session(&self, session: Session) -> Result<Session>;
    async fn delete_session(&self, id: Id) -> Result<()>;

    async fn add_member(&self, session_id: Id, user_id: Id) -> Result<()>;
    async fn remove_member(&self, session_id: Id, user_id: Id) -> Result<()>;
    async fn members(&self, session_id: Id) -> Result<Vec<User>>;
    async fn is_member(&self, session_id: Id, user_id: Id) -> Result<bool>;
}

#[async_trait]
pub trait QueueRepository: Send + Sync {
    async fn create_queue_item(&self, new_item: NewQueueItem) -> Result<QueueItem>;
    async fn get_queue_item(&self, id: Id) -> Result<QueueItem>;
    /// Matching items in insertion order
    async fn list_queue_items(&self, filter: QueueFilter) -> Result<Vec<QueueItem>>;
    /// Persists the item's track reference. The stored weight is kept.
    async fn update_queue_item(&self, item: QueueItem) -> Result<QueueItem>;
    async fn delete_queue_item(&self, id: Id) -> Result<()>;
}

/// Every mutation here adjusts the target item's weight in the same
/// transaction as the vote row.
#[async_trait]
pub trait VoteRepository: Send + Sync {
    async fn create_vote(&self, new_vote: NewVote) -> Result<Vote>;
    async fn get_vote(&self, id: Id) -> Result<Vote>;
    async fn get_vote_by_user(&self, queue_item_id: Id, user_id: Id) -> Result<Option<Vote>>;
    async fn votes_for_item(&self, queue_item_id: Id) -> Result<Vec<Vote>>;
    async fn update_vote(&self, vote: Vote) -> Result<Vote>;
    async fn delete_vote(&self, id: Id) -> Result<()>;
}

#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn create_credential(&self, new_credential: NewCredential) -> Result<Credential>;
    async fn get_credential(&self, id: Id) -> Result<Credential>;
    async fn get_credentials_by_user(&self, user_id: Id) -> Result<Vec<Credential>>;
    async fn get_credentials_by_session(&self, session_id: Id) -> Result<Vec<Credential>>;
    async fn get_credential_for(&self, user_id: Id, session_id: Id) -> Result<Option<Credential>>;
    async fn update_credential(&self, credential: Credential) -> Result<Credential>;
    async fn delete_credential(&self, id: Id) -> Result<()>;
    async fn delete_credentials_by_session(&self, session_id: Id) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_filter_from_options() {
        assert_eq!(QueueFilter::new(Some(1), None), Some(QueueFilter::Session(1)));
        assert_eq!(QueueFilter::new(None, Some(2)), Some(QueueFilter::User(2)));
        assert_eq!(
            QueueFilter::new(Some(1), Some(2)),
            Some(QueueFilter::SessionUser { session_id: 1, user_id: 2 })
        );
        assert_eq!(QueueFilter::new(None, None), None);
    }
}
