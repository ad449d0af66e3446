/// In-process transactional store.
///
/// All tables sit behind one lock, so each repository call is a single
/// transaction: a vote and its item's weight change together, and cascading
/// deletes never leave dangling rows.
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::{
    CredentialRepository, QueueFilter, QueueRepository, SessionRepository, UserRepository,
    VoteRepository,
};
use crate::error::{Error, Result};
use crate::queue::apply_vote_delta;
use crate::types::{
    Credential, Id, NewCredential, NewQueueItem, NewSession, NewUser, NewVote, QueueItem,
    Session, User, Vote,
};
use crate::validation;

/// Clones share the same tables.
///
/// ```
/// use orbit::store::{MemoryStore, UserRepository};
/// use orbit::types::NewUser;
///
/// # tokio_test::block_on(async {
/// let store = MemoryStore::new();
/// let user = store
///     .create_user(NewUser {
///         spotify_user_id: Some("spotify123".to_string()),
///         ..Default::default()
///     })
///     .await
///     .unwrap();
///
/// let shared = store.clone();
/// assert_eq!(shared.get_user(user.id).await.unwrap(), user);
/// # })
/// ```
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

#[derive(Default)]
struct Sequences {
    users: Id,
    sessions: Id,
    queue: Id,
    votes: Id,
    credentials: Id,
}

fn next(seq: &mut Id) -> Id {
    *seq += 1;
    *seq
}

#[derive(Default)]
struct Tables {
    seq: Sequences,
    users: BTreeMap<Id, User>,
    sessions: BTreeMap<Id, Session>,
    /// (session_id, user_id)
    members: BTreeSet<(Id, Id)>,
    queue: BTreeMap<Id, QueueItem>,
    votes: BTreeMap<Id, Vote>,
    credentials: BTreeMap<Id, Credential>,
}

impl Tables {
    fn user(&self, id: Id) -> Result<&User> {
        self.users.get(&id).ok_or_else(|| Error::not_found("user", id))
    }

    fn session(&self, id: Id) -> Result<&Session> {
        self.sessions.get(&id).ok_or_else(|| Error::not_found("session", id))
    }

    fn check_user_identity_free(&self, user: &NewUser, except: Option<Id>) -> Result<()> {
        let spotify_id = user.spotify_user_id.as_deref().filter(|v| !v.is_empty());
        let email = user.email.as_deref().filter(|v| !v.is_empty());

        for other in self.users.values().filter(|u| Some(u.id) != except) {
            if let Some(id) = spotify_id {
                if other.spotify_user_id.as_deref() == Some(id) {
                    return Err(Error::Conflict {
                        resource: "user",
                        field: "spotify_user_id",
                        value: id.to_string(),
                    });
                }
            }
            if let Some(email) = email {
                if other.email.as_deref() == Some(email) {
                    return Err(Error::Conflict {
                        resource: "user",
                        field: "email",
                        value: email.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn remove_vote(&mut self, id: Id) -> Option<Vote> {
        let vote = self.votes.remove(&id)?;
        if let Some(item) = self.queue.get_mut(&vote.queue_item_id) {
            apply_vote_delta(item, -vote.vote_type.delta());
        }
        Some(vote)
    }

    fn remove_queue_item(&mut self, id: Id) -> Option<QueueItem> {
        let item = self.queue.remove(&id)?;
        self.votes.retain(|_, vote| vote.queue_item_id != id);
        Some(item)
    }

    fn remove_session(&mut self, id: Id) -> Option<Session> {
        let session = self.sessions.remove(&id)?;

        let items: Vec<Id> = self
            .queue
            .values()
            .filter(|item| item.session_id == id)
            .map(|item| item.id)
            .collect();
        for item_id in items {
            self.remove_queue_item(item_id);
        }

        self.members.retain(|(session_id, _)| *session_id != id);
        self.credentials.retain(|_, c| c.session_id != id);
        Some(session)
    }

    fn remove_user(&mut self, id: Id) -> Option<User> {
        let user = self.users.remove(&id)?;

        let hosted: Vec<Id> = self
            .sessions
            .values()
            .filter(|s| s.host_id == id)
            .map(|s| s.id)
            .collect();
        for session_id in hosted {
            self.remove_session(session_id);
        }

        let votes: Vec<Id> = self
            .votes
            .values()
            .filter(|v| v.user_id == id)
            .map(|v| v.id)
            .collect();
        for vote_id in votes {
            self.remove_vote(vote_id);
        }

        let items: Vec<Id> = self
            .queue
            .values()
            .filter(|item| item.user_id == id)
            .map(|item| item.id)
            .collect();
        for item_id in items {
            self.remove_queue_item(item_id);
        }

        self.members.retain(|(_, user_id)| *user_id != id);
        self.credentials.retain(|_, c| c.user_id != id);
        Some(user)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn create_user(&self, new_user: NewUser) -> Result<User> {
        validation::validate_new_user(&new_user)?;

        let mut tables = self.tables.lock();
        tables.check_user_identity_free(&new_user, None)?;

        let now = Utc::now();
        let user = User {
            id: next(&mut tables.seq.users),
            spotify_user_id: new_user.spotify_user_id,
            email: new_user.email,
            display_name: new_user.display_name,
            created_at: now,
            updated_at: now,
        };
        tables.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: Id) -> Result<User> {
        self.tables.lock().user(id).cloned()
    }

    async fn get_user_by_spotify_id(&self, spotify_user_id: &str) -> Result<User> {
        self.tables
            .lock()
            .users
            .values()
            .find(|u| u.spotify_user_id.as_deref() == Some(spotify_user_id))
            .cloned()
            .ok_or_else(|| Error::not_found("user", spotify_user_id))
    }

    async fn get_user_by_email(&self, email: &str) -> Result<User> {
        self.tables
            .lock()
            .users
            .values()
            .find(|u| u.email.as_deref() == Some(email))
            .cloned()
            .ok_or_else(|| Error::not_found("user", email))
    }

    async fn get_user_sessions(&self, user_id: Id) -> Result<Vec<Session>> {
        let tables = self.tables.lock();
        tables.user(user_id)?;

        Ok(tables
            .sessions
            .values()
            .filter(|s| s.host_id == user_id || tables.members.contains(&(s.id, user_id)))
            .cloned()
            .collect())
    }

    async fn update_user(&self, user: User) -> Result<User> {
        validation::validate_user(user.spotify_user_id.as_deref(), user.email.as_deref())?;

        let mut tables = self.tables.lock();
        let created_at = tables.user(user.id)?.created_at;

        let identity = NewUser {
            spotify_user_id: user.spotify_user_id.clone(),
            email: user.email.clone(),
            display_name: None,
        };
        tables.check_user_identity_free(&identity, Some(user.id))?;

        let updated = User {
            created_at,
            updated_at: Utc::now(),
            ..user
        };
        tables.users.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn delete_user(&self, id: Id) -> Result<()> {
        self.tables
            .lock()
            .remove_user(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("user", id))
    }
}

#[async_trait]
impl SessionRepository for MemoryStore {
    async fn create_session(&self, new_session: NewSession) -> Result<Session> {
        validation::validate_new_session(&new_session)?;

        let mut tables = self.tables.lock();
        tables.user(new_session.host_id)?;

        if tables.sessions.values().any(|s| s.slug == new_session.slug) {
            return Err(Error::Conflict {
                resource: "session",
                field: "slug",
                value: new_session.slug,
            });
        }

        let now = Utc::now();
        let session = Session {
            id: next(&mut tables.seq.sessions),
            slug: new_session.slug,
            host_id: new_session.host_id,
            created_at: now,
            updated_at: now,
        };
        tables.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: Id) -> Result<Session> {
        self.tables.lock().session(id).cloned()
    }

    async fn get_session_by_slug(&self, slug: &str) -> Result<Session> {
        self.tables
            .lock()
            .sessions
            .values()
            .find(|s| s.slug == slug)
            .cloned()
            .ok_or_else(|| Error::not_found("session", slug))
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        Ok(self.tables.lock().sessions.values().cloned().collect())
    }

    async fn sessions_hosted_by(&self, host_id: Id) -> Result<Vec<Session>> {
        Ok(self
            .tables
            .lock()
            .sessions
            .values()
            .filter(|s| s.host_id == host_id)
            .cloned()
            .collect())
    }

    async fn update_session(&self, session: Session) -> Result<Session> {
        validation::validate_session(&session.slug, session.host_id)?;

        let mut tables = self.tables.lock();
        let created_at = tables.session(session.id)?.created_at;
        tables.user(session.host_id)?;

        if tables
            .sessions
            .values()
            .any(|s| s.slug == session.slug && s.id != session.id)
        {
            return Err(Error::Conflict {
                resource: "session",
                field: "slug",
                value: session.slug,
            });
        }

        let updated = Session {
            created_at,
            updated_at: Utc::now(),
            ..session
        };
        tables.sessions.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn delete_session(&self, id: Id) -> Result<()> {
        self.tables
            .lock()
            .remove_session(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("session", id))
    }

    async fn add_member(&self, session_id: Id, user_id: Id) -> Result<()> {
        let mut tables = self.tables.lock();
        tables.session(session_id)?;
        tables.user(user_id)?;
        tables.members.insert((session_id, user_id));
        Ok(())
    }

    async fn remove_member(&self, session_id: Id, user_id: Id) -> Result<()> {
        if self.tables.lock().members.remove(&(session_id, user_id)) {
            Ok(())
        } else {
            Err(Error::not_found("membership", format!("{}:{}", session_id, user_id)))
        }
    }

    async fn members(&self, session_id: Id) -> Result<Vec<User>> {
        let tables = self.tables.lock();
        tables.session(session_id)?;

        Ok(tables
            .members
            .range((session_id, Id::MIN)..=(session_id, Id::MAX))
            .filter_map(|(_, user_id)| tables.users.get(user_id).cloned())
            .collect())
    }

    async fn is_member(&self, session_id: Id, user_id: Id) -> Result<bool> {
        let tables = self.tables.lock();
        let session = tables.session(session_id)?;
        Ok(session.host_id == user_id || tables.members.contains(&(session_id, user_id)))
    }
}

#[async_trait]
impl QueueRepository for MemoryStore {
    async fn create_queue_item(&self, new_item: NewQueueItem) -> Result<QueueItem> {
        validation::validate_new_queue_item(&new_item)?;

        let mut tables = self.tables.lock();
        tables.session(new_item.session_id)?;
        tables.user(new_item.user_id)?;

        let now = Utc::now();
        let item = QueueItem {
            id: next(&mut tables.seq.queue),
            track_uri: new_item.track_uri,
            session_id: new_item.session_id,
            user_id: new_item.user_id,
            weight: 0,
            created_at: now,
            updated_at: now,
        };
        tables.queue.insert(item.id, item.clone());
        Ok(item)
    }

    async fn get_queue_item(&self, id: Id) -> Result<QueueItem> {
        self.tables
            .lock()
            .queue
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("queue item", id))
    }

    async fn list_queue_items(&self, filter: QueueFilter) -> Result<Vec<QueueItem>> {
        Ok(self
            .tables
            .lock()
            .queue
            .values()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect())
    }

    async fn update_queue_item(&self, item: QueueItem) -> Result<QueueItem> {
        validation::validate_queue_item(&item.track_uri, item.session_id, item.user_id)?;

        let mut tables = self.tables.lock();
        let stored = tables
            .queue
            .get_mut(&item.id)
            .ok_or_else(|| Error::not_found("queue item", item.id))?;

        if stored.session_id != item.session_id {
            return Err(Error::validation("session_id", "cannot be changed"));
        }
        if stored.user_id != item.user_id {
            return Err(Error::validation("user_id", "cannot be changed"));
        }

        stored.track_uri = item.track_uri;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn delete_queue_item(&self, id: Id) -> Result<()> {
        self.tables
            .lock()
            .remove_queue_item(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("queue item", id))
    }
}

#[async_trait]
impl VoteRepository for MemoryStore {
    async fn create_vote(&self, new_vote: NewVote) -> Result<Vote> {
        validation::validate_new_vote(&new_vote)?;

        let mut tables = self.tables.lock();
        tables.user(new_vote.user_id)?;
        if !tables.queue.contains_key(&new_vote.queue_item_id) {
            return Err(Error::not_found("queue item", new_vote.queue_item_id));
        }

        if tables
            .votes
            .values()
            .any(|v| v.queue_item_id == new_vote.queue_item_id && v.user_id == new_vote.user_id)
        {
            return Err(Error::Conflict {
                resource: "vote",
                field: "user_id",
                value: new_vote.user_id.to_string(),
            });
        }

        let now = Utc::now();
        let vote = Vote {
            id: next(&mut tables.seq.votes),
            user_id: new_vote.user_id,
            queue_item_id: new_vote.queue_item_id,
            vote_type: new_vote.vote_type,
            created_at: now,
            updated_at: now,
        };

        if let Some(item) = tables.queue.get_mut(&vote.queue_item_id) {
            apply_vote_delta(item, vote.vote_type.delta());
        }
        tables.votes.insert(vote.id, vote.clone());
        Ok(vote)
    }

    async fn get_vote(&self, id: Id) -> Result<Vote> {
        self.tables
            .lock()
            .votes
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("vote", id))
    }

    async fn get_vote_by_user(&self, queue_item_id: Id, user_id: Id) -> Result<Option<Vote>> {
        Ok(self
            .tables
            .lock()
            .votes
            .values()
            .find(|v| v.queue_item_id == queue_item_id && v.user_id == user_id)
            .cloned())
    }

    async fn votes_for_item(&self, queue_item_id: Id) -> Result<Vec<Vote>> {
        Ok(self
            .tables
            .lock()
            .votes
            .values()
            .filter(|v| v.queue_item_id == queue_item_id)
            .cloned()
            .collect())
    }

    async fn update_vote(&self, vote: Vote) -> Result<Vote> {
        let mut tables = self.tables.lock();
        let stored = tables
            .votes
            .get(&vote.id)
            .cloned()
            .ok_or_else(|| Error::not_found("vote", vote.id))?;

        if stored.user_id != vote.user_id {
            return Err(Error::validation("user_id", "cannot be changed"));
        }
        if stored.queue_item_id != vote.queue_item_id {
            return Err(Error::validation("queue_item_id", "cannot be changed"));
        }

        let delta = vote.vote_type.delta() - stored.vote_type.delta();
        if let Some(item) = tables.queue.get_mut(&stored.queue_item_id) {
            apply_vote_delta(item, delta);
        }

        let updated = Vote {
            vote_type: vote.vote_type,
            updated_at: Utc::now(),
            ..stored
        };
        tables.votes.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn delete_vote(&self, id: Id) -> Result<()> {
        self.tables
            .lock()
            .remove_vote(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("vote", id))
    }
}

#[async_trait]
impl CredentialRepository for MemoryStore {
    async fn create_credential(&self, new_credential: NewCredential) -> Result<Credential> {
        validation::validate_new_credential(&new_credential)?;

        let mut tables = self.tables.lock();
        tables.user(new_credential.user_id)?;
        tables.session(new_credential.session_id)?;

        if tables.credentials.values().any(|c| {
            c.user_id == new_credential.user_id && c.session_id == new_credential.session_id
        }) {
            return Err(Error::Conflict {
                resource: "credential",
                field: "user_id",
                value: new_credential.user_id.to_string(),
            });
        }

        let now = Utc::now();
        let credential = Credential {
            id: next(&mut tables.seq.credentials),
            user_id: new_credential.user_id,
            session_id: new_credential.session_id,
            access_token: new_credential.access_token,
            refresh_token: new_credential.refresh_token,
            expires_at: new_credential.expires_at,
            created_at: now,
            updated_at: now,
        };
        tables.credentials.insert(credential.id, credential.clone());
        Ok(credential)
    }

    async fn get_credential(&self, id: Id) -> Result<Credential> {
        self.tables
            .lock()
            .credentials
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("credential", id))
    }

    async fn get_credentials_by_user(&self, user_id: Id) -> Result<Vec<Credential>> {
        Ok(self
            .tables
            .lock()
            .credentials
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn get_credentials_by_session(&self, session_id: Id) -> Result<Vec<Credential>> {
        Ok(self
            .tables
            .lock()
            .credentials
            .values()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn get_credential_for(&self, user_id: Id, session_id: Id) -> Result<Option<Credential>> {
        Ok(self
            .tables
            .lock()
            .credentials
            .values()
            .find(|c| c.user_id == user_id && c.session_id == session_id)
            .cloned())
    }

    async fn update_credential(&self, credential: Credential) -> Result<Credential> {
        validation::validate_credential(
            credential.user_id,
            credential.session_id,
            &credential.access_token,
            &credential.refresh_token,
            credential.expires_at,
        )?;

        let mut tables = self.tables.lock();
        let stored = tables
            .credentials
            .get(&credential.id)
            .ok_or_else(|| Error::not_found("credential", credential.id))?;

        if stored.user_id != credential.user_id {
            return Err(Error::validation("user_id", "cannot be changed"));
        }
        if stored.session_id != credential.session_id {
            return Err(Error::validation("session_id", "cannot be changed"));
        }

        let updated = Credential {
            created_at: stored.created_at,
            updated_at: Utc::now(),
            ..credential
        };
        tables.credentials.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn delete_credential(&self, id: Id) -> Result<()> {
        self.tables
            .lock()
            .credentials
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("credential", id))
    }

    async fn delete_credentials_by_session(&self, session_id: Id) -> Result<usize> {
        let mut tables = self.tables.lock();
        let before = tables.credentials.len();
        tables.credentials.retain(|_, c| c.session_id != session_id);
        Ok(before - tables.credentials.len())
    }
}
