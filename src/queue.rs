//! Queue ranking engine.
//!
//! A queue item's `weight` is the net sum of its votes (+1 up, -1 down). It is
//! a cache of the vote set: [`apply_vote_delta`] is the only code that changes
//! it, and the store calls it in the same transaction as each vote mutation.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::metrics::METRICS;
use crate::store::{QueueFilter, QueueRepository, SessionRepository, VoteRepository};
use crate::types::{Id, NewQueueItem, NewVote, QueueItem, Vote, VoteType};

/// Adjust an item's cached weight by a vote delta
pub fn apply_vote_delta(item: &mut QueueItem, delta: i64) {
    if delta == 0 {
        return;
    }
    item.weight += delta;
    item.updated_at = Utc::now();
}

/// Order items for display.
///
/// With `prioritize`, heaviest first; equal weights keep their incoming
/// (insertion) order. Without it the input order is returned unchanged.
pub fn rank(mut items: Vec<QueueItem>, prioritize: bool) -> Vec<QueueItem> {
    if prioritize {
        // sort_by is stable
        items.sort_by(|a, b| b.weight.cmp(&a.weight));
    }
    items
}

/// Queue reads and mutations on behalf of a user
#[derive(Clone)]
pub struct QueueService {
    sessions: Arc<dyn SessionRepository>,
    queue: Arc<dyn QueueRepository>,
    votes: Arc<dyn VoteRepository>,
}

impl QueueService {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        queue: Arc<dyn QueueRepository>,
        votes: Arc<dyn VoteRepository>,
    ) -> Self {
        Self {
            sessions,
            queue,
            votes,
        }
    }

    /// List a session's queue, optionally narrowed to one submitter
    pub async fn list(
        &self,
        session_id: Id,
        user_id: Option<Id>,
        prioritize: bool,
    ) -> Result<Vec<QueueItem>> {
        let filter = match user_id {
            Some(user_id) => QueueFilter::SessionUser {
                session_id,
                user_id,
            },
            None => QueueFilter::Session(session_id),
        };
        self.list_filtered(filter, prioritize).await
    }

    pub async fn list_filtered(&self, filter: QueueFilter, prioritize: bool) -> Result<Vec<QueueItem>> {
        let items = self.queue.list_queue_items(filter).await?;
        Ok(rank(items, prioritize))
    }

    /// Everything `user_id` has submitted, limited to sessions `viewer_id`
    /// belongs to
    pub async fn list_by_user(&self, user_id: Id, viewer_id: Id, prioritize: bool) -> Result<Vec<QueueItem>> {
        let items = self.queue.list_queue_items(QueueFilter::User(user_id)).await?;

        let mut visible: HashMap<Id, bool> = HashMap::new();
        let mut kept = Vec::with_capacity(items.len());
        for item in items {
            let allowed = match visible.get(&item.session_id) {
                Some(&allowed) => allowed,
                None => {
                    let allowed = self.sessions.is_member(item.session_id, viewer_id).await?;
                    visible.insert(item.session_id, allowed);
                    allowed
                }
            };
            if allowed {
                kept.push(item);
            }
        }
        Ok(rank(kept, prioritize))
    }

    pub async fn get(&self, id: Id) -> Result<QueueItem> {
        self.queue.get_queue_item(id).await
    }

    pub async fn enqueue(&self, session_id: Id, user_id: Id, track_uri: String) -> Result<QueueItem> {
        self.require_member(session_id, user_id).await?;

        let item = self
            .queue
            .create_queue_item(NewQueueItem {
                track_uri,
                session_id,
                user_id,
            })
            .await?;

        info!(
            "Enqueued {} in session {} (item {})",
            item.track_uri, session_id, item.id
        );
        Ok(item)
    }

    /// Replace the track of an item. Only its submitter may do this.
    pub async fn update_track(&self, id: Id, user_id: Id, track_uri: String) -> Result<QueueItem> {
        let mut item = self.queue.get_queue_item(id).await?;
        if item.user_id != user_id {
            return Err(Error::Forbidden("only the submitter can edit a queue item"));
        }
        item.track_uri = track_uri;
        self.queue.update_queue_item(item).await
    }

    /// Remove an item. Its submitter or the session host may do this.
    pub async fn remove(&self, id: Id, user_id: Id) -> Result<()> {
        let item = self.queue.get_queue_item(id).await?;
        if item.user_id != user_id {
            let session = self.sessions.get_session(item.session_id).await?;
            if session.host_id != user_id {
                return Err(Error::Forbidden(
                    "only the submitter or the host can remove a queue item",
                ));
            }
        }
        self.queue.delete_queue_item(id).await
    }

    /// Cast or change the caller's vote on an item; returns the re-weighted item
    pub async fn cast_vote(&self, item_id: Id, user_id: Id, vote_type: VoteType) -> Result<QueueItem> {
        let item = self.queue.get_queue_item(item_id).await?;
        self.require_member(item.session_id, user_id).await?;

        match self.votes.get_vote_by_user(item_id, user_id).await? {
            Some(existing) if existing.vote_type == vote_type => {
                debug!("Vote on item {} by user {} unchanged", item_id, user_id);
                return Ok(item);
            }
            Some(existing) => {
                self.votes
                    .update_vote(Vote {
                        vote_type,
                        ..existing
                    })
                    .await?;
            }
            None => {
                self.votes
                    .create_vote(NewVote {
                        user_id,
                        queue_item_id: item_id,
                        vote_type,
                    })
                    .await?;
            }
        }

        METRICS
            .votes_total
            .with_label_values(&[vote_type.as_str()])
            .inc();
        self.queue.get_queue_item(item_id).await
    }

    /// Withdraw the caller's vote on an item; returns the re-weighted item
    pub async fn retract_vote(&self, item_id: Id, user_id: Id) -> Result<QueueItem> {
        let vote = self
            .votes
            .get_vote_by_user(item_id, user_id)
            .await?
            .ok_or_else(|| Error::not_found("vote", format!("{}:{}", item_id, user_id)))?;

        self.votes.delete_vote(vote.id).await?;
        self.queue.get_queue_item(item_id).await
    }

    async fn require_member(&self, session_id: Id, user_id: Id) -> Result<()> {
        if self.sessions.is_member(session_id, user_id).await? {
            Ok(())
        } else {
            Err(Error::Forbidden("not a member of this session"))
        }
    }
}
