//! External collaborators consumed by the hub.
//!
//! Identity, channel-membership authorization and message persistence live
//! outside the hub. The in-memory implementations here back development
//! setups and tests.

use async_trait::async_trait;
use chorus_protocol::events::ChatMessage;
use chorus_protocol::{ChannelId, MessageId, UserId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, trace};

/// Collaborator errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The token does not map to a user.
    #[error("Unknown or expired token")]
    UnknownToken,

    /// The collaborator could not be reached.
    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    /// The collaborator refused the request.
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Resolves connection credentials to a user id.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve a bearer token.
    async fn resolve(&self, token: &str) -> Result<UserId, DirectoryError>;
}

/// Decides whether a user may join a channel.
#[async_trait]
pub trait MembershipAuthority: Send + Sync {
    async fn may_join(&self, user_id: &str, channel_id: &str) -> Result<bool, DirectoryError>;
}

/// A message accepted by the hub, handed to persistence after publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub content: String,
    pub created_at: u64,
}

impl From<&ChatMessage> for MessageRecord {
    fn from(message: &ChatMessage) -> Self {
        Self {
            message_id: message.message_id,
            channel_id: message.channel_id.clone(),
            user_id: message.user_id.clone(),
            content: message.content.clone(),
            created_at: message.created_at,
        }
    }
}

/// Fire-and-forget persistence of accepted messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, record: MessageRecord) -> Result<(), DirectoryError>;
}

/// Token and channel directory held in memory.
///
/// Channels without an explicit member list are open to everyone when
/// `open_channels` is set, closed otherwise.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    tokens: DashMap<String, UserId>,
    channels: DashMap<ChannelId, HashSet<UserId>>,
    open_channels: bool,
}

impl InMemoryDirectory {
    #[must_use]
    pub fn new(open_channels: bool) -> Self {
        Self {
            tokens: DashMap::new(),
            channels: DashMap::new(),
            open_channels,
        }
    }

    /// Register a token for a user.
    pub fn add_token(&self, token: impl Into<String>, user_id: impl Into<UserId>) {
        self.tokens.insert(token.into(), user_id.into());
    }

    /// Forget a token. Returns `true` if it existed.
    pub fn remove_token(&self, token: &str) -> bool {
        self.tokens.remove(token).is_some()
    }

    /// Allow a user into a channel.
    pub fn allow(&self, channel_id: impl Into<ChannelId>, user_id: impl Into<UserId>) {
        self.channels
            .entry(channel_id.into())
            .or_default()
            .insert(user_id.into());
    }

    /// Revoke a user's access to a channel.
    pub fn revoke(&self, channel_id: &str, user_id: &str) -> bool {
        self.channels
            .get_mut(channel_id)
            .is_some_and(|mut users| users.remove(user_id))
    }

    /// Replace a channel's member list.
    pub fn set_members(&self, channel_id: impl Into<ChannelId>, users: HashSet<UserId>) {
        let channel_id = channel_id.into();
        debug!(channel = %channel_id, members = users.len(), "Channel members replaced");
        self.channels.insert(channel_id, users);
    }

    /// Allowed users of a channel, if the channel is restricted.
    #[must_use]
    pub fn members(&self, channel_id: &str) -> Option<HashSet<UserId>> {
        self.channels.get(channel_id).map(|users| users.clone())
    }

    #[must_use]
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }
}

#[async_trait]
impl IdentityResolver for InMemoryDirectory {
    async fn resolve(&self, token: &str) -> Result<UserId, DirectoryError> {
        self.tokens
            .get(token)
            .map(|user| user.clone())
            .ok_or(DirectoryError::UnknownToken)
    }
}

#[async_trait]
impl MembershipAuthority for InMemoryDirectory {
    async fn may_join(&self, user_id: &str, channel_id: &str) -> Result<bool, DirectoryError> {
        Ok(self
            .channels
            .get(channel_id)
            .map_or(self.open_channels, |users| users.contains(user_id)))
    }
}

/// Default number of messages retained per channel.
pub const DEFAULT_HISTORY_PER_CHANNEL: usize = 1_000;

/// Message store keeping the most recent messages of each channel in memory.
///
/// Each channel holds at most `per_channel` records; appending to a full
/// channel evicts its oldest record.
#[derive(Debug)]
pub struct InMemoryMessageStore {
    history: DashMap<ChannelId, VecDeque<MessageRecord>>,
    per_channel: usize,
}

impl InMemoryMessageStore {
    #[must_use]
    pub fn new(per_channel: usize) -> Self {
        Self {
            history: DashMap::new(),
            per_channel: per_channel.max(1),
        }
    }

    /// Maximum records retained per channel.
    #[must_use]
    pub fn per_channel(&self) -> usize {
        self.per_channel
    }

    /// Stored messages of a channel, oldest first.
    #[must_use]
    pub fn history(&self, channel_id: &str) -> Vec<MessageRecord> {
        self.history
            .get(channel_id)
            .map(|records| records.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of stored messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.history.iter().map(|entry| entry.value().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_PER_CHANNEL)
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(&self, record: MessageRecord) -> Result<(), DirectoryError> {
        let mut records = self.history.entry(record.channel_id.clone()).or_default();
        if records.len() >= self.per_channel {
            if let Some(evicted) = records.pop_front() {
                trace!(message = evicted.message_id, channel = %evicted.channel_id, "Evicting oldest message");
            }
        }
        records.push_back(record);
        Ok(())
    }
}

/// Message store that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMessageStore;

#[async_trait]
impl MessageStore for NullMessageStore {
    async fn append(&self, record: MessageRecord) -> Result<(), DirectoryError> {
        trace!(message = record.message_id, channel = %record.channel_id, "Discarding message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_resolution() {
        let directory = InMemoryDirectory::new(true);
        directory.add_token("secret", "alice");

        assert_eq!(directory.resolve("secret").await.unwrap(), "alice");
        assert!(matches!(
            directory.resolve("nope").await,
            Err(DirectoryError::UnknownToken)
        ));

        assert!(directory.remove_token("secret"));
        assert!(directory.resolve("secret").await.is_err());
    }

    #[tokio::test]
    async fn test_restricted_channels() {
        let directory = InMemoryDirectory::new(true);
        assert!(directory.may_join("alice", "lobby").await.unwrap());

        directory.allow("private", "alice");
        assert!(directory.may_join("alice", "private").await.unwrap());
        assert!(!directory.may_join("bob", "private").await.unwrap());

        assert!(directory.revoke("private", "alice"));
        assert!(!directory.may_join("alice", "private").await.unwrap());

        let closed = InMemoryDirectory::new(false);
        assert!(!closed.may_join("alice", "lobby").await.unwrap());
    }

    #[tokio::test]
    async fn test_message_store_keeps_order() {
        let store = InMemoryMessageStore::default();
        for id in 1..=3 {
            store
                .append(MessageRecord {
                    message_id: id,
                    channel_id: "general".into(),
                    user_id: "alice".into(),
                    content: format!("message {id}"),
                    created_at: 0,
                })
                .await
                .unwrap();
        }

        let ids: Vec<_> = store.history("general").iter().map(|r| r.message_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(store.len(), 3);
        assert!(store.history("random").is_empty());
    }

    #[tokio::test]
    async fn test_message_store_evicts_oldest_past_capacity() {
        let store = InMemoryMessageStore::new(3);
        for id in 1..=5 {
            store
                .append(MessageRecord {
                    message_id: id,
                    channel_id: "general".into(),
                    user_id: "alice".into(),
                    content: format!("message {id}"),
                    created_at: 0,
                })
                .await
                .unwrap();
        }
        store
            .append(MessageRecord {
                message_id: 6,
                channel_id: "random".into(),
                user_id: "bob".into(),
                content: "elsewhere".into(),
                created_at: 0,
            })
            .await
            .unwrap();

        let ids: Vec<_> = store.history("general").iter().map(|r| r.message_id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(store.history("random").len(), 1);
        assert_eq!(store.len(), 4);
    }
}
