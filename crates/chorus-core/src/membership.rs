//! Channel membership index.
//!
//! Maps channels to member sessions and sessions to joined channels. Both
//! directions are updated together so that a session is listed in a channel
//! exactly when the channel is listed for the session.

use chorus_protocol::{ChannelId, SessionId};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::error::HubError;

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name.starts_with('$') {
        return Err("Channel names starting with '$' are reserved");
    }
    if name.chars().any(char::is_control) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// Result of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
}

/// Bidirectional channel ↔ session index.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MembershipIndex {
    channels: HashMap<ChannelId, HashSet<SessionId>>,
    sessions: HashMap<SessionId, HashSet<ChannelId>>,
}

impl MembershipIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to a channel. Joining twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid or the session already
    /// holds `max_channels` memberships.
    pub fn join(
        &mut self,
        session: SessionId,
        channel: &str,
        max_channels: usize,
    ) -> Result<JoinOutcome, HubError> {
        validate_channel_name(channel).map_err(HubError::InvalidChannel)?;

        let joined = self.sessions.entry(session).or_default();
        if joined.contains(channel) {
            return Ok(JoinOutcome::AlreadyMember);
        }
        if joined.len() >= max_channels {
            if joined.is_empty() {
                self.sessions.remove(&session);
            }
            return Err(HubError::TooManyChannels);
        }

        joined.insert(channel.to_string());
        let members = self.channels.entry(channel.to_string()).or_default();
        members.insert(session);

        debug!(
            channel = %channel,
            session = %session,
            members = members.len(),
            "Joined channel"
        );
        Ok(JoinOutcome::Joined)
    }

    /// Remove a session from a channel.
    ///
    /// Returns `true` if the session was a member.
    pub fn leave(&mut self, session: SessionId, channel: &str) -> bool {
        let Some(joined) = self.sessions.get_mut(&session) else {
            return false;
        };
        if !joined.remove(channel) {
            return false;
        }
        if joined.is_empty() {
            self.sessions.remove(&session);
        }

        if let Some(members) = self.channels.get_mut(channel) {
            members.remove(&session);
            if members.is_empty() {
                self.channels.remove(channel);
                debug!(channel = %channel, "Channel has no members left");
            }
        }

        debug!(channel = %channel, session = %session, "Left channel");
        true
    }

    /// Remove a session from every channel.
    ///
    /// Returns the channels it had joined.
    pub fn remove_session(&mut self, session: SessionId) -> HashSet<ChannelId> {
        let joined = self.sessions.remove(&session).unwrap_or_default();
        for channel in &joined {
            if let Some(members) = self.channels.get_mut(channel) {
                members.remove(&session);
                if members.is_empty() {
                    self.channels.remove(channel);
                }
            }
        }
        joined
    }

    /// Sessions subscribed to a channel.
    #[must_use]
    pub fn members_of(&self, channel: &str) -> HashSet<SessionId> {
        self.channels.get(channel).cloned().unwrap_or_default()
    }

    /// Iterate a channel's sessions without cloning.
    pub fn iter_members<'a>(&'a self, channel: &str) -> impl Iterator<Item = SessionId> + 'a {
        self.channels
            .get(channel)
            .into_iter()
            .flat_map(|members| members.iter().copied())
    }

    /// Channels a session has joined.
    #[must_use]
    pub fn channels_of(&self, session: SessionId) -> HashSet<ChannelId> {
        self.sessions.get(&session).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn is_member(&self, session: SessionId, channel: &str) -> bool {
        self.sessions
            .get(&session)
            .is_some_and(|joined| joined.contains(channel))
    }

    /// Number of channels with at least one member.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Total number of (session, channel) pairs.
    #[must_use]
    pub fn total_memberships(&self) -> usize {
        self.sessions.values().map(HashSet::len).sum()
    }

    /// Read-only view of the channel → sessions map.
    #[must_use]
    pub fn channels(&self) -> &HashMap<ChannelId, HashSet<SessionId>> {
        &self.channels
    }

    /// Panic if the two directions disagree.
    ///
    /// An inconsistency is a coordinator bug, never a runtime condition.
    pub fn assert_consistent(&self) {
        for (channel, members) in &self.channels {
            assert!(!members.is_empty(), "empty member set kept for {channel}");
            for session in members {
                assert!(
                    self.is_member(*session, channel),
                    "{session} listed in {channel} but not joined"
                );
            }
        }
        for (session, joined) in &self.sessions {
            assert!(!joined.is_empty(), "empty channel set kept for {session}");
            for channel in joined {
                assert!(
                    self.channels
                        .get(channel)
                        .is_some_and(|members| members.contains(session)),
                    "{session} joined {channel} but not listed"
                );
            }
        }
    }
}
