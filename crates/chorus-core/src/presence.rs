//! Presence tracking.
//!
//! Derives each user's status from session lifecycle and activity, and keeps
//! per-channel typing indicators that expire unless renewed. The tracker only
//! computes [`PresenceChange`]s; the coordinator decides where to fan them out.

use chorus_protocol::{now_millis, ChannelId, PresenceStatus, UserId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::HubError;

/// A presence transition to broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Status {
        user_id: UserId,
        status: PresenceStatus,
        last_active_at: u64,
    },
    TypingStarted {
        user_id: UserId,
        channel_id: ChannelId,
    },
    TypingStopped {
        user_id: UserId,
        channel_id: ChannelId,
    },
}

#[derive(Debug)]
struct PresenceRecord {
    status: PresenceStatus,
    live_sessions: usize,
    last_activity: Instant,
    last_active_at: u64,
    /// Set by an explicit `away`; activity does not clear it.
    manual_away: bool,
    typing: HashMap<ChannelId, Instant>,
}

impl PresenceRecord {
    fn status_change(&self, user_id: &str) -> PresenceChange {
        PresenceChange::Status {
            user_id: user_id.to_string(),
            status: self.status,
            last_active_at: self.last_active_at,
        }
    }
}

/// Presence state for every user with at least one live session.
///
/// Users without a record are offline.
#[derive(Debug)]
pub struct PresenceTracker {
    records: HashMap<UserId, PresenceRecord>,
    typing_window: Duration,
    away_after: Option<Duration>,
}

impl PresenceTracker {
    /// Create a tracker.
    ///
    /// `typing_window` is how long a typing indicator lives without renewal;
    /// `away_after` marks idle users away (disabled when `None`).
    #[must_use]
    pub fn new(typing_window: Duration, away_after: Option<Duration>) -> Self {
        Self {
            records: HashMap::new(),
            typing_window,
            away_after,
        }
    }

    /// Count a new live session for the user.
    ///
    /// Returns the `online` transition when the user was offline.
    pub fn session_opened(&mut self, user_id: &str, now: Instant) -> Option<PresenceChange> {
        if let Some(record) = self.records.get_mut(user_id) {
            record.live_sessions += 1;
            record.last_activity = now;
            record.last_active_at = now_millis();
            return None;
        }

        let record = PresenceRecord {
            status: PresenceStatus::Online,
            live_sessions: 1,
            last_activity: now,
            last_active_at: now_millis(),
            manual_away: false,
            typing: HashMap::new(),
        };
        let change = record.status_change(user_id);
        self.records.insert(user_id.to_string(), record);
        debug!(user = %user_id, "Presence: online");
        Some(change)
    }

    /// Record activity.
    ///
    /// An automatically-away user flips back to `online`.
    pub fn touch(&mut self, user_id: &str, now: Instant) -> Option<PresenceChange> {
        let record = self.records.get_mut(user_id)?;
        record.last_activity = now;
        record.last_active_at = now_millis();

        if record.status != PresenceStatus::Online && !record.manual_away {
            record.status = PresenceStatus::Online;
            debug!(user = %user_id, "Presence: back online");
            return Some(record.status_change(user_id));
        }
        None
    }

    /// Explicitly select `online` or `away`.
    ///
    /// # Errors
    ///
    /// `offline` cannot be selected while sessions are live.
    pub fn set_status(
        &mut self,
        user_id: &str,
        status: PresenceStatus,
        now: Instant,
    ) -> Result<Option<PresenceChange>, HubError> {
        if status == PresenceStatus::Offline {
            return Err(HubError::InvalidMessage(
                "status must be online or away",
            ));
        }
        let Some(record) = self.records.get_mut(user_id) else {
            return Ok(None);
        };

        record.manual_away = status == PresenceStatus::Away;
        record.last_activity = now;
        record.last_active_at = now_millis();
        if record.status == status {
            return Ok(None);
        }
        record.status = status;
        debug!(user = %user_id, status = %status, "Presence: status set");
        Ok(Some(record.status_change(user_id)))
    }

    /// Start or renew a typing indicator.
    ///
    /// Returns `TypingStarted` only for a new indicator.
    pub fn mark_typing(
        &mut self,
        user_id: &str,
        channel_id: &str,
        now: Instant,
    ) -> Option<PresenceChange> {
        let expiry = now + self.typing_window;
        let record = self.records.get_mut(user_id)?;
        let previous = record.typing.insert(channel_id.to_string(), expiry);

        previous.is_none().then(|| PresenceChange::TypingStarted {
            user_id: user_id.to_string(),
            channel_id: channel_id.to_string(),
        })
    }

    /// Clear a typing indicator.
    ///
    /// Returns `TypingStopped` if one was active.
    pub fn clear_typing(&mut self, user_id: &str, channel_id: &str) -> Option<PresenceChange> {
        let record = self.records.get_mut(user_id)?;
        record
            .typing
            .remove(channel_id)
            .map(|_| PresenceChange::TypingStopped {
                user_id: user_id.to_string(),
                channel_id: channel_id.to_string(),
            })
    }

    /// Count a closed session.
    ///
    /// When the last session goes, active typing indicators stop and the user
    /// turns `offline`, in that order.
    pub fn session_closed(&mut self, user_id: &str) -> Vec<PresenceChange> {
        let Some(record) = self.records.get_mut(user_id) else {
            return Vec::new();
        };

        record.live_sessions = record.live_sessions.saturating_sub(1);
        if record.live_sessions > 0 {
            return Vec::new();
        }

        let Some(record) = self.records.remove(user_id) else {
            return Vec::new();
        };
        let mut channels: Vec<_> = record.typing.into_keys().collect();
        channels.sort();

        let mut changes: Vec<_> = channels
            .into_iter()
            .map(|channel_id| PresenceChange::TypingStopped {
                user_id: user_id.to_string(),
                channel_id,
            })
            .collect();
        changes.push(PresenceChange::Status {
            user_id: user_id.to_string(),
            status: PresenceStatus::Offline,
            last_active_at: now_millis(),
        });

        debug!(user = %user_id, "Presence: offline");
        changes
    }

    /// Expire stale typing indicators and mark idle users away.
    pub fn sweep(&mut self, now: Instant) -> Vec<PresenceChange> {
        let mut changes = Vec::new();
        let mut users: Vec<_> = self.records.keys().cloned().collect();
        users.sort();

        for user_id in users {
            let Some(record) = self.records.get_mut(&user_id) else {
                continue;
            };

            let mut expired: Vec<_> = record
                .typing
                .iter()
                .filter(|(_, expiry)| **expiry <= now)
                .map(|(channel, _)| channel.clone())
                .collect();
            expired.sort();
            for channel_id in expired {
                record.typing.remove(&channel_id);
                changes.push(PresenceChange::TypingStopped {
                    user_id: user_id.clone(),
                    channel_id,
                });
            }

            if let Some(away_after) = self.away_after {
                if record.status == PresenceStatus::Online
                    && now.saturating_duration_since(record.last_activity) >= away_after
                {
                    record.status = PresenceStatus::Away;
                    debug!(user = %user_id, "Presence: idle, away");
                    changes.push(record.status_change(&user_id));
                }
            }
        }

        changes
    }

    /// Current status of a user.
    #[must_use]
    pub fn status(&self, user_id: &str) -> PresenceStatus {
        self.records
            .get(user_id)
            .map_or(PresenceStatus::Offline, |r| r.status)
    }

    #[must_use]
    pub fn is_typing(&self, user_id: &str, channel_id: &str) -> bool {
        self.records
            .get(user_id)
            .is_some_and(|r| r.typing.contains_key(channel_id))
    }

    /// Number of live sessions counted for a user.
    #[must_use]
    pub fn live_sessions(&self, user_id: &str) -> usize {
        self.records.get(user_id).map_or(0, |r| r.live_sessions)
    }

    /// Statuses of every user that is not offline.
    #[must_use]
    pub fn statuses(&self) -> HashMap<UserId, PresenceStatus> {
        self.records
            .iter()
            .map(|(user, record)| (user.clone(), record.status))
            .collect()
    }

    /// Number of users that are not offline.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.records.len()
    }
}
