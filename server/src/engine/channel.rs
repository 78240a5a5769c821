use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ids::{ChannelId, GuildId, MemberId};
use super::negotiation::{ConflictNegotiation, NegotiationSummary};

/// A member currently going live in a watched channel.
///
/// Identity is the member id alone, so a set of sessions never holds two
/// entries for the same member regardless of start time.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StreamerSession {
    pub member_id: MemberId,
    /// `None` when the session was discovered at startup rather than observed starting.
    pub started_at: Option<DateTime<Utc>>,
}

impl StreamerSession {
    pub fn started(member_id: MemberId) -> Self {
        Self {
            member_id,
            started_at: Some(Utc::now()),
        }
    }

    pub fn recovered(member_id: MemberId) -> Self {
        Self {
            member_id,
            started_at: None,
        }
    }
}

impl PartialEq for StreamerSession {
    fn eq(&self, other: &Self) -> bool {
        self.member_id == other.member_id
    }
}

impl Eq for StreamerSession {}

impl Hash for StreamerSession {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.member_id.hash(state);
    }
}

/// Result of adding a streamer to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// The member already had a session; the original start time is kept.
    AlreadyTracked,
    /// Admitting the member would exceed the limit, so the new session was dropped again.
    Evicted(StreamerSession),
}

/// In-memory enforcement state for a single watched voice channel.
#[derive(Debug)]
pub struct ChannelState {
    pub id: ChannelId,
    pub guild_id: GuildId,
    /// `false` means the channel is pending removal and not enforced.
    pub watch: bool,
    pub stream_limit: u32,
    pub streamers: HashSet<StreamerSession>,
    pub negotiation: Option<ConflictNegotiation>,
}

impl ChannelState {
    pub fn new(id: ChannelId, guild_id: GuildId, watch: bool, stream_limit: u32) -> Self {
        Self {
            id,
            guild_id,
            watch,
            stream_limit,
            streamers: HashSet::new(),
            negotiation: None,
        }
    }

    pub fn streamer_count(&self) -> usize {
        self.streamers.len()
    }

    pub fn is_tracking(&self, member_id: MemberId) -> bool {
        self.streamers.contains(&StreamerSession::recovered(member_id))
    }

    /// Add a session and immediately evict it again if that pushes the channel over its limit.
    ///
    /// Add and evict happen in one step, so the tracked set is never observed above the limit.
    pub fn admit(&mut self, session: StreamerSession) -> Admission {
        if !self.streamers.insert(session) {
            return Admission::AlreadyTracked;
        }
        if self.streamers.len() > self.stream_limit as usize {
            self.streamers.remove(&session);
            return Admission::Evicted(session);
        }
        Admission::Admitted
    }

    /// Remove a member's session. Returns whether one was present.
    pub fn discard(&mut self, member_id: MemberId) -> bool {
        self.streamers.remove(&StreamerSession::recovered(member_id))
    }

    /// Seed the tracked set from the live streamers, only when nothing is tracked yet.
    pub fn seed_streamers(&mut self, live: &[MemberId]) -> usize {
        if !self.streamers.is_empty() {
            return 0;
        }
        self.streamers
            .extend(live.iter().copied().map(StreamerSession::recovered));
        self.streamers.len()
    }

    pub fn has_open_negotiation(&self) -> bool {
        self.negotiation.as_ref().is_some_and(|n| !n.is_finished())
    }

    /// Drop the negotiation without resolving it. Nobody is disconnected.
    pub fn release_negotiation(&mut self) -> Option<ConflictNegotiation> {
        let mut negotiation = self.negotiation.take()?;
        negotiation.release();
        Some(negotiation)
    }

    /// Sessions ordered oldest first; sessions with unknown start come first.
    pub fn sorted_streamers(&self) -> Vec<StreamerSession> {
        let mut sessions: Vec<StreamerSession> = self.streamers.iter().copied().collect();
        sessions.sort_by_key(|s| (s.started_at, s.member_id));
        sessions
    }

    pub fn view(&self) -> ChannelView {
        ChannelView {
            channel_id: self.id,
            guild_id: self.guild_id,
            watch: self.watch,
            stream_limit: self.stream_limit,
            streamers: self.sorted_streamers(),
            negotiation: self.negotiation.as_ref().map(ConflictNegotiation::summary),
        }
    }
}

impl PartialEq for ChannelState {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ChannelState {}

impl Hash for ChannelState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Read-only snapshot of a channel for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelView {
    pub channel_id: ChannelId,
    pub guild_id: GuildId,
    pub watch: bool,
    pub stream_limit: u32,
    pub streamers: Vec<StreamerSession>,
    pub negotiation: Option<NegotiationSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(limit: u32) -> ChannelState {
        ChannelState::new(ChannelId(100), GuildId(1), true, limit)
    }

    #[test]
    fn test_session_identity_ignores_start_time() {
        let a = StreamerSession::started(MemberId(1));
        let b = StreamerSession::recovered(MemberId(1));
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_channel_identity_is_id_only() {
        let mut a = channel(1);
        let b = ChannelState::new(ChannelId(100), GuildId(2), false, 9);
        a.admit(StreamerSession::started(MemberId(5)));
        assert_eq!(a, b);
    }

    #[test]
    fn test_admit_evicts_newest_over_limit() {
        let mut ch = channel(1);
        assert_eq!(ch.admit(StreamerSession::started(MemberId(1))), Admission::Admitted);

        let result = ch.admit(StreamerSession::started(MemberId(2)));
        assert!(matches!(result, Admission::Evicted(s) if s.member_id == MemberId(2)));
        assert_eq!(ch.streamer_count(), 1);
        assert!(ch.is_tracking(MemberId(1)));
        assert!(!ch.is_tracking(MemberId(2)));
    }

    #[test]
    fn test_admit_existing_member_keeps_start_time() {
        let mut ch = channel(2);
        ch.seed_streamers(&[MemberId(1)]);
        assert_eq!(
            ch.admit(StreamerSession::started(MemberId(1))),
            Admission::AlreadyTracked
        );
        let session = ch.streamers.iter().next().copied();
        assert!(session.is_some_and(|s| s.started_at.is_none()));
    }

    #[test]
    fn test_discard_is_idempotent() {
        let mut ch = channel(2);
        ch.admit(StreamerSession::started(MemberId(1)));
        assert!(ch.discard(MemberId(1)));
        assert!(!ch.discard(MemberId(1)));
        assert_eq!(ch.streamer_count(), 0);
    }

    #[test]
    fn test_seed_only_when_empty() {
        let mut ch = channel(5);
        assert_eq!(ch.seed_streamers(&[MemberId(1), MemberId(2)]), 2);
        assert_eq!(ch.seed_streamers(&[MemberId(3)]), 0);
        assert!(!ch.is_tracking(MemberId(3)));
    }

    #[test]
    fn test_sorted_streamers_unknown_first() {
        let mut ch = channel(5);
        ch.admit(StreamerSession::started(MemberId(2)));
        ch.streamers.insert(StreamerSession::recovered(MemberId(9)));
        let order: Vec<MemberId> = ch.sorted_streamers().iter().map(|s| s.member_id).collect();
        assert_eq!(order, vec![MemberId(9), MemberId(2)]);
    }
}
