//! Time-boxed conflict negotiation for a channel over its stream limit.
//!
//! A negotiation opens when more members are live than the channel allows.
//! The original offenders get a fixed window to bring the count down on their
//! own; every voice change in the channel re-evaluates who is still live, and
//! the negotiation closes as soon as enough of them have stopped. When the
//! window expires first, everyone still live from the original set is moved
//! out of voice.
//!
//! ```text
//! OPEN ──▶ AGREEMENT_REACHED ──▶ CLOSED
//!   └────▶ TIMED_OUT ─────────▶ CLOSED
//! ```
//!
//! The negotiation is owned by its [`ChannelState`]; the timer task only keeps
//! the channel id and negotiation id and looks the channel up in the registry
//! when it fires.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::channel::ChannelState;
use super::error::NegotiationError;
use super::ids::{ChannelId, GuildId, MemberId};
use super::notice;
use super::registry::ChannelRegistry;
use super::retry::RetryPolicy;
use crate::platform::{DeliveryError, MessageRef, VoicePlatform};

/// Default negotiation window.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// How long resolution notices stay visible.
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Open,
    AgreementReached,
    TimedOut,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Agreement,
    TimedOut,
    /// Dropped without resolving because the channel stopped being enforced.
    Released,
}

#[derive(Debug)]
pub struct ConflictNegotiation {
    id: u64,
    channel_id: ChannelId,
    guild_id: GuildId,
    limit: u32,
    initial_offenders: Vec<MemberId>,
    still_streaming: Vec<MemberId>,
    agreed: Vec<MemberId>,
    opened_at: DateTime<Utc>,
    timeout: Duration,
    state: NegotiationState,
    resolution: Option<Resolution>,
    message: Option<MessageRef>,
    cancel: CancellationToken,
}

impl ConflictNegotiation {
    pub fn open(
        id: u64,
        channel_id: ChannelId,
        guild_id: GuildId,
        limit: u32,
        offenders: Vec<MemberId>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            channel_id,
            guild_id,
            limit,
            still_streaming: offenders.clone(),
            initial_offenders: offenders,
            agreed: Vec::new(),
            opened_at: Utc::now(),
            timeout,
            state: NegotiationState::Open,
            resolution: None,
            message: None,
            cancel,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// The channel limit this negotiation was opened against.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    pub fn initial_offenders(&self) -> &[MemberId] {
        &self.initial_offenders
    }

    pub fn still_streaming(&self) -> &[MemberId] {
        &self.still_streaming
    }

    pub fn agreed(&self) -> &[MemberId] {
        &self.agreed
    }

    pub fn message(&self) -> Option<MessageRef> {
        self.message
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.opened_at + chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::zero())
    }

    /// Offenders that must stop before the conflict counts as resolved.
    pub fn required_agreements(&self) -> usize {
        self.initial_offenders
            .len()
            .saturating_sub(self.limit as usize)
    }

    /// Anything other than `Open` is finished; a finished negotiation may be replaced.
    pub fn is_finished(&self) -> bool {
        self.state != NegotiationState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    /// Recompute which original offenders are still live, given the members
    /// currently streaming in the channel. Members who stopped or left count
    /// as agreed, whatever the reason.
    pub fn observe(&mut self, live: &HashSet<MemberId>) -> NegotiationState {
        if self.state != NegotiationState::Open {
            return self.state;
        }

        self.still_streaming = self
            .initial_offenders
            .iter()
            .copied()
            .filter(|m| live.contains(m))
            .collect();
        self.agreed = self
            .initial_offenders
            .iter()
            .copied()
            .filter(|m| !self.still_streaming.contains(m))
            .collect();

        if self.agreed.len() >= self.required_agreements() {
            self.state = NegotiationState::AgreementReached;
        }
        self.state
    }

    /// Expire the window. Returns the members to disconnect, or `None` if the
    /// negotiation was no longer open.
    pub fn time_out(&mut self) -> Option<Vec<MemberId>> {
        if self.state != NegotiationState::Open {
            return None;
        }
        self.state = NegotiationState::TimedOut;
        Some(self.still_streaming.clone())
    }

    /// Move to `Closed` exactly once and stop the timer.
    pub fn close(&mut self, resolution: Resolution) -> bool {
        if self.state == NegotiationState::Closed {
            return false;
        }
        self.state = NegotiationState::Closed;
        self.resolution = Some(resolution);
        self.cancel.cancel();
        true
    }

    pub fn release(&mut self) -> bool {
        self.close(Resolution::Released)
    }

    pub fn summary(&self) -> NegotiationSummary {
        NegotiationSummary {
            channel_id: self.channel_id,
            limit: self.limit,
            initial_offenders: self.initial_offenders.clone(),
            still_streaming: self.still_streaming.clone(),
            agreed: self.agreed.clone(),
            required: self.required_agreements(),
            opened_at: self.opened_at,
            deadline: self.deadline(),
            state: self.state,
            resolution: self.resolution,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NegotiationSummary {
    pub channel_id: ChannelId,
    pub limit: u32,
    pub initial_offenders: Vec<MemberId>,
    pub still_streaming: Vec<MemberId>,
    pub agreed: Vec<MemberId>,
    pub required: usize,
    pub opened_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub state: NegotiationState,
    pub resolution: Option<Resolution>,
}

// ── Driver ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NegotiationSettings {
    pub timeout: Duration,
    pub message_ttl: Duration,
    /// Applied independently to each forced disconnect on timeout.
    pub kick_retry: RetryPolicy,
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            message_ttl: DEFAULT_MESSAGE_TTL,
            kick_retry: RetryPolicy::fixed(3, Duration::from_secs(3)),
        }
    }
}

/// Opens, advances and expires negotiations. Shared by the reconciliation
/// loop and the voice monitor, which are the only two places allowed to open one.
pub struct Negotiator {
    registry: Arc<ChannelRegistry>,
    platform: Arc<dyn VoicePlatform>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    settings: NegotiationSettings,
    next_id: AtomicU64,
}

impl Negotiator {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        platform: Arc<dyn VoicePlatform>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
        settings: NegotiationSettings,
    ) -> Self {
        Self {
            registry,
            platform,
            tracker,
            shutdown,
            settings,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &NegotiationSettings {
        &self.settings
    }

    /// Open a negotiation for `offenders` on a channel the caller has locked.
    ///
    /// Returns `Ok(false)` when one is already open and unfinished (or when
    /// there is no excess); a finished one is replaced. If the opening notice
    /// cannot be posted nothing is installed and the error is returned.
    pub async fn open(
        self: &Arc<Self>,
        state: &mut ChannelState,
        offenders: Vec<MemberId>,
    ) -> Result<bool, NegotiationError> {
        if state.has_open_negotiation() || offenders.len() <= state.stream_limit as usize {
            return Ok(false);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        let mut negotiation = ConflictNegotiation::open(
            id,
            state.id,
            state.guild_id,
            state.stream_limit,
            offenders,
            self.settings.timeout,
            cancel.clone(),
        );

        let opening = notice::conflict_status(
            negotiation.still_streaming(),
            0,
            negotiation.required_agreements(),
            negotiation.deadline(),
        );
        match self.platform.send_to_channel(state.id, &opening).await {
            Ok(message) => negotiation.message = Some(message),
            Err(e) => {
                cancel.cancel();
                return Err(NegotiationError::from_delivery(state.id, e));
            }
        }

        warn!(
            channel_id = %state.id,
            guild_id = %state.guild_id,
            offenders = negotiation.initial_offenders().len(),
            limit = state.stream_limit,
            "stream limit exceeded, conflict negotiation opened"
        );

        if let Some(previous) = state.negotiation.as_mut() {
            previous.release();
        }
        state.negotiation = Some(negotiation);
        self.arm_timer(state.id, id, cancel);
        Ok(true)
    }

    /// Re-evaluate the channel's negotiation against the live streamer set.
    /// Closes it with a resolution notice once enough offenders have stopped.
    pub async fn refresh(
        &self,
        state: &mut ChannelState,
        live: &HashSet<MemberId>,
    ) -> Option<NegotiationState> {
        let negotiation = state.negotiation.as_mut()?;
        if negotiation.is_closed() {
            state.negotiation = None;
            return None;
        }

        let status = negotiation.observe(live);
        match status {
            NegotiationState::Open => {
                if let Some(message) = negotiation.message() {
                    let update = notice::conflict_status(
                        negotiation.still_streaming(),
                        negotiation.agreed().len(),
                        negotiation.required_agreements(),
                        negotiation.deadline(),
                    );
                    if let Err(e) = self.platform.edit_message(message, &update).await {
                        warn!(channel_id = %state.id, error = %e, "failed to update conflict status");
                    }
                }
            }
            NegotiationState::AgreementReached => {
                self.conclude_agreement(negotiation).await;
                state.negotiation = None;
            }
            NegotiationState::TimedOut | NegotiationState::Closed => {}
        }
        Some(status)
    }

    async fn conclude_agreement(&self, negotiation: &mut ConflictNegotiation) {
        if let Some(message) = negotiation.message() {
            let resolved = notice::conflict_resolved(negotiation.agreed(), self.settings.message_ttl);
            if let Err(e) = self.platform.edit_message(message, &resolved).await {
                warn!(channel_id = %negotiation.channel_id(), error = %e, "failed to post conflict resolution");
            }
        }
        negotiation.close(Resolution::Agreement);
        info!(
            channel_id = %negotiation.channel_id(),
            agreed = negotiation.agreed().len(),
            "stream conflict resolved by agreement"
        );
    }

    fn arm_timer(self: &Arc<Self>, channel_id: ChannelId, negotiation_id: u64, cancel: CancellationToken) {
        let negotiator = Arc::clone(self);
        let timeout = self.settings.timeout;
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(%channel_id, negotiation_id, "conflict timer cancelled");
                }
                _ = tokio::time::sleep(timeout) => {
                    negotiator.expire(channel_id, negotiation_id).await;
                }
            }
        });
    }

    /// Timeout handler. Disconnects every original offender still live, then
    /// closes the negotiation. A no-op if the negotiation already finished or
    /// was replaced, so firing twice is harmless.
    ///
    /// Disconnects already in flight run to completion even during shutdown.
    pub async fn expire(&self, channel_id: ChannelId, negotiation_id: u64) -> Vec<MemberId> {
        let Some(handle) = self.registry.get(channel_id) else {
            return Vec::new();
        };

        let (guild_id, targets) = {
            let mut state = handle.lock().await;
            let guild_id = state.guild_id;
            let Some(negotiation) = state
                .negotiation
                .as_mut()
                .filter(|n| n.id() == negotiation_id && !n.is_finished())
            else {
                return Vec::new();
            };

            // Last look before disconnecting anyone.
            match self.platform.fetch_voice_channel(channel_id).await {
                Ok(snapshot) => {
                    negotiation.observe(&snapshot.streamer_set());
                }
                Err(e) => {
                    debug!(%channel_id, error = %e, "could not refresh streamers before timeout");
                }
            }

            if negotiation.state() == NegotiationState::AgreementReached {
                self.conclude_agreement(negotiation).await;
                state.negotiation = None;
                return Vec::new();
            }

            let Some(targets) = negotiation.time_out() else {
                return Vec::new();
            };

            if let Some(message) = negotiation.message() {
                let closing = notice::conflict_timed_out(&targets, self.settings.message_ttl);
                if let Err(e) = self.platform.edit_message(message, &closing).await {
                    warn!(%channel_id, error = %e, "failed to post conflict timeout");
                }
            }
            (guild_id, targets)
        };

        warn!(
            %channel_id,
            %guild_id,
            count = targets.len(),
            "stream conflict not resolved, disconnecting remaining streamers"
        );
        let removed = self.disconnect_all(guild_id, channel_id, &targets).await;

        let mut state = handle.lock().await;
        for member_id in &removed {
            state.discard(*member_id);
        }
        if state
            .negotiation
            .as_ref()
            .is_some_and(|n| n.id() == negotiation_id)
        {
            if let Some(mut negotiation) = state.negotiation.take() {
                negotiation.close(Resolution::TimedOut);
            }
        }
        removed
    }

    /// Disconnect members concurrently; one failure never blocks the others.
    /// Returns the members that are out of the channel afterwards.
    async fn disconnect_all(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        members: &[MemberId],
    ) -> Vec<MemberId> {
        let reason = notice::kick_reason(channel_id);
        let attempts = members.iter().copied().map(|member_id| {
            let reason = reason.as_str();
            async move {
                match self.platform.member_voice(guild_id, member_id).await {
                    Ok(Some(voice)) if voice.channel_id == Some(channel_id) => {}
                    Ok(_) => return Some(member_id),
                    Err(e) => {
                        debug!(%member_id, error = %e, "voice lookup failed, disconnecting anyway");
                    }
                }

                let result = self
                    .settings
                    .kick_retry
                    .run(
                        || self.platform.disconnect_member(guild_id, member_id, reason),
                        DeliveryError::is_transient,
                    )
                    .await;
                match result {
                    Ok(()) => Some(member_id),
                    Err(e) => {
                        warn!(%channel_id, %member_id, error = %e, "failed to disconnect streamer");
                        None
                    }
                }
            }
        });
        join_all(attempts).await.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::FakePlatform;

    fn members(ids: &[u64]) -> Vec<MemberId> {
        ids.iter().copied().map(MemberId).collect()
    }

    fn live(ids: &[u64]) -> HashSet<MemberId> {
        ids.iter().copied().map(MemberId).collect()
    }

    fn negotiation(offenders: &[u64], limit: u32) -> ConflictNegotiation {
        ConflictNegotiation::open(
            1,
            ChannelId(100),
            GuildId(1),
            limit,
            members(offenders),
            DEFAULT_TIMEOUT,
            CancellationToken::new(),
        )
    }

    // ── State machine ───────────────────────────────────────────

    #[test]
    fn test_required_agreements() {
        assert_eq!(negotiation(&[1, 2, 3], 1).required_agreements(), 2);
        assert_eq!(negotiation(&[1, 2, 3], 2).required_agreements(), 1);
        assert_eq!(negotiation(&[1], 3).required_agreements(), 0);
    }

    #[test]
    fn test_any_two_of_three_reach_agreement_in_any_order() {
        let all = [1u64, 2, 3];
        for first in all {
            for second in all {
                if first == second {
                    continue;
                }
                let mut n = negotiation(&all, 1);

                let after_first: Vec<u64> = all.iter().copied().filter(|m| *m != first).collect();
                assert_eq!(n.observe(&live(&after_first)), NegotiationState::Open);
                assert_eq!(n.agreed(), &members(&[first])[..]);

                let remaining: Vec<u64> = after_first
                    .iter()
                    .copied()
                    .filter(|m| *m != second)
                    .collect();
                assert_eq!(
                    n.observe(&live(&remaining)),
                    NegotiationState::AgreementReached,
                    "stopping {first} then {second}"
                );
                assert_eq!(n.still_streaming(), &members(&remaining)[..]);
            }
        }
    }

    #[test]
    fn test_unrelated_streamers_do_not_count() {
        let mut n = negotiation(&[1, 2, 3], 1);
        // 4 joins the stream, 1 stops: still only one agreement.
        assert_eq!(n.observe(&live(&[2, 3, 4])), NegotiationState::Open);
        assert_eq!(n.agreed(), &members(&[1])[..]);
        assert_eq!(n.still_streaming(), &members(&[2, 3])[..]);
    }

    #[test]
    fn test_observe_preserves_offender_order() {
        let mut n = negotiation(&[3, 1, 2], 2);
        n.observe(&live(&[2, 3]));
        assert_eq!(n.still_streaming(), &members(&[3, 2])[..]);
        assert_eq!(n.agreed(), &members(&[1])[..]);
    }

    #[test]
    fn test_time_out_only_once() {
        let token = CancellationToken::new();
        let mut n = ConflictNegotiation::open(
            1,
            ChannelId(1),
            GuildId(1),
            1,
            members(&[1, 2]),
            DEFAULT_TIMEOUT,
            token.clone(),
        );
        assert_eq!(n.time_out(), Some(members(&[1, 2])));
        assert_eq!(n.state(), NegotiationState::TimedOut);
        assert_eq!(n.time_out(), None);

        assert!(n.close(Resolution::TimedOut));
        assert!(!n.close(Resolution::TimedOut));
        assert_eq!(n.time_out(), None);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_finished_negotiation_ignores_updates() {
        let mut n = negotiation(&[1, 2], 1);
        n.release();
        assert_eq!(n.observe(&live(&[])), NegotiationState::Closed);
        assert!(n.agreed().is_empty());
        assert_eq!(n.resolution(), Some(Resolution::Released));
    }

    // ── Driver ──────────────────────────────────────────────────

    fn negotiator(platform: Arc<FakePlatform>, registry: Arc<ChannelRegistry>) -> Arc<Negotiator> {
        Arc::new(Negotiator::new(
            registry,
            platform,
            TaskTracker::new(),
            CancellationToken::new(),
            NegotiationSettings {
                kick_retry: RetryPolicy::immediate(2),
                ..NegotiationSettings::default()
            },
        ))
    }

    fn crowded_channel(platform: &FakePlatform, streamers: &[u64]) {
        platform.add_channel(GuildId(1), ChannelId(100), "lounge");
        for id in streamers {
            platform.join(ChannelId(100), MemberId(*id), true);
        }
    }

    #[tokio::test]
    async fn test_open_posts_status_and_is_not_reopened() {
        let platform = Arc::new(FakePlatform::new());
        crowded_channel(&platform, &[1, 2, 3]);
        let registry = Arc::new(ChannelRegistry::new());
        let negotiator = negotiator(Arc::clone(&platform), Arc::clone(&registry));

        let mut state = ChannelState::new(ChannelId(100), GuildId(1), true, 1);
        assert!(negotiator.open(&mut state, members(&[1, 2, 3])).await.unwrap());
        assert!(state.has_open_negotiation());
        assert_eq!(platform.channel_posts().len(), 1);
        assert!(platform.channel_posts()[0].1.content.contains("0 / 2"));

        assert!(!negotiator.open(&mut state, members(&[1, 2, 3])).await.unwrap());
        assert_eq!(platform.channel_posts().len(), 1);
    }

    #[tokio::test]
    async fn test_open_spawn_failure_installs_nothing() {
        let platform = Arc::new(FakePlatform::new());
        crowded_channel(&platform, &[1, 2]);
        platform.fail_channel_send(ChannelId(100), vec![DeliveryError::Http("500".into())]);
        let negotiator = negotiator(Arc::clone(&platform), Arc::new(ChannelRegistry::new()));

        let mut state = ChannelState::new(ChannelId(100), GuildId(1), true, 1);
        let err = negotiator.open(&mut state, members(&[1, 2])).await.unwrap_err();
        assert!(matches!(err, NegotiationError::SpawnFailed { .. }));
        assert!(state.negotiation.is_none());
    }

    #[tokio::test]
    async fn test_refresh_closes_on_agreement() {
        let platform = Arc::new(FakePlatform::new());
        crowded_channel(&platform, &[1, 2, 3]);
        let negotiator = negotiator(Arc::clone(&platform), Arc::new(ChannelRegistry::new()));

        let mut state = ChannelState::new(ChannelId(100), GuildId(1), true, 1);
        negotiator.open(&mut state, members(&[1, 2, 3])).await.unwrap();

        let status = negotiator.refresh(&mut state, &live(&[2, 3])).await;
        assert_eq!(status, Some(NegotiationState::Open));
        assert!(state.has_open_negotiation());

        let status = negotiator.refresh(&mut state, &live(&[3])).await;
        assert_eq!(status, Some(NegotiationState::AgreementReached));
        assert!(state.negotiation.is_none());

        let edits = platform.edits();
        let last = &edits.last().unwrap().1;
        assert!(last.content.starts_with("Conflict is resolved"));
        assert!(last.delete_after.is_some());
        assert!(platform.disconnected().is_empty());
    }

    #[tokio::test]
    async fn test_expire_disconnects_remaining_and_is_idempotent() {
        let platform = Arc::new(FakePlatform::new());
        crowded_channel(&platform, &[1, 2, 3]);
        let registry = Arc::new(ChannelRegistry::new());
        let negotiator = negotiator(Arc::clone(&platform), Arc::clone(&registry));

        let mut state = ChannelState::new(ChannelId(100), GuildId(1), true, 1);
        state.seed_streamers(&members(&[1, 2, 3]));
        negotiator.open(&mut state, members(&[1, 2, 3])).await.unwrap();
        let id = state.negotiation.as_ref().unwrap().id();
        registry.put(state);

        // 2 stops on their own before the window closes; not enough.
        platform.set_streaming(ChannelId(100), MemberId(2), false);

        let mut removed = negotiator.expire(ChannelId(100), id).await;
        removed.sort();
        assert_eq!(removed, members(&[1, 3]));

        let mut kicked = platform.disconnected();
        kicked.sort();
        assert_eq!(kicked, members(&[1, 3]));

        let view = registry.view(ChannelId(100)).await.unwrap();
        assert!(view.negotiation.is_none());
        assert_eq!(view.streamers.len(), 1);

        assert!(negotiator.expire(ChannelId(100), id).await.is_empty());
        assert_eq!(platform.disconnected().len(), 2);
    }

    #[tokio::test]
    async fn test_one_failed_disconnect_does_not_block_others() {
        let platform = Arc::new(FakePlatform::new());
        crowded_channel(&platform, &[1, 2, 3]);
        platform.fail_disconnect(MemberId(1), vec![DeliveryError::Forbidden("403".into())]);
        platform.fail_disconnect(
            MemberId(2),
            vec![DeliveryError::RateLimited("429".into())],
        );
        let registry = Arc::new(ChannelRegistry::new());
        let negotiator = negotiator(Arc::clone(&platform), Arc::clone(&registry));

        let mut state = ChannelState::new(ChannelId(100), GuildId(1), true, 2);
        negotiator.open(&mut state, members(&[1, 2, 3])).await.unwrap();
        let id = state.negotiation.as_ref().unwrap().id();
        registry.put(state);

        let mut removed = negotiator.expire(ChannelId(100), id).await;
        removed.sort();
        // 1 is forbidden, 2 succeeds on retry, 3 succeeds first time.
        assert_eq!(removed, members(&[2, 3]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_window() {
        let platform = Arc::new(FakePlatform::new());
        crowded_channel(&platform, &[1, 2]);
        let registry = Arc::new(ChannelRegistry::new());
        let negotiator = negotiator(Arc::clone(&platform), Arc::clone(&registry));

        let handle = registry.put(ChannelState::new(ChannelId(100), GuildId(1), true, 1));
        {
            let mut state = handle.lock().await;
            negotiator.open(&mut state, members(&[1, 2])).await.unwrap();
        }

        tokio::time::sleep(DEFAULT_TIMEOUT - Duration::from_secs(1)).await;
        assert!(platform.disconnected().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        negotiator.tracker.close();
        negotiator.tracker.wait().await;
        assert_eq!(platform.disconnected().len(), 2);
        assert!(handle.lock().await.negotiation.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_cancels_timer() {
        let platform = Arc::new(FakePlatform::new());
        crowded_channel(&platform, &[1, 2]);
        let registry = Arc::new(ChannelRegistry::new());
        let negotiator = negotiator(Arc::clone(&platform), Arc::clone(&registry));

        let handle = registry.put(ChannelState::new(ChannelId(100), GuildId(1), true, 1));
        {
            let mut state = handle.lock().await;
            negotiator.open(&mut state, members(&[1, 2])).await.unwrap();
        }
        registry.remove(&[ChannelId(100)]).await;

        tokio::time::sleep(DEFAULT_TIMEOUT * 2).await;
        negotiator.tracker.close();
        negotiator.tracker.wait().await;
        assert!(platform.disconnected().is_empty());
    }
}
