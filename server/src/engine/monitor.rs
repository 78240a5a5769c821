//! Reaction to individual voice-state changes.
//!
//! [`classify`] turns a before/after pair into a stream event. The monitor
//! then updates the channel's tracked sessions under the channel lock and,
//! when a new stream pushes the channel over its limit, evicts the newcomer:
//! the member is moved out of voice and told why.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::channel::{Admission, ChannelState, StreamerSession};
use super::ids::{ChannelId, GuildId, MemberId};
use super::negotiation::Negotiator;
use super::notice;
use super::registry::ChannelRegistry;
use super::retry::RetryPolicy;
use crate::platform::{DeliveryError, VoicePlatform, VoiceSnapshot, VoiceStateUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTransition {
    /// Nothing changed about the member's stream.
    Ignored,
    /// The member is now live in `channel_id`. `left` is set when they moved
    /// there from another channel while streaming.
    Started {
        channel_id: ChannelId,
        left: Option<ChannelId>,
    },
    Stopped {
        channel_id: ChannelId,
    },
}

/// Classify a voice-state transition. The channel after the change wins for
/// starts, the channel before the change wins for stops.
pub fn classify(before: &VoiceSnapshot, after: &VoiceSnapshot) -> StreamTransition {
    match (before.channel_id, after.channel_id) {
        // Joining voice is never a stream start on its own.
        (None, Some(_)) | (None, None) => StreamTransition::Ignored,
        (Some(channel_id), None) => StreamTransition::Stopped { channel_id },
        (Some(from), Some(to)) => match (before.is_streaming, after.is_streaming) {
            (false, true) => StreamTransition::Started {
                channel_id: to,
                left: None,
            },
            (true, false) => StreamTransition::Stopped { channel_id: from },
            (true, true) => StreamTransition::Started {
                channel_id: to,
                left: (from != to).then_some(from),
            },
            (false, false) => StreamTransition::Ignored,
        },
    }
}

/// What happened to a member evicted for exceeding the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcement {
    /// Moved out of voice and notified.
    Disconnected,
    /// No longer live in the channel by the time we acted; only notified.
    NotInChannel,
    /// Not allowed to move the member; moderators were alerted in the channel.
    Forbidden,
    /// Delivery kept failing and the retry budget ran out.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    Ignored,
    /// The channel is not enforced.
    Unwatched,
    Tracked,
    Stopped,
    Evicted(Enforcement),
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Bounds re-attempts of a whole eviction after a transient failure.
    pub delivery_retry: RetryPolicy,
    /// Role mentioned when the bot may not move a member.
    pub moderator_role: Option<u64>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            delivery_retry: RetryPolicy::fixed(1, Duration::from_secs(3)),
            moderator_role: None,
        }
    }
}

pub struct VoiceStateMonitor {
    registry: Arc<ChannelRegistry>,
    platform: Arc<dyn VoicePlatform>,
    negotiator: Arc<Negotiator>,
    settings: MonitorSettings,
}

impl VoiceStateMonitor {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        platform: Arc<dyn VoicePlatform>,
        negotiator: Arc<Negotiator>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            registry,
            platform,
            negotiator,
            settings,
        }
    }

    pub async fn handle(&self, update: &VoiceStateUpdate) -> MonitorOutcome {
        if update.is_bot {
            return MonitorOutcome::Ignored;
        }

        match classify(&update.before, &update.after) {
            StreamTransition::Ignored => MonitorOutcome::Ignored,
            StreamTransition::Stopped { channel_id } => {
                self.on_stopped(channel_id, update.member_id).await
            }
            StreamTransition::Started { channel_id, left } => {
                if let Some(previous) = left {
                    self.on_stopped(previous, update.member_id).await;
                }
                self.on_started(update.guild_id, channel_id, update.member_id)
                    .await
            }
        }
    }

    async fn on_stopped(&self, channel_id: ChannelId, member_id: MemberId) -> MonitorOutcome {
        let Some(handle) = self.registry.get(channel_id) else {
            return MonitorOutcome::Unwatched;
        };
        let mut state = handle.lock().await;
        if !state.watch {
            return MonitorOutcome::Unwatched;
        }

        self.refresh_negotiation(&mut state).await;
        if state.discard(member_id) {
            debug!(%channel_id, %member_id, remaining = state.streamer_count(), "stream stopped");
        }
        MonitorOutcome::Stopped
    }

    async fn on_started(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        member_id: MemberId,
    ) -> MonitorOutcome {
        let Some(handle) = self.registry.get(channel_id) else {
            return MonitorOutcome::Unwatched;
        };

        let (limit, streamers) = {
            let mut state = handle.lock().await;
            if !state.watch {
                return MonitorOutcome::Unwatched;
            }
            self.refresh_negotiation(&mut state).await;

            match state.admit(StreamerSession::started(member_id)) {
                Admission::Admitted | Admission::AlreadyTracked => {
                    debug!(%channel_id, %member_id, count = state.streamer_count(), "stream started");
                    return MonitorOutcome::Tracked;
                }
                Admission::Evicted(_) => {
                    info!(%channel_id, %member_id, limit = state.stream_limit, "stream limit reached, evicting newest streamer");
                    (state.stream_limit, state.sorted_streamers())
                }
            }
        };

        let enforcement = self
            .enforce(guild_id, channel_id, member_id, limit, &streamers)
            .await;

        if matches!(enforcement, Enforcement::Forbidden | Enforcement::Failed) {
            // The member is still live, so the channel stays over its limit.
            let mut state = handle.lock().await;
            self.negotiate_excess(&mut state).await;
        }
        MonitorOutcome::Evicted(enforcement)
    }

    async fn refresh_negotiation(&self, state: &mut ChannelState) {
        if state.negotiation.is_none() {
            return;
        }
        match self.platform.fetch_voice_channel(state.id).await {
            Ok(snapshot) => {
                self.negotiator.refresh(state, &snapshot.streamer_set()).await;
            }
            Err(e) => debug!(channel_id = %state.id, error = %e, "could not refresh negotiation"),
        }
    }

    async fn negotiate_excess(&self, state: &mut ChannelState) {
        if !state.watch || state.has_open_negotiation() {
            return;
        }
        let live = match self.platform.fetch_voice_channel(state.id).await {
            Ok(snapshot) => snapshot.streamers(),
            Err(e) => {
                debug!(channel_id = %state.id, error = %e, "could not read live streamers");
                return;
            }
        };
        if let Err(e) = self.negotiator.open(state, live).await {
            warn!(channel_id = %state.id, error = %e, "conflict negotiation not started");
        }
    }

    /// Move the member out and tell them why, re-running the whole step after
    /// a transient failure.
    async fn enforce(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        member_id: MemberId,
        limit: u32,
        streamers: &[StreamerSession],
    ) -> Enforcement {
        let result = self
            .settings
            .delivery_retry
            .run(
                || self.enforce_once(guild_id, channel_id, member_id, limit, streamers),
                DeliveryError::is_transient,
            )
            .await;

        match result {
            Ok(enforcement) => enforcement,
            Err(e) => {
                warn!(%channel_id, %member_id, error = %e, "gave up enforcing stream limit");
                Enforcement::Failed
            }
        }
    }

    async fn enforce_once(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        member_id: MemberId,
        limit: u32,
        streamers: &[StreamerSession],
    ) -> Result<Enforcement, DeliveryError> {
        let still_live = match self.platform.member_voice(guild_id, member_id).await {
            Ok(voice) => voice.is_some_and(|v| v.channel_id == Some(channel_id) && v.is_streaming),
            Err(e) => {
                debug!(%member_id, error = %e, "voice lookup failed, disconnecting anyway");
                true
            }
        };

        let mut enforcement = Enforcement::NotInChannel;
        if still_live {
            let reason = notice::eviction_reason(channel_id);
            match self
                .platform
                .disconnect_member(guild_id, member_id, &reason)
                .await
            {
                Ok(()) => enforcement = Enforcement::Disconnected,
                Err(DeliveryError::Forbidden(e)) => {
                    warn!(%channel_id, %member_id, error = %e, "not allowed to disconnect streamer");
                    let alert = notice::kick_forbidden(
                        member_id,
                        channel_id,
                        Utc::now(),
                        self.settings.moderator_role,
                    );
                    if let Err(e) = self.platform.send_to_channel(channel_id, &alert).await {
                        warn!(%channel_id, error = %e, "failed to alert moderators");
                    }
                    return Ok(Enforcement::Forbidden);
                }
                Err(DeliveryError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let eviction = notice::eviction(member_id, channel_id, limit, streamers);
        match self.platform.send_direct(member_id, &eviction).await {
            Ok(_) => {}
            Err(DeliveryError::Forbidden(_) | DeliveryError::NotFound(_)) => {
                if let Err(e) = self.platform.send_to_channel(channel_id, &eviction).await {
                    warn!(%channel_id, %member_id, error = %e, "failed to deliver eviction notice");
                }
            }
            Err(e) => return Err(e),
        }
        Ok(enforcement)
    }
}
