//! Boundary to the hosting chat platform.
//!
//! The engine never talks to a gateway or HTTP API directly. Everything it
//! needs (voice channel lookups, moving members out of voice, posting and
//! editing notices) goes through [`VoicePlatform`], and every inbound voice
//! change arrives as a [`VoiceStateUpdate`].

pub mod error;

#[cfg(feature = "discord")]
pub mod discord;

#[cfg(test)]
pub mod testing;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::engine::ids::{ChannelId, GuildId, MemberId, MessageId};
use crate::engine::notice::Notice;

pub use error::{DeliveryError, FetchError};

/// One side of a voice-state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoiceSnapshot {
    pub channel_id: Option<ChannelId>,
    pub is_streaming: bool,
}

impl VoiceSnapshot {
    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn in_channel(channel_id: ChannelId, is_streaming: bool) -> Self {
        Self {
            channel_id: Some(channel_id),
            is_streaming,
        }
    }
}

/// Inbound voice-state change for a single member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceStateUpdate {
    pub guild_id: GuildId,
    pub member_id: MemberId,
    pub is_bot: bool,
    pub before: VoiceSnapshot,
    pub after: VoiceSnapshot,
}

/// A member currently connected to a voice channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceMember {
    pub id: MemberId,
    pub is_bot: bool,
    pub is_streaming: bool,
}

/// Live view of a voice channel and who is in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceChannelSnapshot {
    pub id: ChannelId,
    pub guild_id: GuildId,
    pub name: String,
    pub members: Vec<VoiceMember>,
}

impl VoiceChannelSnapshot {
    /// Human members that are currently going live, in platform order.
    pub fn streamers(&self) -> Vec<MemberId> {
        self.members
            .iter()
            .filter(|m| m.is_streaming && !m.is_bot)
            .map(|m| m.id)
            .collect()
    }

    pub fn streamer_set(&self) -> HashSet<MemberId> {
        self.streamers().into_iter().collect()
    }
}

/// Reference to a message the engine posted and may later edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

/// A guild the bot is a member of, with the voice channels that still exist in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownGuild {
    pub id: GuildId,
    pub voice_channels: HashSet<ChannelId>,
}

impl KnownGuild {
    pub fn new(id: GuildId, voice_channels: impl IntoIterator<Item = ChannelId>) -> Self {
        Self {
            id,
            voice_channels: voice_channels.into_iter().collect(),
        }
    }
}

/// Operations the engine consumes from the chat platform.
#[async_trait]
pub trait VoicePlatform: Send + Sync {
    /// Resolve a voice channel by id together with its current occupants.
    async fn fetch_voice_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<VoiceChannelSnapshot, FetchError>;

    /// Current voice state of a member, `None` if not connected to voice.
    async fn member_voice(
        &self,
        guild_id: GuildId,
        member_id: MemberId,
    ) -> Result<Option<VoiceSnapshot>, FetchError>;

    /// Forcibly move a member out of voice.
    async fn disconnect_member(
        &self,
        guild_id: GuildId,
        member_id: MemberId,
        reason: &str,
    ) -> Result<(), DeliveryError>;

    /// Send a direct message to a member.
    async fn send_direct(
        &self,
        member_id: MemberId,
        notice: &Notice,
    ) -> Result<MessageRef, DeliveryError>;

    /// Post a message in a channel.
    async fn send_to_channel(
        &self,
        channel_id: ChannelId,
        notice: &Notice,
    ) -> Result<MessageRef, DeliveryError>;

    /// Replace the content of a message posted earlier.
    async fn edit_message(&self, message: MessageRef, notice: &Notice)
    -> Result<(), DeliveryError>;
}
