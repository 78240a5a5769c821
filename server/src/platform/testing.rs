//! Scripted in-memory [`VoicePlatform`] for tests.
//!
//! Holds a set of voice channels and their members, applies disconnects the
//! way the real platform would, and records everything the engine sent.
//! Failures are scripted per target and consumed one per call.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    DeliveryError, FetchError, MessageRef, VoiceChannelSnapshot, VoiceMember, VoicePlatform,
    VoiceSnapshot, VoiceStateUpdate,
};
use crate::engine::ids::{ChannelId, GuildId, MemberId, MessageId};
use crate::engine::notice::Notice;

#[derive(Default)]
struct FakeState {
    channels: HashMap<ChannelId, VoiceChannelSnapshot>,
    fetch_errors: HashMap<ChannelId, FetchError>,
    disconnect_errors: HashMap<MemberId, VecDeque<DeliveryError>>,
    direct_errors: HashMap<MemberId, VecDeque<DeliveryError>>,
    channel_errors: HashMap<ChannelId, VecDeque<DeliveryError>>,
    disconnected: Vec<MemberId>,
    direct: Vec<(MemberId, Notice)>,
    posts: Vec<(ChannelId, Notice)>,
    edits: Vec<(MessageRef, Notice)>,
    fetches: usize,
    next_message: u64,
}

impl FakeState {
    fn locate(&self, member_id: MemberId) -> Option<(ChannelId, VoiceMember)> {
        self.channels.values().find_map(|channel| {
            channel
                .members
                .iter()
                .find(|m| m.id == member_id)
                .map(|m| (channel.id, *m))
        })
    }

    fn snapshot_of(&self, member_id: MemberId) -> VoiceSnapshot {
        self.locate(member_id)
            .map(|(channel, m)| VoiceSnapshot::in_channel(channel, m.is_streaming))
            .unwrap_or_default()
    }

    fn guild_of(&self, channel_id: ChannelId) -> GuildId {
        self.channels
            .get(&channel_id)
            .map(|c| c.guild_id)
            .unwrap_or(GuildId(0))
    }

    fn remove_member(&mut self, member_id: MemberId) -> Option<VoiceMember> {
        for channel in self.channels.values_mut() {
            if let Some(pos) = channel.members.iter().position(|m| m.id == member_id) {
                return Some(channel.members.remove(pos));
            }
        }
        None
    }

    fn set_streaming(&mut self, member_id: MemberId, streaming: bool) {
        for channel in self.channels.values_mut() {
            if let Some(member) = channel.members.iter_mut().find(|m| m.id == member_id) {
                member.is_streaming = streaming;
            }
        }
    }

    fn place(&mut self, channel_id: ChannelId, member: VoiceMember) {
        self.remove_member(member.id);
        if let Some(channel) = self.channels.get_mut(&channel_id) {
            channel.members.push(member);
        }
    }

    fn message(&mut self, channel_id: ChannelId) -> MessageRef {
        self.next_message += 1;
        MessageRef {
            channel_id,
            message_id: MessageId(self.next_message),
        }
    }
}

fn next_failure<K: std::hash::Hash + Eq>(
    failures: &mut HashMap<K, VecDeque<DeliveryError>>,
    key: &K,
) -> Option<DeliveryError> {
    failures.get_mut(key).and_then(VecDeque::pop_front)
}

#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<FakeState>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_channel(&self, guild_id: GuildId, channel_id: ChannelId, name: &str) {
        self.state.lock().channels.insert(
            channel_id,
            VoiceChannelSnapshot {
                id: channel_id,
                guild_id,
                name: name.to_string(),
                members: Vec::new(),
            },
        );
    }

    pub fn remove_channel(&self, channel_id: ChannelId) {
        self.state.lock().channels.remove(&channel_id);
    }

    /// Put a member in a channel without producing an event.
    pub fn join(&self, channel_id: ChannelId, member_id: MemberId, streaming: bool) {
        self.state.lock().place(
            channel_id,
            VoiceMember {
                id: member_id,
                is_bot: false,
                is_streaming: streaming,
            },
        );
    }

    pub fn join_bot(&self, channel_id: ChannelId, member_id: MemberId, streaming: bool) {
        self.state.lock().place(
            channel_id,
            VoiceMember {
                id: member_id,
                is_bot: true,
                is_streaming: streaming,
            },
        );
    }

    pub fn set_streaming(&self, channel_id: ChannelId, member_id: MemberId, streaming: bool) {
        let mut state = self.state.lock();
        if let Some(channel) = state.channels.get_mut(&channel_id)
            && let Some(member) = channel.members.iter_mut().find(|m| m.id == member_id)
        {
            member.is_streaming = streaming;
        }
    }

    fn transition(
        &self,
        member_id: MemberId,
        apply: impl FnOnce(&mut FakeState),
    ) -> VoiceStateUpdate {
        let mut state = self.state.lock();
        let before = state.snapshot_of(member_id);
        apply(&mut *state);
        let after = state.snapshot_of(member_id);
        let guild_id = after
            .channel_id
            .or(before.channel_id)
            .map(|c| state.guild_of(c))
            .unwrap_or(GuildId(0));
        VoiceStateUpdate {
            guild_id,
            member_id,
            is_bot: false,
            before,
            after,
        }
    }

    /// Start streaming in `channel_id`, joining it silently first if needed.
    pub fn go_live(&self, channel_id: ChannelId, member_id: MemberId) -> VoiceStateUpdate {
        if self.state.lock().snapshot_of(member_id).channel_id != Some(channel_id) {
            self.join(channel_id, member_id, false);
        }
        self.transition(member_id, |state| state.set_streaming(member_id, true))
    }

    pub fn stop_streaming(&self, member_id: MemberId) -> VoiceStateUpdate {
        self.transition(member_id, |state| state.set_streaming(member_id, false))
    }

    /// Move to another channel keeping the current stream state.
    pub fn move_to(&self, member_id: MemberId, channel_id: ChannelId) -> VoiceStateUpdate {
        self.transition(member_id, |state| {
            if let Some((_, member)) = state.locate(member_id) {
                state.place(channel_id, member);
            }
        })
    }

    pub fn leave(&self, member_id: MemberId) -> VoiceStateUpdate {
        self.transition(member_id, |state| {
            state.remove_member(member_id);
        })
    }

    pub fn fail_fetch(&self, channel_id: ChannelId, error: FetchError) {
        self.state.lock().fetch_errors.insert(channel_id, error);
    }

    pub fn heal_fetch(&self, channel_id: ChannelId) {
        self.state.lock().fetch_errors.remove(&channel_id);
    }

    pub fn fail_disconnect(&self, member_id: MemberId, errors: Vec<DeliveryError>) {
        self.state
            .lock()
            .disconnect_errors
            .entry(member_id)
            .or_default()
            .extend(errors);
    }

    pub fn fail_direct(&self, member_id: MemberId, errors: Vec<DeliveryError>) {
        self.state
            .lock()
            .direct_errors
            .entry(member_id)
            .or_default()
            .extend(errors);
    }

    pub fn fail_channel_send(&self, channel_id: ChannelId, errors: Vec<DeliveryError>) {
        self.state
            .lock()
            .channel_errors
            .entry(channel_id)
            .or_default()
            .extend(errors);
    }

    pub fn disconnected(&self) -> Vec<MemberId> {
        self.state.lock().disconnected.clone()
    }

    pub fn direct_messages(&self) -> Vec<(MemberId, Notice)> {
        self.state.lock().direct.clone()
    }

    pub fn channel_posts(&self) -> Vec<(ChannelId, Notice)> {
        self.state.lock().posts.clone()
    }

    pub fn edits(&self) -> Vec<(MessageRef, Notice)> {
        self.state.lock().edits.clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.state.lock().fetches
    }
}

#[async_trait]
impl VoicePlatform for FakePlatform {
    async fn fetch_voice_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<VoiceChannelSnapshot, FetchError> {
        let mut state = self.state.lock();
        state.fetches += 1;
        if let Some(error) = state.fetch_errors.get(&channel_id) {
            return Err(error.clone());
        }
        state
            .channels
            .get(&channel_id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(format!("channel {channel_id}")))
    }

    async fn member_voice(
        &self,
        _guild_id: GuildId,
        member_id: MemberId,
    ) -> Result<Option<VoiceSnapshot>, FetchError> {
        let state = self.state.lock();
        Ok(state
            .locate(member_id)
            .map(|(channel, m)| VoiceSnapshot::in_channel(channel, m.is_streaming)))
    }

    async fn disconnect_member(
        &self,
        _guild_id: GuildId,
        member_id: MemberId,
        _reason: &str,
    ) -> Result<(), DeliveryError> {
        let mut state = self.state.lock();
        if let Some(error) = next_failure(&mut state.disconnect_errors, &member_id) {
            return Err(error);
        }
        state.remove_member(member_id);
        state.disconnected.push(member_id);
        Ok(())
    }

    async fn send_direct(
        &self,
        member_id: MemberId,
        notice: &Notice,
    ) -> Result<MessageRef, DeliveryError> {
        let mut state = self.state.lock();
        if let Some(error) = next_failure(&mut state.direct_errors, &member_id) {
            return Err(error);
        }
        state.direct.push((member_id, notice.clone()));
        Ok(state.message(ChannelId(member_id.get())))
    }

    async fn send_to_channel(
        &self,
        channel_id: ChannelId,
        notice: &Notice,
    ) -> Result<MessageRef, DeliveryError> {
        let mut state = self.state.lock();
        if let Some(error) = next_failure(&mut state.channel_errors, &channel_id) {
            return Err(error);
        }
        state.posts.push((channel_id, notice.clone()));
        Ok(state.message(channel_id))
    }

    async fn edit_message(&self, message: MessageRef, notice: &Notice) -> Result<(), DeliveryError> {
        self.state.lock().edits.push((message, notice.clone()));
        Ok(())
    }
}
