use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::info;

use super::channel::{ChannelState, ChannelView};
use super::ids::{ChannelId, GuildId};

/// Shared, lockable entry for one channel. The lock covers the
/// read-compute-write of streamers and negotiation for that channel.
pub type ChannelHandle = Arc<Mutex<ChannelState>>;

/// Process-wide map of enforced channels, keyed by channel id.
///
/// Constructed once by the service and handed to every component that needs it.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<ChannelId, ChannelHandle>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ChannelId) -> Option<ChannelHandle> {
        // Clone the Arc so the shard lock is released before anyone awaits.
        self.channels.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.channels.contains_key(&id)
    }

    /// Insert or replace the entry for `state.id`, returning the new handle.
    pub fn put(&self, state: ChannelState) -> ChannelHandle {
        let id = state.id;
        let handle = Arc::new(Mutex::new(state));
        self.channels.insert(id, Arc::clone(&handle));
        handle
    }

    /// Remove channels, releasing any negotiation they still carry.
    ///
    /// Released negotiations disconnect nobody: the channel is gone or no longer watched.
    pub async fn remove(&self, ids: &[ChannelId]) -> Vec<ChannelView> {
        let mut removed = Vec::new();
        for id in ids {
            let Some((_, handle)) = self.channels.remove(id) else {
                continue;
            };
            let mut state = handle.lock().await;
            let released = state.release_negotiation();
            state.watch = false;

            let mut view = state.view();
            view.negotiation = released.as_ref().map(|n| n.summary());
            removed.push(view);
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "voice channels no longer enforced");
        }
        removed
    }

    /// Snapshot a channel for status reporting.
    pub async fn view(&self, id: ChannelId) -> Option<ChannelView> {
        let handle = self.get(id)?;
        let state = handle.lock().await;
        Some(state.view())
    }

    pub fn ids(&self) -> Vec<ChannelId> {
        self.channels.iter().map(|entry| *entry.key()).collect()
    }

    /// Channel ids registered for a guild.
    pub async fn ids_for_guild(&self, guild_id: GuildId) -> Vec<ChannelId> {
        let handles: Vec<(ChannelId, ChannelHandle)> = self
            .channels
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut ids = Vec::new();
        for (id, handle) in handles {
            if handle.lock().await.guild_id == guild_id {
                ids.push(id);
            }
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
