//! Aligns the channel registry with stored configuration and live voice state.
//!
//! Channels are first *staged* as unhandled, then a drain resolves each one
//! against the platform and commits it into the registry. The same drain
//! serves startup recovery and later setup changes; a failure on one channel
//! never holds up the others.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channel::ChannelState;
use super::error::NegotiationError;
use super::ids::{ChannelId, GuildId, MemberId};
use super::negotiation::Negotiator;
use super::registry::ChannelRegistry;
use crate::platform::{KnownGuild, VoicePlatform};
use crate::store::{ChannelRemoval, ConfigStore, GuildConfig, StoreError};

/// A channel waiting to be reconciled, as described by its guild's config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedChannel {
    pub id: ChannelId,
    pub guild_id: GuildId,
    pub watch: bool,
    pub stream_limit: u32,
}

impl StagedChannel {
    pub fn from_config(config: &GuildConfig) -> Vec<Self> {
        config
            .channels
            .iter()
            .map(|(&id, &stream_limit)| Self {
                id,
                guild_id: config.id,
                watch: config.watch,
                stream_limit,
            })
            .collect()
    }
}

/// What one drain did with each staged channel.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub committed: Vec<ChannelId>,
    /// Staged with `watch = false` and dropped from the registry.
    pub released: Vec<ChannelId>,
    /// Left unhandled after a transient failure.
    pub deferred: Vec<ChannelId>,
    /// Gone or inaccessible; queued for removal from storage.
    pub removed: Vec<ChannelId>,
}

enum Resolution {
    Committed,
    Released,
    Deferred,
    Removed,
}

pub struct Reconciler {
    store: Arc<ConfigStore>,
    registry: Arc<ChannelRegistry>,
    platform: Arc<dyn VoicePlatform>,
    negotiator: Arc<Negotiator>,
    unhandled: parking_lot::Mutex<HashMap<ChannelId, StagedChannel>>,
    wake: Notify,
    ready: AtomicBool,
}

impl Reconciler {
    pub fn new(
        store: Arc<ConfigStore>,
        registry: Arc<ChannelRegistry>,
        platform: Arc<dyn VoicePlatform>,
        negotiator: Arc<Negotiator>,
    ) -> Self {
        Self {
            store,
            registry,
            platform,
            negotiator,
            unhandled: parking_lot::Mutex::new(HashMap::new()),
            wake: Notify::new(),
            ready: AtomicBool::new(false),
        }
    }

    /// Set once the first drain has finished. Commands are refused until then.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Stage channels for the next drain, replacing earlier staged versions.
    pub fn stage(&self, channels: impl IntoIterator<Item = StagedChannel>) {
        let mut unhandled = self.unhandled.lock();
        for channel in channels {
            unhandled.insert(channel.id, channel);
        }
    }

    pub fn unstage(&self, ids: &[ChannelId]) {
        let mut unhandled = self.unhandled.lock();
        for id in ids {
            unhandled.remove(id);
        }
    }

    pub fn unhandled(&self) -> Vec<StagedChannel> {
        let mut staged: Vec<StagedChannel> = self.unhandled.lock().values().copied().collect();
        staged.sort_by_key(|s| s.id);
        staged
    }

    /// Wake the loop. Signals sent while a drain is running collapse into one
    /// more drain.
    pub fn signal(&self) {
        self.wake.notify_one();
    }

    /// Stage every watched channel from the one-shot startup scan.
    pub async fn bootstrap(&self, known: &[KnownGuild]) -> Result<usize, StoreError> {
        info!(guilds = known.len(), "loading guild configs");
        let mut configs = pin!(self.store.get_all_guild_configs(known)?);

        let mut staged = 0;
        while let Some(config) = configs.next().await {
            if !config.watch {
                continue;
            }
            let channels = StagedChannel::from_config(&config);
            info!(guild_id = %config.id, channels = channels.len(), "staged channels from stored config");
            staged += channels.len();
            self.stage(channels);
        }
        Ok(staged)
    }

    /// Resolve every staged channel once.
    pub async fn drain(&self) -> DrainReport {
        let mut batch = self.unhandled();
        batch.sort_by_key(|s| (s.guild_id, s.id));

        let mut report = DrainReport::default();
        let mut removals = Vec::new();

        for staged in batch {
            if !self.is_current(&staged) {
                continue;
            }
            let resolution = self.resolve(&staged).await;
            let handled = match resolution {
                Resolution::Committed => {
                    report.committed.push(staged.id);
                    true
                }
                Resolution::Released => {
                    report.released.push(staged.id);
                    true
                }
                Resolution::Deferred => {
                    report.deferred.push(staged.id);
                    false
                }
                Resolution::Removed => {
                    report.removed.push(staged.id);
                    removals.push(ChannelRemoval {
                        channel_id: staged.id,
                        guild_id: staged.guild_id,
                    });
                    true
                }
            };

            if handled {
                let mut unhandled = self.unhandled.lock();
                // Re-staged while we worked on it: leave the newer entry for the next drain.
                if unhandled.get(&staged.id) == Some(&staged) {
                    unhandled.remove(&staged.id);
                }
            }
        }

        if !removals.is_empty() {
            self.registry.remove(&report.removed).await;
            self.store.remove_invalid_channels(&removals).await;
        }

        if !self.ready.swap(true, Ordering::AcqRel) {
            info!(channels = self.registry.len(), "initial reconciliation complete");
        }
        debug!(?report, "reconciliation pass finished");
        report
    }

    fn is_current(&self, staged: &StagedChannel) -> bool {
        self.unhandled.lock().get(&staged.id) == Some(staged)
    }

    async fn resolve(&self, staged: &StagedChannel) -> Resolution {
        if !staged.watch {
            self.registry.remove(&[staged.id]).await;
            return Resolution::Released;
        }

        let snapshot = match self.platform.fetch_voice_channel(staged.id).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_permanent() => {
                warn!(channel_id = %staged.id, guild_id = %staged.guild_id, error = %e, "channel unavailable, removing from config");
                return Resolution::Removed;
            }
            Err(e) => {
                warn!(channel_id = %staged.id, error = %e, "channel fetch failed, will retry on next pass");
                return Resolution::Deferred;
            }
        };

        if !self.is_current(staged) {
            return Resolution::Deferred;
        }

        let live = snapshot.streamers();
        match self.commit(staged, live).await {
            Ok(true) => {
                info!(channel_id = %staged.id, limit = staged.stream_limit, "channel enforced");
                Resolution::Committed
            }
            Ok(false) => {
                debug!(channel_id = %staged.id, "channel re-staged or dropped during commit");
                Resolution::Deferred
            }
            Err(e @ NegotiationError::ChannelUnavailable { .. }) => {
                warn!(error = %e, "removing channel from config");
                Resolution::Removed
            }
            Err(e @ NegotiationError::SpawnFailed { .. }) => {
                warn!(error = %e, "channel left unhandled");
                Resolution::Deferred
            }
        }
    }

    /// Fold the staged settings and live streamers into the channel's state.
    /// A new channel is only registered once everything succeeded.
    ///
    /// Returns `Ok(false)` when the staged entry changed or was unstaged while
    /// the notice was being posted. Any negotiation opened on the way is
    /// released and nothing is registered.
    async fn commit(&self, staged: &StagedChannel, live: Vec<MemberId>) -> Result<bool, NegotiationError> {
        if let Some(handle) = self.registry.get(staged.id) {
            let mut state = handle.lock().await;
            self.prepare(&mut state, staged, live).await?;
            if !self.is_current(staged) {
                state.release_negotiation();
                return Ok(false);
            }
            return Ok(true);
        }

        let mut state = ChannelState::new(staged.id, staged.guild_id, true, staged.stream_limit);
        self.prepare(&mut state, staged, live).await?;

        // Checked and registered under the unhandled lock, so an unstage
        // either lands first or finds the entry in the registry.
        let rejected = {
            let unhandled = self.unhandled.lock();
            if unhandled.get(&staged.id) == Some(staged) {
                self.registry.put(state);
                None
            } else {
                Some(state)
            }
        };
        match rejected {
            Some(mut state) => {
                state.release_negotiation();
                Ok(false)
            }
            None => Ok(true),
        }
    }

    async fn prepare(
        &self,
        state: &mut ChannelState,
        staged: &StagedChannel,
        live: Vec<MemberId>,
    ) -> Result<(), NegotiationError> {
        state.guild_id = staged.guild_id;
        state.watch = true;
        state.stream_limit = staged.stream_limit;

        // A negotiation opened against another limit has the wrong quota.
        if state
            .negotiation
            .as_ref()
            .is_some_and(|n| n.limit() != staged.stream_limit)
            && state.release_negotiation().is_some()
        {
            debug!(channel_id = %staged.id, limit = staged.stream_limit, "limit changed, conflict negotiation released");
        }

        if state.has_open_negotiation() {
            let live_set = live.iter().copied().collect();
            self.negotiator.refresh(state, &live_set).await;
        } else if live.len() > staged.stream_limit as usize {
            self.negotiator.open(state, live.clone()).await?;
        } else if live.is_empty() {
            debug!(channel_id = %staged.id, "no streamers found");
        }

        let seeded = state.seed_streamers(&live);
        if seeded > 0 {
            debug!(channel_id = %staged.id, seeded, "recovered streamer sessions");
        }
        Ok(())
    }

    /// Drain, then wait for a signal, until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.drain() => {}
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
            }
        }
        info!("reconciliation loop stopped");
    }
}
