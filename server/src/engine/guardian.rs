use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::channel::ChannelView;
use super::error::CommandError;
use super::ids::{ChannelId, GuildId};
use super::monitor::{MonitorOutcome, MonitorSettings, VoiceStateMonitor};
use super::negotiation::{NegotiationSettings, Negotiator};
use super::reconcile::{Reconciler, StagedChannel};
use super::registry::ChannelRegistry;
use super::validation::validate_setup;
use crate::platform::{KnownGuild, VoicePlatform, VoiceStateUpdate};
use crate::store::{ConfigStore, GuildConfig, StoreError};

#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub negotiation: NegotiationSettings,
    pub monitor: MonitorSettings,
}

/// Owns the enforcement engine for every guild and is the single entry point
/// for platform events and commands.
pub struct Guardian {
    store: Arc<ConfigStore>,
    registry: Arc<ChannelRegistry>,
    reconciler: Arc<Reconciler>,
    monitor: VoiceStateMonitor,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Guardian {
    pub fn new(
        store: Arc<ConfigStore>,
        platform: Arc<dyn VoicePlatform>,
        settings: EngineSettings,
    ) -> Self {
        let registry = Arc::new(ChannelRegistry::new());
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();

        let negotiator = Arc::new(Negotiator::new(
            Arc::clone(&registry),
            Arc::clone(&platform),
            tracker.clone(),
            shutdown.clone(),
            settings.negotiation,
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&platform),
            Arc::clone(&negotiator),
        ));
        let monitor = VoiceStateMonitor::new(
            Arc::clone(&registry),
            platform,
            negotiator,
            settings.monitor,
        );

        Self {
            store,
            registry,
            reconciler,
            monitor,
            tracker,
            shutdown,
        }
    }

    /// Recover from storage and start the reconciliation loop.
    ///
    /// `known` lists the guilds the bot is currently in; stored configs for
    /// anything else are cleaned up in the background.
    pub async fn start(&self, known: &[KnownGuild]) -> Result<(), StoreError> {
        let staged = self.reconciler.bootstrap(known).await?;
        info!(guilds = known.len(), staged, "guild configs loaded");

        let store = Arc::clone(&self.store);
        self.tracker.spawn(async move {
            let report = store.cleanup_pending().await;
            if !report.dropped.is_empty() {
                warn!(dropped = ?report.dropped, "startup cleanup incomplete, will retry on next start");
            }
        });

        let reconciler = Arc::clone(&self.reconciler);
        self.tracker.spawn(reconciler.run(self.shutdown.child_token()));
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.reconciler.is_ready()
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub async fn on_voice_state_update(&self, update: &VoiceStateUpdate) -> MonitorOutcome {
        if !self.is_ready() {
            return MonitorOutcome::Ignored;
        }
        self.monitor.handle(update).await
    }

    pub fn on_guild_join(&self, guild_id: GuildId) {
        info!(%guild_id, "joined guild");
    }

    /// Forget everything about a guild the bot was removed from.
    pub async fn on_guild_remove(&self, guild_id: GuildId) -> Result<(), StoreError> {
        if !self.is_ready() {
            return Ok(());
        }
        let config = self.store.get_guild_config(guild_id).await?;
        self.store.leave_guild(guild_id).await?;

        let mut channels: Vec<ChannelId> = config.channels.keys().copied().collect();
        for id in self.registry.ids_for_guild(guild_id).await {
            if !channels.contains(&id) {
                channels.push(id);
            }
        }
        self.reconciler.unstage(&channels);
        self.registry.remove(&channels).await;
        info!(%guild_id, channels = channels.len(), "left guild");
        Ok(())
    }

    pub async fn get_setup(&self, guild_id: GuildId) -> Result<GuildConfig, CommandError> {
        if !self.is_ready() {
            return Err(CommandError::NotReady);
        }
        Ok(self.store.get_guild_config(guild_id).await?)
    }

    /// Live state of every configured channel that is currently enforced.
    pub async fn get_status(&self, guild_id: GuildId) -> Result<Vec<ChannelView>, CommandError> {
        if !self.is_ready() {
            return Err(CommandError::NotReady);
        }
        let config = self.store.get_guild_config(guild_id).await?;
        if !config.watch {
            return Err(CommandError::NotWatching);
        }

        let mut views = Vec::with_capacity(config.channels.len());
        for &channel_id in config.channels.keys() {
            if let Some(view) = self.registry.view(channel_id).await {
                views.push(view);
            }
        }
        Ok(views)
    }

    /// Store a new setup and bring the registry in line with it.
    ///
    /// Returns `Ok(false)` if the write was not acknowledged, in which case
    /// nothing in memory changes.
    pub async fn apply_setup(&self, config: GuildConfig) -> Result<bool, CommandError> {
        if !self.is_ready() {
            return Err(CommandError::NotReady);
        }
        validate_setup(&config).map_err(CommandError::InvalidSetup)?;

        let previous = self.store.get_guild_config(config.id).await?;
        if !self.store.update_guild_config(&config).await? {
            warn!(guild_id = %config.id, "setup write not acknowledged");
            return Ok(false);
        }
        self.apply_diff(&previous, &config).await;
        info!(guild_id = %config.id, watch = config.watch, channels = config.channels.len(), "setup applied");
        Ok(true)
    }

    /// Restore the guild's defaults. Already-default configs are left untouched.
    pub async fn reset(&self, guild_id: GuildId) -> Result<bool, CommandError> {
        if !self.is_ready() {
            return Err(CommandError::NotReady);
        }
        let previous = self.store.get_guild_config(guild_id).await?;
        let default = self.store.default_config(guild_id);
        if previous.is_default_of(&default) {
            debug!(%guild_id, "reset skipped, config already default");
            return Ok(true);
        }

        if !self.store.update_guild_config(&default).await? {
            return Ok(false);
        }
        self.apply_diff(&previous, &default).await;
        info!(%guild_id, "setup reset to defaults");
        Ok(true)
    }

    async fn apply_diff(&self, previous: &GuildConfig, next: &GuildConfig) {
        let dropped: Vec<ChannelId> = if next.watch {
            previous
                .channels
                .keys()
                .filter(|id| !next.channels.contains_key(id))
                .copied()
                .collect()
        } else {
            previous
                .channels
                .keys()
                .chain(next.channels.keys())
                .copied()
                .collect::<HashSet<_>>()
                .into_iter()
                .collect()
        };
        if !dropped.is_empty() {
            self.reconciler.unstage(&dropped);
            self.registry.remove(&dropped).await;
        }

        if !next.watch {
            return;
        }
        let watch_enabled = !previous.watch;
        let staged: Vec<StagedChannel> = StagedChannel::from_config(next)
            .into_iter()
            .filter(|s| watch_enabled || previous.limit_for(s.id) != Some(s.stream_limit))
            .collect();
        if !staged.is_empty() {
            debug!(guild_id = %next.id, channels = staged.len(), "channels staged for reconciliation");
            self.reconciler.stage(staged);
        }
        self.reconciler.signal();
    }

    /// Stop the reconciliation loop and pending timers, then wait for
    /// tracked work such as in-flight disconnects to finish.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
