use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::{Stream, StreamExt};
use tracing::{debug, info, warn};

use super::backend::GuildDocumentStore;
use super::cache::{DEFAULT_MAX_ENTRIES, GuildConfigCache};
use super::document::{GuildConfig, GuildDefaults, GuildDocument};
use super::error::StoreError;
use crate::engine::ids::{ChannelId, GuildId};
use crate::engine::retry::RetryPolicy;
use crate::platform::KnownGuild;

/// A configured channel that should be dropped from its guild's document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelRemoval {
    pub channel_id: ChannelId,
    pub guild_id: GuildId,
}

/// Outcome of [`ConfigStore::remove_invalid_channels`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RemovalReport {
    /// Guilds whose channels were removed and cache entry invalidated.
    pub invalidated: Vec<GuildId>,
    /// Guilds still failing after the retry budget; left untouched.
    pub dropped: Vec<GuildId>,
}

#[derive(Debug, Default)]
struct PendingCleanup {
    guilds: Vec<GuildId>,
    channels: Vec<ChannelRemoval>,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub cache_entries: u64,
    pub defaults: GuildDefaults,
    /// Retries for per-guild channel removal.
    pub bulk_retry: RetryPolicy,
    /// Attempts at the startup connectivity check.
    pub connect_attempts: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            cache_entries: DEFAULT_MAX_ENTRIES,
            defaults: GuildDefaults::default(),
            bulk_retry: RetryPolicy::jittered(3),
            connect_attempts: 3,
        }
    }
}

/// Durable per-guild configuration behind a read-through cache.
pub struct ConfigStore {
    backend: Arc<dyn GuildDocumentStore>,
    cache: GuildConfigCache,
    defaults: GuildDefaults,
    bulk_retry: RetryPolicy,
    scanned: AtomicBool,
    pending: parking_lot::Mutex<PendingCleanup>,
}

impl ConfigStore {
    pub fn new(backend: Arc<dyn GuildDocumentStore>, settings: StoreSettings) -> Self {
        Self {
            backend,
            cache: GuildConfigCache::new(settings.cache_entries),
            defaults: settings.defaults,
            bulk_retry: settings.bulk_retry,
            scanned: AtomicBool::new(false),
            pending: parking_lot::Mutex::new(PendingCleanup::default()),
        }
    }

    /// Build the store after confirming the backend answers. Failure here is fatal.
    pub async fn connect(
        backend: Arc<dyn GuildDocumentStore>,
        settings: StoreSettings,
    ) -> Result<Self, StoreError> {
        let retries = settings.connect_attempts.saturating_sub(1);
        RetryPolicy::fixed(retries, Duration::from_secs(1))
            .run(|| backend.ping(), |_| true)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        info!("config store connected");
        Ok(Self::new(backend, settings))
    }

    pub fn default_config(&self, guild_id: GuildId) -> GuildConfig {
        GuildConfig::with_defaults(guild_id, self.defaults)
    }

    /// Cached read. A guild with no stored document gets the defaults.
    pub async fn get_guild_config(&self, guild_id: GuildId) -> Result<GuildConfig, StoreError> {
        self.cache
            .get_or_load(guild_id, || async {
                match self.backend.find_one(guild_id).await? {
                    Some(document) => GuildConfig::try_from(document),
                    None => Ok(self.default_config(guild_id)),
                }
            })
            .await
    }

    /// Upsert and invalidate. Returns whether the store acknowledged the write.
    pub async fn update_guild_config(&self, config: &GuildConfig) -> Result<bool, StoreError> {
        let document = GuildDocument::from(config);
        let acked = self
            .cache
            .invalidate_after(config.id, self.backend.upsert(&document))
            .await?;
        debug!(guild_id = %config.id, acked, "guild config saved");
        Ok(acked)
    }

    pub async fn leave_guild(&self, guild_id: GuildId) -> Result<bool, StoreError> {
        let deleted = self
            .cache
            .invalidate_after(guild_id, self.backend.delete_one(guild_id))
            .await?;
        info!(%guild_id, deleted, "guild config deleted");
        Ok(deleted)
    }

    /// Drop channel entries, one write per guild, retrying only the guilds
    /// that failed. Guilds still failing after the retry budget are logged
    /// and skipped; the next full reconciliation will find them again.
    pub async fn remove_invalid_channels(&self, entries: &[ChannelRemoval]) -> RemovalReport {
        let mut groups: BTreeMap<GuildId, Vec<ChannelId>> = BTreeMap::new();
        for entry in entries {
            let channels = groups.entry(entry.guild_id).or_default();
            if !channels.contains(&entry.channel_id) {
                channels.push(entry.channel_id);
            }
        }

        let mut report = RemovalReport::default();
        let mut retry = 0;
        while !groups.is_empty() {
            let writes = groups.iter().map(|(&guild_id, channels)| async move {
                let result = self
                    .cache
                    .invalidate_after(guild_id, self.backend.unset_channels(guild_id, channels))
                    .await;
                (guild_id, result)
            });

            let results = join_all(writes).await;
            for (guild_id, result) in results {
                match result {
                    Ok(()) => {
                        let channels = groups.remove(&guild_id).unwrap_or_default();
                        info!(%guild_id, count = channels.len(), "removed invalid channels");
                        report.invalidated.push(guild_id);
                    }
                    Err(e) => {
                        warn!(%guild_id, retry, error = %e, "failed to remove invalid channels");
                    }
                }
            }

            if groups.is_empty() {
                break;
            }
            if retry >= self.bulk_retry.max_retries() {
                report.dropped = groups.keys().copied().collect();
                warn!(
                    guilds = ?report.dropped,
                    "giving up on invalid channel removal until next reconciliation"
                );
                break;
            }
            retry += 1;
            tokio::time::sleep(self.bulk_retry.delay_for(retry)).await;
        }
        report
    }

    /// One-shot startup scan over every stored config.
    ///
    /// Guilds the bot is no longer in are queued for deletion, and channels
    /// that no longer exist are queued for removal and left out of the yielded
    /// config. Run [`ConfigStore::cleanup_pending`] once the stream is drained.
    pub fn get_all_guild_configs(
        &self,
        known: &[KnownGuild],
    ) -> Result<impl Stream<Item = GuildConfig> + Send + '_, StoreError> {
        if self.scanned.swap(true, Ordering::SeqCst) {
            return Err(StoreError::ScanConsumed);
        }

        let known: HashMap<GuildId, HashSet<ChannelId>> = known
            .iter()
            .map(|guild| (guild.id, guild.voice_channels.clone()))
            .collect();
        let mut documents = self.backend.find_all();

        Ok(async_stream::stream! {
            while let Some(next) = documents.next().await {
                let config = match next.and_then(GuildConfig::try_from) {
                    Ok(config) => config,
                    Err(e) if e.is_document_error() => {
                        warn!(error = %e, "skipping unreadable guild config");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "guild config scan aborted");
                        break;
                    }
                };

                let Some(channels) = known.get(&config.id) else {
                    self.pending.lock().guilds.push(config.id);
                    continue;
                };

                let mut config = config;
                let stale = config.retain_channels(channels);
                if !stale.is_empty() {
                    let guild_id = config.id;
                    self.pending.lock().channels.extend(
                        stale
                            .into_iter()
                            .map(|channel_id| ChannelRemoval { channel_id, guild_id }),
                    );
                }
                yield config;
            }
        })
    }

    /// Apply the removals queued by the startup scan.
    pub async fn cleanup_pending(&self) -> RemovalReport {
        let pending = std::mem::take(&mut *self.pending.lock());

        if !pending.guilds.is_empty() {
            for guild_id in &pending.guilds {
                self.cache.invalidate(*guild_id).await;
            }
            match self.backend.delete_many(&pending.guilds).await {
                Ok(deleted) => info!(deleted, "removed configs of departed guilds"),
                Err(e) => warn!(error = %e, "failed to remove configs of departed guilds"),
            }
        }

        self.remove_invalid_channels(&pending.channels).await
    }

    #[cfg(test)]
    pub(crate) fn is_cached(&self, guild_id: GuildId) -> bool {
        self.cache.contains(guild_id)
    }
}
