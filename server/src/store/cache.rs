use std::future::Future;

use moka::future::Cache;
use tokio::sync::Mutex;

use super::document::GuildConfig;
use super::error::StoreError;
use crate::engine::ids::GuildId;

pub const DEFAULT_MAX_ENTRIES: u64 = 128;

const STRIPES: usize = 16;

/// Read-through cache of guild configs.
///
/// A miss-load and a write for the same guild serialize on a striped lock, so
/// a loader can never put a value read before a write back into the cache
/// after that write's invalidation.
pub struct GuildConfigCache {
    entries: Cache<GuildId, GuildConfig>,
    stripes: Vec<Mutex<()>>,
}

impl GuildConfigCache {
    pub fn new(max_entries: u64) -> Self {
        Self {
            entries: Cache::new(max_entries),
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, guild_id: GuildId) -> &Mutex<()> {
        &self.stripes[(guild_id.get() % STRIPES as u64) as usize]
    }

    pub async fn get_or_load<F, Fut>(&self, guild_id: GuildId, load: F) -> Result<GuildConfig, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<GuildConfig, StoreError>>,
    {
        if let Some(hit) = self.entries.get(&guild_id).await {
            return Ok(hit);
        }

        let _guard = self.stripe(guild_id).lock().await;
        if let Some(hit) = self.entries.get(&guild_id).await {
            return Ok(hit);
        }
        let config = load().await?;
        self.entries.insert(guild_id, config.clone()).await;
        Ok(config)
    }

    /// Run a write for `guild_id` and drop its entry before returning.
    ///
    /// The entry is dropped whether or not the write succeeded.
    pub async fn invalidate_after<T, Fut>(&self, guild_id: GuildId, write: Fut) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let _guard = self.stripe(guild_id).lock().await;
        let result = write.await;
        self.entries.invalidate(&guild_id).await;
        result
    }

    pub async fn invalidate(&self, guild_id: GuildId) {
        let _guard = self.stripe(guild_id).lock().await;
        self.entries.invalidate(&guild_id).await;
    }

    pub fn contains(&self, guild_id: GuildId) -> bool {
        self.entries.contains_key(&guild_id)
    }
}
