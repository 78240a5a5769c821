use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

use crate::engine::guardian::EngineSettings;
use crate::engine::monitor::MonitorSettings;
use crate::engine::negotiation::NegotiationSettings;
use crate::engine::retry::RetryPolicy;
use crate::store::{GuildDefaults, StoreSettings};

/// Top-level bot configuration, loaded from liveguard.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct BotConfig {
    pub bot: BotSection,
    pub database: DatabaseSection,
    pub cache: CacheSection,
    pub negotiation: NegotiationSection,
    pub retry: RetrySection,
    pub guild_defaults: GuildDefaultsSection,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct BotSection {
    pub token: String,
    /// Role mentioned when the bot lacks permission to disconnect someone.
    pub moderator_role_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: String,
    pub connect_attempts: u32,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "sqlite:liveguard.db?mode=rwc".into(),
            connect_attempts: 3,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub max_entries: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self { max_entries: 128 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NegotiationSection {
    pub timeout_secs: u64,
    /// How long resolution notices stay up before they are deleted.
    pub message_ttl_secs: u64,
}

impl Default for NegotiationSection {
    fn default() -> Self {
        Self {
            timeout_secs: 180,
            message_ttl_secs: 15,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub delivery_delay_ms: u64,
    /// Attempts for one eviction (disconnect plus notice), including the first.
    pub delivery_max_attempts: u32,
    /// Extra attempts per disconnect when a negotiation times out.
    pub kick_max_retries: u32,
    pub bulk_max_retries: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            delivery_delay_ms: 3000,
            delivery_max_attempts: 2,
            kick_max_retries: 3,
            bulk_max_retries: 3,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GuildDefaultsSection {
    pub stream_limit: u32,
    pub channel_limit: u32,
}

impl Default for GuildDefaultsSection {
    fn default() -> Self {
        let defaults = GuildDefaults::default();
        Self {
            stream_limit: defaults.stream_limit,
            channel_limit: defaults.channel_limit,
        }
    }
}

impl BotConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            Self::parse(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            info!(path = %path.display(), "no config file found, using defaults");
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("DISCORD_TOKEN") {
            self.bot.token = v;
        }
        if let Some(v) = var("MODERATOR_ROLE_ID")
            && let Ok(id) = v.parse()
        {
            self.bot.moderator_role_id = Some(id);
        }
        if let Some(v) = var("DATABASE_URL") {
            self.database.url = v;
        }
    }

    fn delivery_delay(&self) -> Duration {
        Duration::from_millis(self.retry.delivery_delay_ms)
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            cache_entries: self.cache.max_entries,
            defaults: GuildDefaults {
                stream_limit: self.guild_defaults.stream_limit,
                channel_limit: self.guild_defaults.channel_limit,
            },
            bulk_retry: RetryPolicy::jittered(self.retry.bulk_max_retries),
            connect_attempts: self.database.connect_attempts.max(1),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            negotiation: NegotiationSettings {
                timeout: Duration::from_secs(self.negotiation.timeout_secs),
                message_ttl: Duration::from_secs(self.negotiation.message_ttl_secs),
                kick_retry: RetryPolicy::fixed(self.retry.kick_max_retries, self.delivery_delay()),
            },
            monitor: MonitorSettings {
                delivery_retry: RetryPolicy::fixed(
                    self.retry.delivery_max_attempts.saturating_sub(1),
                    self.delivery_delay(),
                ),
                moderator_role: self.bot.moderator_role_id,
            },
        }
    }
}
