use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::error::StoreError;
use crate::engine::ids::{ChannelId, GuildId};

pub const DEFAULT_STREAM_LIMIT: u32 = 1;
pub const DEFAULT_CHANNEL_LIMIT: u32 = 5;

/// Values a guild gets before anyone runs setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuildDefaults {
    pub stream_limit: u32,
    pub channel_limit: u32,
}

impl Default for GuildDefaults {
    fn default() -> Self {
        Self {
            stream_limit: DEFAULT_STREAM_LIMIT,
            channel_limit: DEFAULT_CHANNEL_LIMIT,
        }
    }
}

/// Per-guild enforcement settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuildConfig {
    pub id: GuildId,
    pub watch: bool,
    /// Watched channels and their individual stream limits.
    pub channels: BTreeMap<ChannelId, u32>,
    /// Default per-channel cap, and the upper bound for per-channel limits.
    pub stream_limit: u32,
    /// How many channels may be selected.
    pub channel_limit: u32,
}

impl GuildConfig {
    pub fn new(id: GuildId) -> Self {
        Self::with_defaults(id, GuildDefaults::default())
    }

    pub fn with_defaults(id: GuildId, defaults: GuildDefaults) -> Self {
        Self {
            id,
            watch: false,
            channels: BTreeMap::new(),
            stream_limit: defaults.stream_limit,
            channel_limit: defaults.channel_limit,
        }
    }

    /// True when both configs have no channels and identical scalar fields.
    pub fn is_default_of(&self, default: &GuildConfig) -> bool {
        self.channels.is_empty()
            && default.channels.is_empty()
            && self.watch == default.watch
            && self.stream_limit == default.stream_limit
            && self.channel_limit == default.channel_limit
    }

    pub fn limit_for(&self, channel_id: ChannelId) -> Option<u32> {
        self.channels.get(&channel_id).copied()
    }

    /// Keep only channels that still exist; returns the ones dropped.
    pub fn retain_channels(&mut self, existing: &HashSet<ChannelId>) -> Vec<ChannelId> {
        let stale: Vec<ChannelId> = self
            .channels
            .keys()
            .copied()
            .filter(|id| !existing.contains(id))
            .collect();
        for id in &stale {
            self.channels.remove(id);
        }
        stale
    }
}

/// Stored shape of a guild config. Channel keys are strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildDocument {
    pub id: i64,
    #[serde(default)]
    pub watch: bool,
    #[serde(default)]
    pub channels: BTreeMap<String, i64>,
    #[serde(default = "default_stream_limit")]
    pub stream_limit: i64,
    #[serde(default = "default_channel_limit")]
    pub channel_limit: i64,
}

fn default_stream_limit() -> i64 {
    i64::from(DEFAULT_STREAM_LIMIT)
}

fn default_channel_limit() -> i64 {
    i64::from(DEFAULT_CHANNEL_LIMIT)
}

/// Snowflakes fit in 63 bits, so the cast is lossless.
pub(crate) fn to_sql_id(id: u64) -> i64 {
    id as i64
}

impl From<&GuildConfig> for GuildDocument {
    fn from(config: &GuildConfig) -> Self {
        Self {
            id: to_sql_id(config.id.get()),
            watch: config.watch,
            channels: config
                .channels
                .iter()
                .map(|(id, limit)| (id.to_string(), i64::from(*limit)))
                .collect(),
            stream_limit: i64::from(config.stream_limit),
            channel_limit: i64::from(config.channel_limit),
        }
    }
}

impl TryFrom<GuildDocument> for GuildConfig {
    type Error = StoreError;

    fn try_from(doc: GuildDocument) -> Result<Self, Self::Error> {
        let guild_id = doc.id;
        let invalid = |reason: String| StoreError::InvalidDocument { guild_id, reason };

        let id = u64::try_from(doc.id).map_err(|_| invalid("negative guild id".into()))?;
        let limit = |name: &str, value: i64| {
            u32::try_from(value).map_err(|_| invalid(format!("{name} out of range: {value}")))
        };

        let mut channels = BTreeMap::new();
        for (key, value) in doc.channels {
            let channel = key
                .parse::<u64>()
                .map_err(|_| invalid(format!("bad channel key {key:?}")))?;
            channels.insert(ChannelId(channel), limit("channel limit", value)?);
        }

        Ok(Self {
            id: GuildId(id),
            watch: doc.watch,
            channels,
            stream_limit: limit("stream_limit", doc.stream_limit)?,
            channel_limit: limit("channel_limit", doc.channel_limit)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_shape() {
        let mut config = GuildConfig::new(GuildId(42));
        config.watch = true;
        config.channels.insert(ChannelId(100), 2);

        let json = serde_json::to_value(GuildDocument::from(&config)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 42,
                "watch": true,
                "channels": {"100": 2},
                "stream_limit": 1,
                "channel_limit": 5
            })
        );
    }

    #[test]
    fn test_decode_fills_missing_fields() {
        let doc: GuildDocument = serde_json::from_str(r#"{"id": 7}"#).unwrap();
        let config = GuildConfig::try_from(doc).unwrap();
        assert_eq!(config, GuildConfig::new(GuildId(7)));
    }

    #[test]
    fn test_decode_rejects_bad_channel_keys() {
        let doc: GuildDocument =
            serde_json::from_str(r#"{"id": 7, "channels": {"general": 1}}"#).unwrap();
        let err = GuildConfig::try_from(doc).unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument { guild_id: 7, .. }));
    }

    #[test]
    fn test_decode_rejects_negative_limits() {
        let doc: GuildDocument =
            serde_json::from_str(r#"{"id": 7, "stream_limit": -1}"#).unwrap();
        assert!(GuildConfig::try_from(doc).is_err());
    }

    #[test]
    fn test_is_default_of() {
        let default = GuildConfig::new(GuildId(1));
        let mut config = GuildConfig::new(GuildId(1));
        assert!(config.is_default_of(&default));

        config.channels.insert(ChannelId(5), 1);
        assert!(!config.is_default_of(&default));

        config.channels.clear();
        config.stream_limit = 2;
        assert!(!config.is_default_of(&default));
    }

    #[test]
    fn test_retain_channels() {
        let mut config = GuildConfig::new(GuildId(1));
        config.channels.insert(ChannelId(1), 1);
        config.channels.insert(ChannelId(2), 1);
        config.channels.insert(ChannelId(3), 1);

        let existing: HashSet<ChannelId> = [ChannelId(2)].into_iter().collect();
        let stale = config.retain_channels(&existing);
        assert_eq!(stale, vec![ChannelId(1), ChannelId(3)]);
        assert_eq!(config.channels.len(), 1);
    }
}
