use crate::store::GuildConfig;

/// Upper bound on how many channels a guild may select for enforcement.
pub const MAX_CHANNEL_LIMIT: u32 = 25;

/// Validate the default per-channel stream limit. Must be at least 1.
pub fn validate_stream_limit(limit: u32) -> Result<(), String> {
    if limit == 0 {
        return Err("Stream limit must be at least 1".into());
    }
    Ok(())
}

/// Validate the channel-count limit. Must be 1-25.
pub fn validate_channel_limit(limit: u32) -> Result<(), String> {
    if limit == 0 {
        return Err("Channel limit must be at least 1".into());
    }
    if limit > MAX_CHANNEL_LIMIT {
        return Err(format!(
            "Channel limit too high (max {} channels)",
            MAX_CHANNEL_LIMIT
        ));
    }
    Ok(())
}

/// Validate a full setup before it is saved.
pub fn validate_setup(config: &GuildConfig) -> Result<(), String> {
    validate_stream_limit(config.stream_limit)?;
    validate_channel_limit(config.channel_limit)?;

    if config.channels.len() > config.channel_limit as usize {
        return Err(format!(
            "Too many channels selected (max {})",
            config.channel_limit
        ));
    }
    for (channel_id, limit) in &config.channels {
        if *limit == 0 || *limit > config.stream_limit {
            return Err(format!(
                "Stream limit for channel {} must be between 1 and {}",
                channel_id, config.stream_limit
            ));
        }
    }
    Ok(())
}
