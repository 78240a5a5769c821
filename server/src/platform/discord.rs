//! Discord adapter built on serenity.
//!
//! [`DiscordPlatform`] implements [`VoicePlatform`] over serenity's HTTP client
//! and cache; [`Handler`] turns gateway events into engine calls.

use std::sync::{Arc, OnceLock};

use anyhow::Context as _;
use async_trait::async_trait;
use serenity::all::{
    Cache, Channel, ChannelType, Client, Context, CreateMessage, EditMember, EditMessage,
    EventHandler, GatewayIntents, Guild, Http, UnavailableGuild, VoiceState,
};
use serenity::all::{
    ChannelId as DiscordChannelId, GuildId as DiscordGuildId, MessageId as DiscordMessageId,
    UserId,
};
use serenity::Error as SerenityError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::{
    DeliveryError, FetchError, KnownGuild, MessageRef, VoiceChannelSnapshot, VoiceMember,
    VoicePlatform, VoiceSnapshot, VoiceStateUpdate,
};
use crate::config::BotConfig;
use crate::engine::guardian::{EngineSettings, Guardian};
use crate::engine::ids::{ChannelId, GuildId, MemberId, MessageId};
use crate::engine::notice::Notice;
use crate::store::ConfigStore;

fn status_of(err: &SerenityError) -> Option<u16> {
    match err {
        SerenityError::Http(http) => http.status_code().map(|s| s.as_u16()),
        _ => None,
    }
}

fn fetch_error(err: SerenityError, what: String) -> FetchError {
    match status_of(&err) {
        Some(404) => FetchError::NotFound(what),
        Some(403) => FetchError::Forbidden(what),
        _ if matches!(err, SerenityError::Json(_)) => FetchError::InvalidData(err.to_string()),
        _ => FetchError::Transient(err.to_string()),
    }
}

fn delivery_error(err: SerenityError) -> DeliveryError {
    match status_of(&err) {
        Some(403) => DeliveryError::Forbidden(err.to_string()),
        Some(404) => DeliveryError::NotFound(err.to_string()),
        Some(429) => DeliveryError::RateLimited(err.to_string()),
        _ => DeliveryError::Http(err.to_string()),
    }
}

fn snapshot(state: &VoiceState) -> VoiceSnapshot {
    VoiceSnapshot {
        channel_id: state.channel_id.map(|c| ChannelId(c.get())),
        is_streaming: state.self_stream.unwrap_or(false),
    }
}

fn is_voice(kind: ChannelType) -> bool {
    matches!(kind, ChannelType::Voice | ChannelType::Stage)
}

/// Expired notices are deleted by tasks on `notices`. Tasks still sleeping
/// when `shutdown` fires exit without deleting.
pub struct DiscordPlatform {
    http: Arc<Http>,
    cache: Arc<Cache>,
    notices: TaskTracker,
    shutdown: CancellationToken,
}

impl DiscordPlatform {
    pub fn new(
        http: Arc<Http>,
        cache: Arc<Cache>,
        notices: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            http,
            cache,
            notices,
            shutdown,
        }
    }

    fn members_in(&self, guild_id: DiscordGuildId, channel_id: DiscordChannelId) -> Vec<VoiceMember> {
        let Some(guild) = self.cache.guild(guild_id) else {
            return Vec::new();
        };
        guild
            .voice_states
            .values()
            .filter(|vs| vs.channel_id == Some(channel_id))
            .map(|vs| VoiceMember {
                id: MemberId(vs.user_id.get()),
                is_bot: vs
                    .member
                    .as_ref()
                    .map(|m| m.user.bot)
                    .or_else(|| guild.members.get(&vs.user_id).map(|m| m.user.bot))
                    .unwrap_or(false),
                is_streaming: vs.self_stream.unwrap_or(false),
            })
            .collect()
    }

    fn schedule_delete(&self, message: MessageRef, notice: &Notice) {
        let Some(ttl) = notice.delete_after else {
            return;
        };
        let http = Arc::clone(&self.http);
        let shutdown = self.shutdown.clone();
        self.notices.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(ttl) => {}
            }
            let channel = DiscordChannelId::new(message.channel_id.get());
            let id = DiscordMessageId::new(message.message_id.get());
            if let Err(e) = channel.delete_message(&http, id).await {
                debug!(channel_id = %message.channel_id, error = %e, "failed to delete expired notice");
            }
        });
    }
}

#[async_trait]
impl VoicePlatform for DiscordPlatform {
    async fn fetch_voice_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<VoiceChannelSnapshot, FetchError> {
        let id = DiscordChannelId::new(channel_id.get());
        let channel = id
            .to_channel(&self.http)
            .await
            .map_err(|e| fetch_error(e, format!("channel {channel_id}")))?;

        let Channel::Guild(channel) = channel else {
            return Err(FetchError::InvalidData(format!("channel {channel_id} is not in a guild")));
        };
        if !is_voice(channel.kind) {
            return Err(FetchError::InvalidData(format!("channel {channel_id} is not a voice channel")));
        }

        Ok(VoiceChannelSnapshot {
            id: channel_id,
            guild_id: GuildId(channel.guild_id.get()),
            name: channel.name.clone(),
            members: self.members_in(channel.guild_id, id),
        })
    }

    async fn member_voice(
        &self,
        guild_id: GuildId,
        member_id: MemberId,
    ) -> Result<Option<VoiceSnapshot>, FetchError> {
        let guild = self
            .cache
            .guild(DiscordGuildId::new(guild_id.get()))
            .ok_or_else(|| FetchError::Transient(format!("guild {guild_id} not cached")))?;
        Ok(guild
            .voice_states
            .get(&UserId::new(member_id.get()))
            .filter(|vs| vs.channel_id.is_some())
            .map(snapshot))
    }

    async fn disconnect_member(
        &self,
        guild_id: GuildId,
        member_id: MemberId,
        reason: &str,
    ) -> Result<(), DeliveryError> {
        DiscordGuildId::new(guild_id.get())
            .edit_member(
                &self.http,
                UserId::new(member_id.get()),
                EditMember::new().disconnect_member().audit_log_reason(reason),
            )
            .await
            .map(|_| ())
            .map_err(delivery_error)
    }

    async fn send_direct(
        &self,
        member_id: MemberId,
        notice: &Notice,
    ) -> Result<MessageRef, DeliveryError> {
        let message = UserId::new(member_id.get())
            .direct_message(&self.http, CreateMessage::new().content(&notice.content))
            .await
            .map_err(delivery_error)?;
        let sent = MessageRef {
            channel_id: ChannelId(message.channel_id.get()),
            message_id: MessageId(message.id.get()),
        };
        self.schedule_delete(sent, notice);
        Ok(sent)
    }

    async fn send_to_channel(
        &self,
        channel_id: ChannelId,
        notice: &Notice,
    ) -> Result<MessageRef, DeliveryError> {
        let message = DiscordChannelId::new(channel_id.get())
            .send_message(&self.http, CreateMessage::new().content(&notice.content))
            .await
            .map_err(delivery_error)?;
        let sent = MessageRef {
            channel_id,
            message_id: MessageId(message.id.get()),
        };
        self.schedule_delete(sent, notice);
        Ok(sent)
    }

    async fn edit_message(&self, message: MessageRef, notice: &Notice) -> Result<(), DeliveryError> {
        DiscordChannelId::new(message.channel_id.get())
            .edit_message(
                &self.http,
                DiscordMessageId::new(message.message_id.get()),
                EditMessage::new().content(&notice.content),
            )
            .await
            .map_err(delivery_error)?;
        self.schedule_delete(message, notice);
        Ok(())
    }
}

/// Gateway event handler. The engine is built once the cache is ready, since
/// startup recovery needs the list of guilds and their voice channels.
pub struct Handler {
    store: Arc<ConfigStore>,
    settings: EngineSettings,
    guardian: Arc<OnceLock<Arc<Guardian>>>,
    notices: TaskTracker,
    shutdown: CancellationToken,
}

impl Handler {
    pub fn intents() -> GatewayIntents {
        GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES
    }

    fn guardian(&self) -> Option<&Arc<Guardian>> {
        self.guardian.get()
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn cache_ready(&self, ctx: Context, guilds: Vec<DiscordGuildId>) {
        if self.guardian.get().is_some() {
            return;
        }

        let known: Vec<KnownGuild> = guilds
            .iter()
            .filter_map(|&id| {
                let guild = ctx.cache.guild(id)?;
                let voice = guild
                    .channels
                    .values()
                    .filter(|c| is_voice(c.kind))
                    .map(|c| ChannelId(c.id.get()));
                Some(KnownGuild::new(GuildId(id.get()), voice))
            })
            .collect();

        let platform = Arc::new(DiscordPlatform::new(
            Arc::clone(&ctx.http),
            Arc::clone(&ctx.cache),
            self.notices.clone(),
            self.shutdown.clone(),
        ));
        let guardian = Arc::new(Guardian::new(
            Arc::clone(&self.store),
            platform,
            self.settings.clone(),
        ));
        if self.guardian.set(Arc::clone(&guardian)).is_err() {
            return;
        }

        info!(guilds = known.len(), "discord cache ready");
        if let Err(e) = guardian.start(&known).await {
            error!(error = %e, "failed to load guild configs");
        }
    }

    async fn voice_state_update(&self, _ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let (Some(guardian), Some(guild_id)) = (self.guardian(), new.guild_id) else {
            return;
        };
        let update = VoiceStateUpdate {
            guild_id: GuildId(guild_id.get()),
            member_id: MemberId(new.user_id.get()),
            is_bot: new.member.as_ref().is_some_and(|m| m.user.bot),
            before: old.as_ref().map(snapshot).unwrap_or_default(),
            after: snapshot(&new),
        };
        let outcome = guardian.on_voice_state_update(&update).await;
        debug!(guild_id = %update.guild_id, member_id = %update.member_id, ?outcome, "voice state handled");
    }

    async fn guild_create(&self, _ctx: Context, guild: Guild, is_new: Option<bool>) {
        if is_new == Some(true)
            && let Some(guardian) = self.guardian()
        {
            guardian.on_guild_join(GuildId(guild.id.get()));
        }
    }

    async fn guild_delete(&self, _ctx: Context, incomplete: UnavailableGuild, _full: Option<Guild>) {
        // An outage also arrives as a delete, flagged unavailable.
        if incomplete.unavailable {
            return;
        }
        let Some(guardian) = self.guardian() else {
            return;
        };
        let guild_id = GuildId(incomplete.id.get());
        if let Err(e) = guardian.on_guild_remove(guild_id).await {
            warn!(%guild_id, error = %e, "failed to forget guild");
        }
    }
}

/// Connect to the gateway and run until Ctrl-C.
pub async fn run(config: &BotConfig, store: Arc<ConfigStore>) -> anyhow::Result<()> {
    anyhow::ensure!(!config.bot.token.is_empty(), "DISCORD_TOKEN is not set");

    let guardian = Arc::new(OnceLock::new());
    let notices = TaskTracker::new();
    let shutdown = CancellationToken::new();
    let handler = Handler {
        store,
        settings: config.engine_settings(),
        guardian: Arc::clone(&guardian),
        notices: notices.clone(),
        shutdown: shutdown.clone(),
    };

    let mut client = Client::builder(&config.bot.token, Handler::intents())
        .event_handler(handler)
        .await
        .context("failed to build discord client")?;

    let shard_manager = Arc::clone(&client.shard_manager);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        info!("shutdown signal received");
        shard_manager.shutdown_all().await;
    });

    client.start().await.context("discord client stopped with an error")?;

    if let Some(guardian) = guardian.get() {
        guardian.shutdown().await;
    }

    // Notices not yet expired stay in place.
    shutdown.cancel();
    notices.close();
    notices.wait().await;
    info!("notice cleanup drained");
    Ok(())
}
