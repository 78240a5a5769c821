use std::time::Duration;

use chrono::{DateTime, Utc};

use super::channel::StreamerSession;
use super::ids::{ChannelId, MemberId};

/// Text the engine asks the platform to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub content: String,
    /// When set, the platform deletes the message after this long.
    pub delete_after: Option<Duration>,
}

impl Notice {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            delete_after: None,
        }
    }

    pub fn delete_after(mut self, ttl: Duration) -> Self {
        self.delete_after = Some(ttl);
        self
    }
}

pub fn mention_member(id: MemberId) -> String {
    format!("<@{id}>")
}

pub fn mention_channel(id: ChannelId) -> String {
    format!("<#{id}>")
}

pub fn mention_role(id: u64) -> String {
    format!("<@&{id}>")
}

/// Platform-rendered timestamp, `style` is one of the short format letters (`T`, `R`, ...).
pub fn timestamp(at: DateTime<Utc>, style: char) -> String {
    format!("<t:{}:{style}>", at.timestamp())
}

/// Join mentions as "a", "a and b", "a, b and c".
pub fn human_join(items: &[String]) -> String {
    match items {
        [] => String::new(),
        [only] => only.clone(),
        [init @ .., last] => format!("{} and {last}", init.join(", ")),
    }
}

pub fn mention_all(members: &[MemberId]) -> String {
    let mentions: Vec<String> = members.iter().copied().map(mention_member).collect();
    human_join(&mentions)
}

fn plural_streams(limit: u32) -> String {
    if limit == 1 {
        "1 stream".to_string()
    } else {
        format!("{limit} streams")
    }
}

// ── Eviction ────────────────────────────────────────────────────────

/// Sent to a member who was moved out because the channel was already full.
pub fn eviction(
    member: MemberId,
    channel: ChannelId,
    limit: u32,
    streamers: &[StreamerSession],
) -> Notice {
    let mut content = format!(
        "{}, the stream limit of {} has been reached.\n\
         Only {} is allowed per voice channel. \
         Please move to another channel or try again later.",
        mention_member(member),
        mention_channel(channel),
        plural_streams(limit),
    );

    if streamers.is_empty() {
        content.push_str("\n\nFailed to get stream details.");
    } else {
        content.push_str("\n\nStream details:");
        for session in streamers {
            let started = session
                .started_at
                .map(|at| timestamp(at, 'T'))
                .unwrap_or_else(|| "Unknown".to_string());
            content.push_str(&format!(
                "\n- {} (started: {started})",
                mention_member(session.member_id)
            ));
        }
    }

    Notice::new(content)
}

/// Posted in the channel when the bot is not allowed to move the member itself.
pub fn kick_forbidden(
    member: MemberId,
    channel: ChannelId,
    since: DateTime<Utc>,
    moderator_role: Option<u64>,
) -> Notice {
    let moderators = moderator_role
        .map(|id| format!(" {}", mention_role(id)))
        .unwrap_or_default();
    Notice::new(format!(
        "{} is streaming while exceeding the {} stream limit since {}. Please take a look.{moderators}",
        mention_member(member),
        mention_channel(channel),
        timestamp(since, 'T'),
    ))
}

// ── Conflict negotiation ────────────────────────────────────────────

pub fn conflict_status(
    still_streaming: &[MemberId],
    agreed: usize,
    required: usize,
    deadline: DateTime<Utc>,
) -> Notice {
    Notice::new(format!(
        "Hey, {}! This channel has reached its stream limit. You should resolve your stream conflict.\n\
         If it is not resolved, every remaining streamer will be disconnected {}.\n\
         Waiting agreements {agreed} / {required}",
        mention_all(still_streaming),
        timestamp(deadline, 'R'),
    ))
}

pub fn conflict_resolved(agreed: &[MemberId], ttl: Duration) -> Notice {
    let thanks = mention_all(agreed);
    let content = if thanks.is_empty() {
        "Conflict is resolved. Thank you!".to_string()
    } else {
        format!("Conflict is resolved. Thank you! {thanks}")
    };
    Notice::new(content).delete_after(ttl)
}

pub fn conflict_timed_out(still_streaming: &[MemberId], ttl: Duration) -> Notice {
    Notice::new(format!(
        "Conflict not resolved. Disconnecting {}",
        mention_all(still_streaming)
    ))
    .delete_after(ttl)
}

pub fn kick_reason(channel: ChannelId) -> String {
    format!("Stream conflict not resolved in channel {channel}")
}

pub fn eviction_reason(channel: ChannelId) -> String {
    format!("Stream limit reached in channel {channel}")
}
