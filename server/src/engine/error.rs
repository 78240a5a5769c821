use thiserror::Error;

use super::ids::ChannelId;
use crate::platform::DeliveryError;
use crate::store::StoreError;

/// A conflict negotiation could not be started.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The opening notice was rejected for a reason that may clear up later.
    #[error("could not start conflict negotiation in channel {channel_id}: {source}")]
    SpawnFailed {
        channel_id: ChannelId,
        #[source]
        source: DeliveryError,
    },

    /// The channel is gone or the bot may not post in it.
    #[error("channel {channel_id} cannot be notified: {source}")]
    ChannelUnavailable {
        channel_id: ChannelId,
        #[source]
        source: DeliveryError,
    },
}

impl NegotiationError {
    pub fn from_delivery(channel_id: ChannelId, source: DeliveryError) -> Self {
        match source {
            DeliveryError::Forbidden(_) | DeliveryError::NotFound(_) => {
                Self::ChannelUnavailable { channel_id, source }
            }
            DeliveryError::RateLimited(_) | DeliveryError::Http(_) => {
                Self::SpawnFailed { channel_id, source }
            }
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        match self {
            Self::SpawnFailed { channel_id, .. } | Self::ChannelUnavailable { channel_id, .. } => {
                *channel_id
            }
        }
    }
}

/// Failure of a command issued by the command layer. The Display text is
/// what end users see, so it never includes internal error details.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("The bot is still starting up. Please try again in a moment.")]
    NotReady,

    #[error("Stream limits are not enabled in this server.")]
    NotWatching,

    #[error("{0}")]
    InvalidSetup(String),

    #[error("The configuration could not be saved. Please try again later.")]
    Store(#[from] StoreError),
}
