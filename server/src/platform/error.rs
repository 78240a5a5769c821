use thiserror::Error;

/// Failure while resolving a channel, guild or member from the platform.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The channel or guild no longer exists.
    #[error("not found: {0}")]
    NotFound(String),

    /// The bot cannot see the target (missing permissions).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The platform returned data the adapter could not interpret.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Network hiccup, rate limit, gateway not ready, etc.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl FetchError {
    /// Permanent errors mean the configured channel should be dropped from storage.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Forbidden(_) | Self::InvalidData(_)
        )
    }
}

/// Failure while acting on the platform (moving a member, sending or editing a message).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("http error: {0}")]
    Http(String),
}

impl DeliveryError {
    /// Rate limits and generic HTTP failures are worth retrying after a short delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Http(_))
    }
}
