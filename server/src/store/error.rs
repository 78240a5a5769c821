use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("document encoding error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A stored document decoded but holds values outside the allowed ranges.
    #[error("invalid document for guild {guild_id}: {reason}")]
    InvalidDocument { guild_id: i64, reason: String },

    #[error("document store unavailable: {0}")]
    Unavailable(String),

    /// The startup scan may only be consumed once per process.
    #[error("guild config scan already consumed")]
    ScanConsumed,
}

impl StoreError {
    /// Errors tied to a single stored document rather than the store itself.
    pub fn is_document_error(&self) -> bool {
        matches!(self, Self::Serde(_) | Self::InvalidDocument { .. })
    }
}
