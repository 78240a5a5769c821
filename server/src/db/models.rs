use serde::{Deserialize, Serialize};

/// A stored guild configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GuildConfigRow {
    pub id: i64,
    /// JSON-encoded guild document.
    pub document: String,
    pub updated_at: String,
}
