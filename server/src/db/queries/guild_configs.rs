use futures_util::stream::BoxStream;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::db::models::GuildConfigRow;

/// Cheap round trip used as a connectivity check.
pub async fn ping(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Get a guild's config document by guild ID.
pub async fn get_guild_config(
    pool: &SqlitePool,
    guild_id: i64,
) -> Result<Option<GuildConfigRow>, sqlx::Error> {
    sqlx::query_as::<_, GuildConfigRow>(
        "SELECT id, document, updated_at FROM guild_configs WHERE id = ?",
    )
    .bind(guild_id)
    .fetch_optional(pool)
    .await
}

/// Stream every stored document, ordered by guild ID. Rows are fetched lazily.
pub fn stream_guild_configs(pool: &SqlitePool) -> BoxStream<'_, Result<GuildConfigRow, sqlx::Error>> {
    sqlx::query_as::<_, GuildConfigRow>(
        "SELECT id, document, updated_at FROM guild_configs ORDER BY id",
    )
    .fetch(pool)
}

/// Insert or replace a guild's document. Returns whether a row was written.
pub async fn upsert_guild_config(
    pool: &SqlitePool,
    guild_id: i64,
    document: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO guild_configs (id, document) VALUES (?, ?) \
         ON CONFLICT(id) DO UPDATE SET document = excluded.document, updated_at = datetime('now')",
    )
    .bind(guild_id)
    .bind(document)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Delete a guild's document. Returns true if a row was deleted.
pub async fn delete_guild_config(pool: &SqlitePool, guild_id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM guild_configs WHERE id = ?")
        .bind(guild_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Delete many guild documents in one statement. Returns the number deleted.
pub async fn delete_guild_configs(pool: &SqlitePool, guild_ids: &[i64]) -> Result<u64, sqlx::Error> {
    if guild_ids.is_empty() {
        return Ok(0);
    }

    let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM guild_configs WHERE id IN (");
    let mut ids = query.separated(", ");
    for id in guild_ids {
        ids.push_bind(*id);
    }
    ids.push_unseparated(")");

    let result = query.build().execute(pool).await?;
    Ok(result.rows_affected())
}

/// Remove channel entries from a guild's `channels` map in a single update.
/// Missing keys are ignored. Returns whether the guild's row exists.
pub async fn remove_channels(
    pool: &SqlitePool,
    guild_id: i64,
    channel_ids: &[i64],
) -> Result<bool, sqlx::Error> {
    if channel_ids.is_empty() {
        return Ok(true);
    }

    let mut query = QueryBuilder::<Sqlite>::new("UPDATE guild_configs SET document = json_remove(document");
    for id in channel_ids {
        query.push(", ");
        query.push_bind(format!("$.channels.\"{id}\""));
    }
    query.push("), updated_at = datetime('now') WHERE id = ");
    query.push_bind(guild_id);

    let result = query.build().execute(pool).await?;
    Ok(result.rows_affected() > 0)
}
