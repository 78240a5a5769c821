use async_trait::async_trait;
use futures_util::TryStreamExt;
use futures_util::stream::BoxStream;
use sqlx::SqlitePool;

use super::document::{GuildDocument, to_sql_id};
use super::error::StoreError;
use crate::db::models::GuildConfigRow;
use crate::db::queries::guild_configs;
use crate::engine::ids::{ChannelId, GuildId};

/// Remote document store holding one [`GuildDocument`] per guild.
#[async_trait]
pub trait GuildDocumentStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn find_one(&self, guild_id: GuildId) -> Result<Option<GuildDocument>, StoreError>;

    /// Lazily yield every stored document. A document that fails to decode
    /// yields an error item; the stream continues after it.
    fn find_all(&self) -> BoxStream<'static, Result<GuildDocument, StoreError>>;

    /// Insert or replace. Returns whether the store acknowledged the write.
    async fn upsert(&self, document: &GuildDocument) -> Result<bool, StoreError>;

    async fn delete_one(&self, guild_id: GuildId) -> Result<bool, StoreError>;

    async fn delete_many(&self, guild_ids: &[GuildId]) -> Result<u64, StoreError>;

    /// Remove the given keys from one guild's channel map in a single write.
    async fn unset_channels(
        &self,
        guild_id: GuildId,
        channel_ids: &[ChannelId],
    ) -> Result<(), StoreError>;
}

/// [`GuildDocumentStore`] backed by the `guild_configs` SQLite table.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn decode(row: GuildConfigRow) -> Result<GuildDocument, StoreError> {
    let mut document: GuildDocument = serde_json::from_str(&row.document)?;
    // The row key is authoritative.
    document.id = row.id;
    Ok(document)
}

#[async_trait]
impl GuildDocumentStore for SqliteDocumentStore {
    async fn ping(&self) -> Result<(), StoreError> {
        guild_configs::ping(&self.pool).await?;
        Ok(())
    }

    async fn find_one(&self, guild_id: GuildId) -> Result<Option<GuildDocument>, StoreError> {
        guild_configs::get_guild_config(&self.pool, to_sql_id(guild_id.get()))
            .await?
            .map(decode)
            .transpose()
    }

    fn find_all(&self) -> BoxStream<'static, Result<GuildDocument, StoreError>> {
        let pool = self.pool.clone();
        Box::pin(async_stream::stream! {
            let mut rows = guild_configs::stream_guild_configs(&pool);
            loop {
                match rows.try_next().await {
                    Ok(Some(row)) => yield decode(row),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(StoreError::Database(e));
                        break;
                    }
                }
            }
        })
    }

    async fn upsert(&self, document: &GuildDocument) -> Result<bool, StoreError> {
        let body = serde_json::to_string(document)?;
        Ok(guild_configs::upsert_guild_config(&self.pool, document.id, &body).await?)
    }

    async fn delete_one(&self, guild_id: GuildId) -> Result<bool, StoreError> {
        Ok(guild_configs::delete_guild_config(&self.pool, to_sql_id(guild_id.get())).await?)
    }

    async fn delete_many(&self, guild_ids: &[GuildId]) -> Result<u64, StoreError> {
        let ids: Vec<i64> = guild_ids.iter().map(|id| to_sql_id(id.get())).collect();
        Ok(guild_configs::delete_guild_configs(&self.pool, &ids).await?)
    }

    async fn unset_channels(
        &self,
        guild_id: GuildId,
        channel_ids: &[ChannelId],
    ) -> Result<(), StoreError> {
        let ids: Vec<i64> = channel_ids.iter().map(|id| to_sql_id(id.get())).collect();
        guild_configs::remove_channels(&self.pool, to_sql_id(guild_id.get()), &ids).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::db::pool::{create_pool, run_migrations};

    async fn setup_store() -> SqliteDocumentStore {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteDocumentStore::new(pool)
    }

    fn document(id: i64, channels: &[(&str, i64)]) -> GuildDocument {
        GuildDocument {
            id,
            watch: true,
            channels: channels.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            stream_limit: 2,
            channel_limit: 5,
        }
    }

    #[tokio::test]
    async fn test_upsert_find_delete() {
        let store = setup_store().await;
        store.ping().await.unwrap();
        assert!(store.find_one(GuildId(1)).await.unwrap().is_none());

        let doc = document(1, &[("100", 1)]);
        assert!(store.upsert(&doc).await.unwrap());
        assert_eq!(store.find_one(GuildId(1)).await.unwrap(), Some(doc));

        assert!(store.delete_one(GuildId(1)).await.unwrap());
        assert!(store.find_one(GuildId(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_all_yields_decode_errors_in_place() {
        let store = setup_store().await;
        store.upsert(&document(1, &[])).await.unwrap();
        guild_configs::upsert_guild_config(&store.pool, 2, "not json")
            .await
            .unwrap();
        store.upsert(&document(3, &[])).await.unwrap();

        let items: Vec<Result<GuildDocument, StoreError>> = store.find_all().collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(StoreError::Serde(_))));
        assert_eq!(items[2].as_ref().unwrap().id, 3);
    }

    #[tokio::test]
    async fn test_unset_channels_and_delete_many() {
        let store = setup_store().await;
        store
            .upsert(&document(1, &[("100", 1), ("200", 1)]))
            .await
            .unwrap();
        store.upsert(&document(2, &[])).await.unwrap();

        store
            .unset_channels(GuildId(1), &[ChannelId(100)])
            .await
            .unwrap();
        let doc = store.find_one(GuildId(1)).await.unwrap().unwrap();
        assert_eq!(doc.channels.keys().collect::<Vec<_>>(), vec!["200"]);

        assert_eq!(store.delete_many(&[GuildId(1), GuildId(2)]).await.unwrap(), 2);
    }
}
