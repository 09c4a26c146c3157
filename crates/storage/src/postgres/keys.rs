use async_trait::async_trait;
use strongbox_core::{Gid, ObjectType};

use super::{system_time_to_unix_micros, unix_micros_to_system_time, PostgresStorage};
use crate::{Key, KeyStorage, NewKey, StorageError};

#[async_trait]
impl KeyStorage for PostgresStorage {
    async fn create_key(&self, shard: u16, key: &NewKey) -> Result<Key, StorageError> {
        let pool = self.router.data(shard)?;
        let id = Self::allocate(pool, ObjectType::Key, shard).await?;
        let expires_at_us = key.expires_at.map(system_time_to_unix_micros).transpose()?;
        let row = sqlx::query_as::<_, KeyRow>(
            r#"
            INSERT INTO keys (id, sealed, expires_at_us, created_at_us)
            VALUES ($1, $2, $3, $4)
            RETURNING id, sealed, expires_at_us, created_at_us
            "#,
        )
        .bind(id.as_i64())
        .bind(&key.sealed)
        .bind(expires_at_us)
        .bind(system_time_to_unix_micros(key.created_at)?)
        .fetch_one(pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        Key::try_from(row)
    }

    async fn get_key(&self, id: Gid) -> Result<Key, StorageError> {
        let row = sqlx::query_as::<_, KeyRow>(
            "SELECT id, sealed, expires_at_us, created_at_us FROM keys WHERE id = $1",
        )
        .bind(id.as_i64())
        .fetch_one(self.router.connect(id)?)
        .await
        .map_err(|error| match error {
            sqlx::Error::RowNotFound => StorageError::KeyNotFound,
            _ => StorageError::Database(error.to_string()),
        })?;
        Key::try_from(row)
    }

    async fn delete_key(&self, id: Gid) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM keys WHERE id = $1")
            .bind(id.as_i64())
            .execute(self.router.connect(id)?)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::KeyNotFound);
        }
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct KeyRow {
    id: i64,
    sealed: Vec<u8>,
    expires_at_us: Option<i64>,
    created_at_us: i64,
}

impl TryFrom<KeyRow> for Key {
    type Error = StorageError;

    fn try_from(value: KeyRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Gid::from_i64(value.id),
            sealed: value.sealed,
            expires_at: value
                .expires_at_us
                .map(unix_micros_to_system_time)
                .transpose()?,
            created_at: unix_micros_to_system_time(value.created_at_us)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use strongbox_core::ObjectType;

    use super::super::test_support::*;
    use crate::NewKey;

    #[tokio::test]
    async fn key_row_keeps_sealed_bytes_and_expiry() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let input = NewKey {
            sealed: vec![1, 2, 3, 4],
            expires_at: Some(now() + Duration::from_secs(86_400)),
            created_at: now(),
        };
        let key = storage.create_key(1, &input).await.expect("create key");
        assert!(key.id.is_type(ObjectType::Key));
        assert_eq!(key.id.shard(), 1);

        let fetched = storage.get_key(key.id).await.expect("get key");
        assert_eq!(fetched.sealed, input.sealed);
        assert_eq!(fetched.expires_at, input.expires_at);

        storage.delete_key(key.id).await.expect("delete");
        assert_eq!(
            storage.get_key(key.id).await,
            Err(StorageError::KeyNotFound)
        );
    }
}
