use async_trait::async_trait;
use strongbox_core::{Gid, ObjectType};

use super::{
    insert_error, state_from_db, system_time_to_unix_micros, unix_micros_to_system_time,
    PostgresStorage,
};
use crate::{NewStore, StorageError, Store, StoreStorage};

#[async_trait]
impl StoreStorage for PostgresStorage {
    async fn create_store(&self, shard: u16, store: &NewStore) -> Result<Store, StorageError> {
        let pool = self.router.data(shard)?;
        let id = Self::allocate(pool, ObjectType::Store, shard).await?;
        let row = sqlx::query_as::<_, StoreRow>(
            r#"
            INSERT INTO stores
                (id, org_id, alias, name, state, created_by, created_at_us, modified_at_us)
            VALUES ($1, $2, $3, $4, 0, $5, $6, $6)
            RETURNING id, org_id, alias, name, state, created_by, created_at_us, modified_at_us
            "#,
        )
        .bind(id.as_i64())
        .bind(store.org_id.as_i64())
        .bind(&store.alias)
        .bind(&store.name)
        .bind(store.created_by.as_i64())
        .bind(system_time_to_unix_micros(store.created_at)?)
        .fetch_one(pool)
        .await
        .map_err(insert_error)?;
        Store::try_from(row)
    }

    async fn get_store(&self, id: Gid) -> Result<Store, StorageError> {
        let row = sqlx::query_as::<_, StoreRow>(
            r#"
            SELECT id, org_id, alias, name, state, created_by, created_at_us, modified_at_us
            FROM stores
            WHERE id = $1
            "#,
        )
        .bind(id.as_i64())
        .fetch_one(self.router.connect(id)?)
        .await
        .map_err(|error| match error {
            sqlx::Error::RowNotFound => StorageError::StoreNotFound,
            _ => StorageError::Database(error.to_string()),
        })?;
        Store::try_from(row)
    }

    async fn delete_store(&self, id: Gid) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM stores WHERE id = $1")
            .bind(id.as_i64())
            .execute(self.router.connect(id)?)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::StoreNotFound);
        }
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StoreRow {
    id: i64,
    org_id: i64,
    alias: String,
    name: String,
    state: i64,
    created_by: i64,
    created_at_us: i64,
    modified_at_us: i64,
}

impl TryFrom<StoreRow> for Store {
    type Error = StorageError;

    fn try_from(value: StoreRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Gid::from_i64(value.id),
            org_id: Gid::from_i64(value.org_id),
            alias: value.alias,
            name: value.name,
            state: state_from_db(value.state)?,
            created_by: Gid::from_i64(value.created_by),
            created_at: unix_micros_to_system_time(value.created_at_us)?,
            modified_at: unix_micros_to_system_time(value.modified_at_us)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::NewStore;

    #[tokio::test]
    async fn store_lives_on_requested_shard() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let store = storage
            .create_store(
                0,
                &NewStore {
                    org_id: org_gid(1),
                    alias: "vault".to_owned(),
                    name: "Vault".to_owned(),
                    created_by: user_gid(1),
                    created_at: now(),
                },
            )
            .await
            .expect("create store");
        assert_eq!(store.id.shard(), 0);
        assert_eq!(storage.get_store(store.id).await.expect("get"), store);

        storage.delete_store(store.id).await.expect("delete");
        assert_eq!(
            storage.delete_store(store.id).await,
            Err(StorageError::StoreNotFound)
        );
    }
}
