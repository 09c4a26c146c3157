use async_trait::async_trait;
use strongbox_core::{Gid, ObjectType};

use super::{system_time_to_unix_micros, unix_micros_to_system_time, PostgresStorage};
use crate::{Entry, EntryKind, EntryStorage, EntryUpdate, NewEntry, StorageError};

#[async_trait]
impl EntryStorage for PostgresStorage {
    async fn create_entry(&self, entry: &NewEntry) -> Result<Entry, StorageError> {
        let pool = self.router.connect(entry.store_id)?;
        let id = Self::allocate(pool, ObjectType::Entry, entry.store_id.shard()).await?;
        let mut tx = pool
            .begin()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;

        if !entry.parent_id.is_nil() {
            let parent_kind: Option<i16> = sqlx::query_scalar(
                "SELECT kind FROM entries WHERE store_id = $1 AND id = $2 FOR SHARE",
            )
            .bind(entry.store_id.as_i64())
            .bind(entry.parent_id.as_i64())
            .fetch_optional(tx.as_mut())
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
            match parent_kind.map(EntryKind::try_from).transpose()? {
                Some(EntryKind::Folder) => {}
                _ => return Err(StorageError::EntryNotFound),
            }
        }

        let row = sqlx::query_as::<_, EntryRow>(
            r#"
            INSERT INTO entries
                (store_id, id, parent_id, kind, title, ciphertext,
                 created_by, created_at_us, modified_at_us)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            RETURNING store_id, id, parent_id, kind, title, ciphertext,
                      created_by, created_at_us, modified_at_us
            "#,
        )
        .bind(entry.store_id.as_i64())
        .bind(id.as_i64())
        .bind(entry.parent_id.as_i64())
        .bind(entry.kind as i16)
        .bind(&entry.title)
        .bind(&entry.ciphertext)
        .bind(entry.created_by.as_i64())
        .bind(system_time_to_unix_micros(entry.created_at)?)
        .fetch_one(tx.as_mut())
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        tx.commit()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        Entry::try_from(row)
    }

    async fn get_entry(&self, store_id: Gid, id: Gid) -> Result<Entry, StorageError> {
        let row = sqlx::query_as::<_, EntryRow>(
            r#"
            SELECT store_id, id, parent_id, kind, title, ciphertext,
                   created_by, created_at_us, modified_at_us
            FROM entries
            WHERE store_id = $1 AND id = $2
            "#,
        )
        .bind(store_id.as_i64())
        .bind(id.as_i64())
        .fetch_one(self.router.connect(store_id)?)
        .await
        .map_err(|error| match error {
            sqlx::Error::RowNotFound => StorageError::EntryNotFound,
            _ => StorageError::Database(error.to_string()),
        })?;
        Entry::try_from(row)
    }

    async fn list_entries(&self, store_id: Gid, parent_id: Gid) -> Result<Vec<Entry>, StorageError> {
        let rows = sqlx::query_as::<_, EntryRow>(
            r#"
            SELECT store_id, id, parent_id, kind, title, ciphertext,
                   created_by, created_at_us, modified_at_us
            FROM entries
            WHERE store_id = $1 AND parent_id = $2
            ORDER BY kind ASC, title ASC, id ASC
            "#,
        )
        .bind(store_id.as_i64())
        .bind(parent_id.as_i64())
        .fetch_all(self.router.connect(store_id)?)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        rows.into_iter().map(Entry::try_from).collect()
    }

    async fn update_entry(
        &self,
        store_id: Gid,
        id: Gid,
        update: &EntryUpdate,
    ) -> Result<Entry, StorageError> {
        let row = sqlx::query_as::<_, EntryRow>(
            r#"
            UPDATE entries SET
                title = COALESCE($3, title),
                ciphertext = COALESCE($4, ciphertext),
                modified_at_us = $5
            WHERE store_id = $1 AND id = $2
            RETURNING store_id, id, parent_id, kind, title, ciphertext,
                      created_by, created_at_us, modified_at_us
            "#,
        )
        .bind(store_id.as_i64())
        .bind(id.as_i64())
        .bind(update.title.as_deref())
        .bind(update.ciphertext.as_deref())
        .bind(system_time_to_unix_micros(update.modified_at)?)
        .fetch_one(self.router.connect(store_id)?)
        .await
        .map_err(|error| match error {
            sqlx::Error::RowNotFound => StorageError::EntryNotFound,
            _ => StorageError::Database(error.to_string()),
        })?;
        Entry::try_from(row)
    }

    async fn delete_entry(&self, store_id: Gid, id: Gid) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"
            WITH RECURSIVE subtree(id) AS (
                SELECT id FROM entries WHERE store_id = $1 AND id = $2
                UNION ALL
                SELECT child.id
                FROM entries child
                JOIN subtree parent ON child.parent_id = parent.id
                WHERE child.store_id = $1
            )
            DELETE FROM entries
            WHERE store_id = $1 AND id IN (SELECT id FROM subtree)
            "#,
        )
        .bind(store_id.as_i64())
        .bind(id.as_i64())
        .execute(self.router.connect(store_id)?)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::EntryNotFound);
        }
        Ok(result.rows_affected())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EntryRow {
    store_id: i64,
    id: i64,
    parent_id: i64,
    kind: i16,
    title: String,
    ciphertext: Vec<u8>,
    created_by: i64,
    created_at_us: i64,
    modified_at_us: i64,
}

impl TryFrom<EntryRow> for Entry {
    type Error = StorageError;

    fn try_from(value: EntryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            store_id: Gid::from_i64(value.store_id),
            id: Gid::from_i64(value.id),
            parent_id: Gid::from_i64(value.parent_id),
            kind: EntryKind::try_from(value.kind)?,
            title: value.title,
            ciphertext: value.ciphertext,
            created_by: Gid::from_i64(value.created_by),
            created_at: unix_micros_to_system_time(value.created_at_us)?,
            modified_at: unix_micros_to_system_time(value.modified_at_us)?,
        })
    }
}
