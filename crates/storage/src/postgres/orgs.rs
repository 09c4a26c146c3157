use async_trait::async_trait;
use strongbox_core::{Gid, ObjectType};

use super::{
    insert_error, state_from_db, state_to_db, system_time_to_unix_micros,
    unix_micros_to_system_time, PostgresStorage,
};
use crate::{NewOrg, Org, OrgStorage, OrgStore, StorageError};

#[async_trait]
impl OrgStorage for PostgresStorage {
    async fn create_org(&self, shard: u16, org: &NewOrg) -> Result<Org, StorageError> {
        let pool = self.router.data(shard)?;
        let id = Self::allocate(pool, ObjectType::Org, shard).await?;
        let row = sqlx::query_as::<_, OrgRow>(
            r#"
            INSERT INTO orgs (id, alias, name, state, created_by, created_at_us, modified_at_us)
            VALUES ($1, $2, $3, 0, $4, $5, $5)
            RETURNING id, alias, name, state, created_by, created_at_us, modified_at_us
            "#,
        )
        .bind(id.as_i64())
        .bind(&org.alias)
        .bind(&org.name)
        .bind(org.created_by.as_i64())
        .bind(system_time_to_unix_micros(org.created_at)?)
        .fetch_one(pool)
        .await
        .map_err(insert_error)?;
        Org::try_from(row)
    }

    async fn get_org(&self, id: Gid) -> Result<Org, StorageError> {
        let row = sqlx::query_as::<_, OrgRow>(
            r#"
            SELECT id, alias, name, state, created_by, created_at_us, modified_at_us
            FROM orgs
            WHERE id = $1
            "#,
        )
        .bind(id.as_i64())
        .fetch_one(self.router.connect(id)?)
        .await
        .map_err(|error| match error {
            sqlx::Error::RowNotFound => StorageError::OrgNotFound,
            _ => StorageError::Database(error.to_string()),
        })?;
        Org::try_from(row)
    }

    async fn delete_org(&self, id: Gid) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM orgs WHERE id = $1")
            .bind(id.as_i64())
            .execute(self.router.connect(id)?)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::OrgNotFound);
        }
        Ok(())
    }

    async fn insert_org_store(&self, row: &OrgStore) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO org_stores (org_id, store_id, alias, state) VALUES ($1, $2, $3, $4)",
        )
        .bind(row.org_id.as_i64())
        .bind(row.store_id.as_i64())
        .bind(&row.alias)
        .bind(state_to_db(row.state))
        .execute(self.router.connect(row.org_id)?)
        .await
        .map_err(insert_error)?;
        Ok(())
    }

    async fn get_org_store(
        &self,
        org_id: Gid,
        store_id: Gid,
    ) -> Result<Option<OrgStore>, StorageError> {
        let row = sqlx::query_as::<_, OrgStoreRow>(
            "SELECT org_id, store_id, alias, state FROM org_stores WHERE org_id = $1 AND store_id = $2",
        )
        .bind(org_id.as_i64())
        .bind(store_id.as_i64())
        .fetch_optional(self.router.connect(org_id)?)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        row.map(OrgStore::try_from).transpose()
    }

    async fn find_org_store(
        &self,
        org_id: Gid,
        alias: &str,
    ) -> Result<Option<OrgStore>, StorageError> {
        let row = sqlx::query_as::<_, OrgStoreRow>(
            "SELECT org_id, store_id, alias, state FROM org_stores WHERE org_id = $1 AND alias = $2",
        )
        .bind(org_id.as_i64())
        .bind(alias)
        .fetch_optional(self.router.connect(org_id)?)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        row.map(OrgStore::try_from).transpose()
    }

    async fn list_org_stores(&self, org_id: Gid) -> Result<Vec<OrgStore>, StorageError> {
        let rows = sqlx::query_as::<_, OrgStoreRow>(
            r#"
            SELECT org_id, store_id, alias, state
            FROM org_stores
            WHERE org_id = $1
            ORDER BY alias ASC
            "#,
        )
        .bind(org_id.as_i64())
        .fetch_all(self.router.connect(org_id)?)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        rows.into_iter().map(OrgStore::try_from).collect()
    }

    async fn set_org_store_state(
        &self,
        org_id: Gid,
        store_id: Gid,
        state: u32,
    ) -> Result<(), StorageError> {
        let result =
            sqlx::query("UPDATE org_stores SET state = $3 WHERE org_id = $1 AND store_id = $2")
                .bind(org_id.as_i64())
                .bind(store_id.as_i64())
                .bind(state_to_db(state))
                .execute(self.router.connect(org_id)?)
                .await
                .map_err(|error| StorageError::Database(error.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::StoreNotFound);
        }
        Ok(())
    }

    async fn delete_org_store(&self, org_id: Gid, store_id: Gid) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM org_stores WHERE org_id = $1 AND store_id = $2")
            .bind(org_id.as_i64())
            .bind(store_id.as_i64())
            .execute(self.router.connect(org_id)?)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::StoreNotFound);
        }
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrgRow {
    id: i64,
    alias: String,
    name: String,
    state: i64,
    created_by: i64,
    created_at_us: i64,
    modified_at_us: i64,
}

impl TryFrom<OrgRow> for Org {
    type Error = StorageError;

    fn try_from(value: OrgRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Gid::from_i64(value.id),
            alias: value.alias,
            name: value.name,
            state: state_from_db(value.state)?,
            created_by: Gid::from_i64(value.created_by),
            created_at: unix_micros_to_system_time(value.created_at_us)?,
            modified_at: unix_micros_to_system_time(value.modified_at_us)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrgStoreRow {
    org_id: i64,
    store_id: i64,
    alias: String,
    state: i64,
}

impl TryFrom<OrgStoreRow> for OrgStore {
    type Error = StorageError;

    fn try_from(value: OrgStoreRow) -> Result<Self, Self::Error> {
        Ok(Self {
            org_id: Gid::from_i64(value.org_id),
            store_id: Gid::from_i64(value.store_id),
            alias: value.alias,
            state: state_from_db(value.state)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use strongbox_core::{Gid, ObjectType, GROUP_DATA};

    use super::super::test_support::*;
    use crate::{NewOrg, OrgStore};

    #[tokio::test]
    async fn org_store_relation_is_unique_per_alias() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let org = storage
            .create_org(
                1,
                &NewOrg {
                    alias: "acme".to_owned(),
                    name: "Acme".to_owned(),
                    created_by: user_gid(1),
                    created_at: now(),
                },
            )
            .await
            .expect("create org");
        assert_eq!(org.id.shard(), 1);

        let relation = OrgStore {
            org_id: org.id,
            store_id: Gid::pack(GROUP_DATA, ObjectType::Store, 0, 3),
            alias: "vault".to_owned(),
            state: 0,
        };
        storage.insert_org_store(&relation).await.expect("insert");
        let duplicate_alias = OrgStore {
            store_id: Gid::pack(GROUP_DATA, ObjectType::Store, 0, 4),
            ..relation.clone()
        };
        assert_eq!(
            storage.insert_org_store(&duplicate_alias).await,
            Err(StorageError::AlreadyExists)
        );

        storage
            .set_org_store_state(org.id, relation.store_id, 1)
            .await
            .expect("lock");
        let found = storage
            .find_org_store(org.id, "vault")
            .await
            .expect("find")
            .expect("present");
        assert_eq!(found.state, 1);
        assert_eq!(storage.list_org_stores(org.id).await.expect("list").len(), 1);

        storage
            .delete_org_store(org.id, relation.store_id)
            .await
            .expect("delete");
        assert_eq!(
            storage
                .get_org_store(org.id, relation.store_id)
                .await
                .expect("get"),
            None
        );
    }
}
