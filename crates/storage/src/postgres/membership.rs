use async_trait::async_trait;
use sqlx::{PgConnection, PgExecutor};
use strongbox_auth::Role;
use strongbox_core::{Gid, ObjectType};

use super::{
    insert_error, state_from_db, state_to_db, system_time_to_unix_micros,
    unix_micros_to_system_time, PostgresStorage,
};
use crate::{
    ensure_roles_kept, MembershipStorage, ObjectUser, ObjectUserUpdate, StorageError, UserObject,
    UserObjectUpdate,
};

#[async_trait]
impl MembershipStorage for PostgresStorage {
    async fn insert_object_user(&self, row: &ObjectUser) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO object_users
                (object_id, user_id, user_name, state, roles, store_key,
                 created_by, created_at_us, modified_at_us)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(row.object_id.as_i64())
        .bind(row.user_id.as_i64())
        .bind(&row.user_name)
        .bind(state_to_db(row.state))
        .bind(&row.roles)
        .bind(row.store_key.as_deref())
        .bind(row.created_by.as_i64())
        .bind(system_time_to_unix_micros(row.created_at)?)
        .bind(system_time_to_unix_micros(row.modified_at)?)
        .execute(self.router.connect(row.object_id)?)
        .await
        .map_err(insert_error)?;
        Ok(())
    }

    async fn get_object_user(
        &self,
        object_id: Gid,
        user_id: Gid,
    ) -> Result<Option<ObjectUser>, StorageError> {
        let row = sqlx::query_as::<_, ObjectUserRow>(
            r#"
            SELECT object_id, user_id, user_name, state, roles, store_key,
                   created_by, created_at_us, modified_at_us
            FROM object_users
            WHERE object_id = $1 AND user_id = $2
            "#,
        )
        .bind(object_id.as_i64())
        .bind(user_id.as_i64())
        .fetch_optional(self.router.connect(object_id)?)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        row.map(ObjectUser::try_from).transpose()
    }

    async fn list_object_users(&self, object_id: Gid) -> Result<Vec<ObjectUser>, StorageError> {
        let rows = sqlx::query_as::<_, ObjectUserRow>(
            r#"
            SELECT object_id, user_id, user_name, state, roles, store_key,
                   created_by, created_at_us, modified_at_us
            FROM object_users
            WHERE object_id = $1
            ORDER BY user_name ASC
            "#,
        )
        .bind(object_id.as_i64())
        .fetch_all(self.router.connect(object_id)?)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        rows.into_iter().map(ObjectUser::try_from).collect()
    }

    async fn update_object_user(
        &self,
        object_id: Gid,
        user_id: Gid,
        update: &ObjectUserUpdate,
    ) -> Result<ObjectUser, StorageError> {
        update_row(self.router.connect(object_id)?, object_id, user_id, update).await
    }

    async fn delete_object_user(&self, object_id: Gid, user_id: Gid) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM object_users WHERE object_id = $1 AND user_id = $2")
            .bind(object_id.as_i64())
            .bind(user_id.as_i64())
            .execute(self.router.connect(object_id)?)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::MembershipNotFound);
        }
        Ok(())
    }

    async fn update_object_user_keeping(
        &self,
        object_id: Gid,
        user_id: Gid,
        update: &ObjectUserUpdate,
        keep: &[Role],
    ) -> Result<ObjectUser, StorageError> {
        let mut tx = self
            .router
            .connect(object_id)?
            .begin()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        let members = lock_members(tx.as_mut(), object_id).await?;
        let current = members
            .iter()
            .find(|member| member.user_id == user_id)
            .ok_or(StorageError::MembershipNotFound)?;
        let next = update.roles.as_deref().unwrap_or(&current.roles);
        ensure_roles_kept(&members, user_id, Some(next), keep)?;
        let row = update_row(tx.as_mut(), object_id, user_id, update).await?;
        tx.commit()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        Ok(row)
    }

    async fn delete_object_user_keeping(
        &self,
        object_id: Gid,
        user_id: Gid,
        keep: &[Role],
    ) -> Result<ObjectUser, StorageError> {
        let mut tx = self
            .router
            .connect(object_id)?
            .begin()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        let members = lock_members(tx.as_mut(), object_id).await?;
        if !members.iter().any(|member| member.user_id == user_id) {
            return Err(StorageError::MembershipNotFound);
        }
        ensure_roles_kept(&members, user_id, None, keep)?;
        let row = sqlx::query_as::<_, ObjectUserRow>(
            r#"
            DELETE FROM object_users
            WHERE object_id = $1 AND user_id = $2
            RETURNING object_id, user_id, user_name, state, roles, store_key,
                      created_by, created_at_us, modified_at_us
            "#,
        )
        .bind(object_id.as_i64())
        .bind(user_id.as_i64())
        .fetch_one(tx.as_mut())
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        tx.commit()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        ObjectUser::try_from(row)
    }

    async fn insert_user_object(&self, row: &UserObject) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO user_objects (user_id, object_id, object_type, alias, favorite, state)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(row.user_id.as_i64())
        .bind(row.object_id.as_i64())
        .bind(i16::from(row.object_type as u8))
        .bind(&row.alias)
        .bind(row.favorite)
        .bind(state_to_db(row.state))
        .execute(self.router.connect(row.user_id)?)
        .await
        .map_err(insert_error)?;
        Ok(())
    }

    async fn get_user_object(
        &self,
        user_id: Gid,
        object_id: Gid,
    ) -> Result<Option<UserObject>, StorageError> {
        let row = sqlx::query_as::<_, UserObjectRow>(
            r#"
            SELECT user_id, object_id, object_type, alias, favorite, state
            FROM user_objects
            WHERE user_id = $1 AND object_id = $2
            "#,
        )
        .bind(user_id.as_i64())
        .bind(object_id.as_i64())
        .fetch_optional(self.router.connect(user_id)?)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        row.map(UserObject::try_from).transpose()
    }

    async fn list_user_objects(&self, user_id: Gid) -> Result<Vec<UserObject>, StorageError> {
        let rows = sqlx::query_as::<_, UserObjectRow>(
            r#"
            SELECT user_id, object_id, object_type, alias, favorite, state
            FROM user_objects
            WHERE user_id = $1
            ORDER BY object_type ASC, alias ASC
            "#,
        )
        .bind(user_id.as_i64())
        .fetch_all(self.router.connect(user_id)?)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        rows.into_iter().map(UserObject::try_from).collect()
    }

    async fn update_user_object(
        &self,
        user_id: Gid,
        object_id: Gid,
        update: &UserObjectUpdate,
    ) -> Result<UserObject, StorageError> {
        let row = sqlx::query_as::<_, UserObjectRow>(
            r#"
            UPDATE user_objects SET
                favorite = COALESCE($3, favorite),
                state = COALESCE($4, state)
            WHERE user_id = $1 AND object_id = $2
            RETURNING user_id, object_id, object_type, alias, favorite, state
            "#,
        )
        .bind(user_id.as_i64())
        .bind(object_id.as_i64())
        .bind(update.favorite)
        .bind(update.state.map(state_to_db))
        .fetch_one(self.router.connect(user_id)?)
        .await
        .map_err(|error| match error {
            sqlx::Error::RowNotFound => StorageError::MembershipNotFound,
            _ => StorageError::Database(error.to_string()),
        })?;
        UserObject::try_from(row)
    }

    async fn delete_user_object(&self, user_id: Gid, object_id: Gid) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM user_objects WHERE user_id = $1 AND object_id = $2")
            .bind(user_id.as_i64())
            .bind(object_id.as_i64())
            .execute(self.router.connect(user_id)?)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::MembershipNotFound);
        }
        Ok(())
    }
}

/// Locks every forward row of the object for the rest of the transaction.
async fn lock_members(
    conn: &mut PgConnection,
    object_id: Gid,
) -> Result<Vec<ObjectUser>, StorageError> {
    let rows = sqlx::query_as::<_, ObjectUserRow>(
        r#"
        SELECT object_id, user_id, user_name, state, roles, store_key,
               created_by, created_at_us, modified_at_us
        FROM object_users
        WHERE object_id = $1
        ORDER BY user_id ASC
        FOR UPDATE
        "#,
    )
    .bind(object_id.as_i64())
    .fetch_all(conn)
    .await
    .map_err(|error| StorageError::Database(error.to_string()))?;
    rows.into_iter().map(ObjectUser::try_from).collect()
}

async fn update_row<'c>(
    executor: impl PgExecutor<'c>,
    object_id: Gid,
    user_id: Gid,
    update: &ObjectUserUpdate,
) -> Result<ObjectUser, StorageError> {
    let row = sqlx::query_as::<_, ObjectUserRow>(
        r#"
        UPDATE object_users SET
            state = COALESCE($3, state),
            roles = COALESCE($4, roles),
            store_key = COALESCE($5, store_key),
            modified_at_us = $6
        WHERE object_id = $1 AND user_id = $2
        RETURNING object_id, user_id, user_name, state, roles, store_key,
                  created_by, created_at_us, modified_at_us
        "#,
    )
    .bind(object_id.as_i64())
    .bind(user_id.as_i64())
    .bind(update.state.map(state_to_db))
    .bind(update.roles.as_deref())
    .bind(update.store_key.as_deref())
    .bind(system_time_to_unix_micros(update.modified_at)?)
    .fetch_one(executor)
    .await
    .map_err(|error| match error {
        sqlx::Error::RowNotFound => StorageError::MembershipNotFound,
        _ => StorageError::Database(error.to_string()),
    })?;
    ObjectUser::try_from(row)
}

#[derive(Debug, sqlx::FromRow)]
struct ObjectUserRow {
    object_id: i64,
    user_id: i64,
    user_name: String,
    state: i64,
    roles: String,
    store_key: Option<Vec<u8>>,
    created_by: i64,
    created_at_us: i64,
    modified_at_us: i64,
}

impl TryFrom<ObjectUserRow> for ObjectUser {
    type Error = StorageError;

    fn try_from(value: ObjectUserRow) -> Result<Self, Self::Error> {
        Ok(Self {
            object_id: Gid::from_i64(value.object_id),
            user_id: Gid::from_i64(value.user_id),
            user_name: value.user_name,
            state: state_from_db(value.state)?,
            roles: value.roles,
            store_key: value.store_key,
            created_by: Gid::from_i64(value.created_by),
            created_at: unix_micros_to_system_time(value.created_at_us)?,
            modified_at: unix_micros_to_system_time(value.modified_at_us)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UserObjectRow {
    user_id: i64,
    object_id: i64,
    object_type: i16,
    alias: String,
    favorite: bool,
    state: i64,
}

impl TryFrom<UserObjectRow> for UserObject {
    type Error = StorageError;

    fn try_from(value: UserObjectRow) -> Result<Self, Self::Error> {
        let tag = u8::try_from(value.object_type)
            .map_err(|_| StorageError::InvalidRow(format!("object type {}", value.object_type)))?;
        Ok(Self {
            user_id: Gid::from_i64(value.user_id),
            object_id: Gid::from_i64(value.object_id),
            object_type: ObjectType::try_from(tag)
                .map_err(|error| StorageError::InvalidRow(error.to_string()))?,
            alias: value.alias,
            favorite: value.favorite,
            state: state_from_db(value.state)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use strongbox_auth::Role;
    use strongbox_core::ObjectType;

    use super::super::test_support::*;
    use crate::{ObjectUser, ObjectUserUpdate, UserObject, UserObjectUpdate};

    fn forward(user: strongbox_core::Gid) -> ObjectUser {
        ObjectUser {
            object_id: org_gid(1),
            user_id: user,
            user_name: "alice".to_owned(),
            state: 0,
            roles: "16842755".to_owned(),
            store_key: None,
            created_by: user,
            created_at: now(),
            modified_at: now(),
        }
    }

    #[tokio::test]
    async fn forward_and_reverse_rows_route_to_their_own_shards() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let user = user_gid(7);
        storage
            .insert_object_user(&forward(user))
            .await
            .expect("insert forward");
        storage
            .insert_user_object(&UserObject {
                user_id: user,
                object_id: org_gid(1),
                object_type: ObjectType::Org,
                alias: "acme".to_owned(),
                favorite: false,
                state: 0,
            })
            .await
            .expect("insert reverse");

        // Forward rows sit on shard 1 (the org), reverse rows on shard 0 (the user).
        let data_1 = storage.router().data(1).expect("shard 1");
        let forward_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM object_users")
            .fetch_one(data_1)
            .await
            .expect("count forward");
        assert_eq!(forward_count, 1);
        let data_0 = storage.router().data(0).expect("shard 0");
        let reverse_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_objects")
            .fetch_one(data_0)
            .await
            .expect("count reverse");
        assert_eq!(reverse_count, 1);

        assert_eq!(
            storage.insert_object_user(&forward(user)).await,
            Err(StorageError::AlreadyExists)
        );
    }

    #[tokio::test]
    async fn updates_keep_unsupplied_columns() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let user = user_gid(9);
        let mut row = forward(user);
        row.store_key = Some(vec![9; 8]);
        storage.insert_object_user(&row).await.expect("insert");

        let mut update = ObjectUserUpdate::at(now());
        update.roles = Some("1".to_owned());
        let updated = storage
            .update_object_user(row.object_id, user, &update)
            .await
            .expect("update");
        assert_eq!(updated.roles, "1");
        assert_eq!(updated.store_key, Some(vec![9; 8]));

        storage
            .insert_user_object(&UserObject {
                user_id: user,
                object_id: row.object_id,
                object_type: ObjectType::Org,
                alias: "acme".to_owned(),
                favorite: false,
                state: 0,
            })
            .await
            .expect("insert reverse");
        let reverse = storage
            .update_user_object(
                user,
                row.object_id,
                &UserObjectUpdate {
                    favorite: Some(true),
                    state: None,
                },
            )
            .await
            .expect("update reverse");
        assert!(reverse.favorite);

        storage
            .delete_object_user(row.object_id, user)
            .await
            .expect("delete forward");
        assert_eq!(
            storage.get_object_user(row.object_id, user).await.expect("get"),
            None
        );
        assert_eq!(
            storage.delete_object_user(row.object_id, user).await,
            Err(StorageError::MembershipNotFound)
        );
    }

    #[tokio::test]
    async fn guarded_writes_keep_the_last_manager() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let manager = Role::from_bits(0x0102_0008);
        let alice = user_gid(11);
        let bob = user_gid(12);
        let mut lead = forward(alice);
        lead.roles = "16842755,16908296".to_owned();
        storage.insert_object_user(&lead).await.expect("alice");
        let mut member = forward(bob);
        member.user_name = "bob".to_owned();
        storage.insert_object_user(&member).await.expect("bob");

        let mut demote = ObjectUserUpdate::at(now());
        demote.roles = Some("16842755".to_owned());
        assert_eq!(
            storage
                .update_object_user_keeping(lead.object_id, alice, &demote, &[manager])
                .await,
            Err(StorageError::LastRoleHolder(manager))
        );
        assert_eq!(
            storage
                .delete_object_user_keeping(lead.object_id, alice, &[manager])
                .await,
            Err(StorageError::LastRoleHolder(manager))
        );

        let removed = storage
            .delete_object_user_keeping(lead.object_id, bob, &[manager])
            .await
            .expect("remove bob");
        assert_eq!(removed.user_id, bob);
        assert_eq!(
            storage
                .delete_object_user_keeping(lead.object_id, bob, &[manager])
                .await,
            Err(StorageError::MembershipNotFound)
        );
    }
}
