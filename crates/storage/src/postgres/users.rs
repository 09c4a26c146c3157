use async_trait::async_trait;
use strongbox_core::{Gid, ObjectType};

use super::{
    insert_error, state_from_db, state_to_db, system_time_to_unix_micros,
    unix_micros_to_system_time, PostgresStorage,
};
use crate::{NewUser, StorageError, User, UserStorage, UserUpdate};

#[async_trait]
impl UserStorage for PostgresStorage {
    async fn create_user(&self, shard: u16, user: &NewUser) -> Result<User, StorageError> {
        let pool = self.router.data(shard)?;
        let id = Self::allocate(pool, ObjectType::User, shard).await?;
        let created_at_us = system_time_to_unix_micros(user.created_at)?;
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users
                (id, email, name, display_name, password_hash, state, created_at_us, modified_at_us)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING id, email, name, display_name, password_hash, state, created_at_us, modified_at_us
            "#,
        )
        .bind(id.as_i64())
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.display_name)
        .bind(&user.password_hash)
        .bind(state_to_db(user.state))
        .bind(created_at_us)
        .fetch_one(pool)
        .await
        .map_err(insert_error)?;
        User::try_from(row)
    }

    async fn get_user(&self, id: Gid) -> Result<User, StorageError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, email, name, display_name, password_hash, state, created_at_us, modified_at_us
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id.as_i64())
        .fetch_one(self.router.connect(id)?)
        .await
        .map_err(|error| match error {
            sqlx::Error::RowNotFound => StorageError::UserNotFound,
            _ => StorageError::Database(error.to_string()),
        })?;
        User::try_from(row)
    }

    async fn update_user(&self, id: Gid, update: &UserUpdate) -> Result<User, StorageError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            UPDATE users SET
                email = COALESCE($2, email),
                name = COALESCE($3, name),
                display_name = COALESCE($4, display_name),
                password_hash = COALESCE($5, password_hash),
                state = COALESCE($6, state),
                modified_at_us = $7
            WHERE id = $1
            RETURNING id, email, name, display_name, password_hash, state, created_at_us, modified_at_us
            "#,
        )
        .bind(id.as_i64())
        .bind(update.email.as_deref())
        .bind(update.name.as_deref())
        .bind(update.display_name.as_deref())
        .bind(update.password_hash.as_deref())
        .bind(update.state.map(state_to_db))
        .bind(system_time_to_unix_micros(update.modified_at)?)
        .fetch_one(self.router.connect(id)?)
        .await
        .map_err(|error| match error {
            sqlx::Error::RowNotFound => StorageError::UserNotFound,
            _ => insert_error(error),
        })?;
        User::try_from(row)
    }

    async fn delete_user(&self, id: Gid) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id.as_i64())
            .execute(self.router.connect(id)?)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::UserNotFound);
        }
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: i64,
    email: String,
    name: String,
    display_name: String,
    password_hash: String,
    state: i64,
    created_at_us: i64,
    modified_at_us: i64,
}

impl TryFrom<UserRow> for User {
    type Error = StorageError;

    fn try_from(value: UserRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Gid::from_i64(value.id),
            email: value.email,
            name: value.name,
            display_name: value.display_name,
            password_hash: value.password_hash,
            state: state_from_db(value.state)?,
            created_at: unix_micros_to_system_time(value.created_at_us)?,
            modified_at: unix_micros_to_system_time(value.modified_at_us)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use strongbox_core::{ObjectType, GROUP_DATA};

    use super::super::test_support::*;
    use crate::UserUpdate;

    #[tokio::test]
    async fn create_allocates_ids_on_requested_shard() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let alice = storage
            .create_user(1, &new_user("a@x", "alice"))
            .await
            .expect("create alice");
        let bob = storage
            .create_user(1, &new_user("b@x", "bob"))
            .await
            .expect("create bob");

        assert_eq!(alice.id.group(), GROUP_DATA);
        assert_eq!(alice.id.shard(), 1);
        assert!(alice.id.is_type(ObjectType::User));
        assert_ne!(alice.id, bob.id);

        let fetched = storage.get_user(alice.id).await.expect("get alice");
        assert_eq!(fetched, alice);
    }

    #[tokio::test]
    async fn update_only_touches_supplied_fields() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let user = storage
            .create_user(0, &new_user("a@x", "alice"))
            .await
            .expect("create");

        let mut update = UserUpdate::at(now() + Duration::from_secs(5));
        update.display_name = Some("Alice A.".to_owned());
        let updated = storage.update_user(user.id, &update).await.expect("update");
        assert_eq!(updated.display_name, "Alice A.");
        assert_eq!(updated.email, user.email);
        assert_eq!(updated.password_hash, user.password_hash);
        assert_eq!(updated.modified_at, now() + Duration::from_secs(5));

        storage.delete_user(user.id).await.expect("delete");
        assert_eq!(
            storage.get_user(user.id).await,
            Err(StorageError::UserNotFound)
        );
    }
}
