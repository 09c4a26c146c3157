use std::time::SystemTime;

use async_trait::async_trait;
use strongbox_core::{Gid, InvitationState};

use super::{
    insert_error, state_from_db, state_to_db, system_time_to_unix_micros,
    unix_micros_to_system_time, PostgresStorage,
};
use crate::{InvitationRegistry, OrgRegistry, RegistryStorage, StorageError, UserRegistry};

#[async_trait]
impl RegistryStorage for PostgresStorage {
    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(self.router.registry()?)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        Ok(())
    }

    async fn insert_user_registry(&self, row: &UserRegistry) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO user_registry (user_id, email, name, state) VALUES ($1, $2, $3, $4)",
        )
        .bind(row.user_id.as_i64())
        .bind(&row.email)
        .bind(&row.name)
        .bind(state_to_db(row.state))
        .execute(self.router.registry()?)
        .await
        .map_err(insert_error)?;
        Ok(())
    }

    async fn update_user_registry(&self, row: &UserRegistry) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE user_registry SET email = $2, name = $3, state = $4 WHERE user_id = $1",
        )
        .bind(row.user_id.as_i64())
        .bind(&row.email)
        .bind(&row.name)
        .bind(state_to_db(row.state))
        .execute(self.router.registry()?)
        .await
        .map_err(insert_error)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::UserNotFound);
        }
        Ok(())
    }

    async fn delete_user_registry(&self, user_id: Gid) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM user_registry WHERE user_id = $1")
            .bind(user_id.as_i64())
            .execute(self.router.registry()?)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::UserNotFound);
        }
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRegistry>, StorageError> {
        let row = sqlx::query_as::<_, UserRegistryRow>(
            "SELECT user_id, email, name, state FROM user_registry WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(self.router.registry()?)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        row.map(UserRegistry::try_from).transpose()
    }

    async fn find_user_by_name(&self, name: &str) -> Result<Option<UserRegistry>, StorageError> {
        let row = sqlx::query_as::<_, UserRegistryRow>(
            "SELECT user_id, email, name, state FROM user_registry WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(self.router.registry()?)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        row.map(UserRegistry::try_from).transpose()
    }

    async fn insert_org_registry(&self, row: &OrgRegistry) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO org_registry (org_id, alias, state) VALUES ($1, $2, $3)")
            .bind(row.org_id.as_i64())
            .bind(&row.alias)
            .bind(state_to_db(row.state))
            .execute(self.router.registry()?)
            .await
            .map_err(insert_error)?;
        Ok(())
    }

    async fn delete_org_registry(&self, org_id: Gid) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM org_registry WHERE org_id = $1")
            .bind(org_id.as_i64())
            .execute(self.router.registry()?)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::OrgNotFound);
        }
        Ok(())
    }

    async fn find_org_by_alias(&self, alias: &str) -> Result<Option<OrgRegistry>, StorageError> {
        let row = sqlx::query_as::<_, OrgRegistryRow>(
            "SELECT org_id, alias, state FROM org_registry WHERE alias = $1",
        )
        .bind(alias)
        .fetch_optional(self.router.registry()?)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        row.map(OrgRegistry::try_from).transpose()
    }

    async fn insert_invitation_registry(
        &self,
        row: &InvitationRegistry,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO invitation_registry
                (invitation_id, uid, object_id, created_by, invitee_email, expires_at_us, state)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(row.invitation_id.as_i64())
        .bind(&row.uid)
        .bind(row.object_id.as_i64())
        .bind(row.created_by.as_i64())
        .bind(&row.invitee_email)
        .bind(system_time_to_unix_micros(row.expires_at)?)
        .bind(row.state.as_i16())
        .execute(self.router.registry()?)
        .await
        .map_err(insert_error)?;
        Ok(())
    }

    async fn get_invitation_registry(
        &self,
        uid: &str,
    ) -> Result<InvitationRegistry, StorageError> {
        let row = sqlx::query_as::<_, InvitationRegistryRow>(
            r#"
            SELECT invitation_id, uid, object_id, created_by, invitee_email, expires_at_us, state
            FROM invitation_registry
            WHERE uid = $1
            "#,
        )
        .bind(uid)
        .fetch_one(self.router.registry()?)
        .await
        .map_err(|error| match error {
            sqlx::Error::RowNotFound => StorageError::InvitationNotFound,
            _ => StorageError::Database(error.to_string()),
        })?;
        InvitationRegistry::try_from(row)
    }

    async fn set_invitation_registry_state(
        &self,
        invitation_id: Gid,
        from: InvitationState,
        to: InvitationState,
    ) -> Result<(), StorageError> {
        let pool = self.router.registry()?;
        let result = sqlx::query(
            "UPDATE invitation_registry SET state = $3 WHERE invitation_id = $1 AND state = $2",
        )
        .bind(invitation_id.as_i64())
        .bind(from.as_i16())
        .bind(to.as_i16())
        .execute(pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        if result.rows_affected() == 0 {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM invitation_registry WHERE invitation_id = $1)",
            )
            .bind(invitation_id.as_i64())
            .fetch_one(pool)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
            return Err(if exists {
                StorageError::InvitationClosed
            } else {
                StorageError::InvitationNotFound
            });
        }
        Ok(())
    }

    async fn delete_invitation_registry(&self, invitation_id: Gid) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM invitation_registry WHERE invitation_id = $1")
            .bind(invitation_id.as_i64())
            .execute(self.router.registry()?)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::InvitationNotFound);
        }
        Ok(())
    }

    async fn find_pending_invitation(
        &self,
        object_id: Gid,
        invitee_email: &str,
    ) -> Result<Option<InvitationRegistry>, StorageError> {
        let row = sqlx::query_as::<_, InvitationRegistryRow>(
            r#"
            SELECT invitation_id, uid, object_id, created_by, invitee_email, expires_at_us, state
            FROM invitation_registry
            WHERE object_id = $1
              AND invitee_email = $2
              AND state = 0
            LIMIT 1
            "#,
        )
        .bind(object_id.as_i64())
        .bind(invitee_email)
        .fetch_optional(self.router.registry()?)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        row.map(InvitationRegistry::try_from).transpose()
    }

    async fn list_overdue_invitations(
        &self,
        now: SystemTime,
        limit: usize,
    ) -> Result<Vec<InvitationRegistry>, StorageError> {
        let limit = limit.min(i64::MAX as usize) as i64;
        let rows = sqlx::query_as::<_, InvitationRegistryRow>(
            r#"
            SELECT invitation_id, uid, object_id, created_by, invitee_email, expires_at_us, state
            FROM invitation_registry
            WHERE state = 0
              AND expires_at_us <= $1
            ORDER BY expires_at_us ASC, invitation_id ASC
            LIMIT $2
            "#,
        )
        .bind(system_time_to_unix_micros(now)?)
        .bind(limit)
        .fetch_all(self.router.registry()?)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        rows.into_iter().map(InvitationRegistry::try_from).collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UserRegistryRow {
    user_id: i64,
    email: String,
    name: String,
    state: i64,
}

impl TryFrom<UserRegistryRow> for UserRegistry {
    type Error = StorageError;

    fn try_from(value: UserRegistryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            user_id: Gid::from_i64(value.user_id),
            email: value.email,
            name: value.name,
            state: state_from_db(value.state)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrgRegistryRow {
    org_id: i64,
    alias: String,
    state: i64,
}

impl TryFrom<OrgRegistryRow> for OrgRegistry {
    type Error = StorageError;

    fn try_from(value: OrgRegistryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            org_id: Gid::from_i64(value.org_id),
            alias: value.alias,
            state: state_from_db(value.state)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InvitationRegistryRow {
    invitation_id: i64,
    uid: String,
    object_id: i64,
    created_by: i64,
    invitee_email: String,
    expires_at_us: i64,
    state: i16,
}

impl TryFrom<InvitationRegistryRow> for InvitationRegistry {
    type Error = StorageError;

    fn try_from(value: InvitationRegistryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            invitation_id: Gid::from_i64(value.invitation_id),
            uid: value.uid,
            object_id: Gid::from_i64(value.object_id),
            created_by: Gid::from_i64(value.created_by),
            invitee_email: value.invitee_email,
            expires_at: unix_micros_to_system_time(value.expires_at_us)?,
            state: InvitationState::try_from(value.state)
                .map_err(|error| StorageError::InvalidRow(error.to_string()))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use strongbox_core::InvitationState;

    use super::super::test_support::*;
    use crate::{InvitationRegistry, OrgRegistry, UserRegistry};

    #[tokio::test]
    async fn user_registry_enforces_unique_email_and_name() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let first = UserRegistry {
            user_id: user_gid(1),
            email: "a@x".to_owned(),
            name: "alice".to_owned(),
            state: 0,
        };
        storage
            .insert_user_registry(&first)
            .await
            .expect("insert user registry");

        let clash = UserRegistry {
            user_id: user_gid(2),
            name: "alice2".to_owned(),
            ..first.clone()
        };
        assert_eq!(
            storage.insert_user_registry(&clash).await,
            Err(StorageError::AlreadyExists)
        );

        let found = storage
            .find_user_by_name("alice")
            .await
            .expect("find by name");
        assert_eq!(found, Some(first.clone()));
        assert_eq!(
            storage.find_user_by_email("nobody@x").await.expect("find"),
            None
        );

        storage
            .delete_user_registry(first.user_id)
            .await
            .expect("delete");
        assert_eq!(
            storage.delete_user_registry(first.user_id).await,
            Err(StorageError::UserNotFound)
        );
    }

    #[tokio::test]
    async fn org_registry_alias_lookup() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let row = OrgRegistry {
            org_id: org_gid(1),
            alias: "acme".to_owned(),
            state: 0,
        };
        storage.insert_org_registry(&row).await.expect("insert");
        assert_eq!(
            storage.find_org_by_alias("acme").await.expect("find"),
            Some(row)
        );
    }

    #[tokio::test]
    async fn pending_rows_are_unique_until_closed() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let live = InvitationRegistry {
            invitation_id: invitation_gid(1),
            uid: "a".repeat(40),
            object_id: org_gid(1),
            created_by: user_gid(1),
            invitee_email: "b@x".to_owned(),
            expires_at: now + Duration::from_secs(3600),
            state: InvitationState::Pending,
        };
        let overdue = InvitationRegistry {
            invitation_id: invitation_gid(2),
            uid: "b".repeat(40),
            invitee_email: "c@x".to_owned(),
            expires_at: now - Duration::from_secs(1),
            ..live.clone()
        };
        storage.insert_invitation_registry(&live).await.expect("live");
        storage
            .insert_invitation_registry(&overdue)
            .await
            .expect("overdue");

        let pending = storage
            .find_pending_invitation(org_gid(1), "b@x")
            .await
            .expect("find pending");
        assert_eq!(pending, Some(live.clone()));
        assert_eq!(
            storage
                .find_pending_invitation(org_gid(1), "c@x")
                .await
                .expect("find pending"),
            Some(overdue.clone())
        );

        let second = InvitationRegistry {
            invitation_id: invitation_gid(3),
            uid: "d".repeat(40),
            ..live.clone()
        };
        assert_eq!(
            storage.insert_invitation_registry(&second).await,
            Err(StorageError::AlreadyExists)
        );

        let listed = storage
            .list_overdue_invitations(now, 10)
            .await
            .expect("list overdue");
        assert_eq!(listed, vec![overdue.clone()]);

        storage
            .set_invitation_registry_state(
                overdue.invitation_id,
                InvitationState::Pending,
                InvitationState::Expired,
            )
            .await
            .expect("set state");
        assert_eq!(
            storage
                .set_invitation_registry_state(
                    overdue.invitation_id,
                    InvitationState::Pending,
                    InvitationState::Revoked,
                )
                .await,
            Err(StorageError::InvitationClosed)
        );
        let reread = storage
            .get_invitation_registry(&overdue.uid)
            .await
            .expect("get");
        assert_eq!(reread.state, InvitationState::Expired);
        assert!(storage
            .list_overdue_invitations(now, 10)
            .await
            .expect("list")
            .is_empty());
        assert_eq!(
            storage
                .find_pending_invitation(org_gid(1), "c@x")
                .await
                .expect("find pending"),
            None
        );
    }
}
