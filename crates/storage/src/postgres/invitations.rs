use std::time::SystemTime;

use async_trait::async_trait;
use strongbox_core::{Gid, InvitationState, ObjectType};

use super::{insert_error, system_time_to_unix_micros, unix_micros_to_system_time, PostgresStorage};
use crate::{Invitation, InvitationKey, InvitationStorage, NewInvitation, StorageError};

#[async_trait]
impl InvitationStorage for PostgresStorage {
    async fn create_invitation(
        &self,
        invitation: &NewInvitation,
    ) -> Result<Invitation, StorageError> {
        let shard = invitation.object_id.shard();
        let pool = self.router.connect(invitation.object_id)?;
        let id = Self::allocate(pool, ObjectType::Invitation, shard).await?;
        let row = sqlx::query_as::<_, InvitationRow>(
            r#"
            INSERT INTO invitations
                (id, uid, created_by, invitee_email, object_id, roles, expires_at_us,
                 message, key_id, key_pick, state, created_at_us, modified_at_us)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, $11, $11)
            RETURNING id, uid, created_by, invitee_email, object_id, roles, expires_at_us,
                      message, key_id, key_pick, state, created_at_us, modified_at_us
            "#,
        )
        .bind(id.as_i64())
        .bind(&invitation.uid)
        .bind(invitation.created_by.as_i64())
        .bind(&invitation.invitee_email)
        .bind(invitation.object_id.as_i64())
        .bind(invitation.roles.as_deref())
        .bind(system_time_to_unix_micros(invitation.expires_at)?)
        .bind(invitation.message.as_deref())
        .bind(invitation.key.map(|key| key.key_id.as_i64()))
        .bind(invitation.key.map(|key| i16::from(key.pick)))
        .bind(system_time_to_unix_micros(invitation.created_at)?)
        .fetch_one(pool)
        .await
        .map_err(insert_error)?;
        Invitation::try_from(row)
    }

    async fn get_invitation(&self, id: Gid) -> Result<Invitation, StorageError> {
        let row = sqlx::query_as::<_, InvitationRow>(
            r#"
            SELECT id, uid, created_by, invitee_email, object_id, roles, expires_at_us,
                   message, key_id, key_pick, state, created_at_us, modified_at_us
            FROM invitations
            WHERE id = $1
            "#,
        )
        .bind(id.as_i64())
        .fetch_one(self.router.connect(id)?)
        .await
        .map_err(|error| match error {
            sqlx::Error::RowNotFound => StorageError::InvitationNotFound,
            _ => StorageError::Database(error.to_string()),
        })?;
        Invitation::try_from(row)
    }

    async fn set_invitation_state(
        &self,
        id: Gid,
        from: InvitationState,
        to: InvitationState,
        modified_at: SystemTime,
    ) -> Result<(), StorageError> {
        let pool = self.router.connect(id)?;
        let result = sqlx::query(
            "UPDATE invitations SET state = $3, modified_at_us = $4 WHERE id = $1 AND state = $2",
        )
        .bind(id.as_i64())
        .bind(from.as_i16())
        .bind(to.as_i16())
        .bind(system_time_to_unix_micros(modified_at)?)
        .execute(pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        if result.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM invitations WHERE id = $1)")
                    .bind(id.as_i64())
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

    async fn delete_invitation(&self, id: Gid) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM invitations WHERE id = $1")
            .bind(id.as_i64())
            .execute(self.router.connect(id)?)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::InvitationNotFound);
        }
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InvitationRow {
    id: i64,
    uid: String,
    created_by: i64,
    invitee_email: String,
    object_id: i64,
    roles: Option<String>,
    expires_at_us: i64,
    message: Option<String>,
    key_id: Option<i64>,
    key_pick: Option<i16>,
    state: i16,
    created_at_us: i64,
    modified_at_us: i64,
}

impl TryFrom<InvitationRow> for Invitation {
    type Error = StorageError;

    fn try_from(value: InvitationRow) -> Result<Self, Self::Error> {
        let key = match (value.key_id, value.key_pick) {
            (Some(key_id), Some(pick)) => Some(InvitationKey {
                key_id: Gid::from_i64(key_id),
                pick: u8::try_from(pick)
                    .map_err(|_| StorageError::InvalidRow(format!("key pick {pick}")))?,
            }),
            (None, None) => None,
            _ => {
                return Err(StorageError::InvalidRow(
                    "invitation key id without pick".to_owned(),
                ))
            }
        };
        Ok(Self {
            id: Gid::from_i64(value.id),
            uid: value.uid,
            created_by: Gid::from_i64(value.created_by),
            invitee_email: value.invitee_email,
            object_id: Gid::from_i64(value.object_id),
            roles: value.roles,
            expires_at: unix_micros_to_system_time(value.expires_at_us)?,
            message: value.message,
            key,
            state: InvitationState::try_from(value.state)
                .map_err(|error| StorageError::InvalidRow(error.to_string()))?,
            created_at: unix_micros_to_system_time(value.created_at_us)?,
            modified_at: unix_micros_to_system_time(value.modified_at_us)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use strongbox_core::{Gid, InvitationState, ObjectType, GROUP_DATA};

    use super::super::test_support::*;
    use crate::{InvitationKey, NewInvitation};

    fn input(object_id: Gid, key: Option<InvitationKey>) -> NewInvitation {
        NewInvitation {
            uid: "c".repeat(40),
            created_by: user_gid(1),
            invitee_email: "b@x".to_owned(),
            object_id,
            roles: None,
            expires_at: now() + Duration::from_secs(3 * 86_400),
            message: Some("welcome".to_owned()),
            key,
            created_at: now(),
        }
    }

    #[tokio::test]
    async fn invitation_lives_on_object_shard_with_key_reference() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let store = Gid::pack(GROUP_DATA, ObjectType::Store, 1, 44);
        let key = InvitationKey {
            key_id: Gid::pack(GROUP_DATA, ObjectType::Key, 0, 5),
            pick: 201,
        };
        let created = storage
            .create_invitation(&input(store, Some(key)))
            .await
            .expect("create invitation");
        assert_eq!(created.id.shard(), 1);
        assert!(created.id.is_type(ObjectType::Invitation));
        assert_eq!(created.key, Some(key));
        assert_eq!(created.state, InvitationState::Pending);

        storage
            .set_invitation_state(
                created.id,
                InvitationState::Pending,
                InvitationState::Accepted,
                now(),
            )
            .await
            .expect("accept");
        let fetched = storage.get_invitation(created.id).await.expect("get");
        assert_eq!(fetched.state, InvitationState::Accepted);
        assert_eq!(fetched.message.as_deref(), Some("welcome"));

        assert_eq!(
            storage
                .set_invitation_state(
                    created.id,
                    InvitationState::Pending,
                    InvitationState::Revoked,
                    now(),
                )
                .await,
            Err(StorageError::InvitationClosed)
        );
    }

    #[tokio::test]
    async fn duplicate_uid_is_rejected() {
        let Some(storage) = test_storage().await else {
            return;
        };
        storage
            .create_invitation(&input(org_gid(1), None))
            .await
            .expect("first");
        assert_eq!(
            storage
                .create_invitation(&input(org_gid(1), None))
                .await
                .map(|_| ()),
            Err(StorageError::AlreadyExists)
        );
    }
}
