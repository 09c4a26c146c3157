#![forbid(unsafe_code)]

mod entries;
mod invitations;
mod keys;
mod membership;
mod orgs;
mod registry;
mod router;
mod stores;
mod users;

#[cfg(test)]
mod test_support;

use sqlx::PgPool;
use strongbox_core::{Gid, ObjectType, GROUP_DATA};

pub use router::{RouterConfig, RouterError, ShardConfig, ShardRouter};

use crate::StorageError;

#[derive(Clone)]
pub struct PostgresStorage {
    router: ShardRouter,
}

impl PostgresStorage {
    #[must_use]
    pub fn new(router: ShardRouter) -> Self {
        Self { router }
    }

    #[must_use]
    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    /// Applies the schema to every configured shard.
    pub async fn migrate_all(&self) -> Result<(), StorageError> {
        for ((group, shard), pool) in self.router.pools() {
            tracing::info!(group, shard, "applying shard migrations");
            crate::migrate_with_pool(pool).await?;
        }
        Ok(())
    }

    pub async fn close(self) {
        self.router.close().await;
    }

    /// Allocates the next local id on `pool` and packs it into a data-group id.
    pub(crate) async fn allocate(
        pool: &PgPool,
        object_type: ObjectType,
        shard: u16,
    ) -> Result<Gid, StorageError> {
        let local: i64 = sqlx::query_scalar("SELECT nextval('local_ids')")
            .fetch_one(pool)
            .await
            .map_err(|error| {
                if is_sequence_exhausted(&error) {
                    StorageError::IdSpaceExhausted
                } else {
                    StorageError::Database(error.to_string())
                }
            })?;
        let local = u32::try_from(local).map_err(|_| StorageError::IdSpaceExhausted)?;
        Ok(Gid::pack(GROUP_DATA, object_type, shard, local))
    }
}

// ---------------------------------------------------------------------------
// Shared helpers used across multiple domain modules
// ---------------------------------------------------------------------------

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db_error) if db_error.code().as_deref() == Some("23505")
    )
}

fn is_sequence_exhausted(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db_error) if db_error.code().as_deref() == Some("2200H")
    )
}

pub(crate) fn insert_error(error: sqlx::Error) -> StorageError {
    if is_unique_violation(&error) {
        StorageError::AlreadyExists
    } else {
        StorageError::Database(error.to_string())
    }
}

pub(crate) fn state_to_db(state: u32) -> i64 {
    i64::from(state)
}

pub(crate) fn state_from_db(value: i64) -> Result<u32, StorageError> {
    u32::try_from(value).map_err(|_| StorageError::InvalidRow(format!("state {value}")))
}

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) fn system_time_to_unix_micros(value: SystemTime) -> Result<i64, StorageError> {
    match value.duration_since(UNIX_EPOCH) {
        Ok(duration) => i64::try_from(duration.as_micros())
            .map_err(|_| StorageError::InvalidRow("timestamp out of range".to_owned())),
        Err(error) => {
            let micros = i64::try_from(error.duration().as_micros())
                .map_err(|_| StorageError::InvalidRow("timestamp out of range".to_owned()))?;
            Ok(-micros)
        }
    }
}

pub(crate) fn unix_micros_to_system_time(value: i64) -> Result<SystemTime, StorageError> {
    let micros = value.unsigned_abs();
    let duration = Duration::from_micros(micros);
    if value >= 0 {
        Ok(UNIX_EPOCH + duration)
    } else {
        UNIX_EPOCH
            .checked_sub(duration)
            .ok_or_else(|| StorageError::InvalidRow("timestamp out of range".to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_micros_round_trip_before_and_after_epoch() {
        for micros in [-1_500_000_i64, 0, 1_700_000_000_123_456] {
            let time = unix_micros_to_system_time(micros).expect("to time");
            assert_eq!(system_time_to_unix_micros(time).expect("to micros"), micros);
        }
    }

    #[test]
    fn state_column_rejects_values_outside_u32() {
        assert_eq!(state_from_db(state_to_db(u32::MAX)), Ok(u32::MAX));
        assert!(state_from_db(-1).is_err());
        assert!(state_from_db(i64::from(u32::MAX) + 1).is_err());
    }
}
