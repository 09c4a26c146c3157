use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use sqlx::postgres::PgPoolOptions;
use strongbox_core::{Gid, ObjectType, ShardRange, GROUP_DATA};

use super::{PostgresStorage, ShardRouter};

// Re-export all domain traits so test modules can `use super::super::test_support::*`
// and have every trait method available on PostgresStorage.
#[allow(unused_imports)]
pub(super) use crate::{
    EntryStorage, InvitationStorage, KeyStorage, MembershipStorage, OrgStorage, RegistryStorage,
    Storage, StorageError, StoreStorage, UserStorage,
};

/// Registry shard plus data shards 0 and 1.
const TEST_SHARDS: [(u8, u16); 3] = [(0, 0), (1, 0), (1, 1)];

pub(super) async fn test_storage() -> Option<PostgresStorage> {
    let database_url = match std::env::var("DATABASE_URL") {
        Ok(value) => value,
        Err(_) => return None,
    };

    // One schema per shard per test.
    let run = uuid::Uuid::new_v4().simple().to_string();
    let mut pools = HashMap::new();
    for (group, shard) in TEST_SHARDS {
        let schema = format!("test_{run}_{group}_{shard}");
        let mut opts: sqlx::postgres::PgConnectOptions =
            database_url.parse().expect("parse DATABASE_URL");
        opts = opts.options([("search_path", schema.as_str())]);
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_with(opts)
            .await
            .expect("connect test database");
        sqlx::query(&format!("CREATE SCHEMA \"{schema}\""))
            .execute(&pool)
            .await
            .expect("create test schema");
        crate::migrate_with_pool(&pool)
            .await
            .expect("apply migrations");
        pools.insert((group, shard), pool);
    }

    let router = ShardRouter::from_pools(pools, ShardRange::new(0, 1).expect("range"))
        .expect("build router");
    Some(PostgresStorage::new(router))
}

pub(super) fn now() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

pub(super) fn user_gid(local: u32) -> Gid {
    Gid::pack(GROUP_DATA, ObjectType::User, 0, local)
}

pub(super) fn org_gid(local: u32) -> Gid {
    Gid::pack(GROUP_DATA, ObjectType::Org, 1, local)
}

pub(super) fn invitation_gid(local: u32) -> Gid {
    Gid::pack(GROUP_DATA, ObjectType::Invitation, 1, local)
}

pub(super) fn new_user(email: &str, name: &str) -> crate::NewUser {
    crate::NewUser {
        email: email.to_owned(),
        name: name.to_owned(),
        display_name: name.to_owned(),
        password_hash: "ab".repeat(32),
        state: 0,
        created_at: now(),
    }
}
