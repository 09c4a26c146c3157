//! Shard routing.
//!
//! Group 0 holds the single registry shard `(0, 0)`. Group 1 holds the data
//! shards named by the configured [`ShardRange`]. A global id carries its own
//! `(group, shard)` pair, so routing never needs a lookup.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use strongbox_core::{Gid, ShardRange, GROUP_DATA, GROUP_REGISTRY};

use crate::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("registry shard (group 0, shard 0) is not configured")]
    MissingRegistryShard,
    #[error("data shard {shard} is in the configured range but has no database")]
    MissingDataShard { shard: u16 },
    #[error("shard group {group} shard {shard} is configured twice")]
    DuplicateShard { group: u8, shard: u16 },
    #[error("unknown shard group {0}")]
    UnknownGroup(u8),
    #[error("invalid database url for group {group} shard {shard}: {message}")]
    Connect {
        group: u8,
        shard: u16,
        message: String,
    },
}

/// One configured database.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShardConfig {
    pub group: u8,
    pub shard: u16,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    pub shards: Vec<ShardConfig>,
    pub data_shards: ShardRange,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

#[derive(Clone)]
pub struct ShardRouter {
    pools: HashMap<(u8, u16), PgPool>,
    data_shards: ShardRange,
}

impl ShardRouter {
    /// Creates one lazily connecting pool per configured shard.
    pub fn build(config: &RouterConfig) -> Result<Self, RouterError> {
        let mut pools = HashMap::with_capacity(config.shards.len());
        for shard in &config.shards {
            if shard.group != GROUP_REGISTRY && shard.group != GROUP_DATA {
                return Err(RouterError::UnknownGroup(shard.group));
            }
            let key = (shard.group, shard.shard);
            if pools.contains_key(&key) {
                return Err(RouterError::DuplicateShard {
                    group: shard.group,
                    shard: shard.shard,
                });
            }
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .acquire_timeout(config.acquire_timeout)
                .connect_lazy(&shard.url)
                .map_err(|error| RouterError::Connect {
                    group: shard.group,
                    shard: shard.shard,
                    message: error.to_string(),
                })?;
            pools.insert(key, pool);
        }
        Self::from_pools(pools, config.data_shards)
    }

    /// Builds a router over existing pools, checking the same coverage rules as [`build`](Self::build).
    pub fn from_pools(
        pools: HashMap<(u8, u16), PgPool>,
        data_shards: ShardRange,
    ) -> Result<Self, RouterError> {
        if !pools.contains_key(&(GROUP_REGISTRY, 0)) {
            return Err(RouterError::MissingRegistryShard);
        }
        if let Some(shard) = data_shards
            .as_range()
            .find(|shard| !pools.contains_key(&(GROUP_DATA, *shard)))
        {
            return Err(RouterError::MissingDataShard { shard });
        }
        Ok(Self { pools, data_shards })
    }

    #[must_use]
    pub fn data_shards(&self) -> ShardRange {
        self.data_shards
    }

    /// Picks a data shard for a new row.
    #[must_use]
    pub fn random_data_shard(&self) -> u16 {
        self.data_shards.random_shard()
    }

    /// Pool owning the row identified by `id`.
    pub fn connect(&self, id: Gid) -> Result<&PgPool, StorageError> {
        self.connect_to(id.group(), id.shard())
    }

    pub fn connect_to(&self, group: u8, shard: u16) -> Result<&PgPool, StorageError> {
        self.pools
            .get(&(group, shard))
            .ok_or(StorageError::ShardNotConfigured { group, shard })
    }

    pub fn registry(&self) -> Result<&PgPool, StorageError> {
        self.connect_to(GROUP_REGISTRY, 0)
    }

    pub fn data(&self, shard: u16) -> Result<&PgPool, StorageError> {
        self.connect_to(GROUP_DATA, shard)
    }

    pub(crate) fn pools(&self) -> impl Iterator<Item = (&(u8, u16), &PgPool)> {
        self.pools.iter()
    }

    pub async fn close(&self) {
        for pool in self.pools.values() {
            pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(shards: &[(u8, u16)], data: (u16, u16)) -> RouterConfig {
        RouterConfig {
            shards: shards
                .iter()
                .map(|(group, shard)| ShardConfig {
                    group: *group,
                    shard: *shard,
                    url: "postgres://localhost/strongbox".to_owned(),
                })
                .collect(),
            data_shards: ShardRange::new(data.0, data.1).expect("range"),
            max_connections: 2,
            acquire_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn build_routes_ids_to_their_shard() {
        let router = ShardRouter::build(&config(&[(0, 0), (1, 0), (1, 1)], (0, 1)))
            .expect("build router");
        let id = Gid::pack(GROUP_DATA, strongbox_core::ObjectType::Store, 1, 7);
        assert!(router.connect(id).is_ok());
        assert!(router.registry().is_ok());
        assert_eq!(
            router
                .connect(Gid::pack(GROUP_DATA, strongbox_core::ObjectType::Store, 5, 7))
                .err(),
            Some(StorageError::ShardNotConfigured {
                group: GROUP_DATA,
                shard: 5
            })
        );
        assert!(router.data_shards().contains(router.random_data_shard()));
    }

    #[tokio::test]
    async fn build_rejects_incomplete_layouts() {
        assert!(matches!(
            ShardRouter::build(&config(&[(1, 0)], (0, 0))),
            Err(RouterError::MissingRegistryShard)
        ));
        assert!(matches!(
            ShardRouter::build(&config(&[(0, 0), (1, 0)], (0, 2))),
            Err(RouterError::MissingDataShard { shard: 1 })
        ));
        assert!(matches!(
            ShardRouter::build(&config(&[(0, 0), (0, 0)], (0, 0))),
            Err(RouterError::DuplicateShard { group: 0, shard: 0 })
        ));
        assert!(matches!(
            ShardRouter::build(&config(&[(0, 0), (2, 0)], (0, 0))),
            Err(RouterError::UnknownGroup(2))
        ));
    }

    #[tokio::test]
    async fn build_rejects_unparseable_url() {
        let mut cfg = config(&[(0, 0)], (0, 0));
        cfg.shards[0].url = "not a url".to_owned();
        cfg.shards.push(ShardConfig {
            group: 1,
            shard: 0,
            url: "postgres://localhost/db".to_owned(),
        });
        assert!(matches!(
            ShardRouter::build(&cfg),
            Err(RouterError::Connect { group: 0, .. })
        ));
    }
}
