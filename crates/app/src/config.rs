use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use strongbox_api::{CookieSettings, Settings};
use strongbox_auth::{SessionCodec, SessionError};
use strongbox_core::{ShardRange, GROUP_DATA, GROUP_REGISTRY};
use strongbox_queue::DEFAULT_QUEUE;
use strongbox_storage::{RouterConfig, ShardConfig};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot open configuration file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Process exit status for this failure.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Open { .. } => 1,
            Self::Parse(_) | Self::Invalid(_) => 2,
        }
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bind: BindConfig,
    pub session: SessionConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queue: Option<QueueConfig>,
    #[serde(default)]
    pub vault: VaultConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BindConfig {
    pub host: String,
    pub port: u16,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionConfig {
    pub store: SessionStoreConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionStoreConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub cookie: CookieConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CookieConfig {
    #[serde(default = "default_cookie_id")]
    pub id: String,
    pub hash: String,
    pub encryption: String,
    #[serde(default)]
    pub options: CookieOptions,
}

fn default_cookie_id() -> String {
    "strongbox".to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CookieOptions {
    pub path: String,
    pub domain: Option<String>,
    pub maxage: u64,
    pub secure: bool,
    pub httponly: bool,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            path: "/".to_owned(),
            domain: None,
            maxage: 86_400,
            secure: true,
            httponly: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_timeout_seconds")]
    pub acquire_timeout_seconds: u64,
    pub data_shards: ShardRange,
    pub shards: Vec<ShardConfig>,
}

fn default_max_connections() -> u32 {
    10
}

fn default_timeout_seconds() -> u64 {
    5
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueConfig {
    pub url: String,
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_queue_name() -> String {
    DEFAULT_QUEUE.to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub store_session_minutes: u32,
    pub invitation_default_days: u32,
    pub invitation_max_days: u32,
    /// Background expiry sweep period; off when absent.
    pub invitation_sweep_seconds: Option<u64>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            store_session_minutes: settings.store_session_minutes,
            invitation_default_days: settings.invitation_default_days,
            invitation_max_days: settings.invitation_max_days,
            invitation_sweep_seconds: None,
        }
    }
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Open {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;

        let store = &self.session.store;
        if store.kind != "cookie" {
            return Err(invalid(format!(
                "session.store.type {:?} is not supported, expected \"cookie\"",
                store.kind
            )));
        }
        if store.cookie.id.trim().is_empty() {
            return Err(invalid("session cookie id must not be empty"));
        }
        if store.cookie.hash.is_empty() || store.cookie.encryption.is_empty() {
            return Err(invalid("session cookie hash and encryption secrets must be set"));
        }

        self.validate_shards()?;

        if let Some(queue) = &self.queue {
            validate_url(&queue.url, "queue", &["amqp", "amqps"])?;
            if queue.name.trim().is_empty() {
                return Err(invalid("queue name must not be empty"));
            }
        }

        let vault = &self.vault;
        if vault.store_session_minutes == 0 {
            return Err(invalid("vault.store_session_minutes must be positive"));
        }
        if !(1..=vault.invitation_max_days).contains(&vault.invitation_default_days) {
            return Err(invalid(format!(
                "vault.invitation_default_days must be between 1 and {}",
                vault.invitation_max_days
            )));
        }
        if vault.invitation_sweep_seconds == Some(0) {
            return Err(invalid("vault.invitation_sweep_seconds must be positive"));
        }
        Ok(())
    }

    fn validate_shards(&self) -> Result<(), ConfigError> {
        let database = &self.database;
        let range = database.data_shards;
        ShardRange::new(range.first, range.last).map_err(|error| invalid(error.to_string()))?;

        let mut seen = HashSet::new();
        for shard in &database.shards {
            if shard.group != GROUP_REGISTRY && shard.group != GROUP_DATA {
                return Err(invalid(format!("unknown shard group {}", shard.group)));
            }
            if !seen.insert((shard.group, shard.shard)) {
                return Err(invalid(format!(
                    "shard group {} shard {} is configured twice",
                    shard.group, shard.shard
                )));
            }
            validate_url(&shard.url, "database", &["postgres", "postgresql"])?;
        }
        if !seen.contains(&(GROUP_REGISTRY, 0)) {
            return Err(invalid("registry shard (group 0, shard 0) is not configured"));
        }
        if let Some(shard) = range
            .as_range()
            .find(|shard| !seen.contains(&(GROUP_DATA, *shard)))
        {
            return Err(invalid(format!("data shard {shard} has no database")));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host: IpAddr = self
            .bind
            .host
            .parse()
            .map_err(|_| invalid(format!("bind.host {:?} is not an IP address", self.bind.host)))?;
        Ok(SocketAddr::new(host, self.bind.port))
    }

    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            shards: self.database.shards.clone(),
            data_shards: self.database.data_shards,
            max_connections: self.database.max_connections,
            acquire_timeout: Duration::from_secs(self.database.acquire_timeout_seconds),
        }
    }

    pub fn session_codec(&self) -> Result<SessionCodec, SessionError> {
        let cookie = &self.session.store.cookie;
        SessionCodec::new(
            &cookie.hash,
            &cookie.encryption,
            Duration::from_secs(cookie.options.maxage),
        )
    }

    #[must_use]
    pub fn settings(&self) -> Settings {
        let cookie = &self.session.store.cookie;
        Settings {
            data_shards: self.database.data_shards,
            store_session_minutes: self.vault.store_session_minutes,
            invitation_default_days: self.vault.invitation_default_days,
            invitation_max_days: self.vault.invitation_max_days,
            queue_name: self
                .queue
                .as_ref()
                .map_or_else(default_queue_name, |queue| queue.name.clone()),
            cookie: CookieSettings {
                name: cookie.id.clone(),
                path: cookie.options.path.clone(),
                domain: cookie.options.domain.clone(),
                max_age: Duration::from_secs(cookie.options.maxage),
                secure: cookie.options.secure,
                http_only: cookie.options.httponly,
            },
        }
    }
}

fn validate_url(raw: &str, label: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let parsed = Url::parse(raw).map_err(|error| invalid(format!("invalid {label} URL: {error}")))?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(invalid(format!(
            "invalid {label} URL: scheme must be one of {}",
            schemes.join(", ")
        )));
    }
    Ok(())
}
