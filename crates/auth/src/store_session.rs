#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use strongbox_core::clock::{from_unix_seconds, unix_seconds};
use strongbox_core::Gid;

use crate::crypto::{StoreKey, KEY_LEN};

pub const DEFAULT_STORE_SESSION_MINUTES: u32 = 5;

/// HTTP session key holding the store session for `store_id`.
#[must_use]
pub fn store_session_key(store_id: Gid) -> String {
    format!("_s:{store_id}")
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreSessionError {
    #[error("store session is malformed")]
    Malformed,
    #[error("store session could not be encoded: {0}")]
    Encode(String),
}

/// An unwrapped store key held for a short time in the user's HTTP session.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreSession {
    store_id: Gid,
    key: StoreKey,
    established_at: SystemTime,
    expires_at: SystemTime,
}

#[derive(Serialize, Deserialize)]
struct EncodedStoreSession {
    store: Gid,
    key: String,
    established: u64,
    expires: u64,
}

impl StoreSession {
    #[must_use]
    pub fn open(store_id: Gid, key: StoreKey, now: SystemTime, lifetime: Duration) -> Self {
        Self {
            store_id,
            key,
            established_at: now,
            expires_at: now + lifetime,
        }
    }

    #[must_use]
    pub fn store_id(&self) -> Gid {
        self.store_id
    }

    #[must_use]
    pub fn key(&self) -> &StoreKey {
        &self.key
    }

    #[must_use]
    pub fn established_at(&self) -> SystemTime {
        self.established_at
    }

    #[must_use]
    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    #[must_use]
    pub fn is_open(&self, now: SystemTime) -> bool {
        self.expires_at > now
    }

    /// Moves expiry to `now + by` unless it is already later.
    pub fn extend(&mut self, now: SystemTime, by: Duration) {
        let candidate = now + by;
        if candidate > self.expires_at {
            self.expires_at = candidate;
        }
    }

    pub fn encode(&self) -> Result<String, StoreSessionError> {
        let encoded = EncodedStoreSession {
            store: self.store_id,
            key: URL_SAFE_NO_PAD.encode(self.key.as_bytes()),
            established: unix_seconds(self.established_at),
            expires: unix_seconds(self.expires_at),
        };
        let json = serde_json::to_vec(&encoded)
            .map_err(|error| StoreSessionError::Encode(error.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(raw: &str) -> Result<Self, StoreSessionError> {
        let json = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|_| StoreSessionError::Malformed)?;
        let encoded: EncodedStoreSession =
            serde_json::from_slice(&json).map_err(|_| StoreSessionError::Malformed)?;
        let key_bytes = URL_SAFE_NO_PAD
            .decode(&encoded.key)
            .map_err(|_| StoreSessionError::Malformed)?;
        if key_bytes.len() != KEY_LEN {
            return Err(StoreSessionError::Malformed);
        }
        let key = StoreKey::from_slice(&key_bytes).map_err(|_| StoreSessionError::Malformed)?;
        Ok(Self {
            store_id: encoded.store,
            key,
            established_at: from_unix_seconds(encoded.established),
            expires_at: from_unix_seconds(encoded.expires),
        })
    }
}

impl std::fmt::Debug for StoreSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSession")
            .field("store_id", &self.store_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}
