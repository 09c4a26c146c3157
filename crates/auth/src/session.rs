#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strongbox_core::Gid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{constant_time_eq, NONCE_LEN, TAG_LEN};
use crate::store_session::{store_session_key, StoreSession, StoreSessionError};

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_VERSION: u8 = 1;
const HEADER_LENGTH: usize = 1 + 8 + NONCE_LEN;
const MAC_LENGTH: usize = 32;
const MIN_TOKEN_LENGTH: usize = HEADER_LENGTH + TAG_LEN + MAC_LENGTH;

pub const KEY_USER_ID: &str = "user-id";
pub const KEY_USER_EMAIL: &str = "user-email";
pub const KEY_USER_NAME: &str = "user-name";
pub const KEY_USER_HASH: &str = "user-hash";
pub const KEY_INVITATION_ID: &str = "invitation-id";
const STORE_SESSION_PREFIX: &str = "_s:";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid session token")]
    InvalidSession,
    #[error("session token expired")]
    SessionExpired,
    #[error("session secrets must not be empty")]
    EmptySecret,
    #[error("session expiry is out of range")]
    ExpiryOutOfRange,
}

/// Seals the session map into an encrypted, signed cookie value.
///
/// Token layout before base64url:
///
/// ```text
/// [ version (1) ][ expiry secs (8, BE) ][ nonce (12) ][ ciphertext + tag ][ HMAC-SHA256 (32) ]
/// ```
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionCodec {
    mac_key: [u8; 32],
    cipher_key: [u8; 32],
    #[zeroize(skip)]
    ttl: Duration,
}

impl SessionCodec {
    /// Keys are SHA-256 digests of the configured secrets.
    pub fn new(hash_secret: &str, encryption_secret: &str, ttl: Duration) -> Result<Self, SessionError> {
        if hash_secret.is_empty() || encryption_secret.is_empty() {
            return Err(SessionError::EmptySecret);
        }
        Ok(Self {
            mac_key: Sha256::digest(hash_secret.as_bytes()).into(),
            cipher_key: Sha256::digest(encryption_secret.as_bytes()).into(),
            ttl,
        })
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn encode(&self, data: &SessionData, now: SystemTime) -> Result<String, SessionError> {
        let expiry = now
            .checked_add(self.ttl)
            .ok_or(SessionError::ExpiryOutOfRange)?
            .duration_since(UNIX_EPOCH)
            .map_err(|_| SessionError::ExpiryOutOfRange)?
            .as_secs();

        let plaintext = serde_json::to_vec(data).map_err(|_| SessionError::InvalidSession)?;
        let mut nonce = [0_u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let cipher =
            Aes256Gcm::new_from_slice(&self.cipher_key).map_err(|_| SessionError::InvalidSession)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| SessionError::InvalidSession)?;

        let mut token = Vec::with_capacity(HEADER_LENGTH + ciphertext.len() + MAC_LENGTH);
        token.push(SESSION_VERSION);
        token.extend_from_slice(&expiry.to_be_bytes());
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&ciphertext);
        let mac = self.sign(&token)?;
        token.extend_from_slice(&mac);

        Ok(URL_SAFE_NO_PAD.encode(token))
    }

    pub fn decode(&self, raw: &str, now: SystemTime) -> Result<SessionData, SessionError> {
        let token = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|_| SessionError::InvalidSession)?;
        if token.len() < MIN_TOKEN_LENGTH || token[0] != SESSION_VERSION {
            return Err(SessionError::InvalidSession);
        }

        let (signed, mac) = token.split_at(token.len() - MAC_LENGTH);
        let expected = self.sign(signed)?;
        if !constant_time_eq(mac, &expected) {
            return Err(SessionError::InvalidSession);
        }

        let expiry = u64::from_be_bytes(
            signed[1..9]
                .try_into()
                .map_err(|_| SessionError::InvalidSession)?,
        );
        let expires_at = UNIX_EPOCH
            .checked_add(Duration::from_secs(expiry))
            .ok_or(SessionError::ExpiryOutOfRange)?;
        if now > expires_at {
            return Err(SessionError::SessionExpired);
        }

        let cipher =
            Aes256Gcm::new_from_slice(&self.cipher_key).map_err(|_| SessionError::InvalidSession)?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&signed[9..HEADER_LENGTH]),
                &signed[HEADER_LENGTH..],
            )
            .map_err(|_| SessionError::InvalidSession)?;
        serde_json::from_slice(&plaintext).map_err(|_| SessionError::InvalidSession)
    }

    fn sign(&self, bytes: &[u8]) -> Result<[u8; MAC_LENGTH], SessionError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .map_err(|_| SessionError::InvalidSession)?;
        mac.update(bytes);
        let mut signature = [0_u8; MAC_LENGTH];
        signature.copy_from_slice(&mac.finalize().into_bytes());
        Ok(signature)
    }
}

impl std::fmt::Debug for SessionCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCodec")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// The signed-in user as recorded in the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub id: Gid,
    pub email: String,
    pub name: String,
    pub password_hash: String,
}

/// String map carried in the session cookie.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionData {
    values: BTreeMap<String, String>,
}

impl SessionData {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// None unless every user key is present and the id parses.
    #[must_use]
    pub fn user(&self) -> Option<SessionUser> {
        Some(SessionUser {
            id: self.get(KEY_USER_ID)?.parse().ok()?,
            email: self.get(KEY_USER_EMAIL)?.to_owned(),
            name: self.get(KEY_USER_NAME)?.to_owned(),
            password_hash: self.get(KEY_USER_HASH)?.to_owned(),
        })
    }

    /// Replaces any previous identity; a pending invitation id survives.
    pub fn login(&mut self, user: &SessionUser) {
        let invitation = self.remove(KEY_INVITATION_ID);
        self.clear();
        self.set(KEY_USER_ID, user.id.to_string());
        self.set(KEY_USER_EMAIL, user.email.clone());
        self.set(KEY_USER_NAME, user.name.clone());
        self.set(KEY_USER_HASH, user.password_hash.clone());
        if let Some(invitation) = invitation {
            self.set(KEY_INVITATION_ID, invitation);
        }
    }

    #[must_use]
    pub fn invitation_id(&self) -> Option<&str> {
        self.get(KEY_INVITATION_ID)
    }

    /// Returns the store session, dropping it if it no longer decodes.
    pub fn store_session(&mut self, store_id: Gid) -> Option<StoreSession> {
        let key = store_session_key(store_id);
        let raw = self.values.get(&key)?;
        match StoreSession::decode(raw) {
            Ok(session) if session.store_id() == store_id => Some(session),
            _ => {
                self.values.remove(&key);
                None
            }
        }
    }

    pub fn set_store_session(&mut self, session: &StoreSession) -> Result<(), StoreSessionError> {
        self.set(store_session_key(session.store_id()), session.encode()?);
        Ok(())
    }

    pub fn remove_store_session(&mut self, store_id: Gid) {
        self.values.remove(&store_session_key(store_id));
    }

    pub fn clear_store_sessions(&mut self) {
        self.values
            .retain(|key, _| !key.starts_with(STORE_SESSION_PREFIX));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use strongbox_core::clock::from_unix_seconds;
    use strongbox_core::{ObjectType, GROUP_DATA};

    use super::*;
    use crate::crypto::generate_store_key;

    fn codec() -> SessionCodec {
        SessionCodec::new("hash-secret", "encryption-secret", Duration::from_secs(3600))
            .expect("codec")
    }

    fn now() -> SystemTime {
        from_unix_seconds(1_700_000_000)
    }

    fn user() -> SessionUser {
        SessionUser {
            id: Gid::pack(GROUP_DATA, ObjectType::User, 0, 1),
            email: "a@x".to_owned(),
            name: "alice".to_owned(),
            password_hash: "ab".repeat(32),
        }
    }

    #[test]
    fn session_token_round_trip() {
        let mut data = SessionData::default();
        data.login(&user());
        let token = codec().encode(&data, now()).expect("encode");
        let decoded = codec().decode(&token, now()).expect("decode");
        assert_eq!(decoded, data);
        assert_eq!(decoded.user(), Some(user()));
    }

    #[test]
    fn session_token_rejects_expired() {
        let token = codec().encode(&SessionData::default(), now()).expect("encode");
        let error = codec()
            .decode(&token, now() + Duration::from_secs(3601))
            .expect_err("expired token should fail");
        assert_eq!(error, SessionError::SessionExpired);
    }

    #[test]
    fn session_token_rejects_other_secrets() {
        let token = codec().encode(&SessionData::default(), now()).expect("encode");
        let other = SessionCodec::new("other", "encryption-secret", Duration::from_secs(3600))
            .expect("codec");
        assert_eq!(
            other.decode(&token, now()),
            Err(SessionError::InvalidSession)
        );
    }

    #[test]
    fn session_token_rejects_tampering_and_truncation() {
        let token = codec().encode(&SessionData::default(), now()).expect("encode");
        let mut bytes = URL_SAFE_NO_PAD.decode(&token).expect("base64");
        bytes[3] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(&bytes);
        assert_eq!(
            codec().decode(&tampered, now()),
            Err(SessionError::InvalidSession)
        );
        assert_eq!(
            codec().decode(&token[..20], now()),
            Err(SessionError::InvalidSession)
        );
        assert_eq!(
            codec().decode("%%%", now()),
            Err(SessionError::InvalidSession)
        );
    }

    #[test]
    fn codec_requires_secrets() {
        assert_eq!(
            SessionCodec::new("", "x", Duration::from_secs(1)).err(),
            Some(SessionError::EmptySecret)
        );
    }

    #[test]
    fn user_requires_every_key() {
        let mut data = SessionData::default();
        data.login(&user());
        data.remove(KEY_USER_HASH);
        assert_eq!(data.user(), None);
    }

    #[test]
    fn login_keeps_pending_invitation() {
        let mut data = SessionData::default();
        data.set(KEY_INVITATION_ID, "u1");
        data.set("stale", "value");
        data.login(&user());
        assert_eq!(data.invitation_id(), Some("u1"));
        assert_eq!(data.get("stale"), None);
    }

    #[test]
    fn malformed_store_session_is_dropped() {
        let store = Gid::pack(GROUP_DATA, ObjectType::Store, 0, 4);
        let mut data = SessionData::default();
        data.set(store_session_key(store), "garbage");
        assert!(data.store_session(store).is_none());
        assert_eq!(data.get(&store_session_key(store)), None);
    }

    #[test]
    fn store_sessions_are_scoped_per_store() {
        let first = Gid::pack(GROUP_DATA, ObjectType::Store, 0, 4);
        let second = Gid::pack(GROUP_DATA, ObjectType::Store, 0, 5);
        let mut data = SessionData::default();
        data.login(&user());
        data.set_store_session(&StoreSession::open(
            first,
            generate_store_key(),
            now(),
            Duration::from_secs(60),
        ))
        .expect("store session");
        assert!(data.store_session(first).is_some());
        assert!(data.store_session(second).is_none());

        data.clear_store_sessions();
        assert!(data.store_session(first).is_none());
        assert!(data.user().is_some());
    }
}
