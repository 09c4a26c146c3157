#![forbid(unsafe_code)]

//! Store-key wrapping and entry value encryption.
//!
//! Wrapped key layout:
//!
//! ```text
//! [ version (1) ][ pick (1) ][ nonce (12) ][ ciphertext + GCM tag ]
//! ```
//!
//! The key-encryption key is HKDF-SHA256 over the hex password hash with the
//! pick byte as salt, so the same key wrapped twice under the same password
//! yields unrelated blobs. Entry values use plain `[nonce][ciphertext + tag]`.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const WRAP_VERSION: u8 = 1;
pub const WRAPPED_KEY_LEN: usize = 2 + NONCE_LEN + KEY_LEN + TAG_LEN;

const WRAP_INFO: &[u8] = b"strongbox.key-wrap.v1";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("malformed wrapped key")]
    MalformedWrappedKey,
    #[error("malformed ciphertext")]
    MalformedCiphertext,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("cipher failure")]
    Cipher,
}

/// A store content key. Cleared from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct StoreKey([u8; KEY_LEN]);

impl StoreKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::MalformedWrappedKey)?;
        Ok(Self(array))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StoreKey(..)")
    }
}

/// A key wrapped under a password hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey(Vec<u8>);

impl WrappedKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != WRAPPED_KEY_LEN || bytes[0] != WRAP_VERSION {
            return Err(CryptoError::MalformedWrappedKey);
        }
        Ok(Self(bytes))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    #[must_use]
    pub fn pick(&self) -> u8 {
        self.0[1]
    }

    /// Splits off the pick byte so it can be stored apart from the blob.
    #[must_use]
    pub fn seal(&self) -> (u8, Vec<u8>) {
        let mut sealed = Vec::with_capacity(self.0.len() - 1);
        sealed.push(self.0[0]);
        sealed.extend_from_slice(&self.0[2..]);
        (self.0[1], sealed)
    }

    /// Inverse of [`WrappedKey::seal`].
    pub fn from_sealed(pick: u8, sealed: &[u8]) -> Result<Self, CryptoError> {
        let Some((&version, rest)) = sealed.split_first() else {
            return Err(CryptoError::MalformedWrappedKey);
        };
        let mut bytes = Vec::with_capacity(sealed.len() + 1);
        bytes.push(version);
        bytes.push(pick);
        bytes.extend_from_slice(rest);
        Self::from_bytes(bytes)
    }
}

#[must_use]
pub fn generate_store_key() -> StoreKey {
    let mut key = [0_u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    StoreKey(key)
}

pub fn wrap_key(password_hash: &str, key: &StoreKey) -> Result<WrappedKey, CryptoError> {
    let mut pick = [0_u8; 1];
    OsRng.fill_bytes(&mut pick);
    wrap_key_with_pick(password_hash, key, pick[0])
}

fn wrap_key_with_pick(
    password_hash: &str,
    key: &StoreKey,
    pick: u8,
) -> Result<WrappedKey, CryptoError> {
    let cipher = key_encryption_cipher(password_hash, pick)?;
    let mut nonce_bytes = [0_u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), key.as_bytes().as_slice())
        .map_err(|_| CryptoError::Cipher)?;

    let mut blob = Vec::with_capacity(WRAPPED_KEY_LEN);
    blob.push(WRAP_VERSION);
    blob.push(pick);
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    WrappedKey::from_bytes(blob)
}

/// Fails with [`CryptoError::InvalidCredentials`] when the tag does not verify.
pub fn unwrap_key(password_hash: &str, wrapped: &WrappedKey) -> Result<StoreKey, CryptoError> {
    let bytes = wrapped.as_bytes();
    let cipher = key_encryption_cipher(password_hash, bytes[1])?;
    let nonce = Nonce::from_slice(&bytes[2..2 + NONCE_LEN]);
    let mut plaintext = cipher
        .decrypt(nonce, &bytes[2 + NONCE_LEN..])
        .map_err(|_| CryptoError::InvalidCredentials)?;
    let key = StoreKey::from_slice(&plaintext);
    plaintext.zeroize();
    key
}

pub fn encrypt_value(key: &StoreKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Cipher)?;
    let mut nonce_bytes = [0_u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::Cipher)?;

    let mut output = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt_value(key: &StoreKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::MalformedCiphertext);
    }
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Cipher)?;
    cipher
        .decrypt(
            Nonce::from_slice(&ciphertext[..NONCE_LEN]),
            &ciphertext[NONCE_LEN..],
        )
        .map_err(|_| CryptoError::MalformedCiphertext)
}

/// Lowercase hex SHA-256, the form password hashes travel in.
#[must_use]
pub fn sha256_hex(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

/// 40-character lowercase hex handle: SHA-1 over a random seed.
#[must_use]
pub fn invitation_uid() -> String {
    let mut seed = [0_u8; 32];
    OsRng.fill_bytes(&mut seed);
    hex::encode(Sha1::digest(seed))
}

/// Password the per-invitation key copy is wrapped under.
///
/// Derived from the uid alone: whoever holds the uid, including anyone who
/// reads the invitation email, can unwrap the store key offline from the
/// key row. The uid is a bearer secret. Exposure ends when the key row is
/// deleted, which happens on accept, decline, revoke and expiry, and the
/// row itself expires with the invitation.
#[must_use]
pub fn invitation_password(uid: &str) -> String {
    sha256_hex(uid.as_bytes())
}

/// Length-checked comparison that does not short-circuit on content.
#[must_use]
pub fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }

    let mut diff = 0_u8;
    for (&lhs, &rhs) in left.iter().zip(right) {
        diff |= lhs ^ rhs;
    }

    diff == 0
}

fn key_encryption_cipher(password_hash: &str, pick: u8) -> Result<Aes256Gcm, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(&[pick][..]), password_hash.as_bytes());
    let mut kek = [0_u8; KEY_LEN];
    hk.expand(WRAP_INFO, &mut kek)
        .map_err(|_| CryptoError::KeyDerivation)?;
    let cipher = Aes256Gcm::new_from_slice(&kek).map_err(|_| CryptoError::Cipher);
    kek.zeroize();
    cipher
}
