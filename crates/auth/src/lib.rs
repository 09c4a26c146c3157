#![forbid(unsafe_code)]

pub mod crypto;
pub mod role;
pub mod session;
pub mod state;
pub mod store_session;

pub use crypto::{
    decrypt_value, encrypt_value, generate_store_key, invitation_password, invitation_uid,
    sha256_hex, unwrap_key, wrap_key, CryptoError, StoreKey, WrappedKey,
};
pub use role::{ParseRoleError, Role, RoleSet};
pub use session::{SessionCodec, SessionData, SessionError, SessionUser};
pub use state::StateError;
pub use store_session::{store_session_key, StoreSession, StoreSessionError};
