#![forbid(unsafe_code)]

use std::time::SystemTime;

use async_trait::async_trait;
use strongbox_auth::state::STATE_DELETED;
use strongbox_auth::{Role, RoleSet};
use strongbox_core::{Gid, InvitationState, ObjectType};

#[cfg(feature = "memory")]
pub mod memory;
pub mod postgres;
pub mod registry;
pub mod saga;

#[cfg(feature = "memory")]
pub use memory::MemoryStorage;
pub use postgres::{PostgresStorage, RouterConfig, RouterError, ShardConfig, ShardRouter};
pub use saga::Saga;

/// Parent id of top-level entries. Never stored as a row.
pub const ROOT_ENTRY: Gid = Gid::NIL;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("user not found")]
    UserNotFound,
    #[error("organization not found")]
    OrgNotFound,
    #[error("store not found")]
    StoreNotFound,
    #[error("membership not found")]
    MembershipNotFound,
    #[error("key not found")]
    KeyNotFound,
    #[error("invitation not found")]
    InvitationNotFound,
    #[error("entry not found")]
    EntryNotFound,
    #[error("row already exists")]
    AlreadyExists,
    #[error("invitation is no longer pending")]
    InvitationClosed,
    #[error("no other member holds role {0}")]
    LastRoleHolder(Role),
    #[error("no shard configured for group {group} shard {shard}")]
    ShardNotConfigured { group: u8, shard: u16 },
    #[error("local id space exhausted on shard")]
    IdSpaceExhausted,
    #[error("invalid stored row: {0}")]
    InvalidRow(String),
    #[error("storage unavailable")]
    Unavailable,
    #[error("database error: {0}")]
    Database(String),
    #[error("migration error: {0}")]
    Migration(String),
}

impl StorageError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::UserNotFound
                | Self::OrgNotFound
                | Self::StoreNotFound
                | Self::MembershipNotFound
                | Self::KeyNotFound
                | Self::InvitationNotFound
                | Self::EntryNotFound
        )
    }
}

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Gid,
    pub email: String,
    pub name: String,
    pub display_name: String,
    pub password_hash: String,
    pub state: u32,
    pub created_at: SystemTime,
    pub modified_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    pub display_name: String,
    pub password_hash: String,
    pub state: u32,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub password_hash: Option<String>,
    pub state: Option<u32>,
    pub modified_at: SystemTime,
}

impl UserUpdate {
    #[must_use]
    pub fn at(modified_at: SystemTime) -> Self {
        Self {
            email: None,
            name: None,
            display_name: None,
            password_hash: None,
            state: None,
            modified_at,
        }
    }

    /// True when a registry-indexed field changes.
    #[must_use]
    pub fn touches_registry(&self) -> bool {
        self.email.is_some() || self.name.is_some() || self.state.is_some()
    }
}

impl User {
    #[must_use]
    pub fn registry_row(&self) -> UserRegistry {
        UserRegistry {
            user_id: self.id,
            email: self.email.clone(),
            name: self.name.clone(),
            state: self.state,
        }
    }

    #[must_use]
    pub fn restore_update(&self) -> UserUpdate {
        UserUpdate {
            email: Some(self.email.clone()),
            name: Some(self.name.clone()),
            display_name: Some(self.display_name.clone()),
            password_hash: Some(self.password_hash.clone()),
            state: Some(self.state),
            modified_at: self.modified_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRegistry {
    pub user_id: Gid,
    pub email: String,
    pub name: String,
    pub state: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Org {
    pub id: Gid,
    pub alias: String,
    pub name: String,
    pub state: u32,
    pub created_by: Gid,
    pub created_at: SystemTime,
    pub modified_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrg {
    pub alias: String,
    pub name: String,
    pub created_by: Gid,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgRegistry {
    pub org_id: Gid,
    pub alias: String,
    pub state: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Store {
    pub id: Gid,
    pub org_id: Gid,
    pub alias: String,
    pub name: String,
    pub state: u32,
    pub created_by: Gid,
    pub created_at: SystemTime,
    pub modified_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStore {
    pub org_id: Gid,
    pub alias: String,
    pub name: String,
    pub created_by: Gid,
    pub created_at: SystemTime,
}

/// A store as listed on its organization's shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgStore {
    pub org_id: Gid,
    pub store_id: Gid,
    pub alias: String,
    pub state: u32,
}

/// Forward membership row, on the object's shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUser {
    pub object_id: Gid,
    pub user_id: Gid,
    pub user_name: String,
    pub state: u32,
    pub roles: String,
    /// Store content key wrapped under the member's password hash.
    pub store_key: Option<Vec<u8>>,
    pub created_by: Gid,
    pub created_at: SystemTime,
    pub modified_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUserUpdate {
    pub state: Option<u32>,
    pub roles: Option<String>,
    pub store_key: Option<Vec<u8>>,
    pub modified_at: SystemTime,
}

impl ObjectUserUpdate {
    #[must_use]
    pub fn at(modified_at: SystemTime) -> Self {
        Self {
            state: None,
            roles: None,
            store_key: None,
            modified_at,
        }
    }
}

/// Fails with [`StorageError::LastRoleHolder`] when giving `target` the
/// roles `next` (`None` removes the member) leaves a role in `keep` that
/// some active member held without any holder.
pub fn ensure_roles_kept(
    members: &[ObjectUser],
    target: Gid,
    next: Option<&str>,
    keep: &[Role],
) -> Result<(), StorageError> {
    let parse = |raw: &str| {
        RoleSet::parse_csv(raw).map_err(|error| StorageError::InvalidRow(error.to_string()))
    };
    let next = next.map(parse).transpose()?;
    let active: Vec<_> = members
        .iter()
        .filter(|member| member.state & STATE_DELETED == 0)
        .map(|member| Ok((member.user_id, parse(&member.roles)?)))
        .collect::<Result<_, StorageError>>()?;
    for &role in keep {
        let before = active.iter().filter(|(_, held)| held.covers(role)).count();
        let after = active
            .iter()
            .filter(|(user_id, held)| {
                if *user_id == target {
                    next.as_ref().is_some_and(|roles| roles.covers(role))
                } else {
                    held.covers(role)
                }
            })
            .count();
        if before > 0 && after == 0 {
            return Err(StorageError::LastRoleHolder(role));
        }
    }
    Ok(())
}

/// Reverse membership row, on the user's shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserObject {
    pub user_id: Gid,
    pub object_id: Gid,
    pub object_type: ObjectType,
    pub alias: String,
    pub favorite: bool,
    pub state: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserObjectUpdate {
    pub favorite: Option<bool>,
    pub state: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    pub id: Gid,
    /// Wrapped secret with its pick byte removed.
    pub sealed: Vec<u8>,
    pub expires_at: Option<SystemTime>,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewKey {
    pub sealed: Vec<u8>,
    pub expires_at: Option<SystemTime>,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvitationKey {
    pub key_id: Gid,
    pub pick: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    pub id: Gid,
    pub uid: String,
    pub created_by: Gid,
    pub invitee_email: String,
    pub object_id: Gid,
    pub roles: Option<String>,
    pub expires_at: SystemTime,
    pub message: Option<String>,
    pub key: Option<InvitationKey>,
    pub state: InvitationState,
    pub created_at: SystemTime,
    pub modified_at: SystemTime,
}

impl Invitation {
    #[must_use]
    pub fn registry_row(&self) -> InvitationRegistry {
        InvitationRegistry {
            invitation_id: self.id,
            uid: self.uid.clone(),
            object_id: self.object_id,
            created_by: self.created_by,
            invitee_email: self.invitee_email.clone(),
            expires_at: self.expires_at,
            state: self.state,
        }
    }

    #[must_use]
    pub fn is_pending(&self, now: SystemTime) -> bool {
        self.state == InvitationState::Pending && self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInvitation {
    pub uid: String,
    pub created_by: Gid,
    pub invitee_email: String,
    pub object_id: Gid,
    pub roles: Option<String>,
    pub expires_at: SystemTime,
    pub message: Option<String>,
    pub key: Option<InvitationKey>,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvitationRegistry {
    pub invitation_id: Gid,
    pub uid: String,
    pub object_id: Gid,
    pub created_by: Gid,
    pub invitee_email: String,
    pub expires_at: SystemTime,
    pub state: InvitationState,
}

impl InvitationRegistry {
    #[must_use]
    pub fn is_pending(&self, now: SystemTime) -> bool {
        self.state == InvitationState::Pending && self.expires_at > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum EntryKind {
    Folder = 0,
    Json = 1,
}

impl EntryKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Folder => "folder",
            Self::Json => "json",
        }
    }
}

impl TryFrom<i16> for EntryKind {
    type Error = StorageError;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Folder),
            1 => Ok(Self::Json),
            other => Err(StorageError::InvalidRow(format!("entry kind {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub store_id: Gid,
    pub id: Gid,
    pub parent_id: Gid,
    pub kind: EntryKind,
    pub title: String,
    pub ciphertext: Vec<u8>,
    pub created_by: Gid,
    pub created_at: SystemTime,
    pub modified_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub store_id: Gid,
    pub parent_id: Gid,
    pub kind: EntryKind,
    pub title: String,
    pub ciphertext: Vec<u8>,
    pub created_by: Gid,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryUpdate {
    pub title: Option<String>,
    pub ciphertext: Option<Vec<u8>>,
    pub modified_at: SystemTime,
}

// ---------------------------------------------------------------------------
// Domain-specific storage traits
// ---------------------------------------------------------------------------

/// Lookup tables on the registry shard (group 0, shard 0).
#[async_trait]
pub trait RegistryStorage: Send + Sync {
    async fn ping(&self) -> Result<(), StorageError>;

    async fn insert_user_registry(&self, row: &UserRegistry) -> Result<(), StorageError>;
    async fn update_user_registry(&self, row: &UserRegistry) -> Result<(), StorageError>;
    async fn delete_user_registry(&self, user_id: Gid) -> Result<(), StorageError>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRegistry>, StorageError>;
    async fn find_user_by_name(&self, name: &str) -> Result<Option<UserRegistry>, StorageError>;

    async fn insert_org_registry(&self, row: &OrgRegistry) -> Result<(), StorageError>;
    async fn delete_org_registry(&self, org_id: Gid) -> Result<(), StorageError>;
    async fn find_org_by_alias(&self, alias: &str) -> Result<Option<OrgRegistry>, StorageError>;

    async fn insert_invitation_registry(
        &self,
        row: &InvitationRegistry,
    ) -> Result<(), StorageError>;
    async fn get_invitation_registry(&self, uid: &str)
        -> Result<InvitationRegistry, StorageError>;
    /// Moves the row from `from` to `to`; [`StorageError::InvitationClosed`]
    /// when it is no longer in `from`.
    async fn set_invitation_registry_state(
        &self,
        invitation_id: Gid,
        from: InvitationState,
        to: InvitationState,
    ) -> Result<(), StorageError>;
    async fn delete_invitation_registry(&self, invitation_id: Gid) -> Result<(), StorageError>;
    /// The row still in the pending state for `(object, email)`, overdue or
    /// not. At most one exists.
    async fn find_pending_invitation(
        &self,
        object_id: Gid,
        invitee_email: &str,
    ) -> Result<Option<InvitationRegistry>, StorageError>;
    /// Pending-state rows whose expiry has passed, oldest first.
    async fn list_overdue_invitations(
        &self,
        now: SystemTime,
        limit: usize,
    ) -> Result<Vec<InvitationRegistry>, StorageError>;
}

#[async_trait]
pub trait UserStorage: Send + Sync {
    async fn create_user(&self, shard: u16, user: &NewUser) -> Result<User, StorageError>;
    async fn get_user(&self, id: Gid) -> Result<User, StorageError>;
    async fn update_user(&self, id: Gid, update: &UserUpdate) -> Result<User, StorageError>;
    async fn delete_user(&self, id: Gid) -> Result<(), StorageError>;
}

#[async_trait]
pub trait OrgStorage: Send + Sync {
    async fn create_org(&self, shard: u16, org: &NewOrg) -> Result<Org, StorageError>;
    async fn get_org(&self, id: Gid) -> Result<Org, StorageError>;
    async fn delete_org(&self, id: Gid) -> Result<(), StorageError>;

    async fn insert_org_store(&self, row: &OrgStore) -> Result<(), StorageError>;
    async fn get_org_store(
        &self,
        org_id: Gid,
        store_id: Gid,
    ) -> Result<Option<OrgStore>, StorageError>;
    async fn find_org_store(
        &self,
        org_id: Gid,
        alias: &str,
    ) -> Result<Option<OrgStore>, StorageError>;
    async fn list_org_stores(&self, org_id: Gid) -> Result<Vec<OrgStore>, StorageError>;
    async fn set_org_store_state(
        &self,
        org_id: Gid,
        store_id: Gid,
        state: u32,
    ) -> Result<(), StorageError>;
    async fn delete_org_store(&self, org_id: Gid, store_id: Gid) -> Result<(), StorageError>;
}

#[async_trait]
pub trait StoreStorage: Send + Sync {
    async fn create_store(&self, shard: u16, store: &NewStore) -> Result<Store, StorageError>;
    async fn get_store(&self, id: Gid) -> Result<Store, StorageError>;
    async fn delete_store(&self, id: Gid) -> Result<(), StorageError>;
}

#[async_trait]
pub trait MembershipStorage: Send + Sync {
    async fn insert_object_user(&self, row: &ObjectUser) -> Result<(), StorageError>;
    async fn get_object_user(
        &self,
        object_id: Gid,
        user_id: Gid,
    ) -> Result<Option<ObjectUser>, StorageError>;
    async fn list_object_users(&self, object_id: Gid) -> Result<Vec<ObjectUser>, StorageError>;
    async fn update_object_user(
        &self,
        object_id: Gid,
        user_id: Gid,
        update: &ObjectUserUpdate,
    ) -> Result<ObjectUser, StorageError>;
    async fn delete_object_user(&self, object_id: Gid, user_id: Gid) -> Result<(), StorageError>;
    /// [`MembershipStorage::update_object_user`] with every forward row of
    /// `object_id` locked while [`ensure_roles_kept`] runs.
    async fn update_object_user_keeping(
        &self,
        object_id: Gid,
        user_id: Gid,
        update: &ObjectUserUpdate,
        keep: &[Role],
    ) -> Result<ObjectUser, StorageError>;
    /// Deletes the forward row under the same lock and check, returning it.
    async fn delete_object_user_keeping(
        &self,
        object_id: Gid,
        user_id: Gid,
        keep: &[Role],
    ) -> Result<ObjectUser, StorageError>;

    async fn insert_user_object(&self, row: &UserObject) -> Result<(), StorageError>;
    async fn get_user_object(
        &self,
        user_id: Gid,
        object_id: Gid,
    ) -> Result<Option<UserObject>, StorageError>;
    async fn list_user_objects(&self, user_id: Gid) -> Result<Vec<UserObject>, StorageError>;
    async fn update_user_object(
        &self,
        user_id: Gid,
        object_id: Gid,
        update: &UserObjectUpdate,
    ) -> Result<UserObject, StorageError>;
    async fn delete_user_object(&self, user_id: Gid, object_id: Gid) -> Result<(), StorageError>;
}

#[async_trait]
pub trait KeyStorage: Send + Sync {
    async fn create_key(&self, shard: u16, key: &NewKey) -> Result<Key, StorageError>;
    async fn get_key(&self, id: Gid) -> Result<Key, StorageError>;
    async fn delete_key(&self, id: Gid) -> Result<(), StorageError>;
}

/// Invitation rows live on the shard of the object they grant access to.
#[async_trait]
pub trait InvitationStorage: Send + Sync {
    async fn create_invitation(
        &self,
        invitation: &NewInvitation,
    ) -> Result<Invitation, StorageError>;
    async fn get_invitation(&self, id: Gid) -> Result<Invitation, StorageError>;
    /// Compare-and-set: fails with [`StorageError::InvitationClosed`] unless
    /// the row is in `from`.
    async fn set_invitation_state(
        &self,
        id: Gid,
        from: InvitationState,
        to: InvitationState,
        modified_at: SystemTime,
    ) -> Result<(), StorageError>;
    async fn delete_invitation(&self, id: Gid) -> Result<(), StorageError>;
}

/// Entries live on their store's shard.
#[async_trait]
pub trait EntryStorage: Send + Sync {
    async fn create_entry(&self, entry: &NewEntry) -> Result<Entry, StorageError>;
    async fn get_entry(&self, store_id: Gid, id: Gid) -> Result<Entry, StorageError>;
    async fn list_entries(&self, store_id: Gid, parent_id: Gid) -> Result<Vec<Entry>, StorageError>;
    async fn update_entry(
        &self,
        store_id: Gid,
        id: Gid,
        update: &EntryUpdate,
    ) -> Result<Entry, StorageError>;
    /// Deletes the entry and, for folders, everything beneath it.
    /// Returns the number of rows removed.
    async fn delete_entry(&self, store_id: Gid, id: Gid) -> Result<u64, StorageError>;
}

/// Unified supertrait for code that needs access to all storage domains.
pub trait Storage:
    RegistryStorage
    + UserStorage
    + OrgStorage
    + StoreStorage
    + MembershipStorage
    + KeyStorage
    + InvitationStorage
    + EntryStorage
{
}

impl<T> Storage for T where
    T: RegistryStorage
        + UserStorage
        + OrgStorage
        + StoreStorage
        + MembershipStorage
        + KeyStorage
        + InvitationStorage
        + EntryStorage
{
}

// ---------------------------------------------------------------------------
// Migration helpers
// ---------------------------------------------------------------------------

/// Applies the shard schema. Every shard, registry included, carries the same tables.
pub async fn migrate_with_pool(pool: &sqlx::PgPool) -> Result<(), StorageError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|error| StorageError::Migration(error.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn pending_requires_state_and_future_expiry() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let mut row = InvitationRegistry {
            invitation_id: Gid::from_raw(1),
            uid: "u".to_owned(),
            object_id: Gid::from_raw(2),
            created_by: Gid::from_raw(3),
            invitee_email: "b@x".to_owned(),
            expires_at: now + Duration::from_secs(1),
            state: InvitationState::Pending,
        };
        assert!(row.is_pending(now));

        row.expires_at = now;
        assert!(!row.is_pending(now));

        row.expires_at = now + Duration::from_secs(60);
        row.state = InvitationState::Declined;
        assert!(!row.is_pending(now));
    }

    #[test]
    fn user_update_registry_detection() {
        let now = SystemTime::UNIX_EPOCH;
        let mut update = UserUpdate::at(now);
        update.display_name = Some("Bob".to_owned());
        update.password_hash = Some("ab".repeat(32));
        assert!(!update.touches_registry());
        update.email = Some("b@x".to_owned());
        assert!(update.touches_registry());
    }

    fn member(user: u64, roles: &str, state: u32) -> ObjectUser {
        ObjectUser {
            object_id: Gid::from_raw(100),
            user_id: Gid::from_raw(user),
            user_name: format!("user{user}"),
            state,
            roles: roles.to_owned(),
            store_key: None,
            created_by: Gid::from_raw(user),
            created_at: SystemTime::UNIX_EPOCH,
            modified_at: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn last_holder_of_a_kept_role_cannot_lose_it() {
        let manager = Role::from_bits(0x0102_0008);
        let keep = [manager];
        let members = vec![
            member(1, &manager.to_string(), 0),
            member(2, "16842755", 0),
            member(3, &manager.to_string(), STATE_DELETED),
        ];
        let target = Gid::from_raw(1);
        assert_eq!(
            ensure_roles_kept(&members, target, None, &keep),
            Err(StorageError::LastRoleHolder(manager))
        );
        assert_eq!(
            ensure_roles_kept(&members, target, Some("16842755"), &keep),
            Err(StorageError::LastRoleHolder(manager))
        );
        assert!(ensure_roles_kept(&members, Gid::from_raw(2), None, &keep).is_ok());
        assert!(ensure_roles_kept(&members, target, None, &[]).is_ok());
    }

    #[test]
    fn not_found_classification() {
        assert!(StorageError::EntryNotFound.is_not_found());
        assert!(!StorageError::AlreadyExists.is_not_found());
        assert!(!StorageError::Database("x".to_owned()).is_not_found());
    }
}
