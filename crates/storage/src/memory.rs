//! In-process backend with the same uniqueness rules as the SQL schema.
//!
//! Used by API tests and local tooling. [`MemoryStorage::fail_next`] makes
//! the next call of a named trait method return [`StorageError::Unavailable`],
//! which is how saga compensation paths get exercised.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use strongbox_auth::Role;
use strongbox_core::{Gid, InvitationState, ObjectType, GROUP_DATA};

use crate::{
    ensure_roles_kept, Entry, EntryKind, EntryStorage, EntryUpdate, Invitation, InvitationRegistry,
    InvitationStorage, Key, KeyStorage, MembershipStorage, NewEntry, NewInvitation, NewKey,
    NewOrg, NewStore, NewUser, ObjectUser, ObjectUserUpdate, Org, OrgRegistry, OrgStorage,
    OrgStore, RegistryStorage, StorageError, Store, StoreStorage, User, UserObject,
    UserObjectUpdate, UserRegistry, UserStorage, UserUpdate,
};

#[derive(Default)]
struct State {
    next_local: BTreeMap<u16, u32>,
    fail_next: Vec<&'static str>,
    users: BTreeMap<Gid, User>,
    user_registry: BTreeMap<Gid, UserRegistry>,
    orgs: BTreeMap<Gid, Org>,
    org_registry: BTreeMap<Gid, OrgRegistry>,
    stores: BTreeMap<Gid, Store>,
    org_stores: BTreeMap<(Gid, Gid), OrgStore>,
    object_users: BTreeMap<(Gid, Gid), ObjectUser>,
    user_objects: BTreeMap<(Gid, Gid), UserObject>,
    keys: BTreeMap<Gid, Key>,
    invitations: BTreeMap<Gid, Invitation>,
    invitation_registry: BTreeMap<Gid, InvitationRegistry>,
    entries: BTreeMap<(Gid, Gid), Entry>,
}

impl State {
    fn check(&mut self, op: &'static str) -> Result<(), StorageError> {
        if let Some(index) = self.fail_next.iter().position(|name| *name == op) {
            self.fail_next.remove(index);
            return Err(StorageError::Unavailable);
        }
        Ok(())
    }

    fn members_of(&self, object_id: Gid) -> Vec<ObjectUser> {
        self.object_users
            .values()
            .filter(|row| row.object_id == object_id)
            .cloned()
            .collect()
    }

    fn allocate(&mut self, object_type: ObjectType, shard: u16) -> Result<Gid, StorageError> {
        let next = self.next_local.entry(shard).or_insert(0);
        *next = next.checked_add(1).ok_or(StorageError::IdSpaceExhausted)?;
        Ok(Gid::pack(GROUP_DATA, object_type, shard, *next))
    }
}

fn apply_object_user_update(row: &mut ObjectUser, update: &ObjectUserUpdate) {
    if let Some(value) = update.state {
        row.state = value;
    }
    if let Some(roles) = &update.roles {
        row.roles.clone_from(roles);
    }
    if let Some(store_key) = &update.store_key {
        row.store_key = Some(store_key.clone());
    }
    row.modified_at = update.modified_at;
}

#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call to the trait method named `op` fail.
    pub fn fail_next(&self, op: &'static str) {
        self.lock().fail_next.push(op);
    }

    /// Number of rows across all tables, for asserting that nothing changed.
    #[must_use]
    pub fn row_count(&self) -> usize {
        let state = self.lock();
        state.users.len()
            + state.user_registry.len()
            + state.orgs.len()
            + state.org_registry.len()
            + state.stores.len()
            + state.org_stores.len()
            + state.object_users.len()
            + state.user_objects.len()
            + state.keys.len()
            + state.invitations.len()
            + state.invitation_registry.len()
            + state.entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RegistryStorage for MemoryStorage {
    async fn ping(&self) -> Result<(), StorageError> {
        self.lock().check("ping")
    }

    async fn insert_user_registry(&self, row: &UserRegistry) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("insert_user_registry")?;
        let clash = state.user_registry.values().any(|existing| {
            existing.user_id == row.user_id
                || existing.email == row.email
                || existing.name == row.name
        });
        if clash {
            return Err(StorageError::AlreadyExists);
        }
        state.user_registry.insert(row.user_id, row.clone());
        Ok(())
    }

    async fn update_user_registry(&self, row: &UserRegistry) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("update_user_registry")?;
        if !state.user_registry.contains_key(&row.user_id) {
            return Err(StorageError::UserNotFound);
        }
        let clash = state.user_registry.values().any(|existing| {
            existing.user_id != row.user_id
                && (existing.email == row.email || existing.name == row.name)
        });
        if clash {
            return Err(StorageError::AlreadyExists);
        }
        state.user_registry.insert(row.user_id, row.clone());
        Ok(())
    }

    async fn delete_user_registry(&self, user_id: Gid) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("delete_user_registry")?;
        state
            .user_registry
            .remove(&user_id)
            .map(|_| ())
            .ok_or(StorageError::UserNotFound)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRegistry>, StorageError> {
        let mut state = self.lock();
        state.check("find_user_by_email")?;
        Ok(state
            .user_registry
            .values()
            .find(|row| row.email == email)
            .cloned())
    }

    async fn find_user_by_name(&self, name: &str) -> Result<Option<UserRegistry>, StorageError> {
        let mut state = self.lock();
        state.check("find_user_by_name")?;
        Ok(state
            .user_registry
            .values()
            .find(|row| row.name == name)
            .cloned())
    }

    async fn insert_org_registry(&self, row: &OrgRegistry) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("insert_org_registry")?;
        let clash = state
            .org_registry
            .values()
            .any(|existing| existing.org_id == row.org_id || existing.alias == row.alias);
        if clash {
            return Err(StorageError::AlreadyExists);
        }
        state.org_registry.insert(row.org_id, row.clone());
        Ok(())
    }

    async fn delete_org_registry(&self, org_id: Gid) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("delete_org_registry")?;
        state
            .org_registry
            .remove(&org_id)
            .map(|_| ())
            .ok_or(StorageError::OrgNotFound)
    }

    async fn find_org_by_alias(&self, alias: &str) -> Result<Option<OrgRegistry>, StorageError> {
        let mut state = self.lock();
        state.check("find_org_by_alias")?;
        Ok(state
            .org_registry
            .values()
            .find(|row| row.alias == alias)
            .cloned())
    }

    async fn insert_invitation_registry(
        &self,
        row: &InvitationRegistry,
    ) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("insert_invitation_registry")?;
        let clash = state.invitation_registry.values().any(|existing| {
            existing.invitation_id == row.invitation_id
                || existing.uid == row.uid
                || (row.state == InvitationState::Pending
                    && existing.state == InvitationState::Pending
                    && existing.object_id == row.object_id
                    && existing.invitee_email == row.invitee_email)
        });
        if clash {
            return Err(StorageError::AlreadyExists);
        }
        state
            .invitation_registry
            .insert(row.invitation_id, row.clone());
        Ok(())
    }

    async fn get_invitation_registry(
        &self,
        uid: &str,
    ) -> Result<InvitationRegistry, StorageError> {
        let mut state = self.lock();
        state.check("get_invitation_registry")?;
        state
            .invitation_registry
            .values()
            .find(|row| row.uid == uid)
            .cloned()
            .ok_or(StorageError::InvitationNotFound)
    }

    async fn set_invitation_registry_state(
        &self,
        invitation_id: Gid,
        from: InvitationState,
        to: InvitationState,
    ) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("set_invitation_registry_state")?;
        let row = state
            .invitation_registry
            .get_mut(&invitation_id)
            .ok_or(StorageError::InvitationNotFound)?;
        if row.state != from {
            return Err(StorageError::InvitationClosed);
        }
        row.state = to;
        Ok(())
    }

    async fn delete_invitation_registry(&self, invitation_id: Gid) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("delete_invitation_registry")?;
        state
            .invitation_registry
            .remove(&invitation_id)
            .map(|_| ())
            .ok_or(StorageError::InvitationNotFound)
    }

    async fn find_pending_invitation(
        &self,
        object_id: Gid,
        invitee_email: &str,
    ) -> Result<Option<InvitationRegistry>, StorageError> {
        let mut state = self.lock();
        state.check("find_pending_invitation")?;
        Ok(state
            .invitation_registry
            .values()
            .find(|row| {
                row.object_id == object_id
                    && row.invitee_email == invitee_email
                    && row.state == InvitationState::Pending
            })
            .cloned())
    }

    async fn list_overdue_invitations(
        &self,
        now: SystemTime,
        limit: usize,
    ) -> Result<Vec<InvitationRegistry>, StorageError> {
        let mut state = self.lock();
        state.check("list_overdue_invitations")?;
        let mut rows: Vec<_> = state
            .invitation_registry
            .values()
            .filter(|row| row.state == InvitationState::Pending && row.expires_at <= now)
            .cloned()
            .collect();
        rows.sort_by_key(|row| (row.expires_at, row.invitation_id));
        rows.truncate(limit);
        Ok(rows)
    }
}

#[async_trait]
impl UserStorage for MemoryStorage {
    async fn create_user(&self, shard: u16, user: &NewUser) -> Result<User, StorageError> {
        let mut state = self.lock();
        state.check("create_user")?;
        let id = state.allocate(ObjectType::User, shard)?;
        let row = User {
            id,
            email: user.email.clone(),
            name: user.name.clone(),
            display_name: user.display_name.clone(),
            password_hash: user.password_hash.clone(),
            state: user.state,
            created_at: user.created_at,
            modified_at: user.created_at,
        };
        state.users.insert(id, row.clone());
        Ok(row)
    }

    async fn get_user(&self, id: Gid) -> Result<User, StorageError> {
        let mut state = self.lock();
        state.check("get_user")?;
        state.users.get(&id).cloned().ok_or(StorageError::UserNotFound)
    }

    async fn update_user(&self, id: Gid, update: &UserUpdate) -> Result<User, StorageError> {
        let mut state = self.lock();
        state.check("update_user")?;
        let row = state.users.get_mut(&id).ok_or(StorageError::UserNotFound)?;
        if let Some(email) = &update.email {
            row.email.clone_from(email);
        }
        if let Some(name) = &update.name {
            row.name.clone_from(name);
        }
        if let Some(display_name) = &update.display_name {
            row.display_name.clone_from(display_name);
        }
        if let Some(password_hash) = &update.password_hash {
            row.password_hash.clone_from(password_hash);
        }
        if let Some(value) = update.state {
            row.state = value;
        }
        row.modified_at = update.modified_at;
        Ok(row.clone())
    }

    async fn delete_user(&self, id: Gid) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("delete_user")?;
        state
            .users
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::UserNotFound)
    }
}

#[async_trait]
impl OrgStorage for MemoryStorage {
    async fn create_org(&self, shard: u16, org: &NewOrg) -> Result<Org, StorageError> {
        let mut state = self.lock();
        state.check("create_org")?;
        let id = state.allocate(ObjectType::Org, shard)?;
        let row = Org {
            id,
            alias: org.alias.clone(),
            name: org.name.clone(),
            state: 0,
            created_by: org.created_by,
            created_at: org.created_at,
            modified_at: org.created_at,
        };
        state.orgs.insert(id, row.clone());
        Ok(row)
    }

    async fn get_org(&self, id: Gid) -> Result<Org, StorageError> {
        let mut state = self.lock();
        state.check("get_org")?;
        state.orgs.get(&id).cloned().ok_or(StorageError::OrgNotFound)
    }

    async fn delete_org(&self, id: Gid) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("delete_org")?;
        state
            .orgs
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::OrgNotFound)
    }

    async fn insert_org_store(&self, row: &OrgStore) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("insert_org_store")?;
        let clash = state.org_stores.values().any(|existing| {
            existing.org_id == row.org_id
                && (existing.store_id == row.store_id || existing.alias == row.alias)
        });
        if clash {
            return Err(StorageError::AlreadyExists);
        }
        state
            .org_stores
            .insert((row.org_id, row.store_id), row.clone());
        Ok(())
    }

    async fn get_org_store(
        &self,
        org_id: Gid,
        store_id: Gid,
    ) -> Result<Option<OrgStore>, StorageError> {
        let mut state = self.lock();
        state.check("get_org_store")?;
        Ok(state.org_stores.get(&(org_id, store_id)).cloned())
    }

    async fn find_org_store(
        &self,
        org_id: Gid,
        alias: &str,
    ) -> Result<Option<OrgStore>, StorageError> {
        let mut state = self.lock();
        state.check("find_org_store")?;
        Ok(state
            .org_stores
            .values()
            .find(|row| row.org_id == org_id && row.alias == alias)
            .cloned())
    }

    async fn list_org_stores(&self, org_id: Gid) -> Result<Vec<OrgStore>, StorageError> {
        let mut state = self.lock();
        state.check("list_org_stores")?;
        let mut rows: Vec<_> = state
            .org_stores
            .values()
            .filter(|row| row.org_id == org_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.alias.cmp(&b.alias));
        Ok(rows)
    }

    async fn set_org_store_state(
        &self,
        org_id: Gid,
        store_id: Gid,
        new_state: u32,
    ) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("set_org_store_state")?;
        let row = state
            .org_stores
            .get_mut(&(org_id, store_id))
            .ok_or(StorageError::StoreNotFound)?;
        row.state = new_state;
        Ok(())
    }

    async fn delete_org_store(&self, org_id: Gid, store_id: Gid) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("delete_org_store")?;
        state
            .org_stores
            .remove(&(org_id, store_id))
            .map(|_| ())
            .ok_or(StorageError::StoreNotFound)
    }
}

#[async_trait]
impl StoreStorage for MemoryStorage {
    async fn create_store(&self, shard: u16, store: &NewStore) -> Result<Store, StorageError> {
        let mut state = self.lock();
        state.check("create_store")?;
        let id = state.allocate(ObjectType::Store, shard)?;
        let row = Store {
            id,
            org_id: store.org_id,
            alias: store.alias.clone(),
            name: store.name.clone(),
            state: 0,
            created_by: store.created_by,
            created_at: store.created_at,
            modified_at: store.created_at,
        };
        state.stores.insert(id, row.clone());
        Ok(row)
    }

    async fn get_store(&self, id: Gid) -> Result<Store, StorageError> {
        let mut state = self.lock();
        state.check("get_store")?;
        state
            .stores
            .get(&id)
            .cloned()
            .ok_or(StorageError::StoreNotFound)
    }

    async fn delete_store(&self, id: Gid) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("delete_store")?;
        state
            .stores
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::StoreNotFound)
    }
}

#[async_trait]
impl MembershipStorage for MemoryStorage {
    async fn insert_object_user(&self, row: &ObjectUser) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("insert_object_user")?;
        let key = (row.object_id, row.user_id);
        if state.object_users.contains_key(&key) {
            return Err(StorageError::AlreadyExists);
        }
        state.object_users.insert(key, row.clone());
        Ok(())
    }

    async fn get_object_user(
        &self,
        object_id: Gid,
        user_id: Gid,
    ) -> Result<Option<ObjectUser>, StorageError> {
        let mut state = self.lock();
        state.check("get_object_user")?;
        Ok(state.object_users.get(&(object_id, user_id)).cloned())
    }

    async fn list_object_users(&self, object_id: Gid) -> Result<Vec<ObjectUser>, StorageError> {
        let mut state = self.lock();
        state.check("list_object_users")?;
        let mut rows: Vec<_> = state
            .object_users
            .values()
            .filter(|row| row.object_id == object_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.user_name.cmp(&b.user_name));
        Ok(rows)
    }

    async fn update_object_user(
        &self,
        object_id: Gid,
        user_id: Gid,
        update: &ObjectUserUpdate,
    ) -> Result<ObjectUser, StorageError> {
        let mut state = self.lock();
        state.check("update_object_user")?;
        let row = state
            .object_users
            .get_mut(&(object_id, user_id))
            .ok_or(StorageError::MembershipNotFound)?;
        apply_object_user_update(row, update);
        Ok(row.clone())
    }

    async fn delete_object_user(&self, object_id: Gid, user_id: Gid) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("delete_object_user")?;
        state
            .object_users
            .remove(&(object_id, user_id))
            .map(|_| ())
            .ok_or(StorageError::MembershipNotFound)
    }

    async fn update_object_user_keeping(
        &self,
        object_id: Gid,
        user_id: Gid,
        update: &ObjectUserUpdate,
        keep: &[Role],
    ) -> Result<ObjectUser, StorageError> {
        let mut state = self.lock();
        state.check("update_object_user_keeping")?;
        let members = state.members_of(object_id);
        let current = state
            .object_users
            .get(&(object_id, user_id))
            .ok_or(StorageError::MembershipNotFound)?;
        let next = update.roles.as_deref().unwrap_or(&current.roles);
        ensure_roles_kept(&members, user_id, Some(next), keep)?;
        let row = state
            .object_users
            .get_mut(&(object_id, user_id))
            .ok_or(StorageError::MembershipNotFound)?;
        apply_object_user_update(row, update);
        Ok(row.clone())
    }

    async fn delete_object_user_keeping(
        &self,
        object_id: Gid,
        user_id: Gid,
        keep: &[Role],
    ) -> Result<ObjectUser, StorageError> {
        let mut state = self.lock();
        state.check("delete_object_user_keeping")?;
        if !state.object_users.contains_key(&(object_id, user_id)) {
            return Err(StorageError::MembershipNotFound);
        }
        ensure_roles_kept(&state.members_of(object_id), user_id, None, keep)?;
        state
            .object_users
            .remove(&(object_id, user_id))
            .ok_or(StorageError::MembershipNotFound)
    }

    async fn insert_user_object(&self, row: &UserObject) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("insert_user_object")?;
        let key = (row.user_id, row.object_id);
        if state.user_objects.contains_key(&key) {
            return Err(StorageError::AlreadyExists);
        }
        state.user_objects.insert(key, row.clone());
        Ok(())
    }

    async fn get_user_object(
        &self,
        user_id: Gid,
        object_id: Gid,
    ) -> Result<Option<UserObject>, StorageError> {
        let mut state = self.lock();
        state.check("get_user_object")?;
        Ok(state.user_objects.get(&(user_id, object_id)).cloned())
    }

    async fn list_user_objects(&self, user_id: Gid) -> Result<Vec<UserObject>, StorageError> {
        let mut state = self.lock();
        state.check("list_user_objects")?;
        let mut rows: Vec<_> = state
            .user_objects
            .values()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.object_type, &a.alias).cmp(&(b.object_type, &b.alias))
        });
        Ok(rows)
    }

    async fn update_user_object(
        &self,
        user_id: Gid,
        object_id: Gid,
        update: &UserObjectUpdate,
    ) -> Result<UserObject, StorageError> {
        let mut state = self.lock();
        state.check("update_user_object")?;
        let row = state
            .user_objects
            .get_mut(&(user_id, object_id))
            .ok_or(StorageError::MembershipNotFound)?;
        if let Some(favorite) = update.favorite {
            row.favorite = favorite;
        }
        if let Some(value) = update.state {
            row.state = value;
        }
        Ok(row.clone())
    }

    async fn delete_user_object(&self, user_id: Gid, object_id: Gid) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("delete_user_object")?;
        state
            .user_objects
            .remove(&(user_id, object_id))
            .map(|_| ())
            .ok_or(StorageError::MembershipNotFound)
    }
}

#[async_trait]
impl KeyStorage for MemoryStorage {
    async fn create_key(&self, shard: u16, key: &NewKey) -> Result<Key, StorageError> {
        let mut state = self.lock();
        state.check("create_key")?;
        let id = state.allocate(ObjectType::Key, shard)?;
        let row = Key {
            id,
            sealed: key.sealed.clone(),
            expires_at: key.expires_at,
            created_at: key.created_at,
        };
        state.keys.insert(id, row.clone());
        Ok(row)
    }

    async fn get_key(&self, id: Gid) -> Result<Key, StorageError> {
        let mut state = self.lock();
        state.check("get_key")?;
        state.keys.get(&id).cloned().ok_or(StorageError::KeyNotFound)
    }

    async fn delete_key(&self, id: Gid) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("delete_key")?;
        state
            .keys
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::KeyNotFound)
    }
}

#[async_trait]
impl InvitationStorage for MemoryStorage {
    async fn create_invitation(
        &self,
        invitation: &NewInvitation,
    ) -> Result<Invitation, StorageError> {
        let mut state = self.lock();
        state.check("create_invitation")?;
        if state
            .invitations
            .values()
            .any(|existing| existing.uid == invitation.uid)
        {
            return Err(StorageError::AlreadyExists);
        }
        let id = state.allocate(ObjectType::Invitation, invitation.object_id.shard())?;
        let row = Invitation {
            id,
            uid: invitation.uid.clone(),
            created_by: invitation.created_by,
            invitee_email: invitation.invitee_email.clone(),
            object_id: invitation.object_id,
            roles: invitation.roles.clone(),
            expires_at: invitation.expires_at,
            message: invitation.message.clone(),
            key: invitation.key,
            state: InvitationState::Pending,
            created_at: invitation.created_at,
            modified_at: invitation.created_at,
        };
        state.invitations.insert(id, row.clone());
        Ok(row)
    }

    async fn get_invitation(&self, id: Gid) -> Result<Invitation, StorageError> {
        let mut state = self.lock();
        state.check("get_invitation")?;
        state
            .invitations
            .get(&id)
            .cloned()
            .ok_or(StorageError::InvitationNotFound)
    }

    async fn set_invitation_state(
        &self,
        id: Gid,
        from: InvitationState,
        to: InvitationState,
        modified_at: SystemTime,
    ) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("set_invitation_state")?;
        let row = state
            .invitations
            .get_mut(&id)
            .ok_or(StorageError::InvitationNotFound)?;
        if row.state != from {
            return Err(StorageError::InvitationClosed);
        }
        row.state = to;
        row.modified_at = modified_at;
        Ok(())
    }

    async fn delete_invitation(&self, id: Gid) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.check("delete_invitation")?;
        state
            .invitations
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::InvitationNotFound)
    }
}

#[async_trait]
impl EntryStorage for MemoryStorage {
    async fn create_entry(&self, entry: &NewEntry) -> Result<Entry, StorageError> {
        let mut state = self.lock();
        state.check("create_entry")?;
        if !entry.parent_id.is_nil() {
            match state.entries.get(&(entry.store_id, entry.parent_id)) {
                Some(parent) if parent.kind == EntryKind::Folder => {}
                _ => return Err(StorageError::EntryNotFound),
            }
        }
        let id = state.allocate(ObjectType::Entry, entry.store_id.shard())?;
        let row = Entry {
            store_id: entry.store_id,
            id,
            parent_id: entry.parent_id,
            kind: entry.kind,
            title: entry.title.clone(),
            ciphertext: entry.ciphertext.clone(),
            created_by: entry.created_by,
            created_at: entry.created_at,
            modified_at: entry.created_at,
        };
        state.entries.insert((entry.store_id, id), row.clone());
        Ok(row)
    }

    async fn get_entry(&self, store_id: Gid, id: Gid) -> Result<Entry, StorageError> {
        let mut state = self.lock();
        state.check("get_entry")?;
        state
            .entries
            .get(&(store_id, id))
            .cloned()
            .ok_or(StorageError::EntryNotFound)
    }

    async fn list_entries(&self, store_id: Gid, parent_id: Gid) -> Result<Vec<Entry>, StorageError> {
        let mut state = self.lock();
        state.check("list_entries")?;
        let mut rows: Vec<_> = state
            .entries
            .values()
            .filter(|row| row.store_id == store_id && row.parent_id == parent_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.kind as i16, &a.title, a.id).cmp(&(b.kind as i16, &b.title, b.id))
        });
        Ok(rows)
    }

    async fn update_entry(
        &self,
        store_id: Gid,
        id: Gid,
        update: &EntryUpdate,
    ) -> Result<Entry, StorageError> {
        let mut state = self.lock();
        state.check("update_entry")?;
        let row = state
            .entries
            .get_mut(&(store_id, id))
            .ok_or(StorageError::EntryNotFound)?;
        if let Some(title) = &update.title {
            row.title.clone_from(title);
        }
        if let Some(ciphertext) = &update.ciphertext {
            row.ciphertext.clone_from(ciphertext);
        }
        row.modified_at = update.modified_at;
        Ok(row.clone())
    }

    async fn delete_entry(&self, store_id: Gid, id: Gid) -> Result<u64, StorageError> {
        let mut state = self.lock();
        state.check("delete_entry")?;
        if !state.entries.contains_key(&(store_id, id)) {
            return Err(StorageError::EntryNotFound);
        }
        let mut pending = vec![id];
        let mut removed = 0;
        while let Some(current) = pending.pop() {
            if state.entries.remove(&(store_id, current)).is_some() {
                removed += 1;
            }
            pending.extend(
                state
                    .entries
                    .values()
                    .filter(|row| row.store_id == store_id && row.parent_id == current)
                    .map(|row| row.id),
            );
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ROOT_ENTRY;

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[tokio::test]
    async fn fail_next_trips_exactly_once() {
        let storage = MemoryStorage::new();
        storage.fail_next("ping");
        assert_eq!(storage.ping().await, Err(StorageError::Unavailable));
        assert_eq!(storage.ping().await, Ok(()));
    }

    #[tokio::test]
    async fn user_registry_uniqueness_matches_schema() {
        let storage = MemoryStorage::new();
        let row = UserRegistry {
            user_id: Gid::from_raw(1),
            email: "a@x".to_owned(),
            name: "alice".to_owned(),
            state: 0,
        };
        storage.insert_user_registry(&row).await.expect("insert");
        let same_name = UserRegistry {
            user_id: Gid::from_raw(2),
            email: "other@x".to_owned(),
            ..row.clone()
        };
        assert_eq!(
            storage.insert_user_registry(&same_name).await,
            Err(StorageError::AlreadyExists)
        );
    }

    #[tokio::test]
    async fn one_pending_invitation_per_object_and_invitee() {
        let storage = MemoryStorage::new();
        let row = InvitationRegistry {
            invitation_id: Gid::from_raw(1),
            uid: "a".repeat(40),
            object_id: Gid::from_raw(9),
            created_by: Gid::from_raw(2),
            invitee_email: "b@x".to_owned(),
            expires_at: now(),
            state: InvitationState::Pending,
        };
        storage.insert_invitation_registry(&row).await.expect("insert");
        let second = InvitationRegistry {
            invitation_id: Gid::from_raw(3),
            uid: "c".repeat(40),
            ..row.clone()
        };
        assert_eq!(
            storage.insert_invitation_registry(&second).await,
            Err(StorageError::AlreadyExists)
        );

        storage
            .set_invitation_registry_state(
                row.invitation_id,
                InvitationState::Pending,
                InvitationState::Expired,
            )
            .await
            .expect("expire");
        assert_eq!(
            storage
                .find_pending_invitation(row.object_id, "b@x")
                .await
                .expect("find"),
            None
        );
        storage
            .insert_invitation_registry(&second)
            .await
            .expect("slot is free again");
    }

    #[tokio::test]
    async fn ids_are_packed_for_the_requested_shard() {
        let storage = MemoryStorage::new();
        let key = storage
            .create_key(
                3,
                &NewKey {
                    sealed: vec![1],
                    expires_at: None,
                    created_at: now(),
                },
            )
            .await
            .expect("key");
        assert_eq!(key.id.group(), GROUP_DATA);
        assert_eq!(key.id.shard(), 3);
        assert!(key.id.is_type(ObjectType::Key));
    }

    #[tokio::test]
    async fn delete_entry_is_recursive() {
        let storage = MemoryStorage::new();
        let store = Gid::pack(GROUP_DATA, ObjectType::Store, 0, 1);
        let new_entry = |parent_id, kind| NewEntry {
            store_id: store,
            parent_id,
            kind,
            title: "t".to_owned(),
            ciphertext: Vec::new(),
            created_by: Gid::from_raw(1),
            created_at: now(),
        };
        let folder = storage
            .create_entry(&new_entry(ROOT_ENTRY, EntryKind::Folder))
            .await
            .expect("folder");
        storage
            .create_entry(&new_entry(folder.id, EntryKind::Json))
            .await
            .expect("child");
        assert_eq!(storage.delete_entry(store, folder.id).await, Ok(2));
        assert_eq!(storage.row_count(), 0);
    }
}
