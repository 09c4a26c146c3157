//! Cross-shard writes.
//!
//! Every operation here touches more than one shard and runs as a [`Saga`]:
//! the source row is written first, registry and relation rows after it,
//! and each successful step registers its undo.

use std::time::SystemTime;

use strongbox_auth::state::STATE_MASK_SYSTEM;
use strongbox_auth::Role;
use strongbox_core::{Gid, InvitationState, ObjectType};

use crate::{
    Invitation, InvitationKey, NewInvitation, NewKey, NewOrg, NewStore, NewUser, ObjectUser,
    ObjectUserUpdate, Org, OrgRegistry, OrgStore, Saga, Storage, StorageError, Store, User,
    UserObject, UserObjectUpdate, UserUpdate,
};

/// A membership to be written as a forward/reverse pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMember {
    pub object_id: Gid,
    pub object_type: ObjectType,
    pub alias: String,
    pub user_id: Gid,
    pub user_name: String,
    pub state: u32,
    pub roles: String,
    pub store_key: Option<Vec<u8>>,
    pub created_by: Gid,
    pub created_at: SystemTime,
}

impl NewMember {
    fn forward_row(&self) -> ObjectUser {
        ObjectUser {
            object_id: self.object_id,
            user_id: self.user_id,
            user_name: self.user_name.clone(),
            state: self.state,
            roles: self.roles.clone(),
            store_key: self.store_key.clone(),
            created_by: self.created_by,
            created_at: self.created_at,
            modified_at: self.created_at,
        }
    }

    fn reverse_row(&self) -> UserObject {
        UserObject {
            user_id: self.user_id,
            object_id: self.object_id,
            object_type: self.object_type,
            alias: self.alias.clone(),
            favorite: false,
            state: self.state & STATE_MASK_SYSTEM,
        }
    }
}

/// Membership granted to the creator of an org or store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatorGrant {
    pub state: u32,
    pub roles: String,
    pub store_key: Option<Vec<u8>>,
}

/// Key row minted alongside a store invitation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvitationKeyInput {
    pub shard: u16,
    pub pick: u8,
    pub key: NewKey,
}

/// Both halves of a membership as currently stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRows {
    pub forward: Option<ObjectUser>,
    pub reverse: Option<UserObject>,
}

impl MemberRows {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.forward.is_some() == self.reverse.is_some()
    }
}

pub async fn create_user<S: Storage + ?Sized>(
    storage: &S,
    shard: u16,
    user: &NewUser,
) -> Result<User, StorageError> {
    let mut saga = Saga::begin("create_user");
    let created = saga
        .step("users", storage.create_user(shard, user))
        .await?;
    let id = created.id;
    saga.on_rollback(format!("delete user {id}"), storage.delete_user(id));
    saga.step(
        "user_registry",
        storage.insert_user_registry(&created.registry_row()),
    )
    .await?;
    saga.commit();
    tracing::info!(user_id = %id, "user created");
    Ok(created)
}

/// Updates the user row, then the registry when an indexed field changed.
pub async fn update_user_identity<S: Storage + ?Sized>(
    storage: &S,
    user_id: Gid,
    update: &UserUpdate,
) -> Result<User, StorageError> {
    let before = storage.get_user(user_id).await?;
    let mut saga = Saga::begin("update_user_identity");
    let after = saga
        .step("users", storage.update_user(user_id, update))
        .await?;
    let restore = before.restore_update();
    saga.on_rollback(format!("restore user {user_id}"), async move {
        storage.update_user(user_id, &restore).await.map(|_| ())
    });
    if update.touches_registry() {
        saga.step(
            "user_registry",
            storage.update_user_registry(&after.registry_row()),
        )
        .await?;
    }
    saga.commit();
    Ok(after)
}

/// Creates the org, its registry row and the creator's membership pair.
pub async fn create_org<S: Storage + ?Sized>(
    storage: &S,
    shard: u16,
    org: &NewOrg,
    creator: &User,
    grant: CreatorGrant,
) -> Result<Org, StorageError> {
    let mut saga = Saga::begin("create_org");
    let created = saga.step("orgs", storage.create_org(shard, org)).await?;
    let org_id = created.id;
    saga.on_rollback(format!("delete org {org_id}"), storage.delete_org(org_id));

    let registry_row = OrgRegistry {
        org_id,
        alias: created.alias.clone(),
        state: created.state,
    };
    saga.step("org_registry", storage.insert_org_registry(&registry_row))
        .await?;
    saga.on_rollback(
        format!("delete org registry {org_id}"),
        storage.delete_org_registry(org_id),
    );

    let member = NewMember {
        object_id: org_id,
        object_type: ObjectType::Org,
        alias: created.alias.clone(),
        user_id: creator.id,
        user_name: creator.name.clone(),
        state: grant.state,
        roles: grant.roles,
        store_key: None,
        created_by: creator.id,
        created_at: org.created_at,
    };
    write_member_pair(storage, &mut saga, &member).await?;
    saga.commit();
    tracing::info!(org_id = %org_id, alias = %created.alias, "organization created");
    Ok(created)
}

/// Creates the store, its org relation and the creator's membership pair.
/// The grant carries the content key wrapped under the creator's hash.
pub async fn create_store<S: Storage + ?Sized>(
    storage: &S,
    shard: u16,
    store: &NewStore,
    creator: &User,
    grant: CreatorGrant,
) -> Result<Store, StorageError> {
    let mut saga = Saga::begin("create_store");
    let created = saga
        .step("stores", storage.create_store(shard, store))
        .await?;
    let store_id = created.id;
    saga.on_rollback(
        format!("delete store {store_id}"),
        storage.delete_store(store_id),
    );

    let relation = OrgStore {
        org_id: created.org_id,
        store_id,
        alias: created.alias.clone(),
        state: 0,
    };
    saga.step("org_stores", storage.insert_org_store(&relation))
        .await?;
    let org_id = created.org_id;
    saga.on_rollback(
        format!("delete org store {org_id}/{store_id}"),
        storage.delete_org_store(org_id, store_id),
    );

    let member = NewMember {
        object_id: store_id,
        object_type: ObjectType::Store,
        alias: created.alias.clone(),
        user_id: creator.id,
        user_name: creator.name.clone(),
        state: grant.state,
        roles: grant.roles,
        store_key: grant.store_key,
        created_by: creator.id,
        created_at: store.created_at,
    };
    write_member_pair(storage, &mut saga, &member).await?;
    saga.commit();
    tracing::info!(store_id = %store_id, org_id = %org_id, "store created");
    Ok(created)
}

async fn write_member_pair<'a, S: Storage + ?Sized>(
    storage: &'a S,
    saga: &mut Saga<'a>,
    member: &NewMember,
) -> Result<(), StorageError> {
    let (object_id, user_id) = (member.object_id, member.user_id);
    saga.step("object_users", storage.insert_object_user(&member.forward_row()))
        .await?;
    saga.on_rollback(
        format!("delete object user {object_id}/{user_id}"),
        storage.delete_object_user(object_id, user_id),
    );
    saga.step("user_objects", storage.insert_user_object(&member.reverse_row()))
        .await?;
    saga.on_rollback(
        format!("delete user object {user_id}/{object_id}"),
        storage.delete_user_object(user_id, object_id),
    );
    Ok(())
}

/// Updates the forward row. A state change is mirrored onto the system half
/// of the reverse row; the user-settable half stays untouched. Every role in
/// `keep` must still have a holder afterwards.
pub async fn update_member<S: Storage + ?Sized>(
    storage: &S,
    object_id: Gid,
    user_id: Gid,
    update: &ObjectUserUpdate,
    keep: &[Role],
) -> Result<ObjectUser, StorageError> {
    let rows = member_rows(storage, object_id, user_id).await?;
    let (Some(before), Some(reverse)) = (rows.forward, rows.reverse) else {
        return Err(StorageError::MembershipNotFound);
    };

    let mut saga = Saga::begin("update_member");
    let after = if keep.is_empty() {
        saga.step(
            "object_users",
            storage.update_object_user(object_id, user_id, update),
        )
        .await?
    } else {
        saga.step(
            "object_users",
            storage.update_object_user_keeping(object_id, user_id, update, keep),
        )
        .await?
    };
    let restore = ObjectUserUpdate {
        state: Some(before.state),
        roles: Some(before.roles.clone()),
        store_key: before.store_key.clone(),
        modified_at: before.modified_at,
    };
    saga.on_rollback(
        format!("restore object user {object_id}/{user_id}"),
        async move {
            storage
                .update_object_user(object_id, user_id, &restore)
                .await
                .map(|_| ())
        },
    );

    if let Some(state) = update.state {
        let mirrored = (reverse.state & !STATE_MASK_SYSTEM) | (state & STATE_MASK_SYSTEM);
        if mirrored != reverse.state {
            let reverse_update = UserObjectUpdate {
                favorite: None,
                state: Some(mirrored),
            };
            saga.step(
                "user_objects",
                storage.update_user_object(user_id, object_id, &reverse_update),
            )
            .await?;
        }
    }
    saga.commit();
    Ok(after)
}

/// Removes the user from the org and from every store of the org they
/// belong to. Returns the ids of the stores they were dropped from.
pub async fn remove_org_member<S: Storage + ?Sized>(
    storage: &S,
    org_id: Gid,
    user_id: Gid,
    keep: &[Role],
) -> Result<Vec<Gid>, StorageError> {
    let org_rows = member_rows(storage, org_id, user_id).await?;
    if org_rows.forward.is_none() {
        return Err(StorageError::MembershipNotFound);
    }
    let mut stores = Vec::new();
    for placement in storage.list_org_stores(org_id).await? {
        let rows = member_rows(storage, placement.store_id, user_id).await?;
        if rows.forward.is_some() || rows.reverse.is_some() {
            stores.push((placement.store_id, rows));
        }
    }

    let mut saga = Saga::begin("remove_org_member");
    delete_member_pair(storage, &mut saga, org_id, user_id, org_rows, keep).await?;
    let mut removed = Vec::with_capacity(stores.len());
    for (store_id, rows) in stores {
        delete_member_pair(storage, &mut saga, store_id, user_id, rows, &[]).await?;
        removed.push(store_id);
    }
    saga.commit();
    tracing::info!(%org_id, %user_id, stores = removed.len(), "organization member removed");
    Ok(removed)
}

/// Deletes whichever halves `rows` found, forward first, each with a
/// reinsert registered for rollback.
async fn delete_member_pair<'a, S: Storage + ?Sized>(
    storage: &'a S,
    saga: &mut Saga<'a>,
    object_id: Gid,
    user_id: Gid,
    rows: MemberRows,
    keep: &[Role],
) -> Result<(), StorageError> {
    if rows.forward.is_some() {
        let forward = saga
            .step(
                "object_users",
                storage.delete_object_user_keeping(object_id, user_id, keep),
            )
            .await?;
        saga.on_rollback(
            format!("reinsert object user {object_id}/{user_id}"),
            async move { storage.insert_object_user(&forward).await },
        );
    } else {
        tracing::warn!(%object_id, %user_id, "forward membership row was already missing");
    }
    match rows.reverse {
        Some(reverse) => {
            saga.step(
                "user_objects",
                storage.delete_user_object(user_id, object_id),
            )
            .await?;
            saga.on_rollback(
                format!("reinsert user object {user_id}/{object_id}"),
                async move { storage.insert_user_object(&reverse).await },
            );
        }
        None => {
            tracing::warn!(%object_id, %user_id, "reverse membership row was already missing");
        }
    }
    Ok(())
}

pub async fn member_rows<S: Storage + ?Sized>(
    storage: &S,
    object_id: Gid,
    user_id: Gid,
) -> Result<MemberRows, StorageError> {
    let forward = storage.get_object_user(object_id, user_id).await?;
    let reverse = storage.get_user_object(user_id, object_id).await?;
    Ok(MemberRows { forward, reverse })
}

/// Writes the optional key row, the invitation on its object's shard, then
/// the registry row.
pub async fn create_invitation<S: Storage + ?Sized>(
    storage: &S,
    mut invitation: NewInvitation,
    key: Option<InvitationKeyInput>,
) -> Result<Invitation, StorageError> {
    let mut saga = Saga::begin("create_invitation");
    if let Some(input) = key {
        let key_row = saga
            .step("keys", storage.create_key(input.shard, &input.key))
            .await?;
        let key_id = key_row.id;
        saga.on_rollback(format!("delete key {key_id}"), storage.delete_key(key_id));
        invitation.key = Some(InvitationKey {
            key_id,
            pick: input.pick,
        });
    }

    let created = saga
        .step("invitations", storage.create_invitation(&invitation))
        .await?;
    let invitation_id = created.id;
    saga.on_rollback(
        format!("delete invitation {invitation_id}"),
        storage.delete_invitation(invitation_id),
    );
    saga.step(
        "invitation_registry",
        storage.insert_invitation_registry(&created.registry_row()),
    )
    .await?;
    saga.commit();
    tracing::info!(
        invitation_id = %invitation_id,
        object_id = %created.object_id,
        "invitation created"
    );
    Ok(created)
}

/// Moves a pending invitation to `state`: data row first, registry row
/// second. Any other current state fails with
/// [`StorageError::InvitationClosed`].
pub async fn set_invitation_state<S: Storage + ?Sized>(
    storage: &S,
    invitation_id: Gid,
    state: InvitationState,
    now: SystemTime,
) -> Result<(), StorageError> {
    let mut saga = Saga::begin("set_invitation_state");
    close_invitation(storage, &mut saga, invitation_id, state, now).await?;
    saga.commit();
    tracing::debug!(%invitation_id, state = ?state, "invitation state changed");
    Ok(())
}

/// Claims the invitation as accepted, then writes the membership pair. A
/// concurrent decline, revoke or expiry wins the claim and nothing is added.
pub async fn accept_invitation<S: Storage + ?Sized>(
    storage: &S,
    invitation_id: Gid,
    member: &NewMember,
    now: SystemTime,
) -> Result<ObjectUser, StorageError> {
    let mut saga = Saga::begin("accept_invitation");
    close_invitation(storage, &mut saga, invitation_id, InvitationState::Accepted, now).await?;
    write_member_pair(storage, &mut saga, member).await?;
    saga.commit();
    tracing::info!(%invitation_id, object_id = %member.object_id, user_id = %member.user_id, "invitation accepted");
    Ok(member.forward_row())
}

async fn close_invitation<'a, S: Storage + ?Sized>(
    storage: &'a S,
    saga: &mut Saga<'a>,
    invitation_id: Gid,
    state: InvitationState,
    now: SystemTime,
) -> Result<(), StorageError> {
    let before = storage.get_invitation(invitation_id).await?;
    if before.state != InvitationState::Pending {
        return Err(StorageError::InvitationClosed);
    }
    let pending = InvitationState::Pending;
    saga.step(
        "invitations",
        storage.set_invitation_state(invitation_id, pending, state, now),
    )
    .await?;
    saga.on_rollback(
        format!("reopen invitation {invitation_id}"),
        storage.set_invitation_state(invitation_id, state, pending, before.modified_at),
    );
    saga.step(
        "invitation_registry",
        storage.set_invitation_registry_state(invitation_id, pending, state),
    )
    .await?;
    saga.on_rollback(
        format!("reopen invitation registry {invitation_id}"),
        storage.set_invitation_registry_state(invitation_id, state, pending),
    );
    Ok(())
}

/// Replaces the user's wrapped store keys, then the password hash itself.
/// `rewrapped` holds `(store id, new wrapped key)` pairs.
pub async fn change_password<S: Storage + ?Sized>(
    storage: &S,
    user: &User,
    new_hash: &str,
    rewrapped: Vec<(Gid, Vec<u8>)>,
    now: SystemTime,
) -> Result<User, StorageError> {
    let user_id = user.id;
    let mut saga = Saga::begin("change_password");
    for (store_id, wrapped) in rewrapped {
        let before = storage
            .get_object_user(store_id, user_id)
            .await?
            .ok_or(StorageError::MembershipNotFound)?;
        let update = ObjectUserUpdate {
            state: None,
            roles: None,
            store_key: Some(wrapped),
            modified_at: now,
        };
        saga.step(
            "object_users",
            storage.update_object_user(store_id, user_id, &update),
        )
        .await?;
        let restore = ObjectUserUpdate {
            state: None,
            roles: None,
            store_key: before.store_key,
            modified_at: before.modified_at,
        };
        saga.on_rollback(
            format!("restore store key {store_id}/{user_id}"),
            async move {
                storage
                    .update_object_user(store_id, user_id, &restore)
                    .await
                    .map(|_| ())
            },
        );
    }

    let mut update = UserUpdate::at(now);
    update.password_hash = Some(new_hash.to_owned());
    let updated = saga
        .step("users", storage.update_user(user_id, &update))
        .await?;
    saga.commit();
    tracing::info!(%user_id, "password changed");
    Ok(updated)
}
