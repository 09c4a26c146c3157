//! Invitation engine.
//!
//! ```text
//!            create
//!              |
//!          [pending] --expiry--> [expired]
//!           |  |  \
//!     accept  decline  revoke
//!         |    |        |
//! [accepted] [declined] [revoked]
//! ```
//!
//! Every state but pending is absorbing. Expiry is applied lazily on read
//! and, when configured, by [`sweep_expired`].

use std::time::{Duration, SystemTime};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::Response;
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::{json, Value};
use strongbox_auth::role::{
    CATEGORY_ORG, CATEGORY_STORE, FN_CREATE, INVITES_MANAGER, ORG_BASELINE, STORE_BASELINE,
    STORE_INVITES,
};
use strongbox_auth::session::KEY_INVITATION_ID;
use strongbox_auth::{
    invitation_password, invitation_uid, unwrap_key, wrap_key, Role, RoleSet, StoreKey,
    WrappedKey,
};
use strongbox_core::validation::{
    normalize_email, validate_alias, validate_email, validate_expiry_days, validate_password_hash,
};
use strongbox_core::{ErrorCode, Gid, InvitationState, ObjectType};
use strongbox_queue::{InvitationMessage, TEMPLATE_INVITE_ORG, TEMPLATE_INVITE_STORE};
use strongbox_storage::registry::{self, InvitationKeyInput, NewMember};
use strongbox_storage::{
    Invitation, InvitationRegistry, NewInvitation, NewKey, NewUser, Storage, StorageError, User,
};

use crate::accounts::{create_account, session_user, user_json};
use crate::pipeline::{
    accept_path, enqueue, json_body, optional_json_body, remember_invitation, rfc3339,
    AcceptPath, InvitationContext, OrgContext, RequestContext, StoreContext,
};
use crate::{ApiError, ApiState, Reply};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_MESSAGE_LENGTH: usize = 1024;

#[derive(Debug, Deserialize)]
struct InviteBody {
    invitee: String,
    #[serde(default)]
    roles: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    expiry_in_days: Option<u32>,
}

/// Profile for an invitee who registers while accepting.
#[derive(Debug, Default, Deserialize)]
struct AcceptBody {
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// What an invitation grants access to.
struct Target {
    object_id: Gid,
    object_name: String,
    category: u8,
    baseline: &'static [Role],
    template: &'static str,
    /// Store key to hand over; only store invitations carry one.
    key: Option<StoreKey>,
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

/// `POST /1/org/{org}/invite`
pub(crate) async fn invite_to_org(
    State(state): State<ApiState>,
    Path(org): Path<String>,
    jar: CookieJar,
    body: Bytes,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = invite_to_org_steps(&mut ctx, &org, &body).await;
    ctx.finish(outcome)
}

async fn invite_to_org_steps(
    ctx: &mut RequestContext,
    org: &str,
    body: &Bytes,
) -> Result<Reply, ApiError> {
    let body: InviteBody = json_body(body)?;
    let org = OrgContext::load(ctx, org, &[INVITES_MANAGER]).await?;
    let target = Target {
        object_id: org.org.id,
        object_name: org.org.name.clone(),
        category: CATEGORY_ORG,
        baseline: &ORG_BASELINE,
        template: TEMPLATE_INVITE_ORG,
        key: None,
    };
    create_invitation(ctx, &org.user, body, target).await
}

/// `POST /1/store/{store}/invite`: needs the store open so its key can be
/// wrapped for the invitee.
pub(crate) async fn invite_to_store(
    State(state): State<ApiState>,
    Path(store): Path<String>,
    jar: CookieJar,
    body: Bytes,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = invite_to_store_steps(&mut ctx, &store, &body).await;
    ctx.finish(outcome)
}

async fn invite_to_store_steps(
    ctx: &mut RequestContext,
    store: &str,
    body: &Bytes,
) -> Result<Reply, ApiError> {
    let body: InviteBody = json_body(body)?;
    let store = StoreContext::by_id(ctx, store, &[Role::new(STORE_INVITES, FN_CREATE)]).await?;
    store.ensure_not_blocked()?;
    let session = ctx.store_session(store.store.id)?;

    let invitee = normalize_email(&body.invitee);
    let org_member = match ctx.storage().find_user_by_email(&invitee).await? {
        Some(account) => ctx
            .storage()
            .get_object_user(store.store.org_id, account.user_id)
            .await?
            .is_some(),
        None => false,
    };
    if !org_member && invitee != normalize_email(&store.user.email) {
        return Err(ApiError::with_message(
            ErrorCode::NotFound,
            "invitee is not a member of the organization",
        ));
    }

    let target = Target {
        object_id: store.store.id,
        object_name: store.store.name.clone(),
        category: CATEGORY_STORE,
        baseline: &STORE_BASELINE,
        template: TEMPLATE_INVITE_STORE,
        key: Some(session.key().clone()),
    };
    create_invitation(ctx, &store.user, body, target).await
}

async fn create_invitation(
    ctx: &mut RequestContext,
    inviter: &User,
    body: InviteBody,
    target: Target,
) -> Result<Reply, ApiError> {
    let invitee = normalize_email(&body.invitee);
    validate_email(&invitee)
        .map_err(|error| ApiError::invalid_field("invitee", error.to_string()))?;
    if invitee == normalize_email(&inviter.email) {
        return Err(ApiError::invalid_field("invitee", "cannot invite yourself"));
    }
    let roles = match &body.roles {
        Some(raw) => {
            let roles = RoleSet::parse_csv(raw)
                .map_err(|error| ApiError::invalid_field("roles", error.to_string()))?;
            if roles.is_empty() || !roles.all_in_category(target.category) {
                return Err(ApiError::invalid_field(
                    "roles",
                    "roles must belong to the invited object",
                ));
            }
            roles
        }
        None => RoleSet::new(target.baseline.iter().copied()),
    };
    let settings = ctx.state.settings();
    let days = body
        .expiry_in_days
        .unwrap_or(settings.invitation_default_days);
    validate_expiry_days(days, settings.invitation_max_days)?;
    let message = body
        .message
        .map(|message| message.trim().to_owned())
        .filter(|message| !message.is_empty());
    if message
        .as_ref()
        .is_some_and(|message| message.chars().count() > MAX_MESSAGE_LENGTH)
    {
        return Err(ApiError::invalid_field(
            "message",
            format!("at most {MAX_MESSAGE_LENGTH} characters"),
        ));
    }

    let storage = ctx.storage();
    if let Some(account) = storage.find_user_by_email(&invitee).await? {
        if storage
            .get_object_user(target.object_id, account.user_id)
            .await?
            .is_some()
        {
            return Err(ApiError::with_message(
                ErrorCode::AlreadyRegistered,
                "invitee is already a member",
            ));
        }
    }
    if let Some(pending) = storage
        .find_pending_invitation(target.object_id, &invitee)
        .await?
    {
        if pending.is_pending(ctx.now) {
            return Err(ApiError::with_message(
                ErrorCode::AlreadyRegistered,
                "a pending invitation already exists",
            ));
        }
        retire_overdue(storage, &pending, ctx.now).await?;
    }

    let uid = invitation_uid();
    let expires_at = ctx.now + DAY * days;
    let key = match &target.key {
        Some(store_key) => {
            let wrapped = wrap_key(&invitation_password(&uid), store_key)?;
            let (pick, sealed) = wrapped.seal();
            Some(InvitationKeyInput {
                shard: ctx.state.pick_shard(),
                pick,
                key: NewKey {
                    sealed,
                    expires_at: Some(expires_at),
                    created_at: ctx.now,
                },
            })
        }
        None => None,
    };
    let invitation = registry::create_invitation(
        storage,
        NewInvitation {
            uid,
            created_by: inviter.id,
            invitee_email: invitee,
            object_id: target.object_id,
            roles: Some(roles.to_csv()),
            expires_at,
            message,
            key: None,
            created_at: ctx.now,
        },
        key,
    )
    .await?;

    let expiration = rfc3339(invitation.expires_at)?;
    let warning = enqueue(
        &ctx.state,
        &InvitationMessage {
            template: target.template.to_owned(),
            to: invitation.invitee_email.clone(),
            at_user: invitation.invitee_email.clone(),
            by_user: inviter.name.clone(),
            code: invitation.uid.clone(),
            message: invitation.message.clone(),
            object_name: target.object_name,
            expiration: expiration.clone(),
        },
    )
    .await;
    Ok(Reply::created(json!({
        "id": invitation.id,
        "uid": invitation.uid,
        "object": invitation.object_id,
        "invitee": invitation.invitee_email,
        "roles": invitation.roles,
        "expiration": expiration,
    }))
    .with_warning(warning))
}

// ---------------------------------------------------------------------------
// Accept
// ---------------------------------------------------------------------------

/// `POST /1/invitation/accept/{uid}`
pub(crate) async fn accept(
    State(state): State<ApiState>,
    Path(uid): Path<String>,
    jar: CookieJar,
    body: Bytes,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = accept_steps(&mut ctx, &uid, &body).await;
    ctx.finish(outcome)
}

async fn accept_steps(
    ctx: &mut RequestContext,
    uid: &str,
    body: &Bytes,
) -> Result<Reply, ApiError> {
    let body: AcceptBody = optional_json_body(body)?;
    let invitation = InvitationContext::load(ctx.storage(), uid, ctx.now).await?;

    let signed_in = ctx.session_user();
    if let Some(user) = &signed_in {
        if !invitation.is_for(&user.email) {
            tracing::warn!(
                invitation_id = %invitation.invitation.id,
                user_id = %user.id,
                "invitation opened by a different user, session closed"
            );
            ctx.session_mut().clear();
            return Err(ApiError::with_message(
                ErrorCode::SessionRequired,
                "sign in as the invitee to accept",
            ));
        }
    }
    let account = ctx
        .storage()
        .find_user_by_email(&invitation.invitation.invitee_email)
        .await?;

    match accept_path(invitation.kind, signed_in.as_ref(), account.as_ref())? {
        AcceptPath::Register => register_and_join(ctx, &invitation, body).await,
        AcceptPath::LoginRequired => {
            remember_invitation(ctx.session_mut(), invitation.uid());
            Ok(Reply::ok(json!({ "uid": invitation.uid() })).with_code(ErrorCode::LoginRequired))
        }
        AcceptPath::Member => {
            let user = ctx.current_user().await?;
            let body = join_org(ctx, &invitation, &user).await?;
            Ok(Reply::ok(body))
        }
        AcceptPath::Store => {
            let user = ctx.current_user().await?;
            let body = join_store(ctx, &invitation, &user).await?;
            Ok(Reply::ok(body))
        }
    }
}

async fn register_and_join(
    ctx: &mut RequestContext,
    invitation: &InvitationContext,
    body: AcceptBody,
) -> Result<Reply, ApiError> {
    let (alias, hash) = match (body.alias, body.hash) {
        (Some(alias), Some(hash)) => (alias, hash),
        (alias, hash) => {
            let mut error = ApiError::new(ErrorCode::InvalidBody);
            if alias.is_none() {
                error = error.field("alias", "required to register");
            }
            if hash.is_none() {
                error = error.field("hash", "required to register");
            }
            return Err(error);
        }
    };
    validate_alias(&alias)?;
    validate_password_hash(&hash)?;

    let display_name = body
        .name
        .map(|name| name.trim().to_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| alias.clone());
    let user = create_account(
        ctx,
        NewUser {
            email: invitation.invitation.invitee_email.clone(),
            name: alias,
            display_name,
            password_hash: hash,
            state: 0,
            created_at: ctx.now,
        },
    )
    .await?;
    let mut joined = join_org(ctx, invitation, &user).await?;
    ctx.session_mut().login(&session_user(&user));
    joined["user"] = user_json(&user);
    Ok(Reply::created(joined))
}

async fn join_org(
    ctx: &mut RequestContext,
    invitation: &InvitationContext,
    user: &User,
) -> Result<Value, ApiError> {
    let storage = ctx.storage();
    let org_id = invitation.invitation.object_id;
    if storage.get_object_user(org_id, user.id).await?.is_some() {
        return Err(ApiError::with_message(
            ErrorCode::AlreadyRegistered,
            "already a member",
        ));
    }
    let org = storage.get_org(org_id).await?;
    let roles = granted_roles(&invitation.invitation, &ORG_BASELINE);
    registry::accept_invitation(
        storage,
        invitation.invitation.id,
        &NewMember {
            object_id: org.id,
            object_type: ObjectType::Org,
            alias: org.alias.clone(),
            user_id: user.id,
            user_name: user.name.clone(),
            state: 0,
            roles: roles.clone(),
            store_key: None,
            created_by: invitation.invitation.created_by,
            created_at: ctx.now,
        },
        ctx.now,
    )
    .await?;
    forget_accepted(ctx, invitation);
    Ok(json!({
        "object": org.id,
        "type": ObjectType::Org.as_str(),
        "alias": org.alias,
        "roles": roles,
    }))
}

/// Recovers the store key from the invitation's key row and re-wraps it
/// under the invitee's own hash.
async fn join_store(
    ctx: &mut RequestContext,
    invitation: &InvitationContext,
    user: &User,
) -> Result<Value, ApiError> {
    let storage = ctx.storage();
    let store_id = invitation.invitation.object_id;
    if storage.get_object_user(store_id, user.id).await?.is_some() {
        return Err(ApiError::with_message(
            ErrorCode::AlreadyRegistered,
            "already a member",
        ));
    }
    let store = storage.get_store(store_id).await?;
    let Some(key_ref) = invitation.invitation.key else {
        tracing::error!(invitation_id = %invitation.invitation.id, "store invitation without a key");
        return Err(ApiError::new(ErrorCode::Misconfiguration));
    };
    let key_row = storage.get_key(key_ref.key_id).await.map_err(|error| {
        if error.is_not_found() {
            ApiError::new(ErrorCode::InvalidInvitation)
        } else {
            error.into()
        }
    })?;
    let store_key = WrappedKey::from_sealed(key_ref.pick, &key_row.sealed)
        .and_then(|wrapped| unwrap_key(&invitation_password(invitation.uid()), &wrapped))
        .map_err(|error| {
            tracing::error!(invitation_id = %invitation.invitation.id, error = %error, "invitation key does not open");
            ApiError::new(ErrorCode::Crypto)
        })?;
    let wrapped = wrap_key(&user.password_hash, &store_key)?;

    let roles = granted_roles(&invitation.invitation, &STORE_BASELINE);
    registry::accept_invitation(
        storage,
        invitation.invitation.id,
        &NewMember {
            object_id: store.id,
            object_type: ObjectType::Store,
            alias: store.alias.clone(),
            user_id: user.id,
            user_name: user.name.clone(),
            state: 0,
            roles: roles.clone(),
            store_key: Some(wrapped.into_bytes()),
            created_by: invitation.invitation.created_by,
            created_at: ctx.now,
        },
        ctx.now,
    )
    .await?;
    forget_accepted(ctx, invitation);
    if let Err(error) = ctx.storage().delete_key(key_ref.key_id).await {
        tracing::warn!(key_id = %key_ref.key_id, error = %error, "accepted invitation key left behind");
    }
    Ok(json!({
        "object": store.id,
        "type": ObjectType::Store.as_str(),
        "org": store.org_id,
        "alias": store.alias,
        "roles": roles,
    }))
}

fn granted_roles(invitation: &Invitation, baseline: &[Role]) -> String {
    invitation
        .roles
        .clone()
        .filter(|roles| !roles.is_empty())
        .unwrap_or_else(|| RoleSet::new(baseline.iter().copied()).to_csv())
}

fn forget_accepted(ctx: &mut RequestContext, invitation: &InvitationContext) {
    if ctx.session().invitation_id() == Some(invitation.uid()) {
        ctx.session_mut().remove(KEY_INVITATION_ID);
    }
}

// ---------------------------------------------------------------------------
// Decline, view, revoke
// ---------------------------------------------------------------------------

/// `GET /1/invitation/decline/{uid}`
pub(crate) async fn decline(
    State(state): State<ApiState>,
    Path(uid): Path<String>,
    jar: CookieJar,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = decline_steps(&mut ctx, &uid).await;
    ctx.finish(outcome)
}

async fn decline_steps(ctx: &mut RequestContext, uid: &str) -> Result<Reply, ApiError> {
    let invitation = InvitationContext::load(ctx.storage(), uid, ctx.now).await?;
    registry::set_invitation_state(
        ctx.storage(),
        invitation.invitation.id,
        InvitationState::Declined,
        ctx.now,
    )
    .await?;
    discard_key(ctx.storage(), &invitation.invitation).await;
    tracing::info!(invitation_id = %invitation.invitation.id, "invitation declined");
    Ok(Reply::ok(json!({ "uid": invitation.uid(), "state": InvitationState::Declined })))
}

/// `GET /1/invitation/invite/{uid}`: what the invitee sees before answering.
pub(crate) async fn view(
    State(state): State<ApiState>,
    Path(uid): Path<String>,
    jar: CookieJar,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = view_steps(&mut ctx, &uid).await;
    ctx.finish(outcome)
}

async fn view_steps(ctx: &mut RequestContext, uid: &str) -> Result<Reply, ApiError> {
    let invitation = InvitationContext::load(ctx.storage(), uid, ctx.now).await?;
    let storage = ctx.storage();
    let object_name = match invitation.kind {
        ObjectType::Store => storage.get_store(invitation.invitation.object_id).await?.name,
        _ => storage.get_org(invitation.invitation.object_id).await?.name,
    };
    let by_user = match storage.get_user(invitation.invitation.created_by).await {
        Ok(user) => user.display_name,
        Err(error) if error.is_not_found() => String::new(),
        Err(error) => return Err(error.into()),
    };
    Ok(Reply::ok(json!({
        "uid": invitation.uid(),
        "type": invitation.kind.as_str(),
        "object": invitation.invitation.object_id,
        "object_name": object_name,
        "by_user": by_user,
        "invitee": invitation.invitation.invitee_email,
        "expiration": rfc3339(invitation.invitation.expires_at)?,
        "message": invitation.invitation.message,
        "state": InvitationState::Pending,
    })))
}

/// `DELETE /1/invitation/{uid}`: only the creator, only while pending.
pub(crate) async fn revoke(
    State(state): State<ApiState>,
    Path(uid): Path<String>,
    jar: CookieJar,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = revoke_steps(&mut ctx, &uid).await;
    ctx.finish(outcome)
}

async fn revoke_steps(ctx: &mut RequestContext, uid: &str) -> Result<Reply, ApiError> {
    let user = ctx.current_user().await?;
    let invitation = InvitationContext::load(ctx.storage(), uid, ctx.now).await?;
    if invitation.invitation.created_by != user.id {
        return Err(ApiError::new(ErrorCode::InsufficientRoles));
    }
    registry::set_invitation_state(
        ctx.storage(),
        invitation.invitation.id,
        InvitationState::Revoked,
        ctx.now,
    )
    .await?;
    discard_key(ctx.storage(), &invitation.invitation).await;
    tracing::info!(invitation_id = %invitation.invitation.id, by = %user.id, "invitation revoked");
    Ok(Reply::ok(json!({ "uid": invitation.uid(), "state": InvitationState::Revoked })))
}

// ---------------------------------------------------------------------------
// Expiry
// ---------------------------------------------------------------------------

async fn discard_key(storage: &dyn Storage, invitation: &Invitation) {
    if let Some(key) = invitation.key {
        if let Err(error) = storage.delete_key(key.key_id).await {
            if !error.is_not_found() {
                tracing::warn!(key_id = %key.key_id, error = %error, "invitation key left behind");
            }
        }
    }
}

/// Marks a pending invitation expired and drops its key row.
pub(crate) async fn expire_invitation(
    storage: &dyn Storage,
    invitation: &Invitation,
    now: SystemTime,
) -> Result<(), StorageError> {
    registry::set_invitation_state(storage, invitation.id, InvitationState::Expired, now).await?;
    discard_key(storage, invitation).await;
    tracing::info!(invitation_id = %invitation.id, "invitation expired");
    Ok(())
}

/// Brings an overdue registry row to a final state. Returns whether an
/// invitation was expired by this call.
async fn retire_overdue(
    storage: &dyn Storage,
    row: &InvitationRegistry,
    now: SystemTime,
) -> Result<bool, StorageError> {
    let outcome = match storage.get_invitation(row.invitation_id).await {
        Ok(invitation) if invitation.state == InvitationState::Pending => {
            expire_invitation(storage, &invitation, now).await
        }
        Ok(invitation) => {
            storage
                .set_invitation_registry_state(
                    row.invitation_id,
                    InvitationState::Pending,
                    invitation.state,
                )
                .await?;
            return Ok(false);
        }
        Err(error) if error.is_not_found() => {
            tracing::warn!(invitation_id = %row.invitation_id, "registry row without invitation, retiring it");
            storage
                .set_invitation_registry_state(
                    row.invitation_id,
                    InvitationState::Pending,
                    InvitationState::Expired,
                )
                .await?;
            return Ok(false);
        }
        Err(error) => return Err(error),
    };
    match outcome {
        Ok(()) => Ok(true),
        Err(StorageError::InvitationClosed) => Ok(false),
        Err(error) => Err(error),
    }
}

/// Expires up to `limit` overdue invitations. Returns how many changed.
pub async fn sweep_expired(
    storage: &dyn Storage,
    now: SystemTime,
    limit: usize,
) -> Result<usize, StorageError> {
    let mut expired = 0;
    for row in storage.list_overdue_invitations(now, limit).await? {
        match retire_overdue(storage, &row, now).await {
            Ok(true) => expired += 1,
            Ok(false) | Err(StorageError::InvitationClosed) => {}
            Err(error) => return Err(error),
        }
    }
    Ok(expired)
}
