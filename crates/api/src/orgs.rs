use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::Response;
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::{json, Value};
use strongbox_auth::role::{
    CATEGORY_ORG, FN_CREATE, FN_DELETE, FN_LIST, FN_UPDATE, INVITES_MANAGER, ORG_ADMIN,
    ORG_BASELINE, ORG_ROLES, ORG_STORES, ROLES_MANAGER, STORE_ADMIN,
};
use strongbox_auth::state::{
    apply_masked, has, STATE_DELETED, STATE_MASK_STORE_LOCKS, STATE_SYSTEM,
};
use strongbox_auth::{generate_store_key, wrap_key, Role, RoleSet};
use strongbox_core::validation::validate_alias;
use strongbox_core::{ErrorCode, Gid};
use strongbox_storage::registry::{self, CreatorGrant};
use strongbox_storage::{
    ensure_roles_kept, NewOrg, NewStore, ObjectUser, ObjectUserUpdate, Org, OrgStore, Store,
};

use crate::pipeline::{
    json_body, optional_json_body, resolve_org_store, resolve_user, OrgContext, RequestContext,
};
use crate::{ApiError, ApiState, Reply};

#[derive(Debug, Deserialize)]
struct CreateBody {
    alias: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RolesBody {
    roles: String,
}

#[derive(Debug, Default, Deserialize)]
struct StateBody {
    #[serde(default)]
    set: u32,
    #[serde(default)]
    clear: u32,
}

fn org_json(org: &Org) -> Value {
    json!({
        "id": org.id,
        "alias": org.alias,
        "name": org.name,
        "state": org.state,
    })
}

fn store_json(store: &Store) -> Value {
    json!({
        "id": store.id,
        "org": store.org_id,
        "alias": store.alias,
        "name": store.name,
        "state": store.state,
    })
}

fn placement_json(row: &OrgStore) -> Value {
    json!({
        "id": row.store_id,
        "alias": row.alias,
        "state": row.state,
    })
}

fn member_json(member: &ObjectUser) -> Value {
    json!({
        "id": member.user_id,
        "name": member.user_name,
        "state": member.state,
        "roles": member.roles,
        "admin": has(member.state, STATE_SYSTEM),
    })
}

fn display_name(raw: &str) -> Result<String, ApiError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ApiError::invalid_field("name", "name is required"));
    }
    Ok(name.to_owned())
}

const KEPT_MANAGERS: [Role; 2] = [ROLES_MANAGER, INVITES_MANAGER];

/// Fails with 4061 when giving `target` the roles `next` (`None` removes
/// the member) would leave the org without a roles-manager or an
/// invites-manager. Storage repeats the check under lock when writing.
pub(crate) fn ensure_managers_remain(
    members: &[ObjectUser],
    target: Gid,
    next: Option<&RoleSet>,
) -> Result<(), ApiError> {
    let next = next.map(RoleSet::to_csv);
    ensure_roles_kept(members, target, next.as_deref(), &KEPT_MANAGERS)?;
    Ok(())
}

async fn target_member(
    ctx: &RequestContext,
    org_id: Gid,
    user: &str,
) -> Result<ObjectUser, ApiError> {
    let user_id = resolve_user(ctx.storage(), user).await?;
    ctx.storage()
        .get_object_user(org_id, user_id)
        .await?
        .ok_or_else(|| ApiError::with_message(ErrorCode::NotFound, "member not found"))
}

// ---------------------------------------------------------------------------
// Organizations
// ---------------------------------------------------------------------------

/// `POST /1/org`
pub(crate) async fn create_org(
    State(state): State<ApiState>,
    jar: CookieJar,
    body: Bytes,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = create_org_steps(&mut ctx, &body).await;
    ctx.finish(outcome)
}

async fn create_org_steps(ctx: &mut RequestContext, body: &Bytes) -> Result<Reply, ApiError> {
    let body: CreateBody = json_body(body)?;
    let user = ctx.current_user().await?;
    validate_alias(&body.alias)?;
    let name = display_name(&body.name)?;
    if ctx.storage().find_org_by_alias(&body.alias).await?.is_some() {
        return Err(ApiError::with_message(
            ErrorCode::AlreadyRegistered,
            "organization alias is taken",
        ));
    }

    let new_org = NewOrg {
        alias: body.alias,
        name,
        created_by: user.id,
        created_at: ctx.now,
    };
    let grant = CreatorGrant {
        state: STATE_SYSTEM,
        roles: RoleSet::new(ORG_ADMIN).to_csv(),
        store_key: None,
    };
    let org = registry::create_org(ctx.storage(), ctx.state.pick_shard(), &new_org, &user, grant)
        .await?;
    Ok(Reply::created(org_json(&org)))
}

/// `GET /1/org/{org}/users`
pub(crate) async fn list_users(
    State(state): State<ApiState>,
    Path(org): Path<String>,
    jar: CookieJar,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = list_users_steps(&mut ctx, &org).await;
    ctx.finish(outcome)
}

async fn list_users_steps(ctx: &mut RequestContext, org: &str) -> Result<Reply, ApiError> {
    let org = OrgContext::load(ctx, org, &[Role::new(ORG_ROLES, FN_LIST)]).await?;
    let members: Vec<Value> = org
        .members(ctx.storage())
        .await?
        .iter()
        .filter(|member| member.state & STATE_DELETED == 0)
        .map(member_json)
        .collect();
    Ok(Reply::ok(json!({ "org": org.org.id, "users": members })))
}

/// `PUT /1/org/{org}/user/{user}/roles`
pub(crate) async fn set_roles(
    State(state): State<ApiState>,
    Path((org, user)): Path<(String, String)>,
    jar: CookieJar,
    body: Bytes,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = set_roles_steps(&mut ctx, &org, &user, &body).await;
    ctx.finish(outcome)
}

async fn set_roles_steps(
    ctx: &mut RequestContext,
    org: &str,
    user: &str,
    body: &Bytes,
) -> Result<Reply, ApiError> {
    let body: RolesBody = json_body(body)?;
    let roles = RoleSet::parse_csv(&body.roles)
        .map_err(|error| ApiError::invalid_field("roles", error.to_string()))?;
    if !roles.all_in_category(CATEGORY_ORG) {
        return Err(ApiError::invalid_field(
            "roles",
            "only organization roles can be granted here",
        ));
    }

    let org = OrgContext::load(ctx, org, &[ROLES_MANAGER]).await?;
    let target = target_member(ctx, org.org.id, user).await?;
    let members = org.members(ctx.storage()).await?;
    ensure_managers_remain(&members, target.user_id, Some(&roles))?;
    if has(target.state, STATE_SYSTEM) {
        return Err(ApiError::new(ErrorCode::TargetIsSystemUser));
    }

    let mut update = ObjectUserUpdate::at(ctx.now);
    update.roles = Some(roles.to_csv());
    let updated = registry::update_member(
        ctx.storage(),
        org.org.id,
        target.user_id,
        &update,
        &KEPT_MANAGERS,
    )
    .await?;
    tracing::info!(org_id = %org.org.id, user_id = %target.user_id, by = %org.user.id, "member roles replaced");
    Ok(Reply::ok(member_json(&updated)))
}

/// `POST /1/org/{org}/user/{user}/toggle`: grants or withdraws admin.
pub(crate) async fn toggle_admin(
    State(state): State<ApiState>,
    Path((org, user)): Path<(String, String)>,
    jar: CookieJar,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = toggle_admin_steps(&mut ctx, &org, &user).await;
    ctx.finish(outcome)
}

async fn toggle_admin_steps(
    ctx: &mut RequestContext,
    org: &str,
    user: &str,
) -> Result<Reply, ApiError> {
    let org = OrgContext::load(ctx, org, &[ROLES_MANAGER]).await?;
    let target = target_member(ctx, org.org.id, user).await?;
    let promote = !has(target.state, STATE_SYSTEM);
    let (roles, state) = if promote {
        (RoleSet::new(ORG_ADMIN), target.state | STATE_SYSTEM)
    } else {
        (RoleSet::new(ORG_BASELINE), target.state & !STATE_SYSTEM)
    };
    if !promote {
        let members = org.members(ctx.storage()).await?;
        ensure_managers_remain(&members, target.user_id, Some(&roles))?;
    }

    let mut update = ObjectUserUpdate::at(ctx.now);
    update.roles = Some(roles.to_csv());
    update.state = Some(state);
    let updated = registry::update_member(
        ctx.storage(),
        org.org.id,
        target.user_id,
        &update,
        &KEPT_MANAGERS,
    )
    .await?;
    tracing::info!(org_id = %org.org.id, user_id = %target.user_id, admin = promote, "admin toggled");
    Ok(Reply::ok(member_json(&updated)))
}

/// `DELETE /1/org/{org}/user/{user}`
pub(crate) async fn remove_user(
    State(state): State<ApiState>,
    Path((org, user)): Path<(String, String)>,
    jar: CookieJar,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = remove_user_steps(&mut ctx, &org, &user).await;
    ctx.finish(outcome)
}

async fn remove_user_steps(
    ctx: &mut RequestContext,
    org: &str,
    user: &str,
) -> Result<Reply, ApiError> {
    let org = OrgContext::load(ctx, org, &[Role::new(ORG_ROLES, FN_DELETE)]).await?;
    let target = target_member(ctx, org.org.id, user).await?;
    let members = org.members(ctx.storage()).await?;
    ensure_managers_remain(&members, target.user_id, None)?;
    if has(target.state, STATE_SYSTEM) {
        return Err(ApiError::new(ErrorCode::TargetIsSystemUser));
    }
    let stores =
        registry::remove_org_member(ctx.storage(), org.org.id, target.user_id, &KEPT_MANAGERS)
            .await?;
    tracing::info!(
        org_id = %org.org.id,
        user_id = %target.user_id,
        stores = stores.len(),
        "member removed"
    );
    Ok(Reply::ok(json!({ "removed": target.user_id, "stores": stores })))
}

// ---------------------------------------------------------------------------
// Stores of an organization
// ---------------------------------------------------------------------------

/// `POST /1/org/{org}/store`: the creator's copy of the new key is wrapped
/// under their password hash.
pub(crate) async fn create_store(
    State(state): State<ApiState>,
    Path(org): Path<String>,
    jar: CookieJar,
    body: Bytes,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = create_store_steps(&mut ctx, &org, &body).await;
    ctx.finish(outcome)
}

async fn create_store_steps(
    ctx: &mut RequestContext,
    org: &str,
    body: &Bytes,
) -> Result<Reply, ApiError> {
    let body: CreateBody = json_body(body)?;
    let org = OrgContext::load(ctx, org, &[Role::new(ORG_STORES, FN_CREATE)]).await?;
    validate_alias(&body.alias)?;
    let name = display_name(&body.name)?;
    if ctx
        .storage()
        .find_org_store(org.org.id, &body.alias)
        .await?
        .is_some()
    {
        return Err(ApiError::with_message(
            ErrorCode::AlreadyRegistered,
            "store alias is taken in this organization",
        ));
    }

    let key = generate_store_key();
    let wrapped = wrap_key(&org.user.password_hash, &key)?;
    let new_store = NewStore {
        org_id: org.org.id,
        alias: body.alias,
        name,
        created_by: org.user.id,
        created_at: ctx.now,
    };
    let grant = CreatorGrant {
        state: STATE_SYSTEM,
        roles: RoleSet::new(STORE_ADMIN).to_csv(),
        store_key: Some(wrapped.into_bytes()),
    };
    let store = registry::create_store(
        ctx.storage(),
        ctx.state.pick_shard(),
        &new_store,
        &org.user,
        grant,
    )
    .await?;
    Ok(Reply::created(store_json(&store)))
}

/// `GET /1/org/{org}/stores`
pub(crate) async fn list_stores(
    State(state): State<ApiState>,
    Path(org): Path<String>,
    jar: CookieJar,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = list_stores_steps(&mut ctx, &org).await;
    ctx.finish(outcome)
}

async fn list_stores_steps(ctx: &mut RequestContext, org: &str) -> Result<Reply, ApiError> {
    let org = OrgContext::load(ctx, org, &[Role::new(ORG_STORES, FN_LIST)]).await?;
    let stores: Vec<Value> = ctx
        .storage()
        .list_org_stores(org.org.id)
        .await?
        .iter()
        .filter(|row| row.state & STATE_DELETED == 0)
        .map(placement_json)
        .collect();
    Ok(Reply::ok(json!({ "org": org.org.id, "stores": stores })))
}

/// `PUT /1/org/{org}/store/{store}/state`: lock and block bits only.
pub(crate) async fn set_store_state(
    State(state): State<ApiState>,
    Path((org, store)): Path<(String, String)>,
    jar: CookieJar,
    body: Bytes,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = set_store_state_steps(&mut ctx, &org, &store, &body).await;
    ctx.finish(outcome)
}

async fn set_store_state_steps(
    ctx: &mut RequestContext,
    org: &str,
    store: &str,
    body: &Bytes,
) -> Result<Reply, ApiError> {
    let body: StateBody = optional_json_body(body)?;
    let org = OrgContext::load(ctx, org, &[Role::new(ORG_STORES, FN_UPDATE)]).await?;
    let mut row = resolve_org_store(ctx.storage(), org.org.id, store).await?;
    row.state = apply_masked(row.state, body.set, body.clear, STATE_MASK_STORE_LOCKS)?;
    ctx.storage()
        .set_org_store_state(org.org.id, row.store_id, row.state)
        .await?;
    tracing::info!(org_id = %org.org.id, store_id = %row.store_id, state = row.state, "store state changed");
    Ok(Reply::ok(placement_json(&row)))
}
