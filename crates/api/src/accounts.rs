use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::Response;
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::{json, Value};
use strongbox_auth::crypto::constant_time_eq;
use strongbox_auth::state::{apply_external, is_inactive, STATE_DELETED};
use strongbox_auth::{unwrap_key, wrap_key, SessionUser, WrappedKey};
use strongbox_core::validation::{
    normalize_email, validate_alias, validate_email, validate_password_hash,
};
use strongbox_core::{ErrorCode, Gid, ObjectType};
use strongbox_queue::{ActionMessage, ACTION_PASSWORD_CHANGED, ACTION_USER_REGISTERED};
use strongbox_storage::{registry, NewUser, User, UserObject, UserObjectUpdate};

use crate::pipeline::{enqueue, json_body, optional_json_body, RequestContext};
use crate::{ApiError, ApiState, Reply};

#[derive(Debug, Deserialize)]
struct LoginBody {
    hash: String,
    /// New password hash; `hash` must be the current one.
    #[serde(default)]
    reset: Option<String>,
    #[serde(default)]
    register: Option<RegisterBody>,
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    email: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectStateBody {
    #[serde(default)]
    favorite: Option<bool>,
    #[serde(default)]
    set: u32,
    #[serde(default)]
    clear: u32,
}

pub(crate) fn user_json(user: &User) -> Value {
    json!({
        "id": user.id,
        "email": user.email,
        "name": user.name,
        "display_name": user.display_name,
    })
}

pub(crate) fn session_user(user: &User) -> SessionUser {
    SessionUser {
        id: user.id,
        email: user.email.clone(),
        name: user.name.clone(),
        password_hash: user.password_hash.clone(),
    }
}

fn object_json(object: &UserObject) -> Value {
    json!({
        "id": object.object_id,
        "type": object.object_type.as_str(),
        "alias": object.alias,
        "favorite": object.favorite,
        "state": object.state,
    })
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// `POST /1/session/{id}`: sign in, change password, or register.
pub(crate) async fn login(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    jar: CookieJar,
    body: Bytes,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = login_steps(&mut ctx, &id, &body).await;
    ctx.finish(outcome)
}

async fn login_steps(ctx: &mut RequestContext, id: &str, body: &Bytes) -> Result<Reply, ApiError> {
    let body: LoginBody = json_body(body)?;
    validate_password_hash(&body.hash)?;
    if let Some(register) = body.register {
        return register_user(ctx, id, &body.hash, register).await;
    }

    let user = authenticate(ctx, id, &body.hash).await?;
    let (user, warning) = match body.reset {
        Some(new_hash) => {
            validate_password_hash(&new_hash)
                .map_err(|error| ApiError::invalid_field("reset", error.to_string()))?;
            change_password(ctx, &user, &new_hash).await?
        }
        None => (user, None),
    };
    ctx.session_mut().login(&session_user(&user));
    tracing::info!(user_id = %user.id, "user signed in");
    Ok(Reply::ok(json!({ "user": user_json(&user) })).with_warning(warning))
}

async fn authenticate(ctx: &RequestContext, id: &str, hash: &str) -> Result<User, ApiError> {
    let storage = ctx.storage();
    let row = if id.contains('@') {
        storage.find_user_by_email(&normalize_email(id)).await?
    } else {
        storage.find_user_by_name(id).await?
    };
    let Some(row) = row else {
        return Err(ApiError::new(ErrorCode::InvalidCredentials));
    };
    let user = match storage.get_user(row.user_id).await {
        Ok(user) => user,
        Err(error) if error.is_not_found() => {
            tracing::warn!(user_id = %row.user_id, "user registry points at a missing row");
            return Err(ApiError::new(ErrorCode::InvalidCredentials));
        }
        Err(error) => return Err(error.into()),
    };
    if !constant_time_eq(user.password_hash.as_bytes(), hash.as_bytes()) {
        return Err(ApiError::new(ErrorCode::InvalidCredentials));
    }
    if is_inactive(user.state) {
        return Err(ApiError::new(ErrorCode::UserInactive));
    }
    Ok(user)
}

async fn register_user(
    ctx: &mut RequestContext,
    name: &str,
    hash: &str,
    register: RegisterBody,
) -> Result<Reply, ApiError> {
    validate_alias(name)?;
    let email = normalize_email(&register.email);
    validate_email(&email)?;
    let user = create_account(
        ctx,
        NewUser {
            email,
            name: name.to_owned(),
            display_name: register.display_name.unwrap_or_else(|| name.to_owned()),
            password_hash: hash.to_owned(),
            state: 0,
            created_at: ctx.now,
        },
    )
    .await?;

    let warning = enqueue(
        &ctx.state,
        &ActionMessage {
            action: ACTION_USER_REGISTERED.to_owned(),
            to: user.email.clone(),
            at_user: user.name.clone(),
            payload: json!({}),
        },
    )
    .await;
    ctx.session_mut().login(&session_user(&user));
    Ok(Reply::created(json!({ "user": user_json(&user) })).with_warning(warning))
}

/// Creates a user after checking the registry for a taken email or name.
pub(crate) async fn create_account(ctx: &RequestContext, user: NewUser) -> Result<User, ApiError> {
    let storage = ctx.storage();
    if storage.find_user_by_email(&user.email).await?.is_some() {
        return Err(ApiError::with_message(
            ErrorCode::AlreadyRegistered,
            "email is already registered",
        ));
    }
    if storage.find_user_by_name(&user.name).await?.is_some() {
        return Err(ApiError::with_message(
            ErrorCode::AlreadyRegistered,
            "name is already taken",
        ));
    }
    Ok(registry::create_user(storage, ctx.state.pick_shard(), &user).await?)
}

/// Re-wraps every store key the user holds, then swaps the hash.
async fn change_password(
    ctx: &RequestContext,
    user: &User,
    new_hash: &str,
) -> Result<(User, Option<ErrorCode>), ApiError> {
    let storage = ctx.storage();
    let mut rewrapped = Vec::new();
    for object in storage.list_user_objects(user.id).await? {
        if object.object_type != ObjectType::Store {
            continue;
        }
        let member = storage.get_object_user(object.object_id, user.id).await?;
        let Some(wrapped) = member.and_then(|member| member.store_key) else {
            tracing::warn!(store_id = %object.object_id, user_id = %user.id, "store membership without a wrapped key");
            continue;
        };
        let key = WrappedKey::from_bytes(wrapped)
            .and_then(|wrapped| unwrap_key(&user.password_hash, &wrapped))
            .map_err(|error| {
                tracing::error!(store_id = %object.object_id, user_id = %user.id, error = %error, "stored key does not open with the current hash");
                ApiError::new(ErrorCode::Crypto)
            })?;
        rewrapped.push((object.object_id, wrap_key(new_hash, &key)?.into_bytes()));
    }

    let updated = registry::change_password(storage, user, new_hash, rewrapped, ctx.now).await?;
    let warning = enqueue(
        &ctx.state,
        &ActionMessage {
            action: ACTION_PASSWORD_CHANGED.to_owned(),
            to: updated.email.clone(),
            at_user: updated.name.clone(),
            payload: json!({}),
        },
    )
    .await;
    Ok((updated, warning))
}

/// `DELETE /1/session`
pub(crate) async fn logout(State(state): State<ApiState>, jar: CookieJar) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    if let Some(user) = ctx.session_user() {
        tracing::info!(user_id = %user.id, "user signed out");
    }
    ctx.session_mut().clear();
    ctx.finish(Ok(Reply::ok(json!({}))))
}

/// `POST /1/session/{id}/recover`
pub(crate) async fn recover(State(state): State<ApiState>, jar: CookieJar) -> Response {
    let ctx = RequestContext::begin(state, jar);
    ctx.finish(Err(ApiError::new(ErrorCode::NotImplementedYet)))
}

// ---------------------------------------------------------------------------
// User objects
// ---------------------------------------------------------------------------

/// `GET /1/user/objects`
pub(crate) async fn list_objects(State(state): State<ApiState>, jar: CookieJar) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = list_objects_steps(&mut ctx).await;
    ctx.finish(outcome)
}

async fn list_objects_steps(ctx: &mut RequestContext) -> Result<Reply, ApiError> {
    let user = ctx.current_user().await?;
    let objects: Vec<Value> = ctx
        .storage()
        .list_user_objects(user.id)
        .await?
        .iter()
        .filter(|object| object.state & STATE_DELETED == 0)
        .map(object_json)
        .collect();
    Ok(Reply::ok(json!({ "objects": objects })))
}

/// `PUT /1/user/objects/{object}`: favorite flag and function-state bits.
pub(crate) async fn update_object(
    State(state): State<ApiState>,
    Path(object): Path<String>,
    jar: CookieJar,
    body: Bytes,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = update_object_steps(&mut ctx, &object, &body).await;
    ctx.finish(outcome)
}

async fn update_object_steps(
    ctx: &mut RequestContext,
    object: &str,
    body: &Bytes,
) -> Result<Reply, ApiError> {
    let body: ObjectStateBody = optional_json_body(body)?;
    let user = ctx.current_user().await?;
    let object_id: Gid = object.parse()?;
    let current = ctx
        .storage()
        .get_user_object(user.id, object_id)
        .await?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound))?;
    let state = apply_external(current.state, body.set, body.clear)?;
    let update = UserObjectUpdate {
        favorite: body.favorite,
        state: Some(state),
    };
    let updated = ctx
        .storage()
        .update_user_object(user.id, object_id, &update)
        .await?;
    Ok(Reply::ok(object_json(&updated)))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;
    use strongbox_auth::state::{STATE_PINNED, STATE_SYSTEM};

    use crate::test_support::{code, hash, root, TestApp};

    #[tokio::test]
    async fn registration_signs_in_and_announces() {
        let app = TestApp::new();
        let mut alice = app.client();
        alice.register("alice", "Alice@Example.com", &hash(1)).await;
        let (_, message) = app.publisher.messages().pop().unwrap();
        assert_eq!(message["action"], "user-registered");
        assert_eq!(message["to"], "alice@example.com");

        let (status, body) = alice.get("/1/user/objects").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["objects"], json!([]));

        let mut other = app.client();
        let (status, body) = other
            .post(
                "/1/session/alice2",
                json!({ "hash": hash(2), "register": { "email": "alice@example.com" } }),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(code(&body), 4012);
    }

    #[tokio::test]
    async fn failed_publish_is_a_warning() {
        let app = TestApp::new();
        app.publisher.fail(true);
        let mut alice = app.client();
        let (status, body) = alice
            .post(
                "/1/session/alice",
                json!({ "hash": hash(1), "register": { "email": "alice@example.com" } }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(code(&body), 2490);
        assert_eq!(body["user"]["name"], "alice");
    }

    #[tokio::test]
    async fn login_by_name_or_email() {
        let app = TestApp::new();
        app.client()
            .register("alice", "alice@example.com", &hash(1))
            .await;
        let mut client = app.client();
        let (status, _) = client.login("alice", &hash(1)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = client.login("ALICE@example.com", &hash(1)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = client.login("alice", &hash(9)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(code(&body), 4010);
        let (status, body) = client.login("alice", "not-a-hash").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["fields"]["hash"].is_string());
    }

    #[tokio::test]
    async fn signed_out_requests_need_a_session() {
        let app = TestApp::new();
        let mut alice = app.client();
        alice.register("alice", "alice@example.com", &hash(1)).await;
        let (status, _) = alice.delete("/1/session").await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = alice.get("/1/user/objects").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(code(&body), 4301);
    }

    #[tokio::test]
    async fn password_reset_rewraps_store_keys() {
        let app = TestApp::new();
        let mut alice = app.client();
        alice.register("alice", "alice@example.com", &hash(1)).await;
        let org = alice.create_org("acme").await;
        let store = alice.create_store(&org, "vault").await;
        alice.open_store(&org, &store, &hash(1)).await;
        let (_, entry) = alice
            .post(
                &format!("/1/store/{store}/obj/{}", root()),
                json!({ "kind": "json", "title": "pin", "value": 1234 }),
            )
            .await;
        let entry = entry["id"].as_str().unwrap().to_owned();

        let (status, body) = alice
            .post(
                "/1/session/alice",
                json!({ "hash": hash(1), "reset": hash(9) }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(app.publisher.messages().pop().unwrap().1["action"], "password-changed");

        let (status, body) = alice.open_store(&org, &store, &hash(1)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(code(&body), 4010);
        let (status, _) = alice.open_store(&org, &store, &hash(9)).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = alice
            .get(&format!("/1/store/{store}/obj/{}/{entry}", root()))
            .await;
        assert_eq!(body["value"], 1234);
    }

    #[tokio::test]
    async fn object_flags_keep_system_bits() {
        let app = TestApp::new();
        let mut alice = app.client();
        alice.register("alice", "alice@example.com", &hash(1)).await;
        let org = alice.create_org("acme").await;

        let (status, body) = alice
            .put(
                &format!("/1/user/objects/{org}"),
                json!({ "favorite": true, "set": STATE_PINNED }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["favorite"], true);
        assert_eq!(body["state"], STATE_SYSTEM | STATE_PINNED);

        let (status, body) = alice
            .put(&format!("/1/user/objects/{org}"), json!({ "set": 1 }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["fields"]["set"].is_string());
    }

    #[tokio::test]
    async fn recovery_is_not_available() {
        let app = TestApp::new();
        let (status, body) = app
            .client()
            .post("/1/session/alice/recover", json!({}))
            .await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(code(&body), 5998);
    }
}
