//! Entry CRUD. Titles are cleartext so folders list without an open store;
//! values are sealed under the store key held in the store session.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::Response;
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::{json, Value};
use strongbox_auth::role::{FN_CREATE, FN_DELETE, FN_LIST, FN_READ, FN_UPDATE, STORE_ENTRIES};
use strongbox_auth::{decrypt_value, encrypt_value, Role};
use strongbox_core::validation::validate_title;
use strongbox_core::{ErrorCode, Gid, ObjectType};
use strongbox_storage::{Entry, EntryKind, EntryUpdate, NewEntry, ROOT_ENTRY};

use crate::pipeline::{json_body, parse_id, rfc3339, RequestContext, StoreContext};
use crate::{ApiError, ApiState, Reply};

const LIST: [Role; 1] = [Role::new(STORE_ENTRIES, FN_LIST)];
const READ: [Role; 1] = [Role::new(STORE_ENTRIES, FN_READ)];
const CREATE: [Role; 1] = [Role::new(STORE_ENTRIES, FN_CREATE)];
const UPDATE: [Role; 1] = [Role::new(STORE_ENTRIES, FN_UPDATE)];
const DELETE: [Role; 1] = [Role::new(STORE_ENTRIES, FN_DELETE)];

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum KindBody {
    Folder,
    Json,
}

impl From<KindBody> for EntryKind {
    fn from(value: KindBody) -> Self {
        match value {
            KindBody::Folder => Self::Folder,
            KindBody::Json => Self::Json,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateBody {
    kind: KindBody,
    title: String,
    #[serde(default)]
    value: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct UpdateBody {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    value: Option<Value>,
}

fn entry_json(entry: &Entry) -> Result<Value, ApiError> {
    Ok(json!({
        "id": entry.id,
        "parent": entry.parent_id,
        "kind": entry.kind.as_str(),
        "title": entry.title,
        "created_by": entry.created_by,
        "created_at": rfc3339(entry.created_at)?,
        "modified_at": rfc3339(entry.modified_at)?,
    }))
}

fn seal(ctx: &mut RequestContext, store_id: Gid, value: &Value) -> Result<Vec<u8>, ApiError> {
    let session = ctx.store_session(store_id)?;
    let plaintext = serde_json::to_vec(value)
        .map_err(|error| ApiError::invalid_field("value", error.to_string()))?;
    Ok(encrypt_value(session.key(), &plaintext)?)
}

fn parse_entry(raw: &str) -> Result<Gid, ApiError> {
    parse_id(raw, ObjectType::Entry)
}

/// Loads `object` and checks it sits under `parent`. The root is never
/// addressable as an object.
async fn child_entry(
    ctx: &RequestContext,
    store: &StoreContext,
    parent: &str,
    object: &str,
) -> Result<Entry, ApiError> {
    let parent_id = parse_entry(parent)?;
    let entry_id = parse_entry(object)?;
    if entry_id == ROOT_ENTRY {
        return Err(ApiError::with_message(ErrorCode::NotFound, "entry not found"));
    }
    let entry = ctx.storage().get_entry(store.store.id, entry_id).await?;
    if entry.parent_id != parent_id {
        return Err(ApiError::with_message(ErrorCode::NotFound, "entry not found"));
    }
    Ok(entry)
}

/// A folder lists its children; a json entry is decrypted.
async fn render(
    ctx: &mut RequestContext,
    store: &StoreContext,
    entry: Option<Entry>,
) -> Result<Reply, ApiError> {
    let (parent_id, mut body) = match entry {
        None => (ROOT_ENTRY, json!({ "id": ROOT_ENTRY, "kind": EntryKind::Folder.as_str() })),
        Some(entry) if entry.kind == EntryKind::Json => {
            store.require(&READ)?;
            let session = ctx.store_session(store.store.id)?;
            let plaintext = decrypt_value(session.key(), &entry.ciphertext)?;
            let value: Value = serde_json::from_slice(&plaintext).map_err(|error| {
                tracing::error!(entry_id = %entry.id, error = %error, "decrypted entry is not JSON");
                ApiError::new(ErrorCode::Crypto)
            })?;
            let mut body = entry_json(&entry)?;
            body["value"] = value;
            return Ok(Reply::ok(body));
        }
        Some(entry) => (entry.id, entry_json(&entry)?),
    };
    let children = ctx
        .storage()
        .list_entries(store.store.id, parent_id)
        .await?
        .iter()
        .map(entry_json)
        .collect::<Result<Vec<_>, _>>()?;
    body["children"] = Value::Array(children);
    Ok(Reply::ok(body))
}

/// `GET /1/store/{store}/obj/{parent}`
pub(crate) async fn get_parent(
    State(state): State<ApiState>,
    Path((store, parent)): Path<(String, String)>,
    jar: CookieJar,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = get_parent_steps(&mut ctx, &store, &parent).await;
    ctx.finish(outcome)
}

async fn get_parent_steps(
    ctx: &mut RequestContext,
    store: &str,
    parent: &str,
) -> Result<Reply, ApiError> {
    let store = StoreContext::by_id(ctx, store, &LIST).await?;
    store.ensure_not_blocked()?;
    let parent_id = parse_entry(parent)?;
    let entry = if parent_id == ROOT_ENTRY {
        None
    } else {
        Some(ctx.storage().get_entry(store.store.id, parent_id).await?)
    };
    render(ctx, &store, entry).await
}

/// `GET /1/store/{store}/obj/{parent}/{object}`
pub(crate) async fn get_entry(
    State(state): State<ApiState>,
    Path((store, parent, object)): Path<(String, String, String)>,
    jar: CookieJar,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = get_entry_steps(&mut ctx, &store, &parent, &object).await;
    ctx.finish(outcome)
}

async fn get_entry_steps(
    ctx: &mut RequestContext,
    store: &str,
    parent: &str,
    object: &str,
) -> Result<Reply, ApiError> {
    let store = StoreContext::by_id(ctx, store, &LIST).await?;
    store.ensure_not_blocked()?;
    let entry = child_entry(ctx, &store, parent, object).await?;
    render(ctx, &store, Some(entry)).await
}

/// `POST /1/store/{store}/obj/{parent}`
pub(crate) async fn create_entry(
    State(state): State<ApiState>,
    Path((store, parent)): Path<(String, String)>,
    jar: CookieJar,
    body: Bytes,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = create_entry_steps(&mut ctx, &store, &parent, &body).await;
    ctx.finish(outcome)
}

async fn create_entry_steps(
    ctx: &mut RequestContext,
    store: &str,
    parent: &str,
    body: &Bytes,
) -> Result<Reply, ApiError> {
    let body: CreateBody = json_body(body)?;
    validate_title(&body.title)?;
    let store = StoreContext::by_id(ctx, store, &CREATE).await?;
    store.ensure_writable()?;
    let parent_id = parse_entry(parent)?;
    let kind = EntryKind::from(body.kind);
    let ciphertext = match (kind, &body.value) {
        (EntryKind::Json, Some(value)) => seal(ctx, store.store.id, value)?,
        (EntryKind::Json, None) => {
            return Err(ApiError::invalid_field("value", "json entries need a value"))
        }
        (EntryKind::Folder, Some(_)) => {
            return Err(ApiError::invalid_field("value", "folders carry no value"))
        }
        (EntryKind::Folder, None) => {
            ctx.store_session(store.store.id)?;
            Vec::new()
        }
    };

    let entry = ctx
        .storage()
        .create_entry(&NewEntry {
            store_id: store.store.id,
            parent_id,
            kind,
            title: body.title,
            ciphertext,
            created_by: store.user.id,
            created_at: ctx.now,
        })
        .await?;
    tracing::debug!(store_id = %store.store.id, entry_id = %entry.id, kind = kind.as_str(), "entry created");
    Ok(Reply::created(entry_json(&entry)?))
}

/// `PUT /1/store/{store}/obj/{parent}/{object}`
pub(crate) async fn update_entry(
    State(state): State<ApiState>,
    Path((store, parent, object)): Path<(String, String, String)>,
    jar: CookieJar,
    body: Bytes,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = update_entry_steps(&mut ctx, &store, &parent, &object, &body).await;
    ctx.finish(outcome)
}

async fn update_entry_steps(
    ctx: &mut RequestContext,
    store: &str,
    parent: &str,
    object: &str,
    body: &Bytes,
) -> Result<Reply, ApiError> {
    let body: UpdateBody = json_body(body)?;
    if let Some(title) = &body.title {
        validate_title(title)?;
    }
    let store = StoreContext::by_id(ctx, store, &UPDATE).await?;
    store.ensure_writable()?;
    let entry = child_entry(ctx, &store, parent, object).await?;
    let ciphertext = match (entry.kind, &body.value) {
        (EntryKind::Json, Some(value)) => Some(seal(ctx, store.store.id, value)?),
        (EntryKind::Folder, Some(_)) => {
            return Err(ApiError::invalid_field("value", "folders carry no value"))
        }
        (_, None) => {
            ctx.store_session(store.store.id)?;
            None
        }
    };

    let update = EntryUpdate {
        title: body.title,
        ciphertext,
        modified_at: ctx.now,
    };
    let updated = ctx
        .storage()
        .update_entry(store.store.id, entry.id, &update)
        .await?;
    Ok(Reply::ok(entry_json(&updated)?))
}

/// `DELETE /1/store/{store}/obj/{parent}/{object}`: folders go with their subtree.
pub(crate) async fn delete_entry(
    State(state): State<ApiState>,
    Path((store, parent, object)): Path<(String, String, String)>,
    jar: CookieJar,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = delete_entry_steps(&mut ctx, &store, &parent, &object).await;
    ctx.finish(outcome)
}

async fn delete_entry_steps(
    ctx: &mut RequestContext,
    store: &str,
    parent: &str,
    object: &str,
) -> Result<Reply, ApiError> {
    let store = StoreContext::by_id(ctx, store, &DELETE).await?;
    store.ensure_writable()?;
    let entry = child_entry(ctx, &store, parent, object).await?;
    ctx.store_session(store.store.id)?;
    let deleted = ctx.storage().delete_entry(store.store.id, entry.id).await?;
    tracing::debug!(store_id = %store.store.id, entry_id = %entry.id, deleted, "entry deleted");
    Ok(Reply::ok(json!({ "deleted": deleted })))
}

/// `POST /1/store/{store}/obj/{parent}/{object}/move`
pub(crate) async fn move_entry(State(state): State<ApiState>, jar: CookieJar) -> Response {
    let ctx = RequestContext::begin(state, jar);
    ctx.finish(Err(ApiError::new(ErrorCode::NotImplemented)))
}
