use axum::body::Bytes;
use axum::extract::rejection::FormRejection;
use axum::extract::{Path, State};
use axum::response::Response;
use axum::Form;
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::json;
use strongbox_auth::role::{FN_LIST, STORE_ACCESS};
use strongbox_auth::{unwrap_key, Role, StoreSession, WrappedKey};
use strongbox_core::validation::validate_password_hash;
use strongbox_core::{ErrorCode, ObjectType};

use crate::pipeline::{optional_json_body, parse_id, rfc3339, RequestContext, StoreContext};
use crate::{ApiError, ApiState, Reply};

/// Longest single extension, in minutes.
const MAX_EXTEND_MINUTES: u32 = 24 * 60;

const OPEN_ROLES: [Role; 1] = [Role::new(STORE_ACCESS, FN_LIST)];

#[derive(Debug, Deserialize)]
pub(crate) struct OpenForm {
    #[serde(default)]
    credentials: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ExtendBody {
    #[serde(default)]
    minutes: Option<u32>,
}

fn session_json(session: &StoreSession) -> Result<serde_json::Value, ApiError> {
    Ok(json!({
        "store": session.store_id(),
        "expires_at": rfc3339(session.expires_at())?,
    }))
}

/// `POST /1/org/{org}/store/{store}/open`: unwraps the member's copy of the
/// store key with the submitted hash and keeps it in the session.
pub(crate) async fn open_store(
    State(state): State<ApiState>,
    Path((org, store)): Path<(String, String)>,
    jar: CookieJar,
    form: Result<Form<OpenForm>, FormRejection>,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = open_store_steps(&mut ctx, &org, &store, form).await;
    ctx.finish(outcome)
}

async fn open_store_steps(
    ctx: &mut RequestContext,
    org: &str,
    store: &str,
    form: Result<Form<OpenForm>, FormRejection>,
) -> Result<Reply, ApiError> {
    let credentials = match form {
        Ok(Form(OpenForm {
            credentials: Some(credentials),
        })) => credentials,
        Ok(_) => {
            return Err(ApiError::with_message(
                ErrorCode::MissingParameter,
                "credentials is required",
            ))
        }
        Err(rejection) => {
            return Err(ApiError::with_message(
                ErrorCode::MissingParameter,
                rejection.body_text(),
            ))
        }
    };
    if validate_password_hash(&credentials).is_err() {
        return Err(ApiError::with_message(
            ErrorCode::MalformedParameter,
            "credentials must be a password hash",
        ));
    }

    let store = StoreContext::in_org(ctx, org, store, &OPEN_ROLES).await?;
    store.ensure_not_blocked()?;
    let Some(wrapped) = store.member.store_key.clone() else {
        tracing::error!(store_id = %store.store.id, user_id = %store.user.id, "store membership without a wrapped key");
        return Err(ApiError::new(ErrorCode::Crypto));
    };
    let key = unwrap_key(&credentials, &WrappedKey::from_bytes(wrapped)?)?;
    let lifetime = ctx.store_session_lifetime(None);
    let session = StoreSession::open(store.store.id, key, ctx.now, lifetime);
    ctx.session_mut().set_store_session(&session)?;
    tracing::debug!(store_id = %store.store.id, user_id = %store.user.id, "store opened");
    Ok(Reply::ok(session_json(&session)?))
}

/// `POST /1/store/{store}/close`. Closing a store that is not open succeeds.
pub(crate) async fn close_store(
    State(state): State<ApiState>,
    Path(store): Path<String>,
    jar: CookieJar,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = parse_id(&store, ObjectType::Store).map(|store_id| {
        ctx.session_mut().remove_store_session(store_id);
        Reply::ok(json!({ "store": store_id }))
    });
    ctx.finish(outcome)
}

/// `POST /1/store/{store}/extend`
pub(crate) async fn extend_store(
    State(state): State<ApiState>,
    Path(store): Path<String>,
    jar: CookieJar,
    body: Bytes,
) -> Response {
    let mut ctx = RequestContext::begin(state, jar);
    let outcome = extend_store_steps(&mut ctx, &store, &body).await;
    ctx.finish(outcome)
}

async fn extend_store_steps(
    ctx: &mut RequestContext,
    store: &str,
    body: &Bytes,
) -> Result<Reply, ApiError> {
    let body: ExtendBody = optional_json_body(body)?;
    if let Some(minutes) = body.minutes {
        if !(1..=MAX_EXTEND_MINUTES).contains(&minutes) {
            return Err(ApiError::invalid_field(
                "minutes",
                format!("must be between 1 and {MAX_EXTEND_MINUTES}"),
            ));
        }
    }
    let store = StoreContext::by_id(ctx, store, &OPEN_ROLES).await?;
    let mut session = ctx.store_session(store.store.id)?;
    session.extend(ctx.now, ctx.store_session_lifetime(body.minutes));
    ctx.session_mut().set_store_session(&session)?;
    Ok(Reply::ok(session_json(&session)?))
}
