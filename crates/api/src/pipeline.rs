//! Request plumbing shared by every handler.
//!
//! A handler opens a [`RequestContext`], runs its steps as plain `async`
//! functions returning `Result<_, ApiError>`, and hands the outcome to
//! [`RequestContext::finish`], which writes the session cookie at most once.

use std::time::{Duration, SystemTime};

use axum::body::Bytes;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::de::DeserializeOwned;
use serde::Serialize;
use strongbox_auth::session::KEY_INVITATION_ID;
use strongbox_auth::state::{is_inactive, STATE_BLOCKED, STATE_DELETED, STATE_READONLY};
use strongbox_auth::{Role, RoleSet, SessionData, SessionUser, StoreSession};
use strongbox_core::validation::validate_invitation_uid;
use strongbox_core::{ErrorCode, Gid, InvitationState, ObjectRef, ObjectType};
use strongbox_queue::publish_json;
use strongbox_storage::{
    Invitation, InvitationRegistry, ObjectUser, Org, OrgStore, Storage, Store, User,
    UserRegistry,
};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::{invitations, ApiError, ApiState, Reply};

// ---------------------------------------------------------------------------
// Session cookie
// ---------------------------------------------------------------------------

/// The HTTP session, decoded once per request.
pub(crate) struct SessionStore {
    jar: CookieJar,
    original: SessionData,
    data: SessionData,
    stale: bool,
}

impl SessionStore {
    fn load(state: &ApiState, jar: CookieJar, now: SystemTime) -> Self {
        let name = &state.settings().cookie.name;
        let (data, stale) = match jar.get(name) {
            None => (SessionData::default(), false),
            Some(cookie) => match state.sessions.decode(cookie.value(), now) {
                Ok(data) => (data, false),
                Err(error) => {
                    tracing::debug!(error = %error, "discarding unreadable session cookie");
                    (SessionData::default(), true)
                }
            },
        };
        Self {
            jar,
            original: data.clone(),
            data,
            stale,
        }
    }

    /// Writes the cookie if the session changed, then renders the outcome.
    fn finish(
        self,
        state: &ApiState,
        now: SystemTime,
        outcome: Result<Reply, ApiError>,
    ) -> Response {
        if self.data == self.original && !self.stale {
            return outcome.into_response();
        }
        let settings = &state.settings().cookie;
        let jar = if self.data.is_empty() {
            self.jar.remove(
                Cookie::build((settings.name.clone(), ""))
                    .path(settings.path.clone())
                    .build(),
            )
        } else {
            let value = match state.sessions.encode(&self.data, now) {
                Ok(value) => value,
                Err(error) => return ApiError::from(error).into_response(),
            };
            let max_age = settings.max_age.min(state.sessions.ttl());
            let mut cookie = Cookie::build((settings.name.clone(), value))
                .path(settings.path.clone())
                .secure(settings.secure)
                .http_only(settings.http_only)
                .same_site(SameSite::Lax)
                .max_age(time::Duration::seconds(
                    i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX),
                ));
            if let Some(domain) = &settings.domain {
                cookie = cookie.domain(domain.clone());
            }
            self.jar.add(cookie)
        };
        (jar, outcome).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

pub(crate) struct RequestContext {
    pub(crate) state: ApiState,
    pub(crate) now: SystemTime,
    session: SessionStore,
}

impl RequestContext {
    pub(crate) fn begin(state: ApiState, jar: CookieJar) -> Self {
        let now = state.now();
        let session = SessionStore::load(&state, jar, now);
        Self {
            state,
            now,
            session,
        }
    }

    pub(crate) fn finish(self, outcome: Result<Reply, ApiError>) -> Response {
        if let Err(error) = &outcome {
            tracing::debug!(code = %error.code, error = %error.message, "request aborted");
        }
        self.session.finish(&self.state, self.now, outcome)
    }

    pub(crate) fn storage(&self) -> &dyn Storage {
        self.state.storage()
    }

    pub(crate) fn session(&self) -> &SessionData {
        &self.session.data
    }

    pub(crate) fn session_mut(&mut self) -> &mut SessionData {
        &mut self.session.data
    }

    pub(crate) fn session_user(&self) -> Option<SessionUser> {
        self.session.data.user()
    }

    pub(crate) fn require_user(&self) -> Result<SessionUser, ApiError> {
        self.session_user()
            .ok_or_else(|| ApiError::new(ErrorCode::SessionRequired))
    }

    /// Loads the signed-in user's row. A session whose user vanished or
    /// changed password elsewhere is dropped.
    pub(crate) async fn current_user(&mut self) -> Result<User, ApiError> {
        let session_user = self.require_user()?;
        let user = match self.storage().get_user(session_user.id).await {
            Ok(user) => user,
            Err(error) if error.is_not_found() => {
                self.session_mut().clear();
                return Err(ApiError::new(ErrorCode::SessionRequired));
            }
            Err(error) => return Err(error.into()),
        };
        if user.password_hash != session_user.password_hash {
            self.session_mut().clear();
            return Err(ApiError::new(ErrorCode::SessionRequired));
        }
        if is_inactive(user.state) {
            return Err(ApiError::new(ErrorCode::UserInactive));
        }
        Ok(user)
    }

    /// The live store session for `store_id`, or 4202.
    pub(crate) fn store_session(&mut self, store_id: Gid) -> Result<StoreSession, ApiError> {
        let now = self.now;
        match self.session_mut().store_session(store_id) {
            Some(session) if session.is_open(now) => Ok(session),
            Some(_) => {
                self.session_mut().remove_store_session(store_id);
                Err(ApiError::new(ErrorCode::StoreNotOpen))
            }
            None => Err(ApiError::new(ErrorCode::StoreNotOpen)),
        }
    }

    pub(crate) fn store_session_lifetime(&self, minutes: Option<u32>) -> Duration {
        let minutes = minutes.unwrap_or(self.state.settings().store_session_minutes);
        Duration::from_secs(u64::from(minutes) * 60)
    }
}

// ---------------------------------------------------------------------------
// Bodies and parameters
// ---------------------------------------------------------------------------

pub(crate) fn json_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    if body.is_empty() {
        return Err(ApiError::new(ErrorCode::MissingParameter));
    }
    serde_json::from_slice(body)
        .map_err(|error| ApiError::with_message(ErrorCode::BadJson, error.to_string()))
}

/// Like [`json_body`], but an empty body yields the default value.
pub(crate) fn optional_json_body<T: DeserializeOwned + Default>(
    body: &Bytes,
) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    json_body(body)
}

/// Parses a route parameter that must be a global id of `expected` type.
pub(crate) fn parse_id(raw: &str, expected: ObjectType) -> Result<Gid, ApiError> {
    expect_type(raw.parse()?, expected)
}

/// Nil passes through so callers can treat it as the root or as absent.
pub(crate) fn expect_type(id: Gid, expected: ObjectType) -> Result<Gid, ApiError> {
    if id.is_nil() {
        return Ok(id);
    }
    if !id.is_type(expected) {
        return Err(ApiError::with_message(
            ErrorCode::NotFound,
            format!("{} not found", expected.as_str()),
        ));
    }
    Ok(id)
}

pub(crate) fn rfc3339(value: SystemTime) -> Result<String, ApiError> {
    OffsetDateTime::from(value).format(&Rfc3339).map_err(|error| {
        tracing::error!(error = %error, "timestamp is not representable");
        ApiError::new(ErrorCode::Misconfiguration)
    })
}

/// Publishes to the configured queue. A failure downgrades the reply to
/// 2490 instead of aborting.
pub(crate) async fn enqueue<T: Serialize + Sync>(state: &ApiState, message: &T) -> Option<ErrorCode> {
    let queue = &state.settings().queue_name;
    match publish_json(state.publisher(), queue, message).await {
        Ok(()) => None,
        Err(error) => {
            tracing::warn!(queue = %queue, error = %error, "message could not be queued");
            Some(ErrorCode::QueuedWithWarning)
        }
    }
}

pub(crate) fn require_roles(held: &RoleSet, required: &[Role]) -> Result<(), ApiError> {
    if held.satisfies(required) {
        Ok(())
    } else {
        Err(ApiError::new(ErrorCode::InsufficientRoles))
    }
}

pub(crate) fn member_roles(member: &ObjectUser) -> Result<RoleSet, ApiError> {
    RoleSet::parse_csv(&member.roles).map_err(|error| {
        tracing::error!(
            object_id = %member.object_id,
            user_id = %member.user_id,
            error = %error,
            "stored roles do not parse"
        );
        ApiError::new(ErrorCode::Misconfiguration)
    })
}

// ---------------------------------------------------------------------------
// Resolvers
// ---------------------------------------------------------------------------

pub(crate) async fn resolve_org(storage: &dyn Storage, raw: &str) -> Result<Org, ApiError> {
    let org_id = match ObjectRef::parse(raw)? {
        ObjectRef::Id(id) => expect_type(id, ObjectType::Org)?,
        ObjectRef::Alias(alias) => match storage.find_org_by_alias(&alias).await? {
            Some(row) => row.org_id,
            None => return Err(ApiError::with_message(ErrorCode::NotFound, "organization not found")),
        },
    };
    let org = storage.get_org(org_id).await?;
    if org.state & STATE_DELETED != 0 {
        return Err(ApiError::with_message(ErrorCode::NotFound, "organization not found"));
    }
    Ok(org)
}

pub(crate) async fn resolve_user(storage: &dyn Storage, raw: &str) -> Result<Gid, ApiError> {
    match ObjectRef::parse(raw)? {
        ObjectRef::Id(id) => expect_type(id, ObjectType::User),
        ObjectRef::Alias(name) => storage
            .find_user_by_name(&name)
            .await?
            .map(|row| row.user_id)
            .ok_or_else(|| ApiError::with_message(ErrorCode::NotFound, "user not found")),
    }
}

/// Finds a store of `org_id` by id or by its alias within the org.
pub(crate) async fn resolve_org_store(
    storage: &dyn Storage,
    org_id: Gid,
    raw: &str,
) -> Result<OrgStore, ApiError> {
    let row = match ObjectRef::parse(raw)? {
        ObjectRef::Id(id) => {
            let store_id = expect_type(id, ObjectType::Store)?;
            storage.get_org_store(org_id, store_id).await?
        }
        ObjectRef::Alias(alias) => storage.find_org_store(org_id, &alias).await?,
    };
    match row {
        Some(row) if row.state & STATE_DELETED == 0 => Ok(row),
        _ => Err(ApiError::with_message(ErrorCode::NotFound, "store not found")),
    }
}

// ---------------------------------------------------------------------------
// Object contexts
// ---------------------------------------------------------------------------

/// An organization together with the caller's membership in it.
pub(crate) struct OrgContext {
    pub(crate) org: Org,
    pub(crate) user: User,
}

impl OrgContext {
    pub(crate) async fn load(
        ctx: &mut RequestContext,
        org: &str,
        required: &[Role],
    ) -> Result<Self, ApiError> {
        let user = ctx.current_user().await?;
        let org = resolve_org(ctx.storage(), org).await?;
        let member = ctx
            .storage()
            .get_object_user(org.id, user.id)
            .await?
            .ok_or_else(|| ApiError::new(ErrorCode::InsufficientRoles))?;
        if is_inactive(member.state) {
            return Err(ApiError::new(ErrorCode::UserInactive));
        }
        let roles = member_roles(&member)?;
        require_roles(&roles, required)?;
        Ok(Self { org, user })
    }

    pub(crate) async fn members(&self, storage: &dyn Storage) -> Result<Vec<ObjectUser>, ApiError> {
        Ok(storage.list_object_users(self.org.id).await?)
    }
}

/// A store, its placement in its org and the caller's membership in it.
pub(crate) struct StoreContext {
    pub(crate) store: Store,
    pub(crate) placement: OrgStore,
    pub(crate) user: User,
    pub(crate) member: ObjectUser,
    roles: RoleSet,
}

impl StoreContext {
    /// Store addressed by id alone, as under `/1/store/{store}`.
    pub(crate) async fn by_id(
        ctx: &mut RequestContext,
        store: &str,
        required: &[Role],
    ) -> Result<Self, ApiError> {
        let store_id = parse_id(store, ObjectType::Store)?;
        if store_id.is_nil() {
            return Err(ApiError::with_message(ErrorCode::NotFound, "store not found"));
        }
        let user = ctx.current_user().await?;
        let store = ctx.storage().get_store(store_id).await?;
        let placement = match ctx.storage().get_org_store(store.org_id, store.id).await? {
            Some(row) if row.state & STATE_DELETED == 0 => row,
            _ => return Err(ApiError::with_message(ErrorCode::NotFound, "store not found")),
        };
        Self::with_member(ctx, store, placement, user, required).await
    }

    /// Store addressed through its organization, by id or alias.
    pub(crate) async fn in_org(
        ctx: &mut RequestContext,
        org: &str,
        store: &str,
        required: &[Role],
    ) -> Result<Self, ApiError> {
        let user = ctx.current_user().await?;
        let org = resolve_org(ctx.storage(), org).await?;
        let placement = resolve_org_store(ctx.storage(), org.id, store).await?;
        let store = ctx.storage().get_store(placement.store_id).await?;
        Self::with_member(ctx, store, placement, user, required).await
    }

    async fn with_member(
        ctx: &mut RequestContext,
        store: Store,
        placement: OrgStore,
        user: User,
        required: &[Role],
    ) -> Result<Self, ApiError> {
        let member = ctx
            .storage()
            .get_object_user(store.id, user.id)
            .await?
            .ok_or_else(|| ApiError::new(ErrorCode::InsufficientRoles))?;
        if is_inactive(member.state) {
            return Err(ApiError::new(ErrorCode::UserInactive));
        }
        let roles = member_roles(&member)?;
        require_roles(&roles, required)?;
        Ok(Self {
            store,
            placement,
            user,
            member,
            roles,
        })
    }

    pub(crate) fn require(&self, required: &[Role]) -> Result<(), ApiError> {
        require_roles(&self.roles, required)
    }

    fn lock_state(&self) -> u32 {
        self.placement.state | self.store.state
    }

    /// Opening and reading need a store that is not blocked.
    pub(crate) fn ensure_not_blocked(&self) -> Result<(), ApiError> {
        if self.lock_state() & STATE_BLOCKED != 0 {
            return Err(ApiError::new(ErrorCode::StoreBlocked));
        }
        Ok(())
    }

    /// Writes need a store that is neither blocked nor read-only, and a
    /// member who is not read-only.
    pub(crate) fn ensure_writable(&self) -> Result<(), ApiError> {
        if self.lock_state() & (STATE_BLOCKED | STATE_READONLY) != 0 {
            return Err(ApiError::new(ErrorCode::StoreBlocked));
        }
        if self.member.state & STATE_READONLY != 0 {
            return Err(ApiError::new(ErrorCode::UserReadonly));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Invitations
// ---------------------------------------------------------------------------

/// A pending invitation, revalidated against the clock.
pub(crate) struct InvitationContext {
    pub(crate) registry: InvitationRegistry,
    pub(crate) invitation: Invitation,
    pub(crate) kind: ObjectType,
}

impl InvitationContext {
    /// Loads a pending invitation. An overdue one is marked expired first.
    pub(crate) async fn load(
        storage: &dyn Storage,
        uid: &str,
        now: SystemTime,
    ) -> Result<Self, ApiError> {
        if validate_invitation_uid(uid).is_err() {
            return Err(ApiError::new(ErrorCode::InvalidInvitation));
        }
        let registry = storage
            .get_invitation_registry(uid)
            .await
            .map_err(invalid_invitation)?;
        let invitation = storage
            .get_invitation(registry.invitation_id)
            .await
            .map_err(invalid_invitation)?;
        if invitation.state != InvitationState::Pending {
            return Err(ApiError::new(ErrorCode::InvalidInvitation));
        }
        if invitation.expires_at <= now {
            invitations::expire_invitation(storage, &invitation, now).await?;
            return Err(ApiError::new(ErrorCode::InvitationExpired));
        }
        let kind = invitation.object_id.object_type()?;
        if !matches!(kind, ObjectType::Org | ObjectType::Store) {
            tracing::error!(invitation_id = %invitation.id, object_type = %kind, "invitation targets an unsupported object");
            return Err(ApiError::new(ErrorCode::Misconfiguration));
        }
        Ok(Self {
            registry,
            invitation,
            kind,
        })
    }

    pub(crate) fn uid(&self) -> &str {
        &self.registry.uid
    }

    /// Emails compare case-insensitively.
    pub(crate) fn is_for(&self, email: &str) -> bool {
        self.invitation.invitee_email.eq_ignore_ascii_case(email)
    }
}

fn invalid_invitation(error: strongbox_storage::StorageError) -> ApiError {
    if error.is_not_found() {
        ApiError::new(ErrorCode::InvalidInvitation)
    } else {
        error.into()
    }
}

/// How an accept request proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcceptPath {
    /// Org invite, nobody signed in, invitee has no account: register first.
    Register,
    /// Org invite, nobody signed in, invitee has an account: sign in and retry.
    LoginRequired,
    /// Org invite accepted by the signed-in invitee.
    Member,
    /// Store invite accepted by the signed-in invitee.
    Store,
}

/// Picks the accept variant. The caller has already checked that a
/// signed-in user is the invitee.
pub(crate) fn accept_path(
    kind: ObjectType,
    session: Option<&SessionUser>,
    invitee: Option<&UserRegistry>,
) -> Result<AcceptPath, ApiError> {
    match (kind, session, invitee) {
        (ObjectType::Store, Some(_), _) => Ok(AcceptPath::Store),
        (ObjectType::Store, None, _) => Err(ApiError::new(ErrorCode::SessionRequired)),
        (_, Some(_), _) => Ok(AcceptPath::Member),
        (_, None, Some(account)) if is_inactive(account.state) => {
            Err(ApiError::new(ErrorCode::UserInactive))
        }
        (_, None, Some(_)) => Ok(AcceptPath::LoginRequired),
        (_, None, None) => Ok(AcceptPath::Register),
    }
}

/// Remembers the invitation so the client can retry after signing in.
pub(crate) fn remember_invitation(session: &mut SessionData, uid: &str) {
    session.set(KEY_INVITATION_ID, uid);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_user() -> SessionUser {
        SessionUser {
            id: Gid::pack(1, ObjectType::User, 0, 1),
            email: "b@x".to_owned(),
            name: "bob".to_owned(),
            password_hash: "ab".repeat(32),
        }
    }

    fn account(state: u32) -> UserRegistry {
        UserRegistry {
            user_id: Gid::pack(1, ObjectType::User, 0, 1),
            email: "b@x".to_owned(),
            name: "bob".to_owned(),
            state,
        }
    }

    #[test]
    fn accept_path_covers_every_variant() {
        let user = session_user();
        assert_eq!(
            accept_path(ObjectType::Org, None, None),
            Ok(AcceptPath::Register)
        );
        assert_eq!(
            accept_path(ObjectType::Org, None, Some(&account(0))),
            Ok(AcceptPath::LoginRequired)
        );
        assert_eq!(
            accept_path(ObjectType::Org, Some(&user), Some(&account(0))),
            Ok(AcceptPath::Member)
        );
        assert_eq!(
            accept_path(ObjectType::Store, Some(&user), Some(&account(0))),
            Ok(AcceptPath::Store)
        );
    }

    #[test]
    fn accept_path_refusals() {
        assert_eq!(
            accept_path(ObjectType::Store, None, Some(&account(0)))
                .map_err(|error| error.code),
            Err(ErrorCode::SessionRequired)
        );
        assert_eq!(
            accept_path(ObjectType::Org, None, Some(&account(STATE_BLOCKED)))
                .map_err(|error| error.code),
            Err(ErrorCode::UserInactive)
        );
    }

    #[test]
    fn parse_id_checks_the_type_tag() {
        let store = Gid::pack(1, ObjectType::Store, 0, 7);
        assert_eq!(parse_id(&store.to_string(), ObjectType::Store), Ok(store));
        assert_eq!(
            parse_id(&store.to_string(), ObjectType::Org).map_err(|error| error.code),
            Err(ErrorCode::NotFound)
        );
        assert_eq!(
            parse_id("nope", ObjectType::Store).map_err(|error| error.code),
            Err(ErrorCode::MalformedParameter)
        );
    }

    #[test]
    fn bodies_report_shape_errors() {
        let empty = Bytes::new();
        assert_eq!(
            json_body::<serde_json::Value>(&empty).map_err(|error| error.code),
            Err(ErrorCode::MissingParameter)
        );
        assert_eq!(
            json_body::<serde_json::Value>(&Bytes::from_static(b"{")).map_err(|error| error.code),
            Err(ErrorCode::BadJson)
        );
        let parsed: serde_json::Value = optional_json_body(&empty).expect("default");
        assert!(parsed.is_null());
    }

    #[test]
    fn timestamps_render_as_rfc3339() {
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(rfc3339(at).expect("format"), "2023-11-14T22:13:20Z");
    }
}
