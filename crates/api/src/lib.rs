#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::routing::{delete, get, post, put};
use axum::{extract::State, http::StatusCode, Router};
use strongbox_auth::SessionCodec;
use strongbox_core::{Clock, ShardRange, SystemClock};
use strongbox_queue::{NoopPublisher, QueuePublisher, DEFAULT_QUEUE};
use strongbox_storage::Storage;

mod accounts;
mod entries;
mod error;
mod invitations;
mod orgs;
mod pipeline;
mod stores;
#[cfg(test)]
mod test_support;

pub use error::{ApiError, Reply};
pub use invitations::sweep_expired;

/// Cookie attributes for the session cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieSettings {
    pub name: String,
    pub path: String,
    pub domain: Option<String>,
    pub max_age: Duration,
    pub secure: bool,
    pub http_only: bool,
}

impl Default for CookieSettings {
    fn default() -> Self {
        Self {
            name: "strongbox".to_owned(),
            path: "/".to_owned(),
            domain: None,
            max_age: Duration::from_secs(86_400),
            secure: true,
            http_only: true,
        }
    }
}

/// Process-wide knobs read by the handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub data_shards: ShardRange,
    pub store_session_minutes: u32,
    pub invitation_default_days: u32,
    pub invitation_max_days: u32,
    pub queue_name: String,
    pub cookie: CookieSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_shards: ShardRange::single(0),
            store_session_minutes: strongbox_auth::store_session::DEFAULT_STORE_SESSION_MINUTES,
            invitation_default_days: 3,
            invitation_max_days: 30,
            queue_name: DEFAULT_QUEUE.to_owned(),
            cookie: CookieSettings::default(),
        }
    }
}

#[derive(Clone)]
pub struct ApiState {
    storage: Arc<dyn Storage>,
    sessions: Arc<SessionCodec>,
    publisher: Arc<dyn QueuePublisher>,
    clock: Arc<dyn Clock>,
    settings: Arc<Settings>,
}

impl ApiState {
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, sessions: SessionCodec) -> Self {
        Self {
            storage,
            sessions: Arc::new(sessions),
            publisher: Arc::new(NoopPublisher),
            clock: Arc::new(SystemClock),
            settings: Arc::new(Settings::default()),
        }
    }

    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn QueuePublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub(crate) fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub(crate) fn publisher(&self) -> &dyn QueuePublisher {
        self.publisher.as_ref()
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn now(&self) -> SystemTime {
        self.clock.now()
    }

    /// A data shard for a new row.
    pub(crate) fn pick_shard(&self) -> u16 {
        self.settings.data_shards.random_shard()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/1/session", delete(accounts::logout))
        .route("/1/session/{id}", post(accounts::login))
        .route("/1/session/{id}/recover", post(accounts::recover))
        .route("/1/user/objects", get(accounts::list_objects))
        .route("/1/user/objects/{object}", put(accounts::update_object))
        .route("/1/org", post(orgs::create_org))
        .route("/1/org/{org}/users", get(orgs::list_users))
        .route("/1/org/{org}/user/{user}", delete(orgs::remove_user))
        .route("/1/org/{org}/user/{user}/roles", put(orgs::set_roles))
        .route("/1/org/{org}/user/{user}/toggle", post(orgs::toggle_admin))
        .route("/1/org/{org}/invite", post(invitations::invite_to_org))
        .route("/1/org/{org}/store", post(orgs::create_store))
        .route("/1/org/{org}/stores", get(orgs::list_stores))
        .route("/1/org/{org}/store/{store}/state", put(orgs::set_store_state))
        .route("/1/org/{org}/store/{store}/open", post(stores::open_store))
        .route("/1/store/{store}/close", post(stores::close_store))
        .route("/1/store/{store}/extend", post(stores::extend_store))
        .route("/1/store/{store}/invite", post(invitations::invite_to_store))
        .route(
            "/1/store/{store}/obj/{parent}",
            get(entries::get_parent).post(entries::create_entry),
        )
        .route(
            "/1/store/{store}/obj/{parent}/{object}",
            get(entries::get_entry)
                .put(entries::update_entry)
                .delete(entries::delete_entry),
        )
        .route(
            "/1/store/{store}/obj/{parent}/{object}/move",
            post(entries::move_entry),
        )
        .route("/1/invitation/accept/{uid}", post(invitations::accept))
        .route("/1/invitation/decline/{uid}", get(invitations::decline))
        .route("/1/invitation/invite/{uid}", get(invitations::view))
        .route("/1/invitation/{uid}", delete(invitations::revoke))
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> StatusCode {
    match state.storage.ping().await {
        Ok(()) => StatusCode::OK,
        Err(error) => {
            tracing::warn!(error = %error, "registry shard ping failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use crate::test_support::TestApp;

    #[tokio::test]
    async fn health_pings_the_registry() {
        let app = TestApp::new();
        let (status, _) = app.client().get("/health").await;
        assert_eq!(status, StatusCode::OK);
    }
}
