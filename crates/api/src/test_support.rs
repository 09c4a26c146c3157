use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use strongbox_auth::SessionCodec;
use strongbox_core::clock::from_unix_seconds;
use strongbox_core::{Gid, ManualClock};
use strongbox_queue::{QueueError, QueuePublisher};
use strongbox_storage::MemoryStorage;
use tower::ServiceExt;

use crate::{router, ApiState, Settings};

pub(crate) const START: u64 = 1_700_000_000;

/// Captures published payloads; can be switched to fail.
#[derive(Default)]
pub(crate) struct RecordingPublisher {
    messages: Mutex<Vec<(String, Value)>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    pub(crate) fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn messages(&self) -> Vec<(String, Value)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueuePublisher for RecordingPublisher {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(QueueError::Rejected);
        }
        let message = serde_json::from_slice(payload).unwrap();
        self.messages
            .lock()
            .unwrap()
            .push((queue.to_owned(), message));
        Ok(())
    }
}

pub(crate) struct TestApp {
    pub(crate) storage: Arc<MemoryStorage>,
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) publisher: Arc<RecordingPublisher>,
    app: Router,
}

impl TestApp {
    pub(crate) fn new() -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(from_unix_seconds(START)));
        let publisher = Arc::new(RecordingPublisher::default());
        let sessions =
            SessionCodec::new("hash-secret", "encryption-secret", Duration::from_secs(86_400))
                .unwrap();
        let state = ApiState::new(storage.clone(), sessions)
            .with_publisher(publisher.clone())
            .with_clock(clock.clone())
            .with_settings(Settings::default());
        Self {
            storage,
            clock,
            publisher,
            app: router(state),
        }
    }

    /// A browser with its own cookie.
    pub(crate) fn client(&self) -> Client {
        Client {
            app: self.app.clone(),
            cookie: None,
        }
    }
}

pub(crate) struct Client {
    app: Router,
    cookie: Option<String>,
}

impl Client {
    pub(crate) async fn send(
        &mut self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        self.dispatch(request, body).await
    }

    pub(crate) async fn form(&mut self, uri: &str, form: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        self.dispatch(request, Body::from(form.to_owned())).await
    }

    async fn dispatch(
        &mut self,
        mut request: axum::http::request::Builder,
        body: Body,
    ) -> (StatusCode, Value) {
        if let Some(cookie) = &self.cookie {
            request = request.header(header::COOKIE, cookie);
        }
        let response = self
            .app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        if let Some(set_cookie) = response.headers().get(header::SET_COOKIE) {
            let pair = set_cookie
                .to_str()
                .unwrap()
                .split(';')
                .next()
                .unwrap()
                .to_owned();
            self.cookie = if pair.ends_with('=') { None } else { Some(pair) };
        }
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    pub(crate) async fn get(&mut self, uri: &str) -> (StatusCode, Value) {
        self.send(Method::GET, uri, None).await
    }

    pub(crate) async fn post(&mut self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(Method::POST, uri, Some(body)).await
    }

    pub(crate) async fn put(&mut self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(Method::PUT, uri, Some(body)).await
    }

    pub(crate) async fn delete(&mut self, uri: &str) -> (StatusCode, Value) {
        self.send(Method::DELETE, uri, None).await
    }

    /// Registers and signs in. Returns the user id.
    pub(crate) async fn register(&mut self, name: &str, email: &str, hash: &str) -> String {
        let (status, body) = self
            .post(
                &format!("/1/session/{name}"),
                json!({ "hash": hash, "register": { "email": email } }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["user"]["id"].as_str().unwrap().to_owned()
    }

    pub(crate) async fn login(&mut self, id: &str, hash: &str) -> (StatusCode, Value) {
        self.post(&format!("/1/session/{id}"), json!({ "hash": hash }))
            .await
    }

    /// Creates an organization. Returns its id.
    pub(crate) async fn create_org(&mut self, alias: &str) -> String {
        let (status, body) = self
            .post("/1/org", json!({ "alias": alias, "name": alias }))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["id"].as_str().unwrap().to_owned()
    }

    /// Creates a store in `org`. Returns its id.
    pub(crate) async fn create_store(&mut self, org: &str, alias: &str) -> String {
        let (status, body) = self
            .post(
                &format!("/1/org/{org}/store"),
                json!({ "alias": alias, "name": alias }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["id"].as_str().unwrap().to_owned()
    }

    pub(crate) async fn open_store(
        &mut self,
        org: &str,
        store: &str,
        hash: &str,
    ) -> (StatusCode, Value) {
        self.form(
            &format!("/1/org/{org}/store/{store}/open"),
            &format!("credentials={hash}"),
        )
        .await
    }
}

/// A well-formed password hash derived from `seed`.
pub(crate) fn hash(seed: u8) -> String {
    format!("{seed:02x}").repeat(32)
}

pub(crate) fn root() -> String {
    Gid::NIL.to_string()
}

pub(crate) fn code(body: &Value) -> u64 {
    body["code"].as_u64().unwrap_or_default()
}
