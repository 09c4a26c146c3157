use std::collections::BTreeMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use strongbox_auth::{CryptoError, SessionError, StateError, StoreSessionError};
use strongbox_core::validation::ValidationError;
use strongbox_core::{CoreError, ErrorCode, ErrorResponse};
use strongbox_storage::StorageError;

/// A request that stopped early. Rendered as the JSON error envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub fields: Option<BTreeMap<String, String>>,
}

impl ApiError {
    #[must_use]
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.default_message().to_owned(),
            fields: None,
        }
    }

    #[must_use]
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fields: None,
        }
    }

    /// 5202 naming the offending body field.
    #[must_use]
    pub fn invalid_field(field: &str, reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidBody).field(field, reason)
    }

    #[must_use]
    pub fn field(mut self, field: &str, reason: impl Into<String>) -> Self {
        self.fields
            .get_or_insert_with(BTreeMap::new)
            .insert(field.to_owned(), reason.into());
        self
    }

    fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (
            status,
            Json(ErrorResponse {
                code: self.code,
                error: self.message,
                fields: self.fields,
            }),
        )
            .into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        if error.is_not_found() {
            return Self::with_message(ErrorCode::NotFound, error.to_string());
        }
        match error {
            StorageError::AlreadyExists => Self::new(ErrorCode::AlreadyRegistered),
            StorageError::InvitationClosed => Self::new(ErrorCode::InvalidInvitation),
            StorageError::LastRoleHolder(_) => Self::new(ErrorCode::LastManager),
            StorageError::ShardNotConfigured { .. } => {
                tracing::error!(error = %error, "request routed to an unconfigured shard");
                Self::new(ErrorCode::Misconfiguration)
            }
            other => {
                tracing::error!(error = %other, "storage failure");
                Self::new(ErrorCode::Database)
            }
        }
    }
}

impl From<CryptoError> for ApiError {
    fn from(error: CryptoError) -> Self {
        match error {
            CryptoError::InvalidCredentials => Self::new(ErrorCode::InvalidCredentials),
            other => {
                tracing::error!(error = %other, "crypto failure");
                Self::new(ErrorCode::Crypto)
            }
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::InvalidIdentifier => {
                Self::with_message(ErrorCode::MalformedParameter, error.to_string())
            }
            other => {
                tracing::error!(error = %other, "unexpected identifier contents");
                Self::new(ErrorCode::Misconfiguration)
            }
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(error: SessionError) -> Self {
        tracing::error!(error = %error, "session cookie could not be sealed");
        Self::new(ErrorCode::Misconfiguration)
    }
}

impl From<StoreSessionError> for ApiError {
    fn from(error: StoreSessionError) -> Self {
        tracing::error!(error = %error, "store session could not be stored");
        Self::new(ErrorCode::Misconfiguration)
    }
}

impl From<StateError> for ApiError {
    fn from(error: StateError) -> Self {
        Self::invalid_field("set", error.to_string())
    }
}

impl From<ValidationError> for ApiError {
    fn from(error: ValidationError) -> Self {
        let field = match error {
            ValidationError::InvalidAlias => "alias",
            ValidationError::InvalidEmail => "email",
            ValidationError::InvalidPasswordHash => "hash",
            ValidationError::InvalidInvitationUid => "uid",
            ValidationError::InvalidTitle => "title",
            ValidationError::ExpiryOutOfRange(_) => "expiry_in_days",
        };
        Self::invalid_field(field, error.to_string())
    }
}

/// A successful body, optionally downgraded by an informational code.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: StatusCode,
    pub body: Value,
    pub code: Option<ErrorCode>,
}

impl Reply {
    #[must_use]
    pub fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
            code: None,
        }
    }

    #[must_use]
    pub fn created(body: Value) -> Self {
        Self {
            status: StatusCode::CREATED,
            body,
            code: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }

    #[must_use]
    pub fn with_warning(mut self, warning: Option<ErrorCode>) -> Self {
        if warning.is_some() {
            self.code = warning;
        }
        self
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        let mut body = self.body;
        if let (Some(code), Value::Object(map)) = (self.code, &mut body) {
            map.insert("code".to_owned(), Value::from(code.as_u16()));
        }
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_codes() {
        assert_eq!(
            ApiError::from(StorageError::StoreNotFound).code,
            ErrorCode::NotFound
        );
        assert_eq!(
            ApiError::from(StorageError::AlreadyExists).code,
            ErrorCode::AlreadyRegistered
        );
        assert_eq!(
            ApiError::from(StorageError::InvitationClosed).code,
            ErrorCode::InvalidInvitation
        );
        assert_eq!(
            ApiError::from(StorageError::LastRoleHolder(strongbox_auth::Role::from_bits(1))).code,
            ErrorCode::LastManager
        );
        assert_eq!(
            ApiError::from(StorageError::Database("boom".to_owned())).code,
            ErrorCode::Database
        );
    }

    #[test]
    fn crypto_errors_map_to_codes() {
        assert_eq!(
            ApiError::from(CryptoError::InvalidCredentials).code,
            ErrorCode::InvalidCredentials
        );
        assert_eq!(ApiError::from(CryptoError::Cipher).code, ErrorCode::Crypto);
    }

    #[test]
    fn unencodable_store_session_is_a_system_error() {
        let error = ApiError::from(StoreSessionError::Encode("nope".to_owned()));
        assert_eq!(error.code, ErrorCode::Misconfiguration);
        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn unknown_type_tag_is_a_system_error() {
        let error = ApiError::from(CoreError::UnknownObjectType(9));
        assert_eq!(error.code, ErrorCode::Misconfiguration);
        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn field_errors_accumulate() {
        let error = ApiError::invalid_field("invitee", "cannot invite yourself").field("roles", "bad");
        let fields = error.fields.expect("fields");
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["invitee"], "cannot invite yourself");
    }

    #[tokio::test]
    async fn reply_code_is_merged_into_body() {
        let response = Reply::ok(serde_json::json!({"uid": "u"}))
            .with_code(ErrorCode::QueuedWithWarning)
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let body: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["code"], 2490);
        assert_eq!(body["uid"], "u");
    }
}
