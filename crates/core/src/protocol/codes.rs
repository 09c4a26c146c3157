use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Numeric outcome codes carried in every JSON error body.
///
/// The leading digit is the family: 1 info, 2 partial success, 3 request
/// shape, 4 domain, 5 system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ErrorCode {
    LoginRequired = 1001,
    QueuedWithWarning = 2490,
    MissingParameter = 3001,
    MalformedParameter = 3002,
    BadJson = 3003,
    NotFound = 4000,
    UserInactive = 4001,
    UserReadonly = 4002,
    InsufficientRoles = 4003,
    InvalidCredentials = 4010,
    AlreadyRegistered = 4012,
    LastManager = 4061,
    TargetIsSystemUser = 4101,
    StoreNotOpen = 4202,
    StoreBlocked = 4203,
    SessionRequired = 4301,
    InvalidInvitation = 4390,
    InvitationExpired = 4391,
    Database = 5100,
    InvalidBody = 5202,
    Misconfiguration = 5303,
    Crypto = 5900,
    Queue = 5920,
    NotImplementedYet = 5998,
    NotImplemented = 5999,
}

impl ErrorCode {
    #[must_use]
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// True for 1xxx and 2xxx codes, which ride on a successful response.
    #[must_use]
    pub fn is_informational(self) -> bool {
        self.as_u16() < 3000
    }

    /// HTTP status the code is reported with.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::LoginRequired | Self::QueuedWithWarning => 200,
            Self::MissingParameter | Self::MalformedParameter | Self::BadJson => 400,
            Self::InvalidBody => 400,
            Self::NotFound | Self::InvalidInvitation => 404,
            Self::UserInactive
            | Self::UserReadonly
            | Self::InsufficientRoles
            | Self::TargetIsSystemUser
            | Self::StoreNotOpen
            | Self::StoreBlocked => 403,
            Self::InvalidCredentials | Self::SessionRequired => 401,
            Self::AlreadyRegistered | Self::LastManager => 409,
            Self::InvitationExpired => 410,
            Self::Queue => 502,
            Self::NotImplementedYet | Self::NotImplemented => 501,
            Self::Database | Self::Misconfiguration | Self::Crypto => 500,
        }
    }

    #[must_use]
    pub fn default_message(self) -> &'static str {
        match self {
            Self::LoginRequired => "login required to continue",
            Self::QueuedWithWarning => "completed, but the notification could not be queued",
            Self::MissingParameter => "missing parameter",
            Self::MalformedParameter => "malformed parameter",
            Self::BadJson => "request body is not valid JSON",
            Self::NotFound => "not found",
            Self::UserInactive => "user is inactive",
            Self::UserReadonly => "user is read-only",
            Self::InsufficientRoles => "insufficient roles",
            Self::InvalidCredentials => "invalid credentials",
            Self::AlreadyRegistered => "already registered",
            Self::LastManager => "operation would remove the last manager",
            Self::TargetIsSystemUser => "target is a system user",
            Self::StoreNotOpen => "store is not open",
            Self::StoreBlocked => "store is blocked",
            Self::SessionRequired => "session required",
            Self::InvalidInvitation => "invalid invitation",
            Self::InvitationExpired => "invitation expired",
            Self::Database => "database error",
            Self::InvalidBody => "invalid request body",
            Self::Misconfiguration => "system misconfiguration",
            Self::Crypto => "cryptographic failure",
            Self::Queue => "queue unavailable",
            Self::NotImplementedYet | Self::NotImplemented => "not implemented",
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(value: ErrorCode) -> Self {
        value.as_u16()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown error code {0}")]
pub struct UnknownErrorCode(pub u16);

impl TryFrom<u16> for ErrorCode {
    type Error = UnknownErrorCode;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let code = match value {
            1001 => Self::LoginRequired,
            2490 => Self::QueuedWithWarning,
            3001 => Self::MissingParameter,
            3002 => Self::MalformedParameter,
            3003 => Self::BadJson,
            4000 => Self::NotFound,
            4001 => Self::UserInactive,
            4002 => Self::UserReadonly,
            4003 => Self::InsufficientRoles,
            4010 => Self::InvalidCredentials,
            4012 => Self::AlreadyRegistered,
            4061 => Self::LastManager,
            4101 => Self::TargetIsSystemUser,
            4202 => Self::StoreNotOpen,
            4203 => Self::StoreBlocked,
            4301 => Self::SessionRequired,
            4390 => Self::InvalidInvitation,
            4391 => Self::InvitationExpired,
            5100 => Self::Database,
            5202 => Self::InvalidBody,
            5303 => Self::Misconfiguration,
            5900 => Self::Crypto,
            5920 => Self::Queue,
            5998 => Self::NotImplementedYet,
            5999 => Self::NotImplemented,
            other => return Err(UnknownErrorCode(other)),
        };
        Ok(code)
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorCode;

    #[test]
    fn families_map_to_http_status() {
        assert_eq!(ErrorCode::MissingParameter.http_status(), 400);
        assert_eq!(ErrorCode::NotFound.http_status(), 404);
        assert_eq!(ErrorCode::InsufficientRoles.http_status(), 403);
        assert_eq!(ErrorCode::SessionRequired.http_status(), 401);
        assert_eq!(ErrorCode::LastManager.http_status(), 409);
        assert_eq!(ErrorCode::InvitationExpired.http_status(), 410);
        assert_eq!(ErrorCode::Database.http_status(), 500);
        assert_eq!(ErrorCode::NotImplemented.http_status(), 501);
        assert_eq!(ErrorCode::NotImplementedYet.http_status(), 501);
        assert_eq!(ErrorCode::LoginRequired.http_status(), 200);
    }

    #[test]
    fn informational_codes_are_below_3000() {
        assert!(ErrorCode::LoginRequired.is_informational());
        assert!(ErrorCode::QueuedWithWarning.is_informational());
        assert!(!ErrorCode::MissingParameter.is_informational());
    }

    #[test]
    fn serializes_as_number() {
        let encoded = serde_json::to_string(&ErrorCode::StoreNotOpen).expect("encode");
        assert_eq!(encoded, "4202");
        let decoded: ErrorCode = serde_json::from_str("4391").expect("decode");
        assert_eq!(decoded, ErrorCode::InvitationExpired);
        assert!(serde_json::from_str::<ErrorCode>("4999").is_err());
    }
}
