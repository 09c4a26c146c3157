use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ErrorCode;

/// ErrorResponse is the body of every failed HTTP JSON response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "code")]
    pub code: ErrorCode,
    #[serde(rename = "error")]
    pub error: String,
    /// Per-field reasons for invalid bodies.
    #[serde(rename = "fields", default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<BTreeMap<String, String>>,
}

/// Invitation lifecycle. Every state other than `Pending` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum InvitationState {
    Pending = 0,
    Accepted = 1,
    Declined = 2,
    Expired = 3,
    Revoked = 4,
}

impl InvitationState {
    #[must_use]
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

impl TryFrom<i16> for InvitationState {
    type Error = crate::CoreError;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Accepted),
            2 => Ok(Self::Declined),
            3 => Ok(Self::Expired),
            4 => Ok(Self::Revoked),
            _ => Err(crate::CoreError::UnknownInvitationState(value)),
        }
    }
}
