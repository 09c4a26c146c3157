use serde::{Deserialize, Serialize};

pub const TEMPLATE_INVITE_ORG: &str = "invite-org";
pub const TEMPLATE_INVITE_STORE: &str = "invite-store";

pub const ACTION_USER_REGISTERED: &str = "user-registered";
pub const ACTION_PASSWORD_CHANGED: &str = "password-changed";

/// Mail request for a freshly created invitation. `code` is the invitation UID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationMessage {
    pub template: String,
    pub to: String,
    pub at_user: String,
    pub by_user: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub object_name: String,
    /// RFC 3339 timestamp.
    pub expiration: String,
}

/// Account notification consumed by the same worker as invitations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMessage {
    pub action: String,
    pub to: String,
    pub at_user: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invitation_message_wire_shape() {
        let message = InvitationMessage {
            template: TEMPLATE_INVITE_ORG.to_owned(),
            to: "b@x".to_owned(),
            at_user: "b@x".to_owned(),
            by_user: "alice".to_owned(),
            code: "f".repeat(40),
            message: None,
            object_name: "Acme".to_owned(),
            expiration: "2023-11-17T22:13:20Z".to_owned(),
        };
        let json = serde_json::to_value(&message).expect("encode");
        assert_eq!(json["template"], "invite-org");
        assert_eq!(json["to"], "b@x");
        assert_eq!(json["code"].as_str().map(str::len), Some(40));
        assert!(json.get("message").is_none());
    }

    #[test]
    fn action_message_payload_defaults_to_null() {
        let decoded: ActionMessage = serde_json::from_str(
            r#"{"action":"user-registered","to":"b@x","at_user":"bob"}"#,
        )
        .expect("decode");
        assert_eq!(decoded.action, ACTION_USER_REGISTERED);
        assert!(decoded.payload.is_null());
    }
}
