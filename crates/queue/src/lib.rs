#![forbid(unsafe_code)]

mod error;
mod message;
mod publisher;

pub use error::QueueError;
pub use message::{
    ActionMessage, InvitationMessage, ACTION_PASSWORD_CHANGED, ACTION_USER_REGISTERED,
    TEMPLATE_INVITE_ORG, TEMPLATE_INVITE_STORE,
};
pub use publisher::{publish_json, AmqpPublisher, NoopPublisher, QueuePublisher};

/// Queue that receives invitation and account messages unless configured otherwise.
pub const DEFAULT_QUEUE: &str = "action-incoming";
