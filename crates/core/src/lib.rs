#![forbid(unsafe_code)]

pub mod clock;
pub mod gid;
pub mod protocol;
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use gid::{random_shard, Gid, ObjectRef, ObjectType, ShardRange, GROUP_DATA, GROUP_REGISTRY};
pub use protocol::{ErrorCode, ErrorResponse, InvitationState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid identifier")]
    InvalidIdentifier,
    #[error("unknown object type tag {0}")]
    UnknownObjectType(u8),
    #[error("unknown invitation state {0}")]
    UnknownInvitationState(i16),
    #[error("invalid shard range {first}..={last}")]
    InvalidShardRange { first: u16, last: u16 },
}
