#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),
    #[error("failed to publish message: {0}")]
    Publish(String),
    #[error("broker rejected the message")]
    Rejected,
    #[error("publish timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("failed to encode message: {0}")]
    Encode(String),
}
