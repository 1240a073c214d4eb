use thiserror::Error;

/// Failure categories of the synchronization core.
///
/// Collaborators report plain `anyhow` errors; the variant records which side
/// of the bridge failed so callers can decide whether the next reconnect will
/// heal it. Duplicate deliveries are not errors and never show up here.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("upstream request failed: {0:#}")]
    Upstream(anyhow::Error),

    #[error("failed to convert message {message_id}: {reason:#}")]
    Conversion {
        message_id: String,
        reason: anyhow::Error,
    },

    #[error("failed to send to target: {0:#}")]
    Dispatch(anyhow::Error),

    #[error("target acknowledged {got} of {expected} batch events")]
    BatchMismatch { expected: usize, got: usize },

    #[error("state store error: {0:#}")]
    Store(anyhow::Error),

    #[error("portal {0} has no room yet")]
    NoRoom(String),

    #[error("failed to create room for {channel}: {reason:#}")]
    RoomCreation {
        channel: String,
        reason: anyhow::Error,
    },

    #[error("invalid value for {key}: {value:?}")]
    Config { key: String, value: String },

    #[error("portal {0} is no longer running")]
    PortalClosed(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
