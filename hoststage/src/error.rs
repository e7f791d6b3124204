use crate::types::Rank;

pub type Result<T> = std::result::Result<T, HostStageError>;

#[derive(Debug, thiserror::Error)]
pub enum HostStageError {
    #[error(
        "pinned staging memory exhausted: requested {requested} bytes with {outstanding}/{capacity} bytes outstanding"
    )]
    PinnedExhausted {
        requested: usize,
        outstanding: usize,
        capacity: usize,
    },

    #[error("device runtime error: {message}")]
    DeviceError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{operation} failed at rank {rank}: {reason}")]
    NetworkFailed {
        operation: &'static str,
        rank: Rank,
        reason: String,
    },

    #[error("protocol misuse: {0}")]
    ProtocolMisuse(&'static str),

    #[error("payload of {count} elements across {world} ranks overflows the address space")]
    PayloadTooLarge { count: usize, world: u32 },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("unsupported native reduction token {token}")]
    UnsupportedOp { token: u32 },

    #[error("{0} is not initialized")]
    NotInitialized(&'static str),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl HostStageError {
    /// Create a `DeviceError` with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::DeviceError {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `DeviceError` with a message and a source error.
    pub fn device_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::DeviceError {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a `NetworkFailed` error for `operation` at `rank`.
    pub fn network(operation: &'static str, rank: Rank, reason: impl Into<String>) -> Self {
        Self::NetworkFailed {
            operation,
            rank,
            reason: reason.into(),
        }
    }
}
