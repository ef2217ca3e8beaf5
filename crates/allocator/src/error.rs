use thiserror::Error;

/// Errors surfaced to callers of the allocator's public contract.
#[derive(Debug, Error)]
pub enum AllocError {
    /// Selection found no volume with enough free space right now. A
    /// refill has already been signaled; callers should retry.
    #[error("no available volume for code mode `{code_mode}`")]
    NoAvailableVolume { code_mode: String },

    /// The bid manager has exhausted its configured id space.
    #[error("bid range exhausted")]
    BidExhausted,

    /// Construction-time failure reading cluster manager configuration.
    #[error("cluster manager config error for key `{key}`: {reason}")]
    ClusterConfig { key: String, reason: String },

    /// The allocator's `close()` was already called.
    #[error("allocator is closed")]
    Closed,
}

pub type AllocResult<T> = std::result::Result<T, AllocError>;

/// Failures from the cluster manager client. Never surfaced past the
/// Replenisher/Retainer retry loops that call it.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster manager transport error: {0}")]
    Transport(String),

    #[error("cluster manager returned an invalid response: {0}")]
    InvalidResponse(String),

    /// The call's cancellation context fired before the cluster manager
    /// responded.
    #[error("cluster manager call cancelled")]
    Cancelled,
}

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;
