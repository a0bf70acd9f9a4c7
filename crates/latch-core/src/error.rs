//! Error types for the latch system.

use uuid::Uuid;

/// Result type alias for latch operations.
pub type Result<T> = std::result::Result<T, LatchError>;

/// Main error type for the latch system.
#[derive(Debug, thiserror::Error)]
pub enum LatchError {
    /// Operation code outside the dispatcher's fixed table
    #[error("Unsupported operation type: {code}")]
    UnsupportedOperation { code: i32 },

    /// Malformed binary request or record
    #[error("Decode error: {0}")]
    Decode(String),

    /// Lock holder check failed on release or update
    #[error("Ownership violation: {0}")]
    Ownership(#[from] OwnershipViolation),

    /// Not found errors
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Wrapped anyhow errors for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Reasons a release or update was refused.
///
/// Each of these means the caller's view of who holds the lock is wrong, so
/// none of them is worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OwnershipViolation {
    #[error("can not unlock session data: record is not locked")]
    NotLocked,

    #[error("can not lock session data: record is already locked")]
    AlreadyLocked,

    #[error("can not unlock session data: lock node id check failed (expected {expected}, was {actual})")]
    LockNodeMismatch { expected: Uuid, actual: Uuid },

    #[error("can not unlock session data: lock id check failed (expected {expected}, was {actual})")]
    LockIdMismatch { expected: i64, actual: i64 },
}

impl LatchError {
    /// Create a new unsupported operation error
    pub fn unsupported_operation(code: i32) -> Self {
        Self::UnsupportedOperation { code }
    }

    /// Create a new decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a new not found error
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a protocol error (client/server disagree on the wire format)
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::UnsupportedOperation { .. } | Self::Decode(_))
    }

    /// Check if this is an ownership violation
    pub fn is_ownership_violation(&self) -> bool {
        matches!(self, Self::Ownership(_))
    }

    /// Get the ownership violation, if this is one
    pub fn ownership_violation(&self) -> Option<&OwnershipViolation> {
        match self {
            Self::Ownership(violation) => Some(violation),
            _ => None,
        }
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
