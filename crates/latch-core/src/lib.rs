//! Core types and abstractions for the latch session-locking system.
//!
//! This crate provides the error type, node identity and configuration
//! shared by the store and the command-line tool.

pub mod config;
pub mod error;
pub mod id;

pub use config::{GeneralConfig, LatchConfig, ProviderConfig, StoreConfig};
pub use error::{LatchError, OwnershipViolation, Result};
pub use id::NodeId;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::LatchConfig;
    pub use crate::error::{LatchError, OwnershipViolation, Result};
    pub use crate::id::NodeId;
}
