//! Session record locking for latch.
//!
//! This crate provides the lockable session record, the entry processors that
//! lock and release it atomically inside a store, the binary dispatcher that
//! runs them from encoded requests, and the session-state provider built on
//! top of both.

pub mod codec;
pub mod dispatch;
pub mod items;
pub mod processor;
pub mod provider;
pub mod record;
pub mod store;

pub use codec::{BinaryObject, BinaryReader, BinaryWriter};
pub use dispatch::{Dispatcher, OpCode, SessionRequest, SessionResponse, RESULT_NULL, RESULT_OBJECT};
pub use items::SessionItems;
pub use processor::{EntryProcessor, LockProcessor, MutableEntry, Release, SetAndUnlockProcessor};
pub use provider::{ExclusiveLookup, ItemLookup, SessionStateProvider};
pub use record::{LockResult, LockToken, SessionRecord};
pub use store::{MemoryStore, SessionStore, StoreStatistics};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::dispatch::Dispatcher;
    pub use crate::provider::SessionStateProvider;
    pub use crate::record::{LockResult, LockToken, SessionRecord};
    pub use crate::store::{MemoryStore, SessionStore};
    pub use latch_core::prelude::*;
}
