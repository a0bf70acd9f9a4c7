//! Entry processors: the atomic lock and release steps run by the store.
//!
//! A processor sees the current value for one key through a [`MutableEntry`]
//! and may stage a replacement. The store runs it while holding the key
//! exclusively and writes the staged value only if `process` returns `Ok`.

use crate::record::{LockResult, LockToken, SessionRecord};
use latch_core::error::{LatchError, Result};
use latch_core::id::NodeId;
use tracing::{debug, warn};

/// View of one store entry during a processor run.
#[derive(Debug)]
pub struct MutableEntry<'a> {
    key: &'a str,
    current: Option<&'a SessionRecord>,
    staged: Option<SessionRecord>,
}

impl<'a> MutableEntry<'a> {
    pub fn new(key: &'a str, current: Option<&'a SessionRecord>) -> Self {
        Self {
            key,
            current,
            staged: None,
        }
    }

    pub fn key(&self) -> &'a str {
        self.key
    }

    /// Whether the key had a value when the run started
    pub fn exists(&self) -> bool {
        self.current.is_some()
    }

    /// The value as it was when the run started
    pub fn value(&self) -> Option<&'a SessionRecord> {
        self.current
    }

    /// Stage a replacement value
    pub fn set_value(&mut self, value: SessionRecord) {
        self.staged = Some(value);
    }

    /// The staged replacement, if any
    pub fn into_staged(self) -> Option<SessionRecord> {
        self.staged
    }
}

/// One atomic step against a single key.
pub trait EntryProcessor {
    type Output;

    fn process(&self, entry: &mut MutableEntry<'_>) -> Result<Self::Output>;
}

// ============================================================================
// Lock
// ============================================================================

/// Lock an unlocked record for the token's holder.
///
/// Never waits: a missing record or an existing lock is reported in the
/// [`LockResult`] and the entry is left alone.
#[derive(Debug, Clone, Copy)]
pub struct LockProcessor {
    pub token: LockToken,
}

impl LockProcessor {
    pub fn new(token: LockToken) -> Self {
        Self { token }
    }
}

impl EntryProcessor for LockProcessor {
    type Output = LockResult;

    fn process(&self, entry: &mut MutableEntry<'_>) -> Result<LockResult> {
        let Some(current) = entry.value() else {
            debug!("Lock on '{}' skipped: no record", entry.key());
            return Ok(LockResult::missing());
        };

        if let Some(lock_time) = current.lock_time() {
            debug!("Lock on '{}' contended, held since {}", entry.key(), lock_time);
            return Ok(LockResult::contended(lock_time));
        }

        let locked = current.lock(self.token)?;
        entry.set_value(locked.clone());

        debug!(
            "Lock on '{}' granted to {} (lock {})",
            entry.key(),
            self.token.node_id,
            self.token.lock_id
        );
        Ok(LockResult::acquired(locked))
    }
}

// ============================================================================
// Set And Unlock
// ============================================================================

/// How a holder gives up its lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// Clear the lock, keep the contents
    Unlock { node_id: NodeId, lock_id: i64 },
    /// Merge the record's items delta, replace static objects and timeout,
    /// clear the lock. The record carries the holder's lock token.
    Update(SessionRecord),
}

/// Check the caller holds the lock, then release it, optionally applying an
/// update in the same step.
#[derive(Debug, Clone)]
pub struct SetAndUnlockProcessor {
    pub release: Release,
}

impl SetAndUnlockProcessor {
    pub fn new(release: Release) -> Self {
        Self { release }
    }

    pub fn unlock(node_id: NodeId, lock_id: i64) -> Self {
        Self::new(Release::Unlock { node_id, lock_id })
    }

    pub fn update(record: SessionRecord) -> Self {
        Self::new(Release::Update(record))
    }
}

impl EntryProcessor for SetAndUnlockProcessor {
    type Output = ();

    fn process(&self, entry: &mut MutableEntry<'_>) -> Result<()> {
        let current = entry
            .value()
            .ok_or_else(|| LatchError::not_found("session", entry.key()))?;

        let next = match &self.release {
            Release::Unlock { node_id, lock_id } => current.unlock(*node_id, *lock_id),
            Release::Update(update) => {
                let token = update
                    .lock_token()
                    .ok_or_else(|| LatchError::decode("update record carries no lock holder"))?;

                current.update_and_unlock(
                    token.node_id,
                    token.lock_id,
                    update.items(),
                    update.static_objects().map(<[u8]>::to_vec),
                    update.timeout(),
                )
            }
        };

        let next = next.inspect_err(|e| {
            if let Some(violation) = e.ownership_violation() {
                warn!("Release of '{}' refused: {}", entry.key(), violation);
            }
        })?;

        entry.set_value(next);
        Ok(())
    }
}
