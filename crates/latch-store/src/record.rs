//! Session record model: the lockable value stored under a session key.
//!
//! Records are values. Every transition borrows the current record and returns
//! a new one, so a transition that fails part way never leaves a half-updated
//! record behind.

use crate::codec::{BinaryObject, BinaryReader, BinaryWriter};
use crate::items::SessionItems;
use chrono::{DateTime, Utc};
use latch_core::error::{LatchError, OwnershipViolation, Result};
use latch_core::id::NodeId;
use tracing::debug;

// ============================================================================
// Lock Token
// ============================================================================

/// Identity of a lock holder: the node, a lock id unique within that node, and
/// the time the lock was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken {
    pub node_id: NodeId,
    pub lock_id: i64,
    pub time: DateTime<Utc>,
}

impl LockToken {
    pub fn new(node_id: NodeId, lock_id: i64, time: DateTime<Utc>) -> Self {
        Self {
            node_id,
            lock_id,
            time,
        }
    }

    /// Token stamped with the current time
    pub fn now(node_id: NodeId, lock_id: i64) -> Self {
        Self::new(node_id, lock_id, Utc::now())
    }

    /// Check that this token belongs to `(node_id, lock_id)`
    fn check_owner(&self, node_id: NodeId, lock_id: i64) -> Result<()> {
        if self.node_id != node_id {
            return Err(OwnershipViolation::LockNodeMismatch {
                expected: *self.node_id.as_uuid(),
                actual: *node_id.as_uuid(),
            }
            .into());
        }

        if self.lock_id != lock_id {
            return Err(OwnershipViolation::LockIdMismatch {
                expected: self.lock_id,
                actual: lock_id,
            }
            .into());
        }

        Ok(())
    }
}

// ============================================================================
// Session Record
// ============================================================================

/// Session state held as the value for one session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    items: SessionItems,
    static_objects: Option<Vec<u8>>,
    timeout: i32,
    lock: Option<LockToken>,
}

impl SessionRecord {
    /// Create an empty, unlocked record
    pub fn new(timeout: i32) -> Self {
        Self::with_items(SessionItems::new(), None, timeout)
    }

    /// Create an unlocked record with the given contents
    pub fn with_items(items: SessionItems, static_objects: Option<Vec<u8>>, timeout: i32) -> Self {
        Self {
            items,
            static_objects,
            timeout,
            lock: None,
        }
    }

    pub fn items(&self) -> &SessionItems {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut SessionItems {
        &mut self.items
    }

    pub fn static_objects(&self) -> Option<&[u8]> {
        self.static_objects.as_deref()
    }

    pub fn set_static_objects(&mut self, static_objects: Option<Vec<u8>>) {
        self.static_objects = static_objects;
    }

    pub fn timeout(&self) -> i32 {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: i32) {
        self.timeout = timeout;
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    pub fn lock_token(&self) -> Option<&LockToken> {
        self.lock.as_ref()
    }

    pub fn lock_time(&self) -> Option<DateTime<Utc>> {
        self.lock.map(|t| t.time)
    }

    /// Attach a lock to a client-side copy before sending it back with an
    /// update. Stored records only gain a lock through [`SessionRecord::lock`].
    pub fn set_lock(&mut self, token: Option<LockToken>) {
        self.lock = token;
    }

    /// Copy of this record locked by `token`.
    ///
    /// Locks are not re-entrant: a locked record yields `AlreadyLocked`.
    pub fn lock(&self, token: LockToken) -> Result<SessionRecord> {
        if self.is_locked() {
            return Err(OwnershipViolation::AlreadyLocked.into());
        }

        let mut locked = self.copy_without_lock();
        locked.lock = Some(token);
        Ok(locked)
    }

    /// Copy of this record with the lock cleared, after checking that
    /// `(node_id, lock_id)` holds it.
    pub fn unlock(&self, node_id: NodeId, lock_id: i64) -> Result<SessionRecord> {
        self.check_lock(node_id, lock_id)?;
        debug!("Unlocking record held by {} (lock {})", node_id, lock_id);
        Ok(self.copy_without_lock())
    }

    /// Copy of this record with `delta` merged into the items, static objects
    /// and timeout replaced, and the lock cleared.
    pub fn update_and_unlock(
        &self,
        node_id: NodeId,
        lock_id: i64,
        delta: &SessionItems,
        static_objects: Option<Vec<u8>>,
        timeout: i32,
    ) -> Result<SessionRecord> {
        self.check_lock(node_id, lock_id)?;

        let mut updated = self.copy_without_lock();
        updated.items.apply_changes(delta);
        updated.static_objects = static_objects;
        updated.timeout = timeout;

        debug!(
            "Updated and unlocked record held by {} (lock {}), {} items",
            node_id,
            lock_id,
            updated.items.len()
        );
        Ok(updated)
    }

    fn check_lock(&self, node_id: NodeId, lock_id: i64) -> Result<()> {
        match &self.lock {
            Some(token) => token.check_owner(node_id, lock_id),
            None => Err(OwnershipViolation::NotLocked.into()),
        }
    }

    fn copy_without_lock(&self) -> SessionRecord {
        SessionRecord {
            items: self.items.clone(),
            static_objects: self.static_objects.clone(),
            timeout: self.timeout,
            lock: None,
        }
    }
}

impl BinaryObject for SessionRecord {
    const TYPE_ID: i32 = 1;

    fn write_binary(&self, writer: &mut BinaryWriter<'_>) {
        writer.write_i32(self.timeout);
        writer.write_uuid(self.lock.map(|t| *t.node_id.as_uuid()));
        writer.write_i64(self.lock.map_or(0, |t| t.lock_id));
        writer.write_timestamp(self.lock_time());
        writer.write_object(Some(&self.items));
        writer.write_byte_array(self.static_objects.as_deref());
    }

    fn read_binary(reader: &mut BinaryReader<'_>) -> Result<Self> {
        let timeout = reader.read_i32()?;
        let node_id = reader.read_uuid()?;
        let lock_id = reader.read_i64()?;
        let lock_time = reader.read_timestamp()?;

        let lock = match (node_id, lock_time) {
            (Some(node_id), Some(time)) => Some(LockToken::new(node_id.into(), lock_id, time)),
            (None, None) => None,
            (Some(_), None) => return Err(LatchError::decode("lock node id without lock time")),
            (None, Some(_)) => return Err(LatchError::decode("lock time without lock node id")),
        };

        let items = reader.read_object::<SessionItems>()?.unwrap_or_default();
        let static_objects = reader.read_byte_array()?;

        Ok(Self {
            items,
            static_objects,
            timeout,
            lock,
        })
    }
}

// ============================================================================
// Lock Result
// ============================================================================

/// Outcome of a lock attempt.
///
/// Contention is not an error: the caller gets `acquired == false` and the
/// time the current holder took the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockResult {
    pub acquired: bool,
    /// The newly locked record when acquired
    pub record: Option<SessionRecord>,
    /// When the current holder took the lock, on contention
    pub lock_time: Option<DateTime<Utc>>,
}

impl LockResult {
    pub fn acquired(record: SessionRecord) -> Self {
        Self {
            acquired: true,
            record: Some(record),
            lock_time: None,
        }
    }

    pub fn contended(lock_time: DateTime<Utc>) -> Self {
        Self {
            acquired: false,
            record: None,
            lock_time: Some(lock_time),
        }
    }

    /// No record under the key
    pub fn missing() -> Self {
        Self {
            acquired: false,
            record: None,
            lock_time: None,
        }
    }

    pub fn is_contended(&self) -> bool {
        !self.acquired && self.lock_time.is_some()
    }

    pub fn is_missing(&self) -> bool {
        !self.acquired && self.lock_time.is_none()
    }
}

impl BinaryObject for LockResult {
    const TYPE_ID: i32 = 3;

    fn write_binary(&self, writer: &mut BinaryWriter<'_>) {
        writer.write_bool(self.acquired);
        writer.write_object(self.record.as_ref());
        writer.write_timestamp(self.lock_time);
    }

    fn read_binary(reader: &mut BinaryReader<'_>) -> Result<Self> {
        let acquired = reader.read_bool()?;
        let record = reader.read_object::<SessionRecord>()?;
        let lock_time = reader.read_timestamp()?;

        if acquired && record.is_none() {
            return Err(LatchError::decode("acquired lock result without a record"));
        }

        Ok(Self {
            acquired,
            record,
            lock_time,
        })
    }
}
