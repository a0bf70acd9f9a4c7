//! Session-state provider: the calls a web tier makes per request.
//!
//! A request reads its session either shared ([`SessionStateProvider::get_item`])
//! or exclusively ([`SessionStateProvider::get_item_exclusive`]), and an
//! exclusive read ends with a release, with or without new data. Exclusive
//! calls go through the dispatcher's binary interface, the same path a remote
//! client would use.

use crate::dispatch::{Dispatcher, SessionRequest, SessionResponse};
use crate::processor::Release;
use crate::record::{LockToken, SessionRecord};
use crate::store::SessionStore;
use bytes::BytesMut;
use chrono::{DateTime, TimeDelta, Utc};
use latch_core::config::ProviderConfig;
use latch_core::error::Result;
use latch_core::id::NodeId;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, trace};

/// Result of a shared read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemLookup {
    /// The record, when present and not locked
    pub record: Option<SessionRecord>,
    /// Another request holds the lock
    pub locked: bool,
    /// How long the current holder has had the lock
    pub lock_age: TimeDelta,
}

/// Result of an exclusive read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusiveLookup {
    /// The locked record, when this call acquired the lock
    pub record: Option<SessionRecord>,
    /// Another request holds the lock
    pub locked: bool,
    /// How long the other holder has had the lock
    pub lock_age: TimeDelta,
    /// Lock id allocated for this call; pass it back on release
    pub lock_id: i64,
}

impl ExclusiveLookup {
    pub fn acquired(&self) -> bool {
        self.record.is_some()
    }
}

/// Per-node session-state facade over a [`SessionStore`].
pub struct SessionStateProvider<S> {
    dispatcher: Dispatcher<S>,
    application_id: Option<String>,
    node_id: NodeId,
    lock_counter: AtomicI64,
}

impl<S: SessionStore> SessionStateProvider<S> {
    pub fn new(store: Arc<S>, node_id: NodeId) -> Self {
        Self {
            dispatcher: Dispatcher::new(store),
            application_id: None,
            node_id,
            lock_counter: AtomicI64::new(0),
        }
    }

    pub fn from_config(store: Arc<S>, config: &ProviderConfig) -> Self {
        let node_id = config.node_id.map(NodeId::from).unwrap_or_default();
        debug!(
            "Session provider on node {} (application: {:?})",
            node_id, config.application_id
        );

        Self {
            dispatcher: Dispatcher::new(store),
            application_id: config.application_id.clone(),
            node_id,
            lock_counter: AtomicI64::new(0),
        }
    }

    /// Prefix keys with `application_id` so applications can share a cache
    pub fn with_application_id(mut self, application_id: impl Into<String>) -> Self {
        self.application_id = Some(application_id.into());
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn application_id(&self) -> Option<&str> {
        self.application_id.as_deref()
    }

    pub fn dispatcher(&self) -> &Dispatcher<S> {
        &self.dispatcher
    }

    /// Store key for a session id
    pub fn key(&self, session_id: &str) -> String {
        match &self.application_id {
            Some(app) => format!("{}.{}", app, session_id),
            None => session_id.to_string(),
        }
    }

    /// Fresh unlocked record; not stored
    pub fn create_new_store_data(&self, timeout: i32) -> SessionRecord {
        trace!("create_new_store_data: timeout={}", timeout);
        SessionRecord::new(timeout)
    }

    /// Store a fresh unlocked record for `session_id`
    pub fn create_uninitialized_item(&self, session_id: &str, timeout: i32) {
        trace!("create_uninitialized_item: id={}, timeout={}", session_id, timeout);
        let record = self.create_new_store_data(timeout);
        self.put(session_id, record);
    }

    /// Read without locking.
    pub fn get_item(&self, session_id: &str) -> ItemLookup {
        trace!("get_item: id={}", session_id);

        let mut lookup = ItemLookup {
            record: None,
            locked: false,
            lock_age: TimeDelta::zero(),
        };

        let Some(record) = self.dispatcher.store().get(&self.key(session_id)) else {
            trace!("get_item: id={} not found", session_id);
            return lookup;
        };

        match record.lock_time() {
            Some(lock_time) => {
                trace!("get_item: id={} locked", session_id);
                lookup.locked = true;
                lookup.lock_age = lock_age(lock_time);
            }
            None => lookup.record = Some(record),
        }
        lookup
    }

    /// Lock the record and read it.
    ///
    /// Contention is reported through `locked` and `lock_age`; the caller
    /// decides whether to retry.
    pub fn get_item_exclusive(&self, session_id: &str) -> Result<ExclusiveLookup> {
        trace!("get_item_exclusive: id={}", session_id);

        let lock_id = self.lock_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let request = SessionRequest::Lock {
            key: self.key(session_id),
            token: LockToken::now(self.node_id, lock_id),
        };

        let mut lookup = ExclusiveLookup {
            record: None,
            locked: false,
            lock_age: TimeDelta::zero(),
            lock_id,
        };

        let (handle, out) = self.send(&request)?;
        let result = SessionResponse::read_lock_result(handle, &out)?;

        if result.acquired {
            trace!("get_item_exclusive: id={} locked with {}", session_id, lock_id);
            lookup.record = result.record;
        } else if let Some(lock_time) = result.lock_time {
            trace!("get_item_exclusive: id={} already locked", session_id);
            lookup.locked = true;
            lookup.lock_age = lock_age(lock_time);
        } else {
            trace!("get_item_exclusive: id={} not found", session_id);
        }

        Ok(lookup)
    }

    /// Release a lock without changing the record
    pub fn release_item_exclusive(&self, session_id: &str, lock_id: i64) -> Result<()> {
        trace!("release_item_exclusive: id={}, lock={}", session_id, lock_id);

        let request = SessionRequest::SetAndUnlock {
            key: self.key(session_id),
            release: Release::Unlock {
                node_id: self.node_id,
                lock_id,
            },
        };
        self.send(&request).map(|_| ())
    }

    /// Write back a record and release its lock in one step.
    ///
    /// A new item has no lock to release and is stored as is. Otherwise the
    /// record's item changes are merged into the stored record.
    pub fn set_and_release_item_exclusive(
        &self,
        session_id: &str,
        mut record: SessionRecord,
        lock_id: i64,
        new_item: bool,
    ) -> Result<()> {
        trace!(
            "set_and_release_item_exclusive: id={}, lock={}, new={}",
            session_id, lock_id, new_item
        );

        if new_item {
            self.put(session_id, record);
            return Ok(());
        }

        let time = record.lock_time().unwrap_or_else(Utc::now);
        record.set_lock(Some(LockToken::new(self.node_id, lock_id, time)));

        let request = SessionRequest::SetAndUnlock {
            key: self.key(session_id),
            release: Release::Update(record),
        };
        self.send(&request).map(|_| ())
    }

    pub fn remove_item(&self, session_id: &str) {
        trace!("remove_item: id={}", session_id);
        self.dispatcher.store().remove(&self.key(session_id));
    }

    /// Stored records are always unlocked
    fn put(&self, session_id: &str, mut record: SessionRecord) {
        record.set_lock(None);
        self.dispatcher.store().put(&self.key(session_id), record);
    }

    fn send(&self, request: &SessionRequest) -> Result<(i64, BytesMut)> {
        let mut buf = BytesMut::new();
        request.encode(&mut buf);

        let mut out = BytesMut::new();
        let handle = self.dispatcher.process(&buf, &mut out)?;
        Ok((handle, out))
    }
}

fn lock_age(lock_time: DateTime<Utc>) -> TimeDelta {
    (Utc::now() - lock_time).max(TimeDelta::zero())
}
