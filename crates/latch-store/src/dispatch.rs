//! Binary request dispatch.
//!
//! A request is an `i32` op code followed by its arguments:
//!
//! | Op | Code | Arguments |
//! |---|---|---|
//! | `SESSION_LOCK` | 1 | key: string, node id: uuid, lock id: i64, lock time: timestamp |
//! | `SESSION_SET_AND_UNLOCK` | 2 | key: string, has data: bool, then a record object, or node id: uuid + lock id: i64 |
//!
//! The dispatcher decodes the request, runs the matching processor through
//! [`SessionStore::invoke`], and writes the result into the caller's buffer.
//! It returns [`RESULT_OBJECT`] when an object was written and [`RESULT_NULL`]
//! otherwise.

use crate::codec::{BinaryReader, BinaryWriter};
use crate::processor::{LockProcessor, Release, SetAndUnlockProcessor};
use crate::record::{LockResult, LockToken, SessionRecord};
use crate::store::SessionStore;
use bytes::BytesMut;
use latch_core::error::{LatchError, Result};
use latch_core::id::NodeId;
use std::sync::Arc;
use tracing::{trace, warn};

/// Nothing was written to the output buffer
pub const RESULT_NULL: i64 = 0;
/// One object was written to the output buffer
pub const RESULT_OBJECT: i64 = 1;

/// Operations the dispatcher understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OpCode {
    SessionLock = 1,
    SessionSetAndUnlock = 2,
}

impl TryFrom<i32> for OpCode {
    type Error = LatchError;

    fn try_from(code: i32) -> Result<Self> {
        match code {
            1 => Ok(Self::SessionLock),
            2 => Ok(Self::SessionSetAndUnlock),
            other => Err(LatchError::unsupported_operation(other)),
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    Lock { key: String, token: LockToken },
    SetAndUnlock { key: String, release: Release },
}

impl SessionRequest {
    pub fn op_code(&self) -> OpCode {
        match self {
            Self::Lock { .. } => OpCode::SessionLock,
            Self::SetAndUnlock { .. } => OpCode::SessionSetAndUnlock,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Lock { key, .. } | Self::SetAndUnlock { key, .. } => key,
        }
    }

    /// Append the wire form, op code first
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut writer = BinaryWriter::new(buf);
        writer.write_i32(self.op_code() as i32);
        writer.write_string(Some(self.key()));

        match self {
            Self::Lock { token, .. } => {
                writer.write_uuid(Some(*token.node_id.as_uuid()));
                writer.write_i64(token.lock_id);
                writer.write_timestamp(Some(token.time));
            }
            Self::SetAndUnlock { release, .. } => match release {
                Release::Update(record) => {
                    writer.write_bool(true);
                    writer.write_object(Some(record));
                }
                Release::Unlock { node_id, lock_id } => {
                    writer.write_bool(false);
                    writer.write_uuid(Some(*node_id.as_uuid()));
                    writer.write_i64(*lock_id);
                }
            },
        }
    }

    /// Decode a whole request, op code first
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = BinaryReader::new(bytes);
        let op = OpCode::try_from(reader.read_i32()?)?;
        Self::decode_args(op, &mut reader)
    }

    /// Decode the arguments of `op`; trailing bytes are left unread
    pub fn decode_args(op: OpCode, reader: &mut BinaryReader<'_>) -> Result<Self> {
        let key = reader
            .read_string()?
            .ok_or_else(|| LatchError::decode("null session key"))?;

        match op {
            OpCode::SessionLock => {
                let node_id = read_node_id(reader)?;
                let lock_id = reader.read_i64()?;
                let time = reader
                    .read_timestamp()?
                    .ok_or_else(|| LatchError::decode("null lock time"))?;

                Ok(Self::Lock {
                    key,
                    token: LockToken::new(node_id, lock_id, time),
                })
            }
            OpCode::SessionSetAndUnlock => {
                let release = if reader.read_bool()? {
                    let record = reader
                        .read_object::<SessionRecord>()?
                        .ok_or_else(|| LatchError::decode("null session record"))?;
                    if !record.is_locked() {
                        return Err(LatchError::decode("update record carries no lock holder"));
                    }
                    Release::Update(record)
                } else {
                    Release::Unlock {
                        node_id: read_node_id(reader)?,
                        lock_id: reader.read_i64()?,
                    }
                };

                Ok(Self::SetAndUnlock { key, release })
            }
        }
    }
}

fn read_node_id(reader: &mut BinaryReader<'_>) -> Result<NodeId> {
    reader
        .read_uuid()?
        .map(NodeId::from)
        .ok_or_else(|| LatchError::decode("null lock node id"))
}

// ============================================================================
// Responses
// ============================================================================

/// Result of an executed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionResponse {
    Lock(LockResult),
    Released,
}

impl SessionResponse {
    /// Append the result to `out` and return its handle
    pub fn write(&self, out: &mut BytesMut) -> i64 {
        match self {
            Self::Lock(result) => {
                BinaryWriter::new(out).write_object(Some(result));
                RESULT_OBJECT
            }
            Self::Released => RESULT_NULL,
        }
    }

    /// Read the lock result a `SESSION_LOCK` request produced
    pub fn read_lock_result(handle: i64, out: &[u8]) -> Result<LockResult> {
        if handle != RESULT_OBJECT {
            return Err(LatchError::decode(format!(
                "expected an object result, got handle {}",
                handle
            )));
        }

        BinaryReader::new(out)
            .read_object::<LockResult>()?
            .ok_or_else(|| LatchError::decode("null lock result"))
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Routes binary requests to the store.
///
/// Calls are synchronous; per-key ordering comes from the store's invoke.
pub struct Dispatcher<S> {
    store: Arc<S>,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: SessionStore> Dispatcher<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Decode and run one request, writing any result object into `out`.
    pub fn process(&self, request: &[u8], out: &mut BytesMut) -> Result<i64> {
        let mut reader = BinaryReader::new(request);
        let code = reader.read_i32()?;
        self.process_op(code, &mut reader, out)
    }

    /// Run the request for `code` whose arguments follow in `reader`.
    pub fn process_op(
        &self,
        code: i32,
        reader: &mut BinaryReader<'_>,
        out: &mut BytesMut,
    ) -> Result<i64> {
        let op = OpCode::try_from(code).inspect_err(|_| {
            warn!("Rejected request with unsupported operation code {}", code);
        })?;

        let request = SessionRequest::decode_args(op, reader)?;
        if !reader.is_empty() {
            trace!("Ignoring {} trailing request bytes", reader.remaining());
        }

        let response = self.execute(request)?;
        Ok(response.write(out))
    }

    /// Run a decoded request against the store.
    pub fn execute(&self, request: SessionRequest) -> Result<SessionResponse> {
        trace!("Executing {:?} on '{}'", request.op_code(), request.key());

        match request {
            SessionRequest::Lock { key, token } => self
                .store
                .invoke(&key, &LockProcessor::new(token))
                .map(SessionResponse::Lock),
            SessionRequest::SetAndUnlock { key, release } => self
                .store
                .invoke(&key, &SetAndUnlockProcessor::new(release))
                .map(|()| SessionResponse::Released),
        }
    }
}
