//! Binary encoding shared by the dispatcher and its clients.
//!
//! Layout (little-endian):
//! - `i32`, `i64`, `bool` are written raw, without a header
//! - nullable values start with a one-byte type header, [`TYPE_NULL`] when absent:
//!   - string      `TYPE_STRING`     i32 length + UTF-8 bytes
//!   - uuid        `TYPE_UUID`       16 bytes
//!   - byte array  `TYPE_BYTE_ARRAY` i32 length + bytes
//!   - timestamp   `TYPE_TIMESTAMP`  i64 epoch millis + i32 nanos within the milli
//!   - object      `TYPE_OBJECT`     i32 type id + body

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use latch_core::error::{LatchError, Result};
use uuid::Uuid;

pub const TYPE_STRING: u8 = 9;
pub const TYPE_UUID: u8 = 10;
pub const TYPE_BYTE_ARRAY: u8 = 12;
pub const TYPE_TIMESTAMP: u8 = 33;
pub const TYPE_NULL: u8 = 101;
pub const TYPE_OBJECT: u8 = 103;

const NANOS_PER_MILLI: i32 = 1_000_000;

/// A value with a nested binary form.
pub trait BinaryObject: Sized {
    /// Type id written in front of the body, checked on read
    const TYPE_ID: i32;

    fn write_binary(&self, writer: &mut BinaryWriter<'_>);

    fn read_binary(reader: &mut BinaryReader<'_>) -> Result<Self>;
}

/// Appends encoded values to a caller-owned buffer.
pub struct BinaryWriter<'a> {
    buf: &'a mut BytesMut,
}

impl<'a> BinaryWriter<'a> {
    pub fn new(buf: &'a mut BytesMut) -> Self {
        Self { buf }
    }

    /// Bytes written to the underlying buffer so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64_le(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    pub fn write_string(&mut self, value: Option<&str>) {
        match value {
            Some(s) => {
                self.buf.put_u8(TYPE_STRING);
                self.put_len(s.len());
                self.buf.put_slice(s.as_bytes());
            }
            None => self.buf.put_u8(TYPE_NULL),
        }
    }

    pub fn write_uuid(&mut self, value: Option<Uuid>) {
        match value {
            Some(uuid) => {
                self.buf.put_u8(TYPE_UUID);
                self.buf.put_slice(uuid.as_bytes());
            }
            None => self.buf.put_u8(TYPE_NULL),
        }
    }

    pub fn write_timestamp(&mut self, value: Option<DateTime<Utc>>) {
        match value {
            Some(ts) => {
                self.buf.put_u8(TYPE_TIMESTAMP);
                self.buf.put_i64_le(ts.timestamp_millis());
                self.buf
                    .put_i32_le((ts.timestamp_subsec_nanos() % NANOS_PER_MILLI as u32) as i32);
            }
            None => self.buf.put_u8(TYPE_NULL),
        }
    }

    pub fn write_byte_array(&mut self, value: Option<&[u8]>) {
        match value {
            Some(bytes) => {
                self.buf.put_u8(TYPE_BYTE_ARRAY);
                self.put_len(bytes.len());
                self.buf.put_slice(bytes);
            }
            None => self.buf.put_u8(TYPE_NULL),
        }
    }

    pub fn write_object<T: BinaryObject>(&mut self, value: Option<&T>) {
        match value {
            Some(obj) => {
                self.buf.put_u8(TYPE_OBJECT);
                self.buf.put_i32_le(T::TYPE_ID);
                obj.write_binary(self);
            }
            None => self.buf.put_u8(TYPE_NULL),
        }
    }

    fn put_len(&mut self, len: usize) {
        debug_assert!(len <= i32::MAX as usize);
        self.buf.put_i32_le(len as i32);
    }
}

/// Reads encoded values from a byte slice.
///
/// Every read checks the remaining length first, so truncated input yields a
/// decode error instead of a panic.
pub struct BinaryReader<'a> {
    buf: &'a [u8],
}

impl<'a> BinaryReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Unread bytes left
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.ensure(4, "i32")?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure(8, "i64")?;
        Ok(self.buf.get_i64_le())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        self.ensure(1, "bool")?;
        match self.buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(LatchError::decode(format!("invalid bool byte {}", other))),
        }
    }

    pub fn read_string(&mut self) -> Result<Option<String>> {
        if !self.read_header(TYPE_STRING, "string")? {
            return Ok(None);
        }
        let bytes = self.read_len_prefixed("string")?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| LatchError::decode(format!("invalid UTF-8 in string: {}", e)))
    }

    pub fn read_uuid(&mut self) -> Result<Option<Uuid>> {
        if !self.read_header(TYPE_UUID, "uuid")? {
            return Ok(None);
        }
        self.ensure(16, "uuid")?;
        let mut raw = [0u8; 16];
        self.buf.copy_to_slice(&mut raw);
        Ok(Some(Uuid::from_bytes(raw)))
    }

    pub fn read_timestamp(&mut self) -> Result<Option<DateTime<Utc>>> {
        if !self.read_header(TYPE_TIMESTAMP, "timestamp")? {
            return Ok(None);
        }
        self.ensure(12, "timestamp")?;
        let millis = self.buf.get_i64_le();
        let nanos = self.buf.get_i32_le();

        if !(0..NANOS_PER_MILLI).contains(&nanos) {
            return Err(LatchError::decode(format!(
                "timestamp nanos out of range: {}",
                nanos
            )));
        }

        let secs = millis.div_euclid(1000);
        let subsec = millis.rem_euclid(1000) as u32 * NANOS_PER_MILLI as u32 + nanos as u32;

        DateTime::from_timestamp(secs, subsec)
            .map(Some)
            .ok_or_else(|| LatchError::decode(format!("timestamp out of range: {}ms", millis)))
    }

    pub fn read_byte_array(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.read_header(TYPE_BYTE_ARRAY, "byte array")? {
            return Ok(None);
        }
        self.read_len_prefixed("byte array").map(Some)
    }

    pub fn read_object<T: BinaryObject>(&mut self) -> Result<Option<T>> {
        if !self.read_header(TYPE_OBJECT, "object")? {
            return Ok(None);
        }
        let type_id = self.read_i32()?;
        if type_id != T::TYPE_ID {
            return Err(LatchError::decode(format!(
                "unexpected object type id {} (expected {})",
                type_id,
                T::TYPE_ID
            )));
        }
        T::read_binary(self).map(Some)
    }

    /// Reads a type header; `false` means the value is null
    fn read_header(&mut self, expected: u8, what: &str) -> Result<bool> {
        self.ensure(1, what)?;
        match self.buf.get_u8() {
            TYPE_NULL => Ok(false),
            header if header == expected => Ok(true),
            header => Err(LatchError::decode(format!(
                "unexpected type header {} for {} (expected {})",
                header, what, expected
            ))),
        }
    }

    fn read_len_prefixed(&mut self, what: &str) -> Result<Vec<u8>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(LatchError::decode(format!("negative {} length {}", what, len)));
        }
        let len = len as usize;
        self.ensure(len, what)?;
        let bytes = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(bytes)
    }

    fn ensure(&self, needed: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(LatchError::decode(format!(
                "unexpected end of input reading {}: need {} bytes, have {}",
                what,
                needed,
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn encode(f: impl FnOnce(&mut BinaryWriter<'_>)) -> BytesMut {
        let mut buf = BytesMut::new();
        f(&mut BinaryWriter::new(&mut buf));
        buf
    }

    #[test]
    fn test_primitives_are_headerless() {
        let buf = encode(|w| {
            w.write_i32(-7);
            w.write_i64(i64::MAX);
            w.write_bool(true);
        });
        assert_eq!(buf.len(), 4 + 8 + 1);

        let mut r = BinaryReader::new(&buf);
        assert_eq!(r.read_i32().unwrap(), -7);
        assert_eq!(r.read_i64().unwrap(), i64::MAX);
        assert!(r.read_bool().unwrap());
        assert!(r.is_empty());
    }

    #[test]
    fn test_nullable_values() {
        let id = Uuid::new_v4();
        let buf = encode(|w| {
            w.write_string(Some("sess-1"));
            w.write_string(None);
            w.write_uuid(Some(id));
            w.write_uuid(None);
            w.write_byte_array(Some(&[1u8, 2, 3][..]));
            w.write_byte_array(None);
        });

        let mut r = BinaryReader::new(&buf);
        assert_eq!(r.read_string().unwrap().as_deref(), Some("sess-1"));
        assert_eq!(r.read_string().unwrap(), None);
        assert_eq!(r.read_uuid().unwrap(), Some(id));
        assert_eq!(r.read_uuid().unwrap(), None);
        assert_eq!(r.read_byte_array().unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(r.read_byte_array().unwrap(), None);
        assert!(r.is_empty());
    }

    #[test]
    fn test_timestamp_keeps_sub_millisecond_precision() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let before_epoch = Utc.timestamp_opt(-1, 999_999_999).unwrap();
        let buf = encode(|w| {
            w.write_timestamp(Some(ts));
            w.write_timestamp(Some(before_epoch));
            w.write_timestamp(None);
        });

        let mut r = BinaryReader::new(&buf);
        assert_eq!(r.read_timestamp().unwrap(), Some(ts));
        assert_eq!(r.read_timestamp().unwrap(), Some(before_epoch));
        assert_eq!(r.read_timestamp().unwrap(), None);
    }

    #[test]
    fn test_truncated_input_is_decode_error() {
        let buf = encode(|w| w.write_string(Some("a long session key")));
        let mut r = BinaryReader::new(&buf[..buf.len() - 3]);
        let err = r.read_string().unwrap_err();
        assert!(matches!(err, LatchError::Decode(_)));

        let mut r = BinaryReader::new(&[0x01, 0x02]);
        assert!(r.read_i64().is_err());
    }

    #[test]
    fn test_wrong_header_is_decode_error() {
        let buf = encode(|w| w.write_uuid(Some(Uuid::nil())));
        let mut r = BinaryReader::new(&buf);
        let err = r.read_string().unwrap_err();
        assert!(err.to_string().contains("unexpected type header"));
    }

    #[test]
    fn test_invalid_bool_and_utf8() {
        let mut r = BinaryReader::new(&[2]);
        assert!(r.read_bool().is_err());

        let buf = encode(|w| {
            w.write_byte_array(Some(&[0xffu8, 0xfe][..]));
        });
        let mut bytes = buf.to_vec();
        bytes[0] = TYPE_STRING;
        let mut r = BinaryReader::new(&bytes);
        assert!(r.read_string().is_err());
    }
}
