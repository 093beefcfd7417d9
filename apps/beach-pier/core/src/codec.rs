//! Binary record codec.
//!
//! A frame is a run of records. Each record is a big-endian `u16` model key
//! followed by the value its key declares: nothing, a 2/4/8 byte integer, or a
//! `u32` length-prefixed UTF-8 string.

use std::marker::PhantomData;

use bytes::BufMut;

use crate::model::{Frame, ModelKey, Record, ServerToClientModel, Value, ValueType};
use crate::pool::Buffer;

/// The complete server heartbeat: the heartbeat key and no value.
pub const HEARTBEAT_FRAME: [u8; 2] = (ServerToClientModel::Heartbeat as u16).to_be_bytes();

const KEY_WIDTH: usize = 2;
const STRING_PREFIX_WIDTH: usize = 4;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of input at offset {offset}")]
    UnexpectedEof { offset: usize },
    #[error("unknown model key: {0}")]
    UnknownModel(u16),
    #[error("value for key {key} is {found:?}, expected {expected:?}")]
    TypeMismatch {
        key: u16,
        expected: ValueType,
        found: ValueType,
    },
    #[error("string value is not valid utf-8")]
    InvalidString,
    #[error("string value too long: {0} bytes")]
    StringTooLong(usize),
    #[error("frame needs {needed} bytes but the buffer has {remaining} left")]
    BufferFull { needed: usize, remaining: usize },
}

impl WireError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            WireError::UnexpectedEof { .. } => "unexpected_eof",
            WireError::UnknownModel(_) => "unknown_model",
            WireError::TypeMismatch { .. } => "type_mismatch",
            WireError::InvalidString => "invalid_string",
            WireError::StringTooLong(_) => "string_too_long",
            WireError::BufferFull { .. } => "buffer_full",
        }
    }
}

fn record_len<K: ModelKey>(record: &Record<K>) -> Result<usize, WireError> {
    let expected = record.key.value_type();
    let found = record.value.value_type();
    if expected != found {
        return Err(WireError::TypeMismatch {
            key: record.key.code(),
            expected,
            found,
        });
    }
    let value_len = match &record.value {
        Value::String(text) => {
            if text.len() > u32::MAX as usize {
                return Err(WireError::StringTooLong(text.len()));
            }
            STRING_PREFIX_WIDTH + text.len()
        }
        _ => expected.fixed_width().unwrap_or(0),
    };
    Ok(KEY_WIDTH + value_len)
}

/// Encoded size of a run of records, validating every value against its key.
pub fn encoded_len<K: ModelKey>(records: &[Record<K>]) -> Result<usize, WireError> {
    records.iter().map(record_len).sum()
}

fn write_record<K: ModelKey, B: BufMut>(out: &mut B, record: &Record<K>) {
    out.put_u16(record.key.code());
    match &record.value {
        Value::None => {}
        Value::Short(v) => out.put_i16(*v),
        Value::Integer(v) => out.put_i32(*v),
        Value::Long(v) => out.put_i64(*v),
        Value::String(text) => {
            out.put_u32(text.len() as u32);
            out.put_slice(text.as_bytes());
        }
    }
}

fn encode_records<K: ModelKey>(buffer: &mut Buffer, records: &[Record<K>]) -> Result<usize, WireError> {
    let needed = encoded_len(records)?;
    let remaining = buffer.remaining();
    if needed > remaining {
        return Err(WireError::BufferFull { needed, remaining });
    }
    let out = buffer.writer();
    for record in records {
        write_record(out, record);
    }
    Ok(needed)
}

/// Appends one record at the buffer's write position.
pub fn encode_record<K: ModelKey>(
    buffer: &mut Buffer,
    key: K,
    value: Value,
) -> Result<usize, WireError> {
    encode_records(buffer, &[Record { key, value }])
}

/// Appends a whole frame or nothing: a frame that does not fit the remaining
/// capacity leaves the buffer untouched.
pub fn encode_frame(buffer: &mut Buffer, frame: &Frame) -> Result<usize, WireError> {
    encode_records(buffer, frame.records())
}

/// Encodes records into a fresh vector. Used for frames that do not go through
/// the buffer pool, such as terminal-side ticks.
pub fn encode_to_vec<K: ModelKey>(records: &[Record<K>]) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(encoded_len(records)?);
    for record in records {
        write_record(&mut out, record);
    }
    Ok(out)
}

/// Restartable, rewindable cursor over an inbound frame.
#[derive(Debug, Clone, Copy)]
pub struct Reader<'a, K> {
    bytes: &'a [u8],
    pos: usize,
    previous: Option<usize>,
    _key: PhantomData<K>,
}

impl<'a, K: ModelKey> Reader<'a, K> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            previous: None,
            _key: PhantomData,
        }
    }

    /// Yields the next record, `Ok(None)` once the input is cleanly exhausted.
    /// On error the cursor stays at the start of the offending record.
    pub fn next_field(&mut self) -> Result<Option<Record<K>>, WireError> {
        if self.pos >= self.bytes.len() {
            return Ok(None);
        }
        let start = self.pos;
        match self.read_record() {
            Ok(record) => {
                self.previous = Some(start);
                Ok(Some(record))
            }
            Err(err) => {
                self.pos = start;
                Err(err)
            }
        }
    }

    /// Steps back to the start of the field most recently returned, so another
    /// consumer can read it. Only one level of rewind is kept.
    pub fn rewind(&mut self) -> bool {
        match self.previous.take() {
            Some(start) => {
                self.pos = start;
                true
            }
            None => false,
        }
    }

    pub fn reset(&mut self) {
        self.pos = 0;
        self.previous = None;
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// The unread tail of the frame.
    pub fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos.min(self.bytes.len())..]
    }

    fn read_record(&mut self) -> Result<Record<K>, WireError> {
        let code = u16::from_be_bytes(self.read_array::<2>()?);
        let key = K::from_code(code).ok_or(WireError::UnknownModel(code))?;
        let value = match key.value_type() {
            ValueType::None => Value::None,
            ValueType::Short => Value::Short(i16::from_be_bytes(self.read_array()?)),
            ValueType::Integer => Value::Integer(i32::from_be_bytes(self.read_array()?)),
            ValueType::Long => Value::Long(i64::from_be_bytes(self.read_array()?)),
            ValueType::String => {
                let len = u32::from_be_bytes(self.read_array()?) as usize;
                let raw = self.read_bytes(len)?;
                let text = std::str::from_utf8(raw).map_err(|_| WireError::InvalidString)?;
                Value::String(text.to_string())
            }
        };
        Ok(Record { key, value })
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if len > self.remaining() {
            return Err(WireError::UnexpectedEof { offset: self.pos });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }
}

/// Decodes a complete frame.
pub fn decode_records<K: ModelKey>(bytes: &[u8]) -> Result<Vec<Record<K>>, WireError> {
    let mut reader = Reader::new(bytes);
    let mut records = Vec::new();
    while let Some(record) = reader.next_field()? {
        records.push(record);
    }
    Ok(records)
}
