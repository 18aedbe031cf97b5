//! Row wire format.
//!
//! All integers are big-endian.
//!
//! ```text
//! schema frame   u32 field_count
//!                field_count x { u16 name_len, name, u8 type_tag, i32 length, i32 precision }
//! row frame      u32 payload_len (> 0), payload
//! terminal frame u32 0
//! ```
//!
//! A row payload is positional: one `u8` tag per value (0 for null, else the
//! field's type tag) followed by the value bytes:
//!
//! | type    | bytes                          |
//! |---------|--------------------------------|
//! | String  | u32 len, UTF-8                 |
//! | Integer | i64                            |
//! | Number  | f64 bits                       |
//! | Decimal | i128 unscaled, u8 scale        |
//! | Boolean | u8 (0 or 1)                    |
//! | Date    | i64 seconds, u32 nanoseconds   |
//! | Binary  | u32 len, bytes                 |

use crate::error::{EngineError, Result, TransportKind};
use crate::row::{Decimal, FieldMeta, Row, Schema, Value, ValueType};
use chrono::DateTime;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Largest accepted row payload
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Largest accepted field count in a schema frame
pub const MAX_FIELDS: u32 = 1 << 16;

pub(crate) fn protocol(message: impl Into<String>) -> EngineError {
    EngineError::transport(TransportKind::Protocol, message)
}

pub(crate) fn io_error(err: io::Error) -> EngineError {
    let kind = match err.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => TransportKind::Unreachable,
        _ => TransportKind::Io,
    };
    EngineError::transport(kind, err.to_string())
}

// ==================== Schema frame ====================

pub fn write_schema<W: Write>(w: &mut W, schema: &Schema) -> Result<()> {
    let mut buf = Vec::with_capacity(4 + schema.len() * 16);
    buf.extend_from_slice(&(schema.len() as u32).to_be_bytes());
    for field in schema.fields() {
        let name = field.name.as_bytes();
        let len = u16::try_from(name.len())
            .map_err(|_| protocol(format!("field name '{}' is too long", field.name)))?;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(name);
        buf.push(field.value_type.tag());
        buf.extend_from_slice(&field.length.to_be_bytes());
        buf.extend_from_slice(&field.precision.to_be_bytes());
    }
    w.write_all(&buf).map_err(io_error)
}

pub fn read_schema<R: Read>(r: &mut R) -> Result<Schema> {
    let count = read_u32(r)?;
    if count > MAX_FIELDS {
        return Err(protocol(format!("schema frame claims {} fields", count)));
    }
    let mut fields = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut len = [0u8; 2];
        r.read_exact(&mut len).map_err(io_error)?;
        let mut name = vec![0u8; u16::from_be_bytes(len) as usize];
        r.read_exact(&mut name).map_err(io_error)?;
        let name = String::from_utf8(name).map_err(|_| protocol("field name is not UTF-8"))?;

        let mut tag = [0u8; 1];
        r.read_exact(&mut tag).map_err(io_error)?;
        let value_type = ValueType::from_tag(tag[0])
            .ok_or_else(|| protocol(format!("unknown type tag {}", tag[0])))?;

        let length = read_i32(r)?;
        let precision = read_i32(r)?;
        fields.push(
            FieldMeta::new(name, value_type)
                .with_length(length)
                .with_precision(precision),
        );
    }
    Ok(Schema::new(fields))
}

// ==================== Row frames ====================

/// Append the payload of `row` (without the length prefix) to `buf`.
pub fn encode_row(row: &Row, buf: &mut Vec<u8>) {
    for value in row.values() {
        match value {
            Value::Null => buf.push(0),
            Value::String(s) => {
                buf.push(ValueType::String.tag());
                put_bytes(buf, s.as_bytes());
            }
            Value::Integer(v) => {
                buf.push(ValueType::Integer.tag());
                buf.extend_from_slice(&v.to_be_bytes());
            }
            Value::Number(v) => {
                buf.push(ValueType::Number.tag());
                buf.extend_from_slice(&v.to_bits().to_be_bytes());
            }
            Value::Decimal(d) => {
                buf.push(ValueType::Decimal.tag());
                buf.extend_from_slice(&d.unscaled.to_be_bytes());
                buf.push(d.scale);
            }
            Value::Boolean(v) => {
                buf.push(ValueType::Boolean.tag());
                buf.push(u8::from(*v));
            }
            Value::Date(d) => {
                buf.push(ValueType::Date.tag());
                buf.extend_from_slice(&d.timestamp().to_be_bytes());
                buf.extend_from_slice(&d.timestamp_subsec_nanos().to_be_bytes());
            }
            Value::Binary(b) => {
                buf.push(ValueType::Binary.tag());
                put_bytes(buf, b);
            }
        }
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Decode a row payload against `schema`.
pub fn decode_row(schema: &Arc<Schema>, payload: &[u8]) -> Result<Row> {
    let mut cursor = Cursor { buf: payload, pos: 0 };
    let mut values = Vec::with_capacity(schema.len());
    for field in schema.fields() {
        let tag = cursor.u8()?;
        if tag == 0 {
            values.push(Value::Null);
            continue;
        }
        if tag != field.value_type.tag() {
            return Err(protocol(format!(
                "field '{}' expects tag {}, got {}",
                field.name,
                field.value_type.tag(),
                tag
            )));
        }
        let value = match field.value_type {
            ValueType::String => {
                let bytes = cursor.sized()?;
                Value::String(
                    std::str::from_utf8(bytes)
                        .map_err(|_| protocol(format!("field '{}' is not UTF-8", field.name)))?
                        .to_string(),
                )
            }
            ValueType::Integer => Value::Integer(i64::from_be_bytes(cursor.array()?)),
            ValueType::Number => Value::Number(f64::from_bits(u64::from_be_bytes(cursor.array()?))),
            ValueType::Decimal => {
                let unscaled = i128::from_be_bytes(cursor.array()?);
                Value::Decimal(Decimal::new(unscaled, cursor.u8()?))
            }
            ValueType::Boolean => Value::Boolean(cursor.u8()? != 0),
            ValueType::Date => {
                let secs = i64::from_be_bytes(cursor.array()?);
                let nanos = u32::from_be_bytes(cursor.array()?);
                let date = DateTime::from_timestamp(secs, nanos)
                    .ok_or_else(|| protocol(format!("date {}.{} out of range", secs, nanos)))?;
                Value::Date(date)
            }
            ValueType::Binary => Value::Binary(cursor.sized()?.to_vec()),
        };
        values.push(value);
    }
    if cursor.pos != payload.len() {
        return Err(protocol(format!(
            "{} trailing bytes after row",
            payload.len() - cursor.pos
        )));
    }
    Row::new(schema.clone(), values)
}

/// Write one row frame. `scratch` is reused between calls.
pub fn write_row<W: Write>(w: &mut W, row: &Row, scratch: &mut Vec<u8>) -> Result<()> {
    scratch.clear();
    scratch.extend_from_slice(&[0; 4]);
    encode_row(row, scratch);
    let len = (scratch.len() - 4) as u32;
    if len == 0 {
        return Err(protocol("cannot send a row without fields"));
    }
    scratch[..4].copy_from_slice(&len.to_be_bytes());
    w.write_all(scratch).map_err(io_error)
}

pub fn write_terminal<W: Write>(w: &mut W) -> Result<()> {
    w.write_all(&0u32.to_be_bytes()).map_err(io_error)
}

/// Read one frame: `Some(row)` or `None` for the terminal frame.
pub fn read_row<R: Read>(
    r: &mut R,
    schema: &Arc<Schema>,
    scratch: &mut Vec<u8>,
) -> Result<Option<Row>> {
    let len = read_u32(r)?;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_FRAME_LEN {
        return Err(protocol(format!("frame of {} bytes exceeds limit", len)));
    }
    scratch.resize(len as usize, 0);
    r.read_exact(scratch).map_err(io_error)?;
    decode_row(schema, scratch).map(Some)
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b).map_err(io_error)?;
    Ok(u32::from_be_bytes(b))
}

fn read_i32<R: Read>(r: &mut R) -> Result<i32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b).map_err(io_error)?;
    Ok(i32::from_be_bytes(b))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| protocol("row frame is truncated"))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn sized(&mut self) -> Result<&'a [u8]> {
        let len = u32::from_be_bytes(self.array()?) as usize;
        self.take(len)
    }
}
