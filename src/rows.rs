//! Row image decoding
//!
//! Turns the body of a WRITE/UPDATE/DELETE_ROWS event into ordered
//! column -> value rows using the table's resolved metadata.

use crate::binlog::RowsHeader;
use crate::error::{Binlog2SqlError, Result};
use crate::events::{ColumnType, RowChange, RowKind};
use crate::table_map::{ColumnDescriptor, TableMapEntry};
use crate::value::{Row, Value};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use chrono::{Local, NaiveDate, TimeZone};
use std::io::{Cursor, Read};
use tracing::{trace, warn};

/// Decode every row image in a rows event body
pub fn decode_rows(
    header: &RowsHeader,
    data: &[u8],
    entry: &TableMapEntry,
    kind: RowKind,
) -> Result<Vec<RowChange>> {
    if header.column_count != entry.columns.len() {
        return Err(Binlog2SqlError::Other(format!(
            "rows event has {} columns but table map for {}.{} has {}",
            header.column_count,
            entry.schema,
            entry.table,
            entry.columns.len()
        )));
    }

    let body = data.get(header.body_offset..).unwrap_or(&[]);
    let mut cursor = Cursor::new(body);
    let mut rows = Vec::new();

    while (cursor.position() as usize) < body.len() {
        let image = read_image(&mut cursor, entry, &header.present)?;
        let change = match kind {
            RowKind::Write | RowKind::Delete => RowChange::Values(image),
            RowKind::Update => {
                let bitmap = header.present_after.as_deref().unwrap_or(&header.present[..]);
                let after = read_image(&mut cursor, entry, bitmap)?;
                RowChange::Update {
                    before: image,
                    after,
                }
            }
        };
        rows.push(change);
    }

    trace!(
        "Decoded {} row(s) for {}.{}",
        rows.len(),
        entry.schema,
        entry.table
    );
    Ok(rows)
}

/// One row image: null bitmap over the present columns, then the values
fn read_image(cursor: &mut Cursor<&[u8]>, entry: &TableMapEntry, present: &[u8]) -> Result<Row> {
    let present_count = count_set_bits(present);
    let mut null_bitmap = vec![0u8; present_count.div_ceil(8)];
    cursor.read_exact(&mut null_bitmap)?;

    let mut row = Row::new();
    let mut null_idx = 0;

    for (idx, column) in entry.columns.iter().enumerate() {
        if !is_bit_set(present, idx) {
            continue;
        }
        let value = if is_bit_set(&null_bitmap, null_idx) {
            Value::Null
        } else {
            decode_value(cursor, column)?
        };
        null_idx += 1;
        row.insert(column.name.clone(), value);
    }

    Ok(row)
}

fn decode_value(cursor: &mut Cursor<&[u8]>, column: &ColumnDescriptor) -> Result<Value> {
    let col_type = ColumnType::from_u8(column.type_code).ok_or_else(|| {
        Binlog2SqlError::Other(format!(
            "unknown type {} for column {}",
            column.type_code, column.name
        ))
    })?;
    let meta = column.meta;

    let value = match col_type {
        ColumnType::Tiny => {
            let v = cursor.read_i8()?;
            integer(column, v as i64, v as u8 as u64)
        }
        ColumnType::Short => {
            let v = cursor.read_i16::<LittleEndian>()?;
            integer(column, v as i64, v as u16 as u64)
        }
        ColumnType::Int24 => {
            let raw = cursor.read_u24::<LittleEndian>()?;
            let signed = if raw & 0x80_0000 != 0 {
                (raw | 0xFF00_0000) as i32
            } else {
                raw as i32
            };
            integer(column, signed as i64, raw as u64)
        }
        ColumnType::Long => {
            let v = cursor.read_i32::<LittleEndian>()?;
            integer(column, v as i64, v as u32 as u64)
        }
        ColumnType::LongLong => {
            let v = cursor.read_i64::<LittleEndian>()?;
            integer(column, v, v as u64)
        }
        ColumnType::Float => Value::Float(cursor.read_f32::<LittleEndian>()? as f64),
        ColumnType::Double => Value::Float(cursor.read_f64::<LittleEndian>()?),
        ColumnType::Year => match cursor.read_u8()? {
            0 => Value::Int(0),
            y => Value::Int(1900 + y as i64),
        },
        ColumnType::Date | ColumnType::NewDate => {
            let packed = cursor.read_u24::<LittleEndian>()?;
            let day = packed & 0x1F;
            let month = (packed >> 5) & 0x0F;
            let year = (packed >> 9) & 0x7FFF;
            date_value(year as i32, month, day, None)
        }
        ColumnType::Time => {
            let packed = cursor.read_u24::<LittleEndian>()?;
            Value::String(format!(
                "{:02}:{:02}:{:02}",
                packed / 10000,
                (packed / 100) % 100,
                packed % 100
            ))
        }
        ColumnType::DateTime => {
            let packed = cursor.read_u64::<LittleEndian>()?;
            let date = packed / 1_000_000;
            let time = packed % 1_000_000;
            date_value(
                (date / 10000) as i32,
                ((date / 100) % 100) as u32,
                (date % 100) as u32,
                Some((
                    (time / 10000) as u32,
                    ((time / 100) % 100) as u32,
                    (time % 100) as u32,
                    0,
                )),
            )
        }
        ColumnType::Timestamp => timestamp_value(cursor.read_u32::<LittleEndian>()?, 0),
        ColumnType::Timestamp2 => {
            let secs = cursor.read_u32::<BigEndian>()?;
            let micros = read_fractional_seconds(cursor, meta as u8)?;
            timestamp_value(secs, micros)
        }
        ColumnType::DateTime2 => {
            // 1 bit sign, 17 bits year*13+month, 5 day, 5 hour, 6 minute, 6 second
            let packed = cursor.read_uint::<BigEndian>(5)? as i64 - 0x80_0000_0000;
            let micros = read_fractional_seconds(cursor, meta as u8)?;
            let ymd = packed >> 17;
            let ym = ymd >> 5;
            let hms = packed % (1 << 17);
            date_value(
                (ym / 13) as i32,
                (ym % 13) as u32,
                (ymd % (1 << 5)) as u32,
                Some((
                    (hms >> 12) as u32,
                    ((hms >> 6) % (1 << 6)) as u32,
                    (hms % (1 << 6)) as u32,
                    micros,
                )),
            )
        }
        ColumnType::Time2 => {
            let packed = cursor.read_u24::<BigEndian>()? as i64 - 0x80_0000;
            let micros = read_fractional_seconds(cursor, meta as u8)?;
            time2_value(packed, micros, meta as u8)
        }
        ColumnType::Varchar | ColumnType::VarString => {
            let len = if meta < 256 {
                cursor.read_u8()? as usize
            } else {
                cursor.read_u16::<LittleEndian>()? as usize
            };
            text_value(column, read_bytes(cursor, len)?)
        }
        ColumnType::String => {
            let real_type = (meta >> 8) as u8;
            if real_type == ColumnType::Enum as u8 {
                enum_value(column, cursor, (meta & 0xFF) as usize)?
            } else if real_type == ColumnType::Set as u8 {
                set_value(column, cursor, (meta & 0xFF) as usize)?
            } else {
                let max_len = (((meta >> 4) & 0x300) ^ 0x300) + (meta & 0xFF);
                let len = if max_len < 256 {
                    cursor.read_u8()? as usize
                } else {
                    cursor.read_u16::<LittleEndian>()? as usize
                };
                text_value(column, read_bytes(cursor, len)?)
            }
        }
        ColumnType::Enum => enum_value(column, cursor, (meta & 0xFF) as usize)?,
        ColumnType::Set => set_value(column, cursor, (meta & 0xFF) as usize)?,
        ColumnType::Blob
        | ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob => {
            let len = read_sized_len(cursor, meta)?;
            text_value(column, read_bytes(cursor, len)?)
        }
        ColumnType::Geometry => {
            let len = read_sized_len(cursor, meta)?;
            Value::Bytes(read_bytes(cursor, len)?)
        }
        ColumnType::Json => {
            let len = read_sized_len(cursor, meta)?;
            let bytes = read_bytes(cursor, len)?;
            json_column_value(decode_json_binary(&bytes)?)
        }
        ColumnType::NewDecimal => {
            let precision = (meta >> 8) as usize;
            let scale = (meta & 0xFF) as usize;
            Value::Decimal(decode_decimal(cursor, precision, scale)?)
        }
        ColumnType::Bit => {
            let nbits = ((meta >> 8) * 8 + (meta & 0xFF)) as usize;
            Value::Bytes(read_bytes(cursor, nbits.div_ceil(8))?)
        }
        ColumnType::Null => Value::Null,
        ColumnType::Decimal => {
            return Err(Binlog2SqlError::Other(format!(
                "legacy DECIMAL column {} is not supported",
                column.name
            )))
        }
    };

    Ok(value)
}

fn integer(column: &ColumnDescriptor, signed: i64, unsigned: u64) -> Value {
    if column.unsigned {
        Value::UInt(unsigned)
    } else {
        Value::Int(signed)
    }
}

/// Character data becomes text; binary data and undecodable text stay bytes
fn text_value(column: &ColumnDescriptor, bytes: Vec<u8>) -> Value {
    if column.is_binary() {
        return Value::Bytes(bytes);
    }
    let charset = column.charset.as_deref().unwrap_or("utf8mb4");
    if charset.eq_ignore_ascii_case("latin1") {
        return Value::String(bytes.iter().map(|&b| b as char).collect());
    }
    match String::from_utf8(bytes) {
        Ok(text) => Value::String(text),
        Err(e) => {
            warn!(
                "Column {} is not valid {}, rendering as hex",
                column.name, charset
            );
            Value::Bytes(e.into_bytes())
        }
    }
}

fn enum_value(column: &ColumnDescriptor, cursor: &mut Cursor<&[u8]>, size: usize) -> Result<Value> {
    let index = match size {
        1 => cursor.read_u8()? as usize,
        _ => cursor.read_u16::<LittleEndian>()? as usize,
    };
    // index 0 is the empty error value
    let name = index
        .checked_sub(1)
        .and_then(|i| column.members.get(i))
        .cloned()
        .unwrap_or_default();
    Ok(Value::String(name))
}

fn set_value(column: &ColumnDescriptor, cursor: &mut Cursor<&[u8]>, size: usize) -> Result<Value> {
    let bits = cursor.read_uint::<LittleEndian>(size.clamp(1, 8))?;
    let names = column
        .members
        .iter()
        .enumerate()
        .filter(|(i, _)| bits & (1u64 << i) != 0)
        .map(|(_, name)| name.clone())
        .collect();
    Ok(Value::Set(names))
}

/// JSON columns render as JSON text; containers stay structured so nested
/// bytes can still be fixed before serialization.
fn json_column_value(value: Value) -> Value {
    match value {
        Value::List(_) | Value::Map(_) => value,
        Value::Null => Value::String("null".to_string()),
        scalar => Value::String(scalar.fix_bytes().to_json().to_string()),
    }
}

fn date_value(year: i32, month: u32, day: u32, time: Option<(u32, u32, u32, u32)>) -> Value {
    let date = match NaiveDate::from_ymd_opt(year, month, day) {
        Some(date) => date,
        None => return Value::Null,
    };
    match time {
        None => Value::String(date.format("%Y-%m-%d").to_string()),
        Some((h, m, s, micros)) => match date.and_hms_micro_opt(h, m, s, micros) {
            Some(dt) if micros > 0 => Value::String(dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
            Some(dt) => Value::String(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
            None => Value::Null,
        },
    }
}

/// TIMESTAMP columns are rendered in the local time zone
fn timestamp_value(secs: u32, micros: u32) -> Value {
    if secs == 0 {
        return Value::String("0000-00-00 00:00:00".to_string());
    }
    match Local.timestamp_opt(secs as i64, micros * 1000).single() {
        Some(dt) if micros > 0 => Value::String(dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
        Some(dt) => Value::String(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
        None => Value::Null,
    }
}

fn time2_value(packed: i64, micros: u32, fsp: u8) -> Value {
    let negative = packed < 0;
    let mut value = packed.abs();
    let mut micros = micros as i64;
    // negative values with a fraction borrow one second
    if negative && micros > 0 && fsp > 0 {
        value -= 1;
        micros = 1_000_000 - micros;
    }
    let hours = (value >> 12) % (1 << 10);
    let minutes = (value >> 6) % (1 << 6);
    let seconds = value % (1 << 6);
    let sign = if negative { "-" } else { "" };
    if micros > 0 {
        Value::String(format!(
            "{}{:02}:{:02}:{:02}.{:06}",
            sign, hours, minutes, seconds, micros
        ))
    } else {
        Value::String(format!("{}{:02}:{:02}:{:02}", sign, hours, minutes, seconds))
    }
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Length prefix whose width (1-4 bytes) comes from the column metadata
fn read_sized_len(cursor: &mut Cursor<&[u8]>, width: u16) -> Result<usize> {
    Ok(cursor.read_uint::<LittleEndian>(width.clamp(1, 4) as usize)? as usize)
}

/// Big-endian fraction stored in (fsp + 1) / 2 bytes, scaled to microseconds
fn read_fractional_seconds(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<u32> {
    let fsp = fsp.min(6) as u32;
    let bytes = fsp.div_ceil(2) as usize;
    if bytes == 0 {
        return Ok(0);
    }
    let raw = cursor.read_uint::<BigEndian>(bytes)? as u32;
    // stored digits are always a multiple of two
    Ok(raw * 10u32.pow(6 - bytes as u32 * 2))
}

fn count_set_bits(bitmap: &[u8]) -> usize {
    bitmap.iter().map(|b| b.count_ones() as usize).sum()
}

fn is_bit_set(bitmap: &[u8], idx: usize) -> bool {
    let byte_idx = idx / 8;
    byte_idx < bitmap.len() && (bitmap[byte_idx] & (1 << (idx % 8))) != 0
}

const DIG2BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];
const DIGITS_PER_WORD: usize = 9;

/// NEWDECIMAL: sign-flipped big-endian groups of nine digits
fn decode_decimal(cursor: &mut Cursor<&[u8]>, precision: usize, scale: usize) -> Result<String> {
    let int_digits = precision.checked_sub(scale).ok_or_else(|| {
        Binlog2SqlError::Other(format!("decimal scale {} exceeds precision {}", scale, precision))
    })?;
    let int_words = int_digits / DIGITS_PER_WORD;
    let int_leftover = int_digits % DIGITS_PER_WORD;
    let frac_words = scale / DIGITS_PER_WORD;
    let frac_leftover = scale % DIGITS_PER_WORD;

    let size = DIG2BYTES[int_leftover]
        + int_words * 4
        + frac_words * 4
        + DIG2BYTES[frac_leftover];
    let mut bytes = read_bytes(cursor, size)?;
    if bytes.is_empty() {
        return Ok("0".to_string());
    }

    let negative = bytes[0] & 0x80 == 0;
    bytes[0] ^= 0x80;
    if negative {
        for b in bytes.iter_mut() {
            *b = !*b;
        }
    }

    let mut digits = Cursor::new(bytes.as_slice());
    let mut int_part = String::new();

    if DIG2BYTES[int_leftover] > 0 {
        let val = digits.read_uint::<BigEndian>(DIG2BYTES[int_leftover])?;
        if val > 0 {
            int_part.push_str(&val.to_string());
        }
    }
    for _ in 0..int_words {
        let val = digits.read_u32::<BigEndian>()?;
        if int_part.is_empty() {
            if val > 0 {
                int_part.push_str(&val.to_string());
            }
        } else {
            int_part.push_str(&format!("{:09}", val));
        }
    }
    if int_part.is_empty() {
        int_part.push('0');
    }

    let mut result = String::new();
    if negative {
        result.push('-');
    }
    result.push_str(&int_part);

    if scale > 0 {
        result.push('.');
        for _ in 0..frac_words {
            let val = digits.read_u32::<BigEndian>()?;
            result.push_str(&format!("{:09}", val));
        }
        if DIG2BYTES[frac_leftover] > 0 {
            let val = digits.read_uint::<BigEndian>(DIG2BYTES[frac_leftover])?;
            result.push_str(&format!("{:0width$}", val, width = frac_leftover));
        }
    }

    Ok(result)
}

// MySQL binary JSON
//
//   0x00/0x01  small/large object
//   0x02/0x03  small/large array
//   0x04       literal (null/true/false)
//   0x05-0x0a  int16, uint16, int32, uint32, int64, uint64
//   0x0b       double
//   0x0c       utf8 string
//   0x0f       opaque

const JSONB_SMALL_OBJECT: u8 = 0x00;
const JSONB_LARGE_OBJECT: u8 = 0x01;
const JSONB_SMALL_ARRAY: u8 = 0x02;
const JSONB_LARGE_ARRAY: u8 = 0x03;
const JSONB_LITERAL: u8 = 0x04;
const JSONB_INT16: u8 = 0x05;
const JSONB_UINT16: u8 = 0x06;
const JSONB_INT32: u8 = 0x07;
const JSONB_UINT32: u8 = 0x08;
const JSONB_INT64: u8 = 0x09;
const JSONB_UINT64: u8 = 0x0a;
const JSONB_DOUBLE: u8 = 0x0b;
const JSONB_STRING: u8 = 0x0c;
const JSONB_OPAQUE: u8 = 0x0f;

/// Decode a binary JSON document.
///
/// Strings that are not valid UTF-8 and opaque payloads are kept as bytes
/// for the nested byte fixer.
pub fn decode_json_binary(data: &[u8]) -> Result<Value> {
    if data.is_empty() {
        return Ok(Value::Null);
    }
    json_typed(data[0], &data[1..])
}

fn json_typed(type_byte: u8, data: &[u8]) -> Result<Value> {
    match type_byte {
        JSONB_SMALL_OBJECT => json_container(data, false, true),
        JSONB_LARGE_OBJECT => json_container(data, true, true),
        JSONB_SMALL_ARRAY => json_container(data, false, false),
        JSONB_LARGE_ARRAY => json_container(data, true, false),
        JSONB_LITERAL => Ok(json_literal(data.first().copied().unwrap_or(0) as u16)),
        JSONB_INT16 => Ok(Value::Int(json_slice(data, 0, 2)?.read_i16::<LittleEndian>()? as i64)),
        JSONB_UINT16 => Ok(Value::Int(json_slice(data, 0, 2)?.read_u16::<LittleEndian>()? as i64)),
        JSONB_INT32 => Ok(Value::Int(json_slice(data, 0, 4)?.read_i32::<LittleEndian>()? as i64)),
        JSONB_UINT32 => Ok(Value::Int(json_slice(data, 0, 4)?.read_u32::<LittleEndian>()? as i64)),
        JSONB_INT64 => Ok(Value::Int(json_slice(data, 0, 8)?.read_i64::<LittleEndian>()?)),
        JSONB_UINT64 => Ok(Value::UInt(json_slice(data, 0, 8)?.read_u64::<LittleEndian>()?)),
        JSONB_DOUBLE => Ok(Value::Float(json_slice(data, 0, 8)?.read_f64::<LittleEndian>()?)),
        JSONB_STRING => {
            let (len, prefix) = json_variable_length(data)?;
            let bytes = json_slice(data, prefix, len)?.to_vec();
            Ok(match String::from_utf8(bytes) {
                Ok(s) => Value::String(s),
                Err(e) => Value::Bytes(e.into_bytes()),
            })
        }
        JSONB_OPAQUE => {
            let rest = data.get(1..).unwrap_or(&[]);
            let (len, prefix) = json_variable_length(rest)?;
            Ok(Value::Bytes(json_slice(rest, prefix, len)?.to_vec()))
        }
        other => Err(Binlog2SqlError::Other(format!(
            "unknown JSON binary type 0x{:02x}",
            other
        ))),
    }
}

fn json_literal(code: u16) -> Value {
    match code {
        0x01 => Value::Bool(true),
        0x02 => Value::Bool(false),
        _ => Value::Null,
    }
}

/// Objects and arrays share the header and value-entry layout; objects add
/// key entries between the two.
fn json_container(data: &[u8], large: bool, is_object: bool) -> Result<Value> {
    let offset_size = if large { 4 } else { 2 };
    let read_offset = |pos: usize| -> Result<usize> {
        let mut slice = json_slice(data, pos, offset_size)?;
        Ok(slice.read_uint::<LittleEndian>(offset_size)? as usize)
    };

    let count = read_offset(0)?;
    let header_size = offset_size * 2;
    let key_entry_size = offset_size + 2;
    let value_entry_size = offset_size + 1;
    let value_entries_start = if is_object {
        header_size + count * key_entry_size
    } else {
        header_size
    };

    let mut keys = Vec::with_capacity(if is_object { count } else { 0 });
    if is_object {
        for i in 0..count {
            let entry = header_size + i * key_entry_size;
            let key_offset = read_offset(entry)?;
            let key_len = json_slice(data, entry + offset_size, 2)?.read_u16::<LittleEndian>()? as usize;
            let key = json_slice(data, key_offset, key_len)?.to_vec();
            keys.push(match String::from_utf8(key) {
                Ok(s) => Value::String(s),
                Err(e) => Value::Bytes(e.into_bytes()),
            });
        }
    }

    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let entry = value_entries_start + i * value_entry_size;
        let value_type = *data
            .get(entry)
            .ok_or_else(|| Binlog2SqlError::Other("truncated JSON value entry".to_string()))?;
        values.push(json_entry_value(data, value_type, entry + 1, large)?);
    }

    if is_object {
        Ok(Value::Map(keys.into_iter().zip(values).collect()))
    } else {
        Ok(Value::List(values))
    }
}

/// Small scalars are inlined in the value entry; everything else is an
/// offset relative to the start of the container.
fn json_entry_value(data: &[u8], value_type: u8, pos: usize, large: bool) -> Result<Value> {
    match value_type {
        JSONB_LITERAL => {
            return Ok(json_literal(
                json_slice(data, pos, 2)?.read_u16::<LittleEndian>()?,
            ))
        }
        JSONB_INT16 => return Ok(Value::Int(json_slice(data, pos, 2)?.read_i16::<LittleEndian>()? as i64)),
        JSONB_UINT16 => return Ok(Value::Int(json_slice(data, pos, 2)?.read_u16::<LittleEndian>()? as i64)),
        JSONB_INT32 if large => {
            return Ok(Value::Int(json_slice(data, pos, 4)?.read_i32::<LittleEndian>()? as i64))
        }
        JSONB_UINT32 if large => {
            return Ok(Value::Int(json_slice(data, pos, 4)?.read_u32::<LittleEndian>()? as i64))
        }
        _ => {}
    }

    let offset_size = if large { 4 } else { 2 };
    let offset = json_slice(data, pos, offset_size)?.read_uint::<LittleEndian>(offset_size)? as usize;
    let nested = data
        .get(offset..)
        .ok_or_else(|| Binlog2SqlError::Other("JSON value offset out of bounds".to_string()))?;
    json_typed(value_type, nested)
}

/// 7 bits per byte, high bit continues; at most 5 bytes
fn json_variable_length(data: &[u8]) -> Result<(usize, usize)> {
    let mut length = 0usize;
    for (i, &b) in data.iter().take(5).enumerate() {
        length |= ((b & 0x7F) as usize) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((length, i + 1));
        }
    }
    Err(Binlog2SqlError::Other(
        "truncated JSON variable-length integer".to_string(),
    ))
}

fn json_slice(data: &[u8], start: usize, len: usize) -> Result<&[u8]> {
    data.get(start..start + len)
        .ok_or_else(|| Binlog2SqlError::Other("truncated JSON document".to_string()))
}
