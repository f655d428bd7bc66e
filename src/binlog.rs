//! Binlog event framing and payload parsing
//!
//! File layout: 4-byte magic (0xfe 'b' 'i' 'n') followed by events.
//! Each event:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Event Data (variable, optionally followed by a CRC32)
//!
//! All integers are little-endian.

use crate::error::{Binlog2SqlError, Result};
use crate::events::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use uuid::Uuid;

pub const BINLOG_MAGIC: [u8; 4] = [0xfe, 0x62, 0x69, 0x6e];
pub const CHECKSUM_LEN: usize = 4;

/// Fixed part of a format description payload: version(2) + server(50) + ts(4) + header len(1)
const FDE_FIXED_LEN: usize = 57;

/// Binlog payload parser
pub struct BinlogParser;

impl BinlogParser {
    /// Verify the file magic
    pub fn verify_magic(data: &[u8]) -> Result<()> {
        if data.len() < BINLOG_MAGIC.len() {
            return Err(Binlog2SqlError::malformed(0, "file too short for magic"));
        }

        if data[..4] == BINLOG_MAGIC {
            Ok(())
        } else {
            Err(Binlog2SqlError::malformed(
                0,
                format!(
                    "magic bytes {:02x?} did not match expected {:02x?}",
                    &data[..4],
                    BINLOG_MAGIC
                ),
            ))
        }
    }

    /// Parse the fixed 19-byte event header
    pub fn parse_header(data: &[u8]) -> Result<EventHeader> {
        if data.len() < EventHeader::SIZE {
            return Err(truncated("event header"));
        }

        let mut cursor = Cursor::new(data);

        let timestamp = cursor.read_u32::<LittleEndian>()?;
        let type_code = cursor.read_u8()?;
        let server_id = cursor.read_u32::<LittleEndian>()?;
        let event_length = cursor.read_u32::<LittleEndian>()?;
        let log_pos = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;

        if (event_length as usize) < EventHeader::SIZE {
            return Err(Binlog2SqlError::Other(format!(
                "event size {} smaller than header",
                event_length
            )));
        }

        Ok(EventHeader {
            timestamp,
            event_type: EventType::from_u8(type_code),
            type_code,
            server_id,
            event_length,
            log_pos,
            flags,
        })
    }

    /// Drop the trailing CRC32, if the source writes one
    pub fn strip_checksum(payload: &[u8], checksum: bool) -> &[u8] {
        if checksum && payload.len() >= CHECKSUM_LEN {
            &payload[..payload.len() - CHECKSUM_LEN]
        } else {
            payload
        }
    }

    /// FORMAT_DESCRIPTION (15). `has_trailer` tells whether the 4 checksum
    /// bytes are still attached (files) or were already stripped (framed
    /// replication streams).
    pub fn parse_format_description(data: &[u8], has_trailer: bool) -> Result<FormatDescriptionData> {
        if data.len() < FDE_FIXED_LEN {
            return Err(truncated("format description event"));
        }

        let mut cursor = Cursor::new(data);

        let binlog_version = cursor.read_u16::<LittleEndian>()?;
        let mut version_bytes = [0u8; 50];
        cursor.read_exact(&mut version_bytes)?;
        let server_version = String::from_utf8_lossy(&version_bytes)
            .trim_end_matches('\0')
            .to_string();
        let create_timestamp = cursor.read_u32::<LittleEndian>()?;
        let header_length = cursor.read_u8()?;

        // The algorithm byte is last, followed by the CRC32 unless stripped.
        let trailer = if has_trailer { CHECKSUM_LEN } else { 0 };
        let checksum_alg = if version_has_checksum(&server_version)
            && data.len() >= FDE_FIXED_LEN + 1 + trailer
        {
            match data[data.len() - trailer - 1] {
                alg @ (0 | 1) => alg,
                _ => 0,
            }
        } else {
            0
        };

        Ok(FormatDescriptionData {
            binlog_version,
            server_version,
            create_timestamp,
            header_length,
            checksum_alg,
        })
    }

    /// ROTATE (4)
    pub fn parse_rotate(data: &[u8]) -> Result<RotateEventData> {
        if data.len() < 8 {
            return Err(truncated("rotate event"));
        }

        let mut cursor = Cursor::new(data);
        let position = cursor.read_u64::<LittleEndian>()?;
        let next_binlog = String::from_utf8_lossy(&data[8..])
            .trim_end_matches('\0')
            .to_string();

        Ok(RotateEventData {
            next_binlog,
            position,
        })
    }

    /// QUERY (2)
    pub fn parse_query(data: &[u8]) -> Result<QueryEventData> {
        if data.len() < 13 {
            return Err(truncated("query event"));
        }

        let mut cursor = Cursor::new(data);

        let thread_id = cursor.read_u32::<LittleEndian>()?;
        let exec_time = cursor.read_u32::<LittleEndian>()?;
        let schema_len = cursor.read_u8()? as usize;
        let error_code = cursor.read_u16::<LittleEndian>()?;
        let status_len = cursor.read_u16::<LittleEndian>()? as u64;

        // status variables are not needed
        cursor.set_position(cursor.position() + status_len);

        let mut schema_bytes = vec![0u8; schema_len];
        cursor.read_exact(&mut schema_bytes)?;
        let schema = String::from_utf8_lossy(&schema_bytes).to_string();

        // null terminator
        cursor.read_u8()?;

        let start = cursor.position() as usize;
        let query = String::from_utf8_lossy(&data[start..]).to_string();

        Ok(QueryEventData {
            thread_id,
            exec_time,
            error_code,
            schema,
            query,
        })
    }

    /// GTID (33) and ANONYMOUS_GTID (34)
    pub fn parse_gtid(data: &[u8]) -> Result<GtidEventData> {
        if data.len() < 25 {
            return Err(truncated("GTID event"));
        }

        let mut cursor = Cursor::new(data);

        let flags = cursor.read_u8()?;
        let mut uuid_bytes = [0u8; 16];
        cursor.read_exact(&mut uuid_bytes)?;
        let gno = cursor.read_u64::<LittleEndian>()?;

        Ok(GtidEventData {
            flags,
            uuid: Uuid::from_bytes(uuid_bytes).to_string(),
            gno,
        })
    }

    /// TABLE_MAP (19)
    pub fn parse_table_map(data: &[u8]) -> Result<TableMapData> {
        if data.len() < 8 {
            return Err(truncated("table map event"));
        }

        let mut cursor = Cursor::new(data);

        let table_id = cursor.read_u48::<LittleEndian>()?;
        let _flags = cursor.read_u16::<LittleEndian>()?;

        let schema = read_name(&mut cursor)?;
        let table = read_name(&mut cursor)?;

        let column_count = read_lcb(&mut cursor)? as usize;
        let mut column_types = vec![0u8; column_count];
        cursor.read_exact(&mut column_types)?;

        let metadata_len = read_lcb(&mut cursor)? as usize;
        let mut metadata = vec![0u8; metadata_len];
        cursor.read_exact(&mut metadata)?;
        let column_meta = parse_column_meta(&column_types, &metadata)?;

        let mut null_bitmap = vec![0u8; column_count.div_ceil(8)];
        cursor.read_exact(&mut null_bitmap)?;

        Ok(TableMapData {
            table_id,
            schema,
            table,
            column_types,
            column_meta,
            null_bitmap,
        })
    }

    /// Common prefix of WRITE/UPDATE/DELETE_ROWS (v1 and v2).
    ///
    /// The returned header records where the row images start so that the
    /// image decoder can run once table metadata is known.
    pub fn parse_rows_header(data: &[u8], event_type: EventType) -> Result<RowsHeader> {
        if data.len() < 8 {
            return Err(truncated("rows event"));
        }

        let mut cursor = Cursor::new(data);

        let table_id = cursor.read_u48::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;

        if event_type.is_v2_rows() {
            // length includes its own two bytes
            let extra_len = cursor.read_u16::<LittleEndian>()? as u64;
            if extra_len > 2 {
                cursor.set_position(cursor.position() + extra_len - 2);
            }
        }

        let column_count = read_lcb(&mut cursor)? as usize;
        let bitmap_len = column_count.div_ceil(8);

        let mut present = vec![0u8; bitmap_len];
        cursor.read_exact(&mut present)?;

        let present_after = if event_type.row_kind() == Some(RowKind::Update) {
            let mut bitmap = vec![0u8; bitmap_len];
            cursor.read_exact(&mut bitmap)?;
            Some(bitmap)
        } else {
            None
        };

        Ok(RowsHeader {
            table_id,
            flags,
            column_count,
            present,
            present_after,
            body_offset: cursor.position() as usize,
        })
    }

    /// XID (16)
    pub fn parse_xid(data: &[u8]) -> Result<XidEventData> {
        let mut cursor = Cursor::new(data);
        let xid = cursor.read_u64::<LittleEndian>()?;
        Ok(XidEventData { xid })
    }
}

/// Row event prefix shared by all row-event kinds
#[derive(Debug, Clone)]
pub struct RowsHeader {
    pub table_id: u64,
    pub flags: u16,
    pub column_count: usize,
    /// Columns present in the (before) image
    pub present: Vec<u8>,
    /// Columns present in the after image (updates only)
    pub present_after: Option<Vec<u8>>,
    pub body_offset: usize,
}

/// Per-column metadata from a table map, one u16 per column.
///
/// String/Enum/Set keep the two raw bytes as `(real_type << 8) | length`;
/// NewDecimal keeps `(precision << 8) | scale`.
fn parse_column_meta(column_types: &[u8], metadata: &[u8]) -> Result<Vec<u16>> {
    let mut cursor = Cursor::new(metadata);
    let mut meta = Vec::with_capacity(column_types.len());

    for &code in column_types {
        let value = match ColumnType::from_u8(code) {
            Some(
                ColumnType::Float
                | ColumnType::Double
                | ColumnType::Blob
                | ColumnType::TinyBlob
                | ColumnType::MediumBlob
                | ColumnType::LongBlob
                | ColumnType::Json
                | ColumnType::Geometry
                | ColumnType::Time2
                | ColumnType::DateTime2
                | ColumnType::Timestamp2,
            ) => cursor.read_u8()? as u16,
            Some(ColumnType::Varchar | ColumnType::VarString | ColumnType::Bit) => {
                cursor.read_u16::<LittleEndian>()?
            }
            Some(
                ColumnType::NewDecimal | ColumnType::String | ColumnType::Enum | ColumnType::Set,
            ) => {
                let high = cursor.read_u8()? as u16;
                let low = cursor.read_u8()? as u16;
                (high << 8) | low
            }
            Some(_) => 0,
            None => {
                return Err(Binlog2SqlError::Other(format!(
                    "unknown column type {}",
                    code
                )))
            }
        };
        meta.push(value);
    }

    Ok(meta)
}

/// Length-prefixed, null-terminated identifier
fn read_name(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor.read_u8()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    cursor.read_u8()?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

/// Length-coded binary (packed integer)
pub(crate) fn read_lcb(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let byte = cursor.read_u8()?;
    match byte {
        0..=0xfa => Ok(byte as u64),
        0xfc => Ok(cursor.read_u16::<LittleEndian>()? as u64),
        0xfd => Ok(cursor.read_u24::<LittleEndian>()? as u64),
        0xfe => Ok(cursor.read_u64::<LittleEndian>()?),
        _ => Err(Binlog2SqlError::Other(format!(
            "invalid length-coded integer prefix 0x{:02x}",
            byte
        ))),
    }
}

/// Checksums exist from MySQL 5.6.1 and MariaDB 5.3
fn version_has_checksum(version: &str) -> bool {
    let mut parts = version.split('.');
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u32 = parts
        .next()
        .map(|p| p.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);

    if version.contains("MariaDB") {
        return major > 5 || (major == 5 && minor >= 3);
    }
    major > 5 || (major == 5 && minor >= 6)
}

fn truncated(what: &str) -> Binlog2SqlError {
    Binlog2SqlError::Other(format!("truncated {}", what))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn header_bytes(event_type: u8, timestamp: u32, length: u32, log_pos: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(EventHeader::SIZE);
        buf.extend_from_slice(&timestamp.to_le_bytes());
        buf.push(event_type);
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(&log_pos.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf
    }

    #[test]
    fn test_verify_magic() {
        let valid = vec![0xfe, 0x62, 0x69, 0x6e];
        assert!(BinlogParser::verify_magic(&valid).is_ok());

        let invalid = vec![0x00, 0x00, 0x00, 0x00];
        assert!(matches!(
            BinlogParser::verify_magic(&invalid),
            Err(Binlog2SqlError::MalformedLog { position: 0, .. })
        ));
    }

    #[test]
    fn test_parse_header() {
        let data = header_bytes(30, 1_700_000_000, 60, 1234);
        let header = BinlogParser::parse_header(&data).unwrap();
        assert_eq!(header.timestamp, 1_700_000_000);
        assert_eq!(header.event_type, EventType::WriteRowsV2);
        assert_eq!(header.event_length, 60);
        assert_eq!(header.log_pos, 1234);

        assert!(BinlogParser::parse_header(&data[..10]).is_err());
        let tiny = header_bytes(2, 0, 5, 0);
        assert!(BinlogParser::parse_header(&tiny).is_err());
    }

    #[test]
    fn test_parse_gtid_uuid_format() {
        let mut data = vec![1u8];
        data.extend_from_slice(&[
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc,
            0xde, 0xf0,
        ]);
        data.extend_from_slice(&42u64.to_le_bytes());
        let gtid = BinlogParser::parse_gtid(&data).unwrap();
        assert_eq!(gtid.uuid, "12345678-9abc-def0-1234-56789abcdef0");
        assert_eq!(gtid.gtid(), "12345678-9abc-def0-1234-56789abcdef0:42");
    }

    #[test]
    fn test_parse_rotate() {
        let mut data = 4u64.to_le_bytes().to_vec();
        data.extend_from_slice(b"mysql-bin.000002");
        let rotate = BinlogParser::parse_rotate(&data).unwrap();
        assert_eq!(rotate.position, 4);
        assert_eq!(rotate.next_binlog, "mysql-bin.000002");
    }

    #[test]
    fn test_parse_query() {
        let mut data = Vec::new();
        data.extend_from_slice(&7u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.push(3);
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&[0xaa, 0xbb]);
        data.extend_from_slice(b"db1\0BEGIN");
        let query = BinlogParser::parse_query(&data).unwrap();
        assert_eq!(query.thread_id, 7);
        assert_eq!(query.schema, "db1");
        assert!(query.is_begin());
    }

    #[test]
    fn test_parse_table_map_with_metadata() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0x2a, 0, 0, 0, 0, 0]);
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&[3, b'd', b'b', b'1', 0]);
        data.extend_from_slice(&[6, b'o', b'r', b'd', b'e', b'r', b's', 0]);
        // long, varchar(64), newdecimal(10,2), string(enum)
        data.push(4);
        data.extend_from_slice(&[3, 15, 246, 254]);
        data.push(6);
        data.extend_from_slice(&[64, 0, 10, 2, 247, 1]);
        data.push(0b0000_1110);

        let map = BinlogParser::parse_table_map(&data).unwrap();
        assert_eq!(map.table_id, 42);
        assert_eq!(map.schema, "db1");
        assert_eq!(map.table, "orders");
        assert_eq!(map.column_meta, vec![0, 64, (10 << 8) | 2, (247 << 8) | 1]);
        assert_eq!(map.null_bitmap, vec![0b0000_1110]);
    }

    #[test]
    fn test_parse_rows_header_v2_update() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0x2a, 0, 0, 0, 0, 0]);
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        data.push(2);
        data.push(0b11);
        data.push(0b10);
        let header = BinlogParser::parse_rows_header(&data, EventType::UpdateRowsV2).unwrap();
        assert_eq!(header.table_id, 42);
        assert_eq!(header.column_count, 2);
        assert_eq!(header.present, vec![0b11]);
        assert_eq!(header.present_after, Some(vec![0b10]));
        assert_eq!(header.body_offset, data.len());
    }

    #[test]
    fn test_format_description_checksum() {
        let mut data = Vec::new();
        data.extend_from_slice(&4u16.to_le_bytes());
        let mut version = [0u8; 50];
        version[..6].copy_from_slice(b"8.0.35");
        data.extend_from_slice(&version);
        data.extend_from_slice(&0u32.to_le_bytes());
        data.push(19);
        data.extend_from_slice(&[0u8; 40]);
        data.push(1);
        data.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        let fde = BinlogParser::parse_format_description(&data, true).unwrap();
        assert_eq!(fde.server_version, "8.0.35");
        assert_eq!(fde.checksum_alg, 1);
        assert_eq!(
            BinlogParser::strip_checksum(&data, true).len(),
            data.len() - CHECKSUM_LEN
        );

        // a replication stream delivers the same event without its CRC32
        let stripped = &data[..data.len() - CHECKSUM_LEN];
        let fde = BinlogParser::parse_format_description(stripped, false).unwrap();
        assert_eq!(fde.checksum_alg, 1);
    }

    #[test]
    fn test_read_lcb() {
        let data = [0xfc, 0x10, 0x01];
        let mut cursor = Cursor::new(&data[..]);
        assert_eq!(read_lcb(&mut cursor).unwrap(), 0x110);
        let data = [0xff];
        let mut cursor = Cursor::new(&data[..]);
        assert!(read_lcb(&mut cursor).is_err());
    }
}
