//! Binlog event types and decoded payload structures

use crate::value::Row;
use serde::{Deserialize, Serialize};

/// Binlog event type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    Unknown = 0,
    StartV3 = 1,
    Query = 2,
    Stop = 3,
    Rotate = 4,
    Intvar = 5,
    Rand = 13,
    UserVar = 14,
    FormatDescription = 15,
    Xid = 16,
    BeginLoadQuery = 17,
    ExecuteLoadQuery = 18,
    TableMap = 19,
    WriteRowsV1 = 23,
    UpdateRowsV1 = 24,
    DeleteRowsV1 = 25,
    Incident = 26,
    Heartbeat = 27,
    Ignorable = 28,
    RowsQuery = 29,
    WriteRowsV2 = 30,
    UpdateRowsV2 = 31,
    DeleteRowsV2 = 32,
    Gtid = 33,
    AnonymousGtid = 34,
    PreviousGtids = 35,
    TransactionContext = 36,
    ViewChange = 37,
    XaPrepare = 38,
    PartialUpdateRows = 39,
    TransactionPayload = 40,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => EventType::StartV3,
            2 => EventType::Query,
            3 => EventType::Stop,
            4 => EventType::Rotate,
            5 => EventType::Intvar,
            13 => EventType::Rand,
            14 => EventType::UserVar,
            15 => EventType::FormatDescription,
            16 => EventType::Xid,
            17 => EventType::BeginLoadQuery,
            18 => EventType::ExecuteLoadQuery,
            19 => EventType::TableMap,
            23 => EventType::WriteRowsV1,
            24 => EventType::UpdateRowsV1,
            25 => EventType::DeleteRowsV1,
            26 => EventType::Incident,
            27 => EventType::Heartbeat,
            28 => EventType::Ignorable,
            29 => EventType::RowsQuery,
            30 => EventType::WriteRowsV2,
            31 => EventType::UpdateRowsV2,
            32 => EventType::DeleteRowsV2,
            33 => EventType::Gtid,
            34 => EventType::AnonymousGtid,
            35 => EventType::PreviousGtids,
            36 => EventType::TransactionContext,
            37 => EventType::ViewChange,
            38 => EventType::XaPrepare,
            39 => EventType::PartialUpdateRows,
            40 => EventType::TransactionPayload,
            _ => EventType::Unknown,
        }
    }

    pub fn is_row_event(&self) -> bool {
        self.row_kind().is_some()
    }

    /// Row events of format v2 carry an extra-data block after the flags.
    pub fn is_v2_rows(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsV2 | EventType::UpdateRowsV2 | EventType::DeleteRowsV2
        )
    }

    pub fn row_kind(&self) -> Option<RowKind> {
        match self {
            EventType::WriteRowsV1 | EventType::WriteRowsV2 => Some(RowKind::Write),
            EventType::UpdateRowsV1 | EventType::UpdateRowsV2 => Some(RowKind::Update),
            EventType::DeleteRowsV1 | EventType::DeleteRowsV2 => Some(RowKind::Delete),
            _ => None,
        }
    }
}

/// Which statement family a row event produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowKind {
    Write,
    Update,
    Delete,
}

impl RowKind {
    /// The SQL verb used by `sql_type` filtering.
    pub fn as_str(&self) -> &'static str {
        match self {
            RowKind::Write => "INSERT",
            RowKind::Update => "UPDATE",
            RowKind::Delete => "DELETE",
        }
    }
}

/// MySQL column types as they appear in a table map event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    NewDate = 14,
    Varchar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    pub fn from_u8(value: u8) -> Option<Self> {
        let ty = match value {
            0 => ColumnType::Decimal,
            1 => ColumnType::Tiny,
            2 => ColumnType::Short,
            3 => ColumnType::Long,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            6 => ColumnType::Null,
            7 => ColumnType::Timestamp,
            8 => ColumnType::LongLong,
            9 => ColumnType::Int24,
            10 => ColumnType::Date,
            11 => ColumnType::Time,
            12 => ColumnType::DateTime,
            13 => ColumnType::Year,
            14 => ColumnType::NewDate,
            15 => ColumnType::Varchar,
            16 => ColumnType::Bit,
            17 => ColumnType::Timestamp2,
            18 => ColumnType::DateTime2,
            19 => ColumnType::Time2,
            245 => ColumnType::Json,
            246 => ColumnType::NewDecimal,
            247 => ColumnType::Enum,
            248 => ColumnType::Set,
            249 => ColumnType::TinyBlob,
            250 => ColumnType::MediumBlob,
            251 => ColumnType::LongBlob,
            252 => ColumnType::Blob,
            253 => ColumnType::VarString,
            254 => ColumnType::String,
            255 => ColumnType::Geometry,
            _ => return None,
        };
        Some(ty)
    }
}

/// Fixed 19-byte event header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// Seconds since the Unix epoch
    pub timestamp: u32,
    pub event_type: EventType,
    pub type_code: u8,
    pub server_id: u32,
    /// Total event size including header (and checksum, if any)
    pub event_length: u32,
    /// Position immediately following this event
    pub log_pos: u32,
    pub flags: u16,
}

impl EventHeader {
    pub const SIZE: usize = 19;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatDescriptionData {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub header_length: u8,
    /// 0 = NONE, 1 = CRC32
    pub checksum_alg: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateEventData {
    pub next_binlog: String,
    pub position: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEventData {
    pub thread_id: u32,
    pub exec_time: u32,
    pub error_code: u16,
    pub schema: String,
    pub query: String,
}

impl QueryEventData {
    pub fn is_begin(&self) -> bool {
        self.query == "BEGIN"
    }

    pub fn is_commit(&self) -> bool {
        self.query == "COMMIT"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GtidEventData {
    pub flags: u8,
    pub uuid: String,
    pub gno: u64,
}

impl GtidEventData {
    /// `uuid:gno`
    pub fn gtid(&self) -> String {
        format!("{}:{}", self.uuid, self.gno)
    }
}

/// Table map as carried in the binlog itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMapData {
    pub table_id: u64,
    pub schema: String,
    pub table: String,
    pub column_types: Vec<u8>,
    pub column_meta: Vec<u16>,
    pub null_bitmap: Vec<u8>,
}

/// Fully decoded row event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowsEventData {
    pub kind: RowKind,
    pub table_id: u64,
    pub schema: String,
    pub table: String,
    pub primary_key: Vec<String>,
    pub rows: Vec<RowChange>,
}

/// One affected row.
///
/// Write and Delete carry a single image; Update carries before/after images
/// with identical key sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowChange {
    Values(Row),
    Update { before: Row, after: Row },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XidEventData {
    pub xid: u64,
}

/// Decoded binlog event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogEvent {
    Rotate(RotateEventData),
    FormatDescription(FormatDescriptionData),
    Query(QueryEventData),
    Gtid(GtidEventData),
    TableMap(TableMapData),
    WriteRows(RowsEventData),
    UpdateRows(RowsEventData),
    DeleteRows(RowsEventData),
    Xid(XidEventData),
    Heartbeat,
    /// Row event for a table excluded by the schema filter
    Skipped(u64),
    Unimplemented(EventType),
}

impl LogEvent {
    pub fn rows(&self) -> Option<&RowsEventData> {
        match self {
            LogEvent::WriteRows(data) | LogEvent::UpdateRows(data) | LogEvent::DeleteRows(data) => {
                Some(data)
            }
            _ => None,
        }
    }
}

/// Event header plus decoded payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinlogEvent {
    pub header: EventHeader,
    pub data: LogEvent,
}

impl BinlogEvent {
    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    pub fn log_pos(&self) -> u64 {
        self.header.log_pos as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_from_u8() {
        assert_eq!(EventType::from_u8(15), EventType::FormatDescription);
        assert_eq!(EventType::from_u8(19), EventType::TableMap);
        assert_eq!(EventType::from_u8(30), EventType::WriteRowsV2);
        assert_eq!(EventType::from_u8(24), EventType::UpdateRowsV1);
        assert_eq!(EventType::from_u8(200), EventType::Unknown);
    }

    #[test]
    fn test_row_kind() {
        assert_eq!(EventType::WriteRowsV1.row_kind(), Some(RowKind::Write));
        assert_eq!(EventType::UpdateRowsV2.row_kind(), Some(RowKind::Update));
        assert_eq!(EventType::DeleteRowsV2.row_kind(), Some(RowKind::Delete));
        assert!(!EventType::Query.is_row_event());
        assert!(EventType::DeleteRowsV2.is_v2_rows());
        assert!(!EventType::DeleteRowsV1.is_v2_rows());
    }

    #[test]
    fn test_column_type_from_u8() {
        assert_eq!(ColumnType::from_u8(3), Some(ColumnType::Long));
        assert_eq!(ColumnType::from_u8(245), Some(ColumnType::Json));
        assert_eq!(ColumnType::from_u8(100), None);
    }
}
