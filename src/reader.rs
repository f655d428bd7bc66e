//! Binlog frame reader
//!
//! Reads framed events from any async byte source (a binlog file on disk
//! or an already framed replication stream), strips checksums and turns
//! payloads into typed [`BinlogEvent`]s. Row images are decoded here using
//! the session's table metadata cache.

use crate::binlog::{BinlogParser, BINLOG_MAGIC};
use crate::error::{Binlog2SqlError, Result};
use crate::events::*;
use crate::filter::SchemaFilter;
use crate::offset::FIRST_EVENT_POSITION;
use crate::rows::decode_rows;
use crate::table_map::{Catalog, TableMetadataCache};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace, warn};

/// Largest event the server can write (`max_allowed_packet` ceiling)
pub const MAX_EVENT_SIZE: u32 = 1 << 30;

/// One undecoded event
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub header: EventHeader,
    /// Payload with any checksum still attached
    pub payload: Vec<u8>,
    /// Byte offset of the header in the source
    pub start: u64,
}

pub struct BinlogReader<R> {
    source: R,
    /// Whether payloads end with a CRC32; refreshed by every format description
    checksum: bool,
    /// Frames arrive with their checksums already removed
    stripped: bool,
    offset: u64,
    schema_filter: SchemaFilter,
}

impl<R: AsyncRead + Unpin> BinlogReader<R> {
    /// Open a binlog file, validating its magic
    pub async fn open(mut source: R, checksum: bool) -> Result<Self> {
        let mut magic = [0u8; 4];
        source.read_exact(&mut magic).await.map_err(|e| {
            Binlog2SqlError::malformed(0, format!("unable to read magic: {}", e))
        })?;
        BinlogParser::verify_magic(&magic)?;
        Ok(Self::new(source, checksum, false))
    }

    /// Replication stream positioned at the first event (no magic). Frames
    /// carry no checksum whatever the format description announces.
    pub fn framed(source: R) -> Self {
        Self::new(source, false, true)
    }

    fn new(source: R, checksum: bool, stripped: bool) -> Self {
        BinlogReader {
            source,
            checksum,
            stripped,
            offset: FIRST_EVENT_POSITION,
            schema_filter: SchemaFilter::default(),
        }
    }

    pub fn with_schema_filter(mut self, filter: SchemaFilter) -> Self {
        self.schema_filter = filter;
        self
    }

    pub fn checksum(&self) -> bool {
        self.checksum
    }

    /// Byte offset of the next frame
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next raw frame; `None` at end of stream
    pub async fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        let start = self.offset;
        let mut header_bytes = [0u8; EventHeader::SIZE];
        let read = read_fully(&mut self.source, &mut header_bytes).await?;
        if read < EventHeader::SIZE {
            if read > 0 {
                debug!("Ignoring {} trailing bytes at position {}", read, start);
            }
            return Ok(None);
        }

        let header = BinlogParser::parse_header(&header_bytes)
            .map_err(|e| Binlog2SqlError::malformed(start, e.to_string()))?;
        if header.event_length > MAX_EVENT_SIZE {
            return Err(Binlog2SqlError::malformed(
                start,
                format!(
                    "event size {} exceeds the {} byte limit",
                    header.event_length, MAX_EVENT_SIZE
                ),
            ));
        }

        let mut payload = vec![0u8; header.event_length as usize - EventHeader::SIZE];
        let read = read_fully(&mut self.source, &mut payload).await?;
        if read < payload.len() {
            return Err(Binlog2SqlError::malformed(
                start,
                format!(
                    "event truncated: expected {} payload bytes, got {}",
                    payload.len(),
                    read
                ),
            ));
        }

        self.offset += header.event_length as u64;
        trace!(
            "Frame {:?} at {} (length {}, next {})",
            header.event_type,
            start,
            header.event_length,
            header.log_pos
        );
        Ok(Some(RawFrame {
            header,
            payload,
            start,
        }))
    }

    /// Next decoded event; `None` at end of stream.
    ///
    /// Row events whose table is filtered out, or whose metadata cannot be
    /// resolved, come back as [`LogEvent::Skipped`].
    pub async fn next_event(
        &mut self,
        cache: &mut TableMetadataCache,
        catalog: &mut dyn Catalog,
    ) -> Result<Option<BinlogEvent>> {
        let frame = match self.next_frame().await? {
            Some(frame) => frame,
            None => return Ok(None),
        };
        let data = self.decode(frame, cache, catalog).await?;
        Ok(Some(data))
    }

    async fn decode(
        &mut self,
        frame: RawFrame,
        cache: &mut TableMetadataCache,
        catalog: &mut dyn Catalog,
    ) -> Result<BinlogEvent> {
        let RawFrame {
            header,
            payload,
            start,
        } = frame;

        if header.event_type == EventType::FormatDescription {
            let fde = BinlogParser::parse_format_description(&payload, !self.stripped)
                .map_err(|e| at(start, e))?;
            let checksum = fde.checksum_alg == 1 && !self.stripped;
            if checksum != self.checksum {
                debug!(
                    "Format description from {} sets checksum {}",
                    fde.server_version, checksum
                );
            }
            self.checksum = checksum;
            return Ok(BinlogEvent {
                header,
                data: LogEvent::FormatDescription(fde),
            });
        }

        let body = BinlogParser::strip_checksum(&payload, self.checksum);
        let data = match header.event_type {
            EventType::Rotate => {
                let rotate = BinlogParser::parse_rotate(body).map_err(|e| at(start, e))?;
                cache.invalidate();
                debug!("Rotate to {}:{}", rotate.next_binlog, rotate.position);
                LogEvent::Rotate(rotate)
            }
            EventType::Query => {
                LogEvent::Query(BinlogParser::parse_query(body).map_err(|e| at(start, e))?)
            }
            EventType::Gtid => {
                LogEvent::Gtid(BinlogParser::parse_gtid(body).map_err(|e| at(start, e))?)
            }
            EventType::TableMap => {
                let map = BinlogParser::parse_table_map(body).map_err(|e| at(start, e))?;
                cache.observe(map.clone());
                LogEvent::TableMap(map)
            }
            EventType::Xid => {
                LogEvent::Xid(BinlogParser::parse_xid(body).map_err(|e| at(start, e))?)
            }
            EventType::Heartbeat => LogEvent::Heartbeat,
            t if t.is_row_event() => self.decode_rows(t, body, start, cache, catalog).await?,
            other => LogEvent::Unimplemented(other),
        };

        Ok(BinlogEvent { header, data })
    }

    async fn decode_rows(
        &self,
        event_type: EventType,
        body: &[u8],
        start: u64,
        cache: &mut TableMetadataCache,
        catalog: &mut dyn Catalog,
    ) -> Result<LogEvent> {
        let kind = event_type
            .row_kind()
            .ok_or_else(|| Binlog2SqlError::parse(start, "row event without a kind"))?;
        let rows_header =
            BinlogParser::parse_rows_header(body, event_type).map_err(|e| at(start, e))?;

        if let Some((schema, table)) = cache.table_name(rows_header.table_id) {
            if !self.schema_filter.is_wanted(schema, table) {
                trace!("Skipping rows for filtered table {}.{}", schema, table);
                return Ok(LogEvent::Skipped(rows_header.table_id));
            }
        }

        let entry = match cache.resolve(rows_header.table_id, catalog, start).await? {
            Some(entry) => entry,
            None => return Ok(LogEvent::Skipped(rows_header.table_id)),
        };

        let rows = decode_rows(&rows_header, body, entry, kind).map_err(|e| at(start, e))?;
        let data = RowsEventData {
            kind,
            table_id: entry.table_id,
            schema: entry.schema.clone(),
            table: entry.table.clone(),
            primary_key: entry.primary_key.clone(),
            rows,
        };

        Ok(match kind {
            RowKind::Write => LogEvent::WriteRows(data),
            RowKind::Update => LogEvent::UpdateRows(data),
            RowKind::Delete => LogEvent::DeleteRows(data),
        })
    }
}

/// Read until the buffer is full or the source is exhausted
async fn read_fully<R: AsyncRead + Unpin>(source: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Attach the event position to payload decoding errors
fn at(position: u64, err: Binlog2SqlError) -> Binlog2SqlError {
    match err {
        Binlog2SqlError::Other(reason) | Binlog2SqlError::IoError(reason) => {
            Binlog2SqlError::parse(position, reason)
        }
        other => other,
    }
}

/// Start-of-transaction and last-event positions for provenance comments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionTracker {
    /// Position preceding the current transaction's `BEGIN`
    pub start_pos: u64,
    /// End position of the last event seen
    pub last_pos: u64,
}

impl PositionTracker {
    pub fn new(position: u64) -> Self {
        PositionTracker {
            start_pos: position,
            last_pos: position,
        }
    }

    /// Call before the event's statements are generated
    pub fn begin(&mut self, event: &BinlogEvent) {
        if let LogEvent::Query(ref q) = event.data {
            if q.is_begin() {
                self.start_pos = self.last_pos;
            }
        }
    }

    /// Call once the event has been handled (or skipped)
    pub fn advance(&mut self, event: &BinlogEvent) {
        match event.data {
            LogEvent::Rotate(_) | LogEvent::FormatDescription(_) => {}
            _ => {
                if event.log_pos() > 0 {
                    self.last_pos = event.log_pos();
                } else {
                    warn!("Event {:?} carries no log position", event.header.event_type);
                }
            }
        }
    }
}
