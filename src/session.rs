//! Decoding session
//!
//! A [`DecoderSession`] owns everything that lives across events: the table
//! metadata cache, GTID state, the flashback spool and the checkpoint. It
//! pulls events from a [`BinlogReader`], applies the position/time windows
//! and filters, renders statements and hands them to a [`Sink`].

use crate::error::{Binlog2SqlError, Result};
use crate::events::{BinlogEvent, GtidEventData, LogEvent, RowKind};
use crate::filter::SchemaFilter;
use crate::gtid::{GtidFilter, MaxPending};
use crate::offset::{BinlogPosition, Checkpoint, FIRST_EVENT_POSITION};
use crate::output::Sink;
use crate::reader::{BinlogReader, PositionTracker};
use crate::reversal::{sort_file, SortMode, Spool, TempFile, DEFAULT_CHUNK_SIZE};
use crate::sql::{without_comment, ReconstructedStatement, SqlGenerator, SqlOptions};
use crate::table_map::{Catalog, TableMetadataCache};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, info, trace, warn};

/// Cooperative cancellation, checked between events
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Byte range of one binlog file to decode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionWindow {
    pub start_pos: u64,
    /// Last event end position to include
    pub stop_pos: Option<u64>,
}

impl Default for PositionWindow {
    fn default() -> Self {
        PositionWindow {
            start_pos: FIRST_EVENT_POSITION,
            stop_pos: None,
        }
    }
}

/// Why a run ended early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    StopPosition,
    StopTime,
    /// Every transaction the GTID include set asks for has been seen
    GtidExhausted,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    EndOfLog,
    Stopped(StopReason),
}

impl RunOutcome {
    /// Whether later files should still be read
    pub fn should_continue(&self) -> bool {
        matches!(self, RunOutcome::EndOfLog)
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Unix seconds; earlier events are skipped
    pub start_time: Option<i64>,
    /// Unix seconds; the run ends at the first event at or after it
    pub stop_time: Option<i64>,
    pub sql_types: HashSet<RowKind>,
    /// Suppress query (DDL) output
    pub only_dml: bool,
    pub schema_filter: SchemaFilter,
    pub gtid_filter: GtidFilter,
    pub fail_on_unavailable: bool,
    pub sort_mode: SortMode,
    pub chunk_size: usize,
    /// Where the spool and reversal chunks live
    pub work_dir: PathBuf,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            start_time: None,
            stop_time: None,
            sql_types: [RowKind::Write, RowKind::Update, RowKind::Delete]
                .into_iter()
                .collect(),
            only_dml: false,
            schema_filter: SchemaFilter::default(),
            gtid_filter: GtidFilter::default(),
            fail_on_unavailable: false,
            sort_mode: SortMode::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            work_dir: std::env::temp_dir(),
        }
    }
}

pub struct DecoderSession {
    options: SessionOptions,
    generator: SqlGenerator,
    /// Comment toggle as requested; flashback keeps comments in the spool
    need_comment: bool,
    cache: TableMetadataCache,
    max_pending: Option<MaxPending>,
    checkpoint: Checkpoint,
    stop: StopSignal,
    spool: Option<Spool>,
    checksum_hint: Option<bool>,
    /// GTID of the current transaction
    gtid: Option<String>,
    gtid_wanted: bool,
}

impl DecoderSession {
    pub fn new(options: SessionOptions, mut sql: SqlOptions) -> Result<Self> {
        let need_comment = sql.need_comment;
        if sql.flashback {
            // sort_by_time reads the time back from the comment
            sql.need_comment = true;
        }
        let generator = SqlGenerator::new(sql)?;
        let cache = TableMetadataCache::new(
            generator.options().ignore_virtual_columns,
            options.fail_on_unavailable,
        );
        let max_pending = if options.gtid_filter.include.is_empty() {
            None
        } else {
            Some(MaxPending::from_include(&options.gtid_filter.include))
        };
        let gtid_wanted = options.gtid_filter.wants_unknown();

        Ok(DecoderSession {
            options,
            generator,
            need_comment,
            cache,
            max_pending,
            checkpoint: Checkpoint::new(),
            stop: StopSignal::new(),
            spool: None,
            checksum_hint: None,
            gtid: None,
            gtid_wanted,
        })
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint.clone()
    }

    pub fn is_flashback(&self) -> bool {
        self.generator.options().flashback
    }

    /// Decode a binlog file (starting with the magic header)
    pub async fn run_file<R: AsyncRead + Unpin>(
        &mut self,
        filename: &str,
        source: R,
        window: PositionWindow,
        catalog: &mut dyn Catalog,
        sink: &mut dyn Sink,
    ) -> Result<RunOutcome> {
        let checksum = self.checksum_hint(catalog).await;
        let reader = BinlogReader::open(source, checksum)
            .await?
            .with_schema_filter(self.options.schema_filter.clone());
        self.process(filename, reader, window, catalog, sink).await
    }

    /// Decode an already framed event stream whose checksums were removed
    /// upstream
    pub async fn run_stream<R: AsyncRead + Unpin>(
        &mut self,
        filename: &str,
        source: R,
        window: PositionWindow,
        catalog: &mut dyn Catalog,
        sink: &mut dyn Sink,
    ) -> Result<RunOutcome> {
        let reader = BinlogReader::framed(source)
            .with_schema_filter(self.options.schema_filter.clone());
        self.process(filename, reader, window, catalog, sink).await
    }

    async fn checksum_hint(&mut self, catalog: &mut dyn Catalog) -> bool {
        if let Some(checksum) = self.checksum_hint {
            return checksum;
        }
        let checksum = match catalog.checksum_enabled().await {
            Ok(checksum) => checksum,
            Err(e) => {
                warn!("Unable to query binlog checksum setting: {}", e);
                false
            }
        };
        self.checksum_hint = Some(checksum);
        checksum
    }

    async fn process<R: AsyncRead + Unpin>(
        &mut self,
        filename: &str,
        mut reader: BinlogReader<R>,
        window: PositionWindow,
        catalog: &mut dyn Catalog,
        sink: &mut dyn Sink,
    ) -> Result<RunOutcome> {
        info!("Decoding {} from position {}", filename, window.start_pos);
        let mut tracker = PositionTracker::new(window.start_pos);

        loop {
            if self.stop.is_stopped() {
                info!("Stop requested at {}:{}", filename, tracker.last_pos);
                return Ok(RunOutcome::Stopped(StopReason::Cancelled));
            }

            let event = match reader.next_event(&mut self.cache, catalog).await? {
                Some(event) => event,
                None => break,
            };
            self.checkpoint.update(|s| s.events += 1);

            let log_pos = event.log_pos();
            if let Some(stop_pos) = window.stop_pos {
                if log_pos > stop_pos {
                    info!("Reached stop position {} in {}", stop_pos, filename);
                    return Ok(RunOutcome::Stopped(StopReason::StopPosition));
                }
            }

            let frame_start = log_pos.saturating_sub(event.header.event_length as u64);
            if log_pos > 0 && frame_start < window.start_pos && !is_structural(&event) {
                trace!("Skipping {:?} before start position", event.header.event_type);
                continue;
            }

            let timestamp = event.timestamp() as i64;
            if let Some(start_time) = self.options.start_time {
                if timestamp < start_time {
                    tracker.advance(&event);
                    continue;
                }
            }
            if let Some(stop_time) = self.options.stop_time {
                if timestamp >= stop_time {
                    info!("Reached stop time at {}:{}", filename, tracker.last_pos);
                    return Ok(RunOutcome::Stopped(StopReason::StopTime));
                }
            }

            tracker.begin(&event);
            if let LogEvent::Gtid(ref gtid) = event.data {
                if self.on_gtid(gtid) {
                    return Ok(RunOutcome::Stopped(StopReason::GtidExhausted));
                }
            }
            self.handle(&event, tracker.start_pos, sink).await?;
            tracker.advance(&event);

            let position = BinlogPosition::new(filename.to_string(), tracker.last_pos);
            self.checkpoint.update(|s| s.position = Some(position));

            if let Some(stop_pos) = window.stop_pos {
                if log_pos >= stop_pos {
                    info!("Reached stop position {} in {}", stop_pos, filename);
                    return Ok(RunOutcome::Stopped(StopReason::StopPosition));
                }
            }
        }

        debug!("End of {} at position {}", filename, reader.offset());
        Ok(RunOutcome::EndOfLog)
    }

    /// Track the transaction's GTID; true once nothing more is wanted
    fn on_gtid(&mut self, gtid: &GtidEventData) -> bool {
        if let Some(ref mut pending) = self.max_pending {
            pending.observe(&gtid.uuid, gtid.gno);
            if pending.is_exhausted() {
                info!("All requested GTIDs seen, stopping at {}", gtid.gtid());
                return true;
            }
        }

        self.gtid_wanted = self.options.gtid_filter.is_wanted(&gtid.uuid, gtid.gno);
        if !self.gtid_wanted {
            debug!("Skipping transaction {}", gtid.gtid());
        }
        self.checkpoint
            .update(|s| s.gtid_set.add(&gtid.uuid, gtid.gno));
        self.gtid = Some(gtid.gtid());
        false
    }

    async fn handle(&mut self, event: &BinlogEvent, start_pos: u64, sink: &mut dyn Sink) -> Result<()> {
        let wanted = match &event.data {
            LogEvent::WriteRows(rows) | LogEvent::UpdateRows(rows) | LogEvent::DeleteRows(rows) => {
                self.options.sql_types.contains(&rows.kind)
            }
            LogEvent::Query(query) => {
                !self.options.only_dml
                    && !query.is_begin()
                    && !query.is_commit()
                    && (query.schema.is_empty()
                        || self.options.schema_filter.is_schema_wanted(&query.schema))
            }
            LogEvent::Skipped(table_id) => {
                trace!("Row event for table id {} skipped", table_id);
                false
            }
            _ => false,
        };
        if !wanted || !self.gtid_wanted {
            return Ok(());
        }

        let statements = self
            .generator
            .statements(event, start_pos, self.gtid.as_deref())?;
        for statement in statements {
            self.output(statement, sink).await?;
        }
        Ok(())
    }

    async fn output(&mut self, statement: ReconstructedStatement, sink: &mut dyn Sink) -> Result<()> {
        if self.is_flashback() {
            if self.spool.is_none() {
                self.spool = Some(Spool::create(&self.options.work_dir).await?);
            }
            if let Some(ref mut spool) = self.spool {
                spool.push(&statement.sql).await?;
            }
        } else {
            sink.emit(&statement).await?;
        }
        self.checkpoint.update(|s| s.statements += 1);
        Ok(())
    }

    /// Emit any spooled flashback statements newest-first, then finalize
    /// the sink
    pub async fn finish(&mut self, sink: &mut dyn Sink) -> Result<()> {
        if let Some(mut spool) = self.spool.take() {
            spool.finish().await?;
            info!("Reordering {} flashback statements", spool.lines());

            let reordered = TempFile::new_in(&self.options.work_dir, "flashback");
            let input = spool.path().to_path_buf();
            let output = reordered.path().to_path_buf();
            let mode = self.options.sort_mode;
            let chunk_size = self.options.chunk_size;
            let work_dir = self.options.work_dir.clone();
            tokio::task::spawn_blocking(move || {
                sort_file(mode, &input, &output, chunk_size, &work_dir)
            })
            .await
            .map_err(|e| Binlog2SqlError::Other(format!("flashback reordering failed: {}", e)))??;

            let file = tokio::fs::File::open(reordered.path()).await?;
            let mut lines = BufReader::new(file).lines();
            while let Some(line) = lines.next_line().await? {
                let text = if self.need_comment {
                    line.as_str()
                } else {
                    without_comment(&line)
                };
                sink.emit(&ReconstructedStatement::from_line(text)).await?;
            }
        }
        sink.finish().await
    }
}

/// Events the reader needs regardless of the start position
fn is_structural(event: &BinlogEvent) -> bool {
    matches!(
        event.data,
        LogEvent::FormatDescription(_) | LogEvent::Rotate(_) | LogEvent::TableMap(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset::Provenance;
    use crate::output::MemorySink;
    use crate::reader::fixtures::*;
    use crate::table_map::memory::MemoryCatalog;
    use std::io::Cursor;

    fn catalog() -> MemoryCatalog {
        MemoryCatalog::default().with_table("db1", "orders", orders_columns())
    }

    // runs may stop early, so no mock that insists on being drained
    fn source(bytes: &[u8]) -> Cursor<Vec<u8>> {
        Cursor::new(bytes.to_vec())
    }

    async fn run(
        options: SessionOptions,
        sql: SqlOptions,
        bytes: Vec<u8>,
        window: PositionWindow,
    ) -> (RunOutcome, MemorySink) {
        let mut session = DecoderSession::new(options, sql).unwrap();
        let mut sink = MemorySink::default();
        let outcome = session
            .run_file("mysql-bin.000001", source(&bytes), window, &mut catalog(), &mut sink)
            .await
            .unwrap();
        session.finish(&mut sink).await.unwrap();
        (outcome, sink)
    }

    fn three_orders() -> Vec<u8> {
        LogBuilder::new(false)
            .fde(100)
            .insert_txn(200, 1, 1, "a")
            .insert_txn(300, 2, 2, "b")
            .insert_txn(400, 3, 3, "c")
            .build()
    }

    fn quiet() -> SqlOptions {
        SqlOptions {
            need_comment: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_forward_run() {
        let sql = SqlOptions {
            need_comment: true,
            ..Default::default()
        };
        let (outcome, sink) = run(SessionOptions::default(), sql, three_orders(), PositionWindow::default()).await;
        assert_eq!(outcome, RunOutcome::EndOfLog);
        assert!(sink.finished);
        assert_eq!(sink.statements.len(), 3);
        assert!(sink.lines()[0]
            .starts_with("INSERT INTO `db1`.`orders`(`id`,`status`) VALUES (1,'a'); #start "));
        assert_eq!(sink.statements[0].qualified_name().as_deref(), Some("db1.orders"));

        let provenance = Provenance::parse(sink.lines()[1]).unwrap();
        assert_eq!(provenance.gtid, Some(format!("{}:2", UUID)));
        assert!(provenance.start < provenance.end);
    }

    #[tokio::test]
    async fn test_stream_run_from_checksum_server() {
        let bytes = LogBuilder::stream()
            .fde(100)
            .query(150, "db1", "ALTER TABLE orders ADD note TEXT")
            .insert_txn(200, 1, 1, "a")
            .build();
        let mut catalog = catalog();
        catalog.checksum = true;
        let mut session = DecoderSession::new(SessionOptions::default(), quiet()).unwrap();
        let mut sink = MemorySink::default();
        let outcome = session
            .run_stream("mysql-bin.000001", source(&bytes), PositionWindow::default(), &mut catalog, &mut sink)
            .await
            .unwrap();
        session.finish(&mut sink).await.unwrap();

        assert_eq!(outcome, RunOutcome::EndOfLog);
        assert_eq!(
            sink.lines(),
            vec![
                "USE db1;\nALTER TABLE orders ADD note TEXT;",
                "INSERT INTO `db1`.`orders`(`id`,`status`) VALUES (1,'a');",
            ]
        );
        // stream offsets start after the 4 byte magic the stream does not carry
        assert_eq!(
            session.checkpoint().snapshot().position,
            Some(BinlogPosition::new("mysql-bin.000001".to_string(), bytes.len() as u64 + 4))
        );
    }

    #[tokio::test]
    async fn test_flashback_run_is_reversed() {
        let bytes = LogBuilder::new(true)
            .fde(100)
            .insert_txn(200, 1, 1, "a")
            .insert_txn(300, 2, 2, "b")
            .gtid(400, 3)
            .query(400, "db1", "BEGIN")
            .orders_map(400)
            .update(400, 2, "b", "z")
            .xid(400)
            .build();
        let dir = tempfile::tempdir().unwrap();
        let options = SessionOptions {
            work_dir: dir.path().to_path_buf(),
            chunk_size: 2,
            ..Default::default()
        };
        let sql = SqlOptions {
            flashback: true,
            ..quiet()
        };
        let (_, sink) = run(options, sql, bytes, PositionWindow::default()).await;
        assert_eq!(
            sink.lines(),
            vec![
                "UPDATE `db1`.`orders` SET `id`=2, `status`='b' WHERE `id`=2 AND `status`='z' LIMIT 1;",
                "DELETE FROM `db1`.`orders` WHERE `id`=2 AND `status`='b' LIMIT 1;",
                "DELETE FROM `db1`.`orders` WHERE `id`=1 AND `status`='a' LIMIT 1;",
            ]
        );
        assert_eq!(sink.statements[0].qualified_name().as_deref(), Some("db1.orders"));
        assert!(sink.finished);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_flashback_skips_queries() {
        let bytes = LogBuilder::new(false)
            .fde(100)
            .query(150, "db1", "CREATE TABLE t (id int)")
            .insert_txn(200, 1, 1, "a")
            .build();
        let dir = tempfile::tempdir().unwrap();
        let options = SessionOptions {
            work_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let sql = SqlOptions {
            flashback: true,
            ..quiet()
        };
        let (_, sink) = run(options, sql, bytes, PositionWindow::default()).await;
        assert_eq!(
            sink.lines(),
            vec!["DELETE FROM `db1`.`orders` WHERE `id`=1 AND `status`='a' LIMIT 1;"]
        );
    }

    #[tokio::test]
    async fn test_gtid_include_and_early_stop() {
        let options = SessionOptions {
            gtid_filter: GtidFilter::new(Some(&format!("{}:2", UUID)), None).unwrap(),
            ..Default::default()
        };
        let (outcome, sink) = run(options, quiet(), three_orders(), PositionWindow::default()).await;
        assert_eq!(outcome, RunOutcome::Stopped(StopReason::GtidExhausted));
        assert_eq!(
            sink.lines(),
            vec!["INSERT INTO `db1`.`orders`(`id`,`status`) VALUES (2,'b');"]
        );
    }

    #[tokio::test]
    async fn test_gtid_exclude() {
        let options = SessionOptions {
            gtid_filter: GtidFilter::new(None, Some(&format!("{}:1-2", UUID))).unwrap(),
            ..Default::default()
        };
        let (outcome, sink) = run(options, quiet(), three_orders(), PositionWindow::default()).await;
        assert_eq!(outcome, RunOutcome::EndOfLog);
        assert_eq!(
            sink.lines(),
            vec!["INSERT INTO `db1`.`orders`(`id`,`status`) VALUES (3,'c');"]
        );
    }

    #[tokio::test]
    async fn test_position_window() {
        let sql = SqlOptions {
            need_comment: true,
            ..Default::default()
        };
        let (_, all) = run(SessionOptions::default(), sql.clone(), three_orders(), PositionWindow::default()).await;
        let first = Provenance::parse(all.lines()[0]).unwrap();
        let second = Provenance::parse(all.lines()[1]).unwrap();

        // stop right after the first insert
        let window = PositionWindow {
            start_pos: FIRST_EVENT_POSITION,
            stop_pos: Some(first.end),
        };
        let (outcome, sink) = run(SessionOptions::default(), sql.clone(), three_orders(), window).await;
        assert_eq!(outcome, RunOutcome::Stopped(StopReason::StopPosition));
        assert_eq!(sink.statements.len(), 1);

        // start at the second transaction
        let window = PositionWindow {
            start_pos: second.start,
            stop_pos: None,
        };
        let (outcome, sink) = run(SessionOptions::default(), sql, three_orders(), window).await;
        assert_eq!(outcome, RunOutcome::EndOfLog);
        assert_eq!(sink.statements.len(), 2);
        // the GTID event precedes the window, so only positions carry over
        let resumed = Provenance::parse(sink.lines()[0]).unwrap();
        assert_eq!((resumed.start, resumed.end), (second.start, second.end));
        assert_eq!(resumed.gtid, None);
    }

    #[tokio::test]
    async fn test_time_window() {
        let options = SessionOptions {
            start_time: Some(250),
            stop_time: Some(400),
            ..Default::default()
        };
        let (outcome, sink) = run(options, quiet(), three_orders(), PositionWindow::default()).await;
        assert_eq!(outcome, RunOutcome::Stopped(StopReason::StopTime));
        assert_eq!(
            sink.lines(),
            vec!["INSERT INTO `db1`.`orders`(`id`,`status`) VALUES (2,'b');"]
        );
    }

    #[tokio::test]
    async fn test_sql_type_and_only_dml() {
        let bytes = LogBuilder::new(false)
            .fde(100)
            .query(150, "db1", "CREATE TABLE t (id int)")
            .insert_txn(200, 1, 1, "a")
            .gtid(300, 2)
            .query(300, "db1", "BEGIN")
            .orders_map(300)
            .delete(300, 1, "a")
            .xid(300)
            .build();

        let (_, sink) = run(SessionOptions::default(), quiet(), bytes.clone(), PositionWindow::default()).await;
        assert_eq!(sink.statements.len(), 3);
        assert_eq!(sink.lines()[0], "USE db1;\nCREATE TABLE t (id int);");
        assert_eq!(sink.statements[0].qualified_name(), None);

        let options = SessionOptions {
            only_dml: true,
            sql_types: [RowKind::Delete].into_iter().collect(),
            ..Default::default()
        };
        let (_, sink) = run(options, quiet(), bytes, PositionWindow::default()).await;
        assert_eq!(
            sink.lines(),
            vec!["DELETE FROM `db1`.`orders` WHERE `id`=1 AND `status`='a' LIMIT 1;"]
        );
    }

    #[tokio::test]
    async fn test_stop_signal() {
        let mut session = DecoderSession::new(SessionOptions::default(), quiet()).unwrap();
        session.stop_signal().stop();
        let mut sink = MemorySink::default();
        let outcome = session
            .run_file("mysql-bin.000001", source(&three_orders()), PositionWindow::default(), &mut catalog(), &mut sink)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Stopped(StopReason::Cancelled));
        assert!(sink.statements.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_metadata() {
        let bytes = three_orders();

        let mut session = DecoderSession::new(SessionOptions::default(), quiet()).unwrap();
        let mut sink = MemorySink::default();
        let outcome = session
            .run_file("mysql-bin.000001", source(&bytes), PositionWindow::default(), &mut MemoryCatalog::default(), &mut sink)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::EndOfLog);
        assert!(sink.statements.is_empty());
        assert_eq!(session.checkpoint().snapshot().events, 16);

        let options = SessionOptions {
            fail_on_unavailable: true,
            ..Default::default()
        };
        let mut session = DecoderSession::new(options, quiet()).unwrap();
        let err = session
            .run_file("mysql-bin.000001", source(&bytes), PositionWindow::default(), &mut MemoryCatalog::default(), &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, Binlog2SqlError::MetadataUnavailable { table_id: ORDERS_ID, .. }));
    }

    #[tokio::test]
    async fn test_checkpoint_tracks_progress() {
        let mut session = DecoderSession::new(SessionOptions::default(), quiet()).unwrap();
        let checkpoint = session.checkpoint();
        let mut sink = MemorySink::default();
        let bytes = three_orders();
        session
            .run_file("mysql-bin.000001", source(&bytes), PositionWindow::default(), &mut catalog(), &mut sink)
            .await
            .unwrap();

        let state = checkpoint.snapshot();
        assert_eq!(state.statements, 3);
        assert_eq!(
            state.position,
            Some(BinlogPosition::new("mysql-bin.000001".to_string(), bytes.len() as u64))
        );
        assert_eq!(state.gtid_set.to_string(), format!("{}:1-3", UUID));
    }

    #[test]
    fn test_rejects_flashback_without_pk() {
        let sql = SqlOptions {
            flashback: true,
            no_pk: true,
            ..Default::default()
        };
        assert!(matches!(
            DecoderSession::new(SessionOptions::default(), sql),
            Err(Binlog2SqlError::IncompatibleOptions(_))
        ));
    }
}
