//! Rebuild SQL from MySQL binary logs
//!
//! Decodes binlog files (or an already framed replication stream) and
//! reconstructs the changes they record as SQL text:
//! - forward statements that replay the change
//! - flashback statements that undo it, newest first
//! - filtering by schema/table, GTID, time and position ranges and row predicates

pub mod binlog;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod filter;
pub mod gtid;
pub mod offset;
pub mod output;
pub mod reader;
pub mod reversal;
pub mod rows;
pub mod session;
pub mod sql;
pub mod table_map;
pub mod value;

pub use config::Binlog2SqlConfig;
pub use connection::MySqlConnection;
pub use error::{Binlog2SqlError, Result};
pub use events::{BinlogEvent, EventType, LogEvent};
pub use gtid::{GtidFilter, GtidRangeSet};
pub use output::{ConsoleSink, FileSink, Sink, TablePerFileSink};
pub use session::{DecoderSession, RunOutcome};
pub use sql::{ReconstructedStatement, SqlGenerator, SqlOptions};
pub use value::{Row, Value};
