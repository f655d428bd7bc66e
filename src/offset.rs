//! Log positions, provenance comments and the resume checkpoint
//!
//! A position is a binlog file name plus a byte offset, e.g. byte 4097 of
//! "mysql-bin.000003". Every generated statement carries a provenance
//! comment recording where in the log it came from.

use crate::gtid::GtidRangeSet;
use chrono::{Local, NaiveDateTime, TimeZone};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// First event offset in every binlog file (right after the magic)
pub const FIRST_EVENT_POSITION: u64 = 4;

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

static PROVENANCE_REGEX: OnceLock<Regex> = OnceLock::new();

fn provenance_regex() -> &'static Regex {
    PROVENANCE_REGEX.get_or_init(|| {
        Regex::new(
            r"#start (\d+) end (\d+) time (\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})(?: gtid (\S+))?",
        )
        .unwrap()
    })
}

/// File + byte offset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinlogPosition {
    /// e.g. "mysql-bin.000001"
    pub filename: String,
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(filename: String, position: u64) -> Self {
        BinlogPosition { filename, position }
    }

    /// Numeric suffix of the file name
    pub fn file_sequence(&self) -> Option<u64> {
        self.filename
            .rsplit('.')
            .next()
            .and_then(|s| s.parse().ok())
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

/// Where a statement came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Start of the enclosing transaction
    pub start: u64,
    /// Position right after the event
    pub end: u64,
    /// Source event time in local time
    pub time: NaiveDateTime,
    pub gtid: Option<String>,
}

impl Provenance {
    pub fn new(start: u64, end: u64, timestamp: u32, gtid: Option<String>) -> Self {
        Provenance {
            start,
            end,
            time: local_time(timestamp),
            gtid,
        }
    }

    /// Recover the provenance from a generated statement line
    pub fn parse(line: &str) -> Option<Self> {
        let caps = provenance_regex().captures(line)?;
        Some(Provenance {
            start: caps[1].parse().ok()?,
            end: caps[2].parse().ok()?,
            time: NaiveDateTime::parse_from_str(&caps[3], TIME_FORMAT).ok()?,
            gtid: caps.get(4).map(|m| m.as_str().to_string()),
        })
    }
}

/// Rendered with a leading space so it can follow the statement's `;`
impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            " #start {} end {} time {}",
            self.start,
            self.end,
            self.time.format(TIME_FORMAT)
        )?;
        if let Some(ref gtid) = self.gtid {
            write!(f, " gtid {}", gtid)?;
        }
        Ok(())
    }
}

/// Unix seconds to local wall-clock time
pub fn local_time(timestamp: u32) -> NaiveDateTime {
    match Local.timestamp_opt(timestamp as i64, 0) {
        chrono::LocalResult::Single(t) => t.naive_local(),
        chrono::LocalResult::Ambiguous(t, _) => t.naive_local(),
        chrono::LocalResult::None => chrono::DateTime::from_timestamp(timestamp as i64, 0)
            .map(|t| t.naive_utc())
            .unwrap_or_default(),
    }
}

/// Parse `YYYY-MM-DD HH:MM:SS` as local time and return Unix seconds
pub fn parse_local_datetime(text: &str) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(text.trim(), TIME_FORMAT).ok()?;
    match Local.from_local_datetime(&naive) {
        chrono::LocalResult::Single(t) => Some(t.timestamp()),
        chrono::LocalResult::Ambiguous(t, _) => Some(t.timestamp()),
        chrono::LocalResult::None => None,
    }
}

/// Drop a trailing provenance comment, keeping the terminating `;`
pub fn strip_provenance(line: &str) -> &str {
    match line.rfind("; #start ") {
        Some(idx) => &line[..idx + 1],
        None => line,
    }
}

/// Progress of a decoding run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointState {
    pub position: Option<BinlogPosition>,
    /// GTIDs of every transaction seen so far
    pub gtid_set: GtidRangeSet,
    pub events: u64,
    pub statements: u64,
}

/// Shared, cheaply cloneable view of the run's progress
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    state: Arc<RwLock<CheckpointState>>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CheckpointState {
        self.state.read().clone()
    }

    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut CheckpointState),
    {
        let mut state = self.state.write();
        f(&mut state);
    }

    pub fn to_json(&self) -> serde_json::Value {
        let state = self.state.read();
        serde_json::json!({
            "file": state.position.as_ref().map(|p| p.filename.clone()),
            "pos": state.position.as_ref().map(|p| p.position),
            "gtid_set": state.gtid_set.to_string(),
            "events": state.events,
            "statements": state.statements,
        })
    }
}
