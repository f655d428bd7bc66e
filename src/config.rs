//! Run configuration
//!
//! [`Binlog2SqlConfig`] gathers every user-facing switch. It is normally
//! filled from environment variables by [`Binlog2SqlConfig::from_env`] and
//! checked with [`Binlog2SqlConfig::validate`] before any log is read.

use crate::connection::ConnectionConfig;
use crate::error::{Binlog2SqlError, Result};
use crate::events::RowKind;
use crate::filter::{RenameMap, RowFilter, SchemaFilter};
use crate::gtid::GtidFilter;
use crate::offset::{parse_local_datetime, FIRST_EVENT_POSITION};
use crate::output::DateStyle;
use crate::reversal::{SortMode, DEFAULT_CHUNK_SIZE};
use crate::session::{PositionWindow, SessionOptions};
use crate::sql::SqlOptions;
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Binlog2SqlConfig {
    /// Catalog connection used to describe tables
    pub connection: ConnectionConfig,
    /// Local binlog files, decoded in order
    pub binlog_files: Vec<PathBuf>,

    pub start_pos: u64,
    pub stop_pos: Option<u64>,
    /// `YYYY-MM-DD HH:MM:SS`, local time
    pub start_time: Option<String>,
    pub stop_time: Option<String>,
    pub stop_never: bool,

    pub only_schemas: Vec<String>,
    pub only_tables: Vec<String>,
    pub ignore_schemas: Vec<String>,
    pub ignore_tables: Vec<String>,
    pub only_dml: bool,
    /// Subset of INSERT, UPDATE, DELETE
    pub sql_types: Vec<String>,
    pub include_gtids: Option<String>,
    pub exclude_gtids: Option<String>,
    /// `--where` terms, each an AND term
    pub conditions: Vec<String>,

    pub flashback: bool,
    pub no_pk: bool,
    pub only_pk: bool,
    pub replace: bool,
    pub insert_ignore: bool,
    pub update_to_replace: bool,
    pub remove_not_update_col: bool,
    pub keep_not_update_col: Vec<String>,
    pub ignore_columns: Vec<String>,
    pub ignore_virtual_columns: bool,
    pub rename_db: Vec<String>,
    pub rename_tb: Vec<String>,
    pub need_comment: bool,
    pub fail_on_unavailable: bool,

    pub result_file: Option<PathBuf>,
    pub result_dir: PathBuf,
    pub table_per_file: bool,
    pub date_prefix: bool,
    pub no_date: bool,

    pub sort_mode: SortMode,
    pub chunk_size: usize,
    pub tmp_dir: PathBuf,
}

impl Default for Binlog2SqlConfig {
    fn default() -> Self {
        Binlog2SqlConfig {
            connection: ConnectionConfig::default(),
            binlog_files: Vec::new(),
            start_pos: FIRST_EVENT_POSITION,
            stop_pos: None,
            start_time: None,
            stop_time: None,
            stop_never: false,
            only_schemas: Vec::new(),
            only_tables: Vec::new(),
            ignore_schemas: Vec::new(),
            ignore_tables: Vec::new(),
            only_dml: false,
            sql_types: vec![
                "INSERT".to_string(),
                "UPDATE".to_string(),
                "DELETE".to_string(),
            ],
            include_gtids: None,
            exclude_gtids: None,
            conditions: Vec::new(),
            flashback: false,
            no_pk: false,
            only_pk: false,
            replace: false,
            insert_ignore: false,
            update_to_replace: false,
            remove_not_update_col: false,
            keep_not_update_col: Vec::new(),
            ignore_columns: Vec::new(),
            ignore_virtual_columns: false,
            rename_db: Vec::new(),
            rename_tb: Vec::new(),
            need_comment: true,
            fail_on_unavailable: false,
            result_file: None,
            result_dir: PathBuf::from("."),
            table_per_file: false,
            date_prefix: false,
            no_date: false,
            sort_mode: SortMode::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            tmp_dir: env::temp_dir(),
        }
    }
}

impl Binlog2SqlConfig {
    /// Build from `DB_*` and `BINLOG_*` style variables; unset variables
    /// keep their defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Binlog2SqlConfig::default();

        let connection = ConnectionConfig {
            hostname: env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env::var("DB_PORT")
                .unwrap_or_else(|_| "3306".to_string())
                .parse()
                .unwrap_or(3306),
            username: env::var("DB_USER").unwrap_or_else(|_| "root".to_string()),
            password: env::var("DB_PASSWORD").unwrap_or_default(),
            database: env::var("DB_NAME").ok(),
            timeout: Duration::from_secs(
                env::var("DB_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        };

        let sort_mode = match env::var("SORT_TYPE") {
            Ok(s) => s.parse()?,
            Err(_) => defaults.sort_mode,
        };

        let sql_types = env_list("SQL_TYPE");
        Ok(Binlog2SqlConfig {
            connection,
            binlog_files: env_list("BINLOG_FILES").into_iter().map(PathBuf::from).collect(),
            start_pos: env_number("START_POS")?.unwrap_or(defaults.start_pos),
            stop_pos: env_number("STOP_POS")?,
            start_time: env::var("START_TIME").ok(),
            stop_time: env::var("STOP_TIME").ok(),
            stop_never: env_flag("STOP_NEVER"),
            only_schemas: env_list("DATABASES"),
            only_tables: env_list("TABLES"),
            ignore_schemas: env_list("IGNORE_DATABASES"),
            ignore_tables: env_list("IGNORE_TABLES"),
            only_dml: env_flag("ONLY_DML"),
            sql_types: if sql_types.is_empty() {
                defaults.sql_types
            } else {
                sql_types
            },
            include_gtids: env::var("INCLUDE_GTIDS").ok(),
            exclude_gtids: env::var("EXCLUDE_GTIDS").ok(),
            // conditions may contain commas (IN lists)
            conditions: env_split("FILTER_CONDITIONS", ';'),
            flashback: env_flag("FLASHBACK"),
            no_pk: env_flag("NO_PK"),
            only_pk: env_flag("ONLY_PK"),
            replace: env_flag("REPLACE"),
            insert_ignore: env_flag("INSERT_IGNORE"),
            update_to_replace: env_flag("UPDATE_TO_REPLACE"),
            remove_not_update_col: env_flag("REMOVE_NOT_UPDATE_COL"),
            keep_not_update_col: env_list("KEEP_NOT_UPDATE_COL"),
            ignore_columns: env_list("IGNORE_COLUMNS"),
            ignore_virtual_columns: env_flag("IGNORE_VIRTUAL_COLUMNS"),
            rename_db: env_list("RENAME_DB"),
            rename_tb: env_list("RENAME_TB"),
            need_comment: env::var("NEED_COMMENT")
                .map(|v| is_truthy(&v))
                .unwrap_or(defaults.need_comment),
            fail_on_unavailable: env_flag("FAIL_ON_UNAVAILABLE"),
            result_file: env::var("RESULT_FILE").ok().map(PathBuf::from),
            result_dir: env::var("RESULT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.result_dir),
            table_per_file: env_flag("TABLE_PER_FILE"),
            date_prefix: env_flag("DATE_PREFIX"),
            no_date: env_flag("NO_DATE"),
            sort_mode,
            chunk_size: env_number("CHUNK")?
                .map(|n| n as usize)
                .unwrap_or(defaults.chunk_size),
            tmp_dir: env::var("TMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.tmp_dir),
        })
    }

    /// Configuration-time checks; nothing has been read yet when these fail
    pub fn validate(&self) -> Result<()> {
        if self.flashback && self.no_pk {
            return Err(Binlog2SqlError::IncompatibleOptions(
                "only one of flashback or no_pk can be set".to_string(),
            ));
        }
        if self.flashback && self.stop_never {
            return Err(Binlog2SqlError::IncompatibleOptions(
                "only one of flashback or stop_never can be set".to_string(),
            ));
        }
        if self.result_file.is_some() && self.table_per_file {
            return Err(Binlog2SqlError::IncompatibleOptions(
                "result_file and table_per_file cannot be used together".to_string(),
            ));
        }
        if self.replace && self.insert_ignore {
            return Err(Binlog2SqlError::IncompatibleOptions(
                "replace and insert_ignore cannot be used together".to_string(),
            ));
        }
        if self.date_prefix && self.no_date {
            return Err(Binlog2SqlError::IncompatibleOptions(
                "date_prefix and no_date cannot be used together".to_string(),
            ));
        }
        for (name, value) in [("start_time", &self.start_time), ("stop_time", &self.stop_time)] {
            if let Some(text) = value {
                if parse_local_datetime(text).is_none() {
                    return Err(Binlog2SqlError::IncompatibleOptions(format!(
                        "incorrect datetime for {}: {} (expected YYYY-MM-DD HH:MM:SS)",
                        name, text
                    )));
                }
            }
        }
        if self.chunk_size < 1 {
            return Err(Binlog2SqlError::IncompatibleOptions(
                "chunk size must be at least 1".to_string(),
            ));
        }
        if let (Some(start), Some(stop)) = (self.start_pos_on_single_file(), self.stop_pos) {
            if stop < start {
                return Err(Binlog2SqlError::IncompatibleOptions(format!(
                    "stop position {} precedes start position {}",
                    stop, start
                )));
            }
        }
        self.sql_kinds()?;
        self.sql_options()?.validate()?;
        self.gtid_filter()?;
        Ok(())
    }

    fn start_pos_on_single_file(&self) -> Option<u64> {
        (self.binlog_files.len() == 1).then_some(self.start_pos)
    }

    pub fn sql_kinds(&self) -> Result<HashSet<RowKind>> {
        self.sql_types
            .iter()
            .map(|t| match t.trim().to_ascii_uppercase().as_str() {
                "INSERT" => Ok(RowKind::Write),
                "UPDATE" => Ok(RowKind::Update),
                "DELETE" => Ok(RowKind::Delete),
                other => Err(Binlog2SqlError::IncompatibleOptions(format!(
                    "unknown sql type: {}",
                    other
                ))),
            })
            .collect()
    }

    pub fn gtid_filter(&self) -> Result<GtidFilter> {
        GtidFilter::new(self.include_gtids.as_deref(), self.exclude_gtids.as_deref())
    }

    pub fn schema_filter(&self) -> SchemaFilter {
        SchemaFilter {
            only_schemas: self.only_schemas.iter().cloned().collect(),
            only_tables: self.only_tables.iter().cloned().collect(),
            ignored_schemas: self.ignore_schemas.iter().cloned().collect(),
            ignored_tables: self.ignore_tables.iter().cloned().collect(),
        }
    }

    pub fn sql_options(&self) -> Result<SqlOptions> {
        Ok(SqlOptions {
            flashback: self.flashback,
            no_pk: self.no_pk,
            only_pk: self.only_pk,
            replace: self.replace,
            insert_ignore: self.insert_ignore,
            update_to_replace: self.update_to_replace,
            remove_not_update_col: self.remove_not_update_col,
            keep_not_update_col: self.keep_not_update_col.iter().cloned().collect(),
            ignore_columns: self.ignore_columns.iter().cloned().collect(),
            ignore_virtual_columns: self.ignore_virtual_columns,
            rename_db: RenameMap::parse(&self.rename_db)?,
            rename_tb: RenameMap::parse(&self.rename_tb)?,
            row_filter: RowFilter::parse(&self.conditions)?,
            need_comment: self.need_comment,
        })
    }

    /// Time bounds are ignored when following the log forever
    pub fn session_options(&self) -> Result<SessionOptions> {
        let (start_time, stop_time) = if self.stop_never {
            (None, None)
        } else {
            (
                self.start_time.as_deref().and_then(parse_local_datetime),
                self.stop_time.as_deref().and_then(parse_local_datetime),
            )
        };
        Ok(SessionOptions {
            start_time,
            stop_time,
            sql_types: self.sql_kinds()?,
            only_dml: self.only_dml,
            schema_filter: self.schema_filter(),
            gtid_filter: self.gtid_filter()?,
            fail_on_unavailable: self.fail_on_unavailable,
            sort_mode: self.sort_mode,
            chunk_size: self.chunk_size,
            work_dir: self.tmp_dir.clone(),
        })
    }

    /// The start position applies to the first file, the stop position to
    /// the last one
    pub fn window(&self, index: usize) -> PositionWindow {
        let last = self.binlog_files.len().saturating_sub(1);
        PositionWindow {
            start_pos: if index == 0 {
                self.start_pos
            } else {
                FIRST_EVENT_POSITION
            },
            stop_pos: if index == last { self.stop_pos } else { None },
        }
    }

    pub fn date_style(&self) -> DateStyle {
        if self.date_prefix {
            DateStyle::Prefix
        } else if self.no_date {
            DateStyle::None
        } else {
            DateStyle::Suffix
        }
    }

    /// Result file path inside the result directory
    pub fn result_path(&self) -> Option<PathBuf> {
        self.result_file.as_ref().map(|f| match f.file_name() {
            Some(name) => self.result_dir.join(name),
            None => self.result_dir.join(f),
        })
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_flag(name: &str) -> bool {
    env::var(name).map(|v| is_truthy(&v)).unwrap_or(false)
}

fn env_split(name: &str, sep: char) -> Vec<String> {
    env::var(name)
        .map(|v| split_list(&v, sep))
        .unwrap_or_default()
}

fn env_list(name: &str) -> Vec<String> {
    env_split(name, ',')
}

fn env_number(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(v) => v.trim().parse().map(Some).map_err(|_| {
            Binlog2SqlError::IncompatibleOptions(format!("{} must be a number, got {}", name, v))
        }),
        Err(_) => Ok(None),
    }
}

fn split_list(value: &str, sep: char) -> Vec<String> {
    value
        .split(sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
