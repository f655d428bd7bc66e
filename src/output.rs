//! Where generated statements go
//!
//! Statements are written to stdout, to a single result file, or to one
//! file per table. File output is written under a temporary name and only
//! renamed into place by [`Sink::finish`].

use crate::error::{Binlog2SqlError, Result};
use crate::reversal::TempFile;
use crate::sql::ReconstructedStatement;
use async_trait::async_trait;
use chrono::Local;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};

/// Destination for generated SQL
#[async_trait]
pub trait Sink: Send {
    async fn emit(&mut self, statement: &ReconstructedStatement) -> Result<()>;

    /// Flush and finalize all output
    async fn finish(&mut self) -> Result<()>;
}

static TARGET_REGEX: OnceLock<Regex> = OnceLock::new();

fn target_regex() -> &'static Regex {
    TARGET_REGEX.get_or_init(|| {
        Regex::new(r"^(?:INSERT(?: IGNORE)? INTO|REPLACE INTO|DELETE FROM|UPDATE) `((?:[^`]|``)+)`\.`((?:[^`]|``)+)`").unwrap()
    })
}

/// Recover the target table of a rendered row statement
pub fn parse_target(sql: &str) -> Option<(String, String)> {
    let caps = target_regex().captures(sql)?;
    Some((caps[1].replace("``", "`"), caps[2].replace("``", "`")))
}

impl ReconstructedStatement {
    /// Rebuild a statement from a line of a flashback spool
    pub fn from_line(line: &str) -> Self {
        match parse_target(line) {
            Some((schema, table)) => ReconstructedStatement {
                sql: line.to_string(),
                schema: Some(schema),
                table: Some(table),
            },
            None => ReconstructedStatement {
                sql: line.to_string(),
                schema: None,
                table: None,
            },
        }
    }
}

/// Prints each statement on stdout
#[derive(Debug, Default)]
pub struct ConsoleSink;

#[async_trait]
impl Sink for ConsoleSink {
    async fn emit(&mut self, statement: &ReconstructedStatement) -> Result<()> {
        println!("{}", statement.sql);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A file being written under a temporary name
struct PendingFile {
    target: PathBuf,
    temp: TempFile,
    writer: BufWriter<File>,
}

impl PendingFile {
    async fn create(target: PathBuf) -> Result<Self> {
        let dir = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir).await?;
        let temp = TempFile::new_in(&dir, "partial");
        let file = File::create(temp.path()).await?;
        Ok(PendingFile {
            target,
            temp,
            writer: BufWriter::new(file),
        })
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn commit(mut self) -> Result<PathBuf> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_all().await?;
        tokio::fs::rename(self.temp.path(), &self.target).await?;
        Ok(self.target)
    }
}

/// Writes everything to one result file
pub struct FileSink {
    pending: Option<PendingFile>,
    path: PathBuf,
    statements: u64,
}

impl FileSink {
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let pending = PendingFile::create(path.clone()).await?;
        debug!("Writing statements to {}", path.display());
        Ok(FileSink {
            pending: Some(pending),
            path,
            statements: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn emit(&mut self, statement: &ReconstructedStatement) -> Result<()> {
        let pending = self
            .pending
            .as_mut()
            .ok_or_else(|| Binlog2SqlError::Other("result file already finished".to_string()))?;
        pending.write_line(&statement.sql).await?;
        self.statements += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        if let Some(pending) = self.pending.take() {
            let path = pending.commit().await?;
            info!("Saved {} statements to {}", self.statements, path.display());
        }
        Ok(())
    }
}

/// How per-table files are named
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DateStyle {
    /// `db.tb.20240301.sql`
    #[default]
    Suffix,
    /// `20240301.db.tb.sql`
    Prefix,
    /// `db.tb.sql`
    None,
}

/// One file per `schema.table`; statements without a table go to `others`
pub struct TablePerFileSink {
    dir: PathBuf,
    style: DateStyle,
    date: String,
    files: HashMap<String, PendingFile>,
}

impl TablePerFileSink {
    pub fn new(dir: impl Into<PathBuf>, style: DateStyle) -> Self {
        TablePerFileSink {
            dir: dir.into(),
            style,
            date: Local::now().format("%Y%m%d").to_string(),
            files: HashMap::new(),
        }
    }

    /// Override the date stamp used in file names
    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.date = date.into();
        self
    }

    pub fn file_name(&self, statement: &ReconstructedStatement) -> String {
        let name = statement
            .qualified_name()
            .unwrap_or_else(|| "others".to_string());
        match self.style {
            DateStyle::Suffix => format!("{}.{}.sql", name, self.date),
            DateStyle::Prefix => format!("{}.{}.sql", self.date, name),
            DateStyle::None => format!("{}.sql", name),
        }
    }
}

#[async_trait]
impl Sink for TablePerFileSink {
    async fn emit(&mut self, statement: &ReconstructedStatement) -> Result<()> {
        let name = self.file_name(statement);
        if !self.files.contains_key(&name) {
            let pending = PendingFile::create(self.dir.join(&name)).await?;
            debug!("Opened table file {}", name);
            self.files.insert(name.clone(), pending);
        }
        match self.files.get_mut(&name) {
            Some(pending) => pending.write_line(&statement.sql).await,
            None => Err(Binlog2SqlError::Other(format!("no writer for {}", name))),
        }
    }

    async fn finish(&mut self) -> Result<()> {
        for (_, pending) in self.files.drain() {
            let path = pending.commit().await?;
            info!("Saved {}", path.display());
        }
        Ok(())
    }
}

/// Collects statements in memory
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemorySink {
    pub(crate) statements: Vec<ReconstructedStatement>,
    pub(crate) finished: bool,
}

#[cfg(test)]
impl MemorySink {
    pub(crate) fn lines(&self) -> Vec<&str> {
        self.statements.iter().map(|s| s.sql.as_str()).collect()
    }
}

#[cfg(test)]
#[async_trait]
impl Sink for MemorySink {
    async fn emit(&mut self, statement: &ReconstructedStatement) -> Result<()> {
        self.statements.push(statement.clone());
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(sql: &str, target: Option<(&str, &str)>) -> ReconstructedStatement {
        ReconstructedStatement {
            sql: sql.to_string(),
            schema: target.map(|t| t.0.to_string()),
            table: target.map(|t| t.1.to_string()),
        }
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(
            parse_target("DELETE FROM `db1`.`orders` WHERE `id`=5 LIMIT 1;"),
            Some(("db1".to_string(), "orders".to_string()))
        );
        assert_eq!(
            parse_target("INSERT IGNORE INTO `a``b`.`t`(`id`) VALUES (1);"),
            Some(("a`b".to_string(), "t".to_string()))
        );
        assert_eq!(
            parse_target("UPDATE `db1`.`orders` SET `status`='x' WHERE `id`=1 LIMIT 1;"),
            Some(("db1".to_string(), "orders".to_string()))
        );
        assert_eq!(parse_target("USE db1;"), None);

        let s = ReconstructedStatement::from_line("REPLACE INTO `d`.`t` SET `id`=1;");
        assert_eq!(s.qualified_name().as_deref(), Some("d.t"));
    }

    #[tokio::test]
    async fn test_file_sink_appears_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.sql");
        let mut sink = FileSink::create(&path).await.unwrap();
        sink.emit(&stmt("SELECT 1;", None)).await.unwrap();
        sink.emit(&stmt("SELECT 2;", None)).await.unwrap();
        assert!(!path.exists());

        sink.finish().await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "SELECT 1;\nSELECT 2;\n");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_file_sink_dropped_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.sql");
        {
            let mut sink = FileSink::create(&path).await.unwrap();
            sink.emit(&stmt("SELECT 1;", None)).await.unwrap();
        }
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_table_per_file_routing() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = TablePerFileSink::new(dir.path(), DateStyle::Suffix).with_date("20240301");
        sink.emit(&stmt("INSERT 1;", Some(("db1", "orders")))).await.unwrap();
        sink.emit(&stmt("INSERT 2;", Some(("db1", "users")))).await.unwrap();
        sink.emit(&stmt("INSERT 3;", Some(("db1", "orders")))).await.unwrap();
        sink.emit(&stmt("USE db1;\nDROP TABLE x;", None)).await.unwrap();
        sink.finish().await.unwrap();

        let read = |name: &str| std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(read("db1.orders.20240301.sql"), "INSERT 1;\nINSERT 3;\n");
        assert_eq!(read("db1.users.20240301.sql"), "INSERT 2;\n");
        assert_eq!(read("others.20240301.sql"), "USE db1;\nDROP TABLE x;\n");
    }

    #[test]
    fn test_table_file_names() {
        let s = stmt("x", Some(("db", "tb")));
        let prefix = TablePerFileSink::new("/tmp", DateStyle::Prefix).with_date("20240301");
        assert_eq!(prefix.file_name(&s), "20240301.db.tb.sql");
        let none = TablePerFileSink::new("/tmp", DateStyle::None);
        assert_eq!(none.file_name(&s), "db.tb.sql");
        assert_eq!(none.file_name(&stmt("x", None)), "others.sql");
    }
}
