//! Flashback output ordering
//!
//! Flashback statements are produced in forward log order but must be
//! emitted newest-first. The spool is split into fixed-size chunks, each
//! chunk is reversed into its own temp file, and the chunks are replayed
//! last-to-first. Memory use is bounded by one chunk regardless of how
//! large the spool grows.

use crate::error::{Binlog2SqlError, Result};
use regex::Regex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

static SQL_TIME_REGEX: OnceLock<Regex> = OnceLock::new();

fn sql_time_regex() -> &'static Regex {
    SQL_TIME_REGEX.get_or_init(|| Regex::new(r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}").unwrap())
}

/// How a flashback spool is reordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortMode {
    /// Exact reversal of the spool
    #[default]
    ReverseSeq,
    /// Bucketed ascending sort on the provenance time
    SortByTime,
}

impl FromStr for SortMode {
    type Err = Binlog2SqlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reverse_seq" => Ok(SortMode::ReverseSeq),
            "sort_by_time" => Ok(SortMode::SortByTime),
            other => Err(Binlog2SqlError::IncompatibleOptions(format!(
                "invalid sort type: {}",
                other
            ))),
        }
    }
}

/// A file removed when dropped
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
}

impl TempFile {
    pub fn new_in(dir: &Path, suffix: &str) -> Self {
        TempFile {
            path: dir.join(format!("binlog2sql-{}.{}", Uuid::new_v4(), suffix)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove temp file {}: {}", self.path.display(), e),
        }
    }
}

/// Forward-order statement spool
pub struct Spool {
    file: TempFile,
    writer: Option<tokio::io::BufWriter<tokio::fs::File>>,
    lines: u64,
}

impl Spool {
    pub async fn create(work_dir: &Path) -> Result<Self> {
        let file = TempFile::new_in(work_dir, "spool");
        let handle = tokio::fs::File::create(file.path()).await?;
        debug!("Spooling flashback statements to {}", file.path().display());
        Ok(Spool {
            file,
            writer: Some(tokio::io::BufWriter::new(handle)),
            lines: 0,
        })
    }

    pub async fn push(&mut self, line: &str) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Binlog2SqlError::Other("spool already finished".to_string()))?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        self.lines += 1;
        Ok(())
    }

    /// Flush and close for reading
    pub async fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            writer.into_inner().sync_all().await?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }
}

/// Read up to `chunk_size` lines; empty at end of input
fn read_chunk<R: BufRead>(reader: &mut R, chunk_size: usize) -> Result<Vec<String>> {
    let mut chunk = Vec::with_capacity(chunk_size.min(4096));
    let mut line = String::new();
    while chunk.len() < chunk_size {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        chunk.push(line.clone());
    }
    Ok(chunk)
}

fn write_lines(path: &Path, lines: &[String], append: bool) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)?;
    let mut writer = BufWriter::new(file);
    for line in lines {
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Copy a chunk file into the output
fn replay(path: &Path, out: &mut dyn Write) -> Result<()> {
    let mut file = File::open(path)?;
    std::io::copy(&mut file, out)?;
    Ok(())
}

/// Write the exact line-reversal of `input` to `out`. Returns the line count.
pub fn reverse_seq(input: &Path, out: &mut dyn Write, chunk_size: usize, work_dir: &Path) -> Result<u64> {
    let chunk_size = chunk_size.max(1);
    let mut reader = BufReader::new(File::open(input)?);
    let mut chunks: Vec<TempFile> = Vec::new();
    let mut total = 0u64;

    loop {
        let mut chunk = read_chunk(&mut reader, chunk_size)?;
        if chunk.is_empty() {
            break;
        }
        total += chunk.len() as u64;
        chunk.reverse();
        let file = TempFile::new_in(work_dir, "chunk");
        write_lines(file.path(), &chunk, false)?;
        chunks.push(file);
    }
    debug!("Reversing {} lines in {} chunks", total, chunks.len());

    // newest chunk first; each file is deleted as soon as it is replayed
    while let Some(chunk) = chunks.pop() {
        replay(chunk.path(), out)?;
    }
    out.flush()?;
    Ok(total)
}

fn line_time(line: &str) -> Option<String> {
    let tail = line.rsplit("#start ").next().unwrap_or(line);
    sql_time_regex().find(tail).map(|m| m.as_str().to_string())
}

struct Bucket {
    file: TempFile,
    min: String,
    max: String,
}

/// Sort `input` by provenance time using time-range buckets.
///
/// Each chunk is sorted in memory. Its lines are appended to existing
/// buckets whose `[min, max]` covers them, in ascending order, until the
/// first line no bucket covers; that line and everything after it open a
/// new bucket. Buckets are emitted by ascending `min`, each merge-sorted.
pub fn sort_by_time(input: &Path, out: &mut dyn Write, chunk_size: usize, work_dir: &Path) -> Result<u64> {
    let chunk_size = chunk_size.max(1);
    let mut reader = BufReader::new(File::open(input)?);
    let mut buckets: Vec<Bucket> = Vec::new();
    let mut last_time = String::new();
    let mut total = 0u64;

    loop {
        let chunk = read_chunk(&mut reader, chunk_size)?;
        if chunk.is_empty() {
            break;
        }
        total += chunk.len() as u64;

        let mut timed = stamp(chunk, &mut last_time);
        timed.sort_by(|a, b| a.0.cmp(&b.0));

        let mut placed: Vec<Vec<String>> = vec![Vec::new(); buckets.len()];
        let mut split = timed.len();
        for (idx, (time, _)) in timed.iter().enumerate() {
            match buckets
                .iter()
                .position(|b| b.min.as_str() <= time.as_str() && time.as_str() <= b.max.as_str())
            {
                Some(b) => placed[b].push(timed[idx].1.clone()),
                None => {
                    split = idx;
                    break;
                }
            }
        }
        for (bucket, lines) in buckets.iter().zip(placed.iter()) {
            if !lines.is_empty() {
                write_lines(bucket.file.path(), lines, true)?;
            }
        }

        let rest = &timed[split..];
        if let (Some(first), Some(last)) = (rest.first(), rest.last()) {
            let bucket = Bucket {
                file: TempFile::new_in(work_dir, "bucket"),
                min: first.0.clone(),
                max: last.0.clone(),
            };
            let lines: Vec<String> = rest.iter().map(|(_, l)| l.clone()).collect();
            write_lines(bucket.file.path(), &lines, false)?;
            buckets.push(bucket);
        }
    }

    buckets.sort_by(|a, b| a.min.cmp(&b.min));
    debug!("Sorting {} lines from {} buckets", total, buckets.len());

    for bucket in buckets {
        sort_bucket(bucket.file.path(), out, chunk_size, work_dir)?;
    }
    out.flush()?;
    Ok(total)
}

/// Pair each line with its provenance time; lines without one inherit the
/// time of the line before
fn stamp(lines: Vec<String>, last: &mut String) -> Vec<(String, String)> {
    lines
        .into_iter()
        .map(|line| {
            if let Some(t) = line_time(&line) {
                *last = t;
            }
            (last.clone(), line)
        })
        .collect()
}

/// Stable external sort of one bucket by time. Sorted runs of `chunk_size`
/// lines are merged, so at most one chunk plus one line per run is held.
fn sort_bucket(path: &Path, out: &mut dyn Write, chunk_size: usize, work_dir: &Path) -> Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut runs: Vec<TempFile> = Vec::new();
    let mut last = String::new();

    loop {
        let chunk = read_chunk(&mut reader, chunk_size)?;
        if chunk.is_empty() {
            break;
        }
        let mut timed = stamp(chunk, &mut last);
        timed.sort_by(|a, b| a.0.cmp(&b.0));
        let keyed: Vec<String> = timed
            .into_iter()
            .map(|(time, line)| format!("{}\t{}", time, line))
            .collect();
        let run = TempFile::new_in(work_dir, "run");
        write_lines(run.path(), &keyed, false)?;
        runs.push(run);
    }

    // ties go to the earlier run, which keeps the sort stable
    let mut readers = Vec::with_capacity(runs.len());
    let mut heap = BinaryHeap::new();
    for (idx, run) in runs.iter().enumerate() {
        let mut reader = BufReader::new(File::open(run.path())?);
        if let Some((time, line)) = next_keyed(&mut reader)? {
            heap.push(Reverse((time, idx, line)));
        }
        readers.push(reader);
    }
    while let Some(Reverse((_, idx, line))) = heap.pop() {
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        if let Some((time, line)) = next_keyed(&mut readers[idx])? {
            heap.push(Reverse((time, idx, line)));
        }
    }
    Ok(())
}

fn next_keyed<R: BufRead>(reader: &mut R) -> Result<Option<(String, String)>> {
    let entry = match read_chunk(reader, 1)?.pop() {
        Some(entry) => entry,
        None => return Ok(None),
    };
    match entry.split_once('\t') {
        Some((time, line)) => Ok(Some((time.to_string(), line.to_string()))),
        None => Err(Binlog2SqlError::Other(format!("corrupt sort run entry: {}", entry))),
    }
}

/// Reorder `input` into a new file at `output`. The output only appears
/// once it is complete.
pub fn sort_file(
    mode: SortMode,
    input: &Path,
    output: &Path,
    chunk_size: usize,
    work_dir: &Path,
) -> Result<u64> {
    let dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(work_dir);
    let partial = TempFile::new_in(dir, "partial");
    let total = {
        let mut writer = BufWriter::new(File::create(partial.path())?);
        let total = match mode {
            SortMode::ReverseSeq => reverse_seq(input, &mut writer, chunk_size, work_dir)?,
            SortMode::SortByTime => sort_by_time(input, &mut writer, chunk_size, work_dir)?,
        };
        writer.flush()?;
        writer.get_ref().sync_all()?;
        total
    };
    fs::rename(partial.path(), output)?;
    info!("Wrote {} reordered lines to {}", total, output.display());
    Ok(total)
}
