//! SQL reconstruction
//!
//! Turns decoded row changes and query events into executable SQL text,
//! either replaying the change (forward) or undoing it (flashback).
//!
//! Statements are first built as a template with `%s` placeholders plus a
//! parameter list, then rendered with MySQL literal escaping. Rendering
//! quotes every literal, so a second pass removes the quotes around `0x..`
//! literals that came from binary values while leaving genuine strings that
//! happen to start with `0x` untouched.

use crate::error::{Binlog2SqlError, Result};
use crate::events::{BinlogEvent, LogEvent, QueryEventData, RowChange, RowKind, RowsEventData};
use crate::filter::{prune_unchanged, strip_columns, RenameMap, RowFilter};
use crate::offset::{strip_provenance, Provenance};
use crate::value::{Row, Value, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::Range;
use tracing::trace;

/// Switches that shape generated statements
#[derive(Debug, Clone, Default)]
pub struct SqlOptions {
    pub flashback: bool,
    /// Leave primary key columns out of forward INSERTs
    pub no_pk: bool,
    /// Identify rows by primary key only
    pub only_pk: bool,
    pub replace: bool,
    pub insert_ignore: bool,
    pub update_to_replace: bool,
    pub remove_not_update_col: bool,
    pub keep_not_update_col: HashSet<String>,
    pub ignore_columns: HashSet<String>,
    pub ignore_virtual_columns: bool,
    pub rename_db: RenameMap,
    pub rename_tb: RenameMap,
    pub row_filter: RowFilter,
    /// Append the provenance comment
    pub need_comment: bool,
}

impl SqlOptions {
    pub fn validate(&self) -> Result<()> {
        if self.flashback && self.no_pk {
            return Err(Binlog2SqlError::IncompatibleOptions(
                "flashback and no-primary-key cannot be combined".to_string(),
            ));
        }
        if self.replace && self.insert_ignore {
            return Err(Binlog2SqlError::IncompatibleOptions(
                "replace and insert-ignore cannot be combined".to_string(),
            ));
        }
        Ok(())
    }
}

/// A generated statement and the object it targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructedStatement {
    pub sql: String,
    /// `None` for statements not tied to a single table (DDL, raw queries)
    pub schema: Option<String>,
    pub table: Option<String>,
}

impl ReconstructedStatement {
    /// `schema.table` used to route output, if known
    pub fn qualified_name(&self) -> Option<String> {
        match (&self.schema, &self.table) {
            (Some(s), Some(t)) => Some(format!("{}.{}", s, t)),
            _ => None,
        }
    }
}

/// Template with `%s` placeholders plus the values to bind
#[derive(Debug, Clone, Default, PartialEq)]
struct Pattern {
    template: String,
    values: Vec<Value>,
}

pub struct SqlGenerator {
    options: SqlOptions,
}

impl SqlGenerator {
    pub fn new(options: SqlOptions) -> Result<Self> {
        options.validate()?;
        Ok(SqlGenerator { options })
    }

    pub fn options(&self) -> &SqlOptions {
        &self.options
    }

    /// Statements for one event. `start_pos` is the position of the
    /// enclosing transaction's `BEGIN`.
    pub fn statements(
        &self,
        event: &BinlogEvent,
        start_pos: u64,
        gtid: Option<&str>,
    ) -> Result<Vec<ReconstructedStatement>> {
        let provenance = Provenance::new(
            start_pos,
            event.log_pos(),
            event.timestamp(),
            gtid.map(str::to_string),
        );

        match &event.data {
            LogEvent::WriteRows(rows) | LogEvent::UpdateRows(rows) | LogEvent::DeleteRows(rows) => {
                let mut out = Vec::with_capacity(rows.rows.len());
                for change in &rows.rows {
                    if let Some(stmt) = self.row_statement(rows, change.clone(), &provenance)? {
                        out.push(stmt);
                    }
                }
                Ok(out)
            }
            LogEvent::Query(query) => Ok(self.query_statement(query, &provenance).into_iter().collect()),
            other => Err(Binlog2SqlError::UnsupportedEvent(
                event_name(other).to_string(),
            )),
        }
    }

    /// One row change; `None` when the row filter rejects it
    pub fn row_statement(
        &self,
        event: &RowsEventData,
        change: RowChange,
        provenance: &Provenance,
    ) -> Result<Option<ReconstructedStatement>> {
        let opts = &self.options;

        let pattern = match (event.kind, change) {
            (RowKind::Write, RowChange::Values(mut values)) => {
                if !opts.row_filter.matches(&values) {
                    return Ok(None);
                }
                strip_columns(&mut values, &opts.ignore_columns, opts.ignore_virtual_columns);
                if opts.flashback {
                    self.delete_pattern(event, &values)
                } else {
                    if opts.no_pk {
                        for key in &event.primary_key {
                            values.remove(key);
                        }
                    }
                    self.insert_pattern(event, values)
                }
            }
            (RowKind::Delete, RowChange::Values(mut values)) => {
                if !opts.row_filter.matches(&values) {
                    return Ok(None);
                }
                strip_columns(&mut values, &opts.ignore_columns, opts.ignore_virtual_columns);
                if opts.flashback {
                    self.insert_pattern(event, values)
                } else {
                    self.delete_pattern(event, &values)
                }
            }
            (RowKind::Update, RowChange::Update { mut before, mut after }) => {
                if !opts.row_filter.matches(&before) {
                    return Ok(None);
                }
                strip_columns(&mut before, &opts.ignore_columns, opts.ignore_virtual_columns);
                strip_columns(&mut after, &opts.ignore_columns, opts.ignore_virtual_columns);
                // flashback restores the before image onto the row as it is after
                let (mut matching, mut set) = if opts.flashback {
                    (after, before)
                } else {
                    (before, after)
                };
                if opts.remove_not_update_col {
                    prune_unchanged(
                        &mut matching,
                        &mut set,
                        &event.primary_key,
                        &opts.keep_not_update_col,
                    );
                }
                self.update_pattern(event, matching, set)
            }
            (kind, _) => {
                return Err(Binlog2SqlError::UnsupportedEvent(format!(
                    "{} event with mismatched row image",
                    kind.as_str()
                )))
            }
        };

        let (schema, table) = self.target(event);
        let sql = self.render(pattern, provenance);
        trace!("{}", sql);
        Ok(Some(ReconstructedStatement {
            sql,
            schema: Some(schema.to_string()),
            table: Some(table.to_string()),
        }))
    }

    /// Query events are replayed verbatim in forward mode only; transaction
    /// markers never produce output.
    pub fn query_statement(
        &self,
        query: &QueryEventData,
        provenance: &Provenance,
    ) -> Option<ReconstructedStatement> {
        if self.options.flashback || query.is_begin() || query.is_commit() {
            return None;
        }

        let text = query.query.trim().trim_end_matches(';');
        let mut sql = String::new();
        if !query.schema.is_empty() {
            sql.push_str(&format!("USE {};\n", query.schema));
        }
        sql.push_str(text);
        sql.push(';');
        if self.options.need_comment {
            sql.push_str(&provenance.to_string());
        }
        if !query.schema.is_empty() && text.to_ascii_uppercase().starts_with("CREATE DATABASE") {
            sql.push_str(&format!("\nUSE {};", query.schema));
        }

        Some(ReconstructedStatement {
            sql,
            schema: None,
            table: None,
        })
    }

    fn target<'a>(&'a self, event: &'a RowsEventData) -> (&'a str, &'a str) {
        (
            self.options.rename_db.resolve(&event.schema),
            self.options.rename_tb.resolve(&event.table),
        )
    }

    fn insert_pattern(&self, event: &RowsEventData, values: Row) -> Pattern {
        let (db, tb) = self.target(event);
        let verb = if self.options.replace {
            "REPLACE INTO"
        } else if self.options.insert_ignore {
            "INSERT IGNORE INTO"
        } else {
            "INSERT INTO"
        };
        let columns: Vec<String> = values.names().map(quote_ident).collect();
        let placeholders = vec!["%s"; values.len()];
        Pattern {
            template: format!(
                "{} {}.{}({}) VALUES ({});",
                verb,
                quote_ident(db),
                quote_ident(tb),
                columns.join(","),
                placeholders.join(",")
            ),
            values: values.values().cloned().collect(),
        }
    }

    fn delete_pattern(&self, event: &RowsEventData, values: &Row) -> Pattern {
        let (db, tb) = self.target(event);
        let key = self.where_image(event, values);
        Pattern {
            template: format!(
                "DELETE FROM {}.{} WHERE {} LIMIT 1;",
                quote_ident(db),
                quote_ident(tb),
                where_clause(&key)
            ),
            values: key.values().cloned().collect(),
        }
    }

    /// `set` becomes the new row, `matching` identifies the old one
    fn update_pattern(&self, event: &RowsEventData, matching: Row, set: Row) -> Pattern {
        let (db, tb) = self.target(event);
        if self.options.update_to_replace {
            return Pattern {
                template: format!(
                    "REPLACE INTO {}.{} SET {};",
                    quote_ident(db),
                    quote_ident(tb),
                    set_clause(&set)
                ),
                values: set.values().cloned().collect(),
            };
        }

        let key = self.where_image(event, &matching);
        let mut values: Vec<Value> = set.values().cloned().collect();
        values.extend(key.values().cloned());
        Pattern {
            template: format!(
                "UPDATE {}.{} SET {} WHERE {} LIMIT 1;",
                quote_ident(db),
                quote_ident(tb),
                set_clause(&set),
                where_clause(&key)
            ),
            values,
        }
    }

    fn where_image(&self, event: &RowsEventData, image: &Row) -> Row {
        if self.options.only_pk && !event.primary_key.is_empty() {
            image.project(event.primary_key.iter().map(String::as_str))
        } else {
            image.clone()
        }
    }

    fn render(&self, pattern: Pattern, provenance: &Provenance) -> String {
        let kinds: Vec<ValueKind> = pattern.values.iter().map(Value::kind).collect();
        let values: Vec<Value> = pattern.values.into_iter().map(Value::fix_bytes).collect();
        let (sql, spans) = mogrify(&pattern.template, &values, &kinds);
        let mut sql = fix_hex_values(&sql, &spans);
        if self.options.need_comment {
            sql.push_str(&provenance.to_string());
        }
        sql
    }
}

fn event_name(event: &LogEvent) -> &'static str {
    match event {
        LogEvent::Rotate(_) => "Rotate",
        LogEvent::FormatDescription(_) => "FormatDescription",
        LogEvent::Gtid(_) => "Gtid",
        LogEvent::TableMap(_) => "TableMap",
        LogEvent::Xid(_) => "Xid",
        LogEvent::Heartbeat => "Heartbeat",
        _ => "Unimplemented",
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn set_clause(row: &Row) -> String {
    row.names()
        .map(|k| format!("{}=%s", quote_ident(k)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn where_clause(row: &Row) -> String {
    row.iter()
        .map(|(k, v)| {
            if v.is_null() {
                format!("{} IS %s", quote_ident(k))
            } else {
                format!("{}=%s", quote_ident(k))
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// A bound literal inside rendered SQL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralSpan {
    pub range: Range<usize>,
    pub kind: ValueKind,
}

/// Bind values into a `%s` template. Returns the SQL and where each literal
/// landed.
pub fn mogrify(template: &str, values: &[Value], kinds: &[ValueKind]) -> (String, Vec<LiteralSpan>) {
    let mut sql = String::with_capacity(template.len() + values.len() * 8);
    let mut spans = Vec::with_capacity(values.len());
    let mut rest = template;
    let mut index = 0;

    while let Some(at) = rest.find("%s") {
        sql.push_str(&rest[..at]);
        rest = &rest[at + 2..];
        match values.get(index) {
            Some(value) => {
                let start = sql.len();
                sql.push_str(&literal(value));
                spans.push(LiteralSpan {
                    range: start..sql.len(),
                    kind: kinds.get(index).copied().unwrap_or_else(|| value.kind()),
                });
            }
            None => sql.push_str("%s"),
        }
        index += 1;
    }
    sql.push_str(rest);
    (sql, spans)
}

/// Unquote `'0x..'` literals that were bound from binary values
pub fn fix_hex_values(sql: &str, spans: &[LiteralSpan]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut cursor = 0;
    for span in spans {
        let text = &sql[span.range.clone()];
        if span.kind == ValueKind::Bytes && text.starts_with("'0x") && text.ends_with('\'') {
            out.push_str(&sql[cursor..span.range.start]);
            out.push_str(&text[1..text.len() - 1]);
            cursor = span.range.end;
        }
    }
    out.push_str(&sql[cursor..]);
    out
}

/// MySQL literal for a fixed value
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) if f.is_finite() => f.to_string(),
        Value::Float(_) => "NULL".to_string(),
        Value::Decimal(d) => d.clone(),
        Value::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
        Value::String(s) => quote_string(s),
        Value::Bytes(b) => quote_string(&crate::value::hex_literal(b)),
        Value::Set(items) => quote_string(&items.join(",")),
        Value::List(_) | Value::Map(_) => quote_string(&value.to_json().to_string()),
    }
}

/// Single-quoted with MySQL backslash escapes
pub fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1a' => out.push_str("\\Z"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Apply the comment toggle to an already rendered line
pub fn without_comment(sql: &str) -> &str {
    strip_provenance(sql)
}
