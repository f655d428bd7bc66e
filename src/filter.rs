//! Row and object filters
//!
//! `--where` style row predicates, schema/table allow and deny lists,
//! rename maps, and the column pruning applied to row images before SQL
//! generation.

use crate::error::{Binlog2SqlError, Result};
use crate::value::{Row, Value};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use tracing::warn;

static DROPPED_COLUMN_REGEX: OnceLock<Regex> = OnceLock::new();

fn dropped_column_regex() -> &'static Regex {
    DROPPED_COLUMN_REGEX.get_or_init(|| Regex::new(r"__dropped_col_\d+__").unwrap())
}

/// Byte offsets of `text` outside quoted literals and backquoted names
fn unquoted_offsets(text: &str) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(text.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        match quote {
            Some(_) if escaped => escaped = false,
            Some(q) if c == '\\' && q != '`' => escaped = true,
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if matches!(c, '\'' | '"' | '`') => quote = Some(c),
            None => offsets.push(i),
        }
    }
    offsets
}

fn keyword_at(text: &str, at: usize, keyword: &str) -> bool {
    text.get(at..at + keyword.len())
        .map_or(false, |s| s.eq_ignore_ascii_case(keyword))
}

fn contains_unquoted(text: &str, keyword: &str) -> bool {
    unquoted_offsets(text)
        .into_iter()
        .any(|at| keyword_at(text, at, keyword))
}

/// Split on `separator` (case-insensitive) wherever it is not quoted
fn split_unquoted<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut start = 0;
    for at in unquoted_offsets(text) {
        if at >= start && keyword_at(text, at, separator) {
            parts.push(&text[start..at]);
            start = at + separator.len();
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Comparison operator of a single condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Is,
    In,
}

impl Operator {
    /// Tried in order at each unquoted offset, so two-character operators
    /// win over their one-character prefixes
    const SEARCH_ORDER: [(&'static str, Operator); 9] = [
        (">=", Operator::Ge),
        ("<=", Operator::Le),
        ("!=", Operator::Ne),
        ("<>", Operator::Ne),
        ("=", Operator::Eq),
        (">", Operator::Gt),
        ("<", Operator::Lt),
        (" IS ", Operator::Is),
        (" IN ", Operator::In),
    ];
}

/// Right-hand side of a condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Int(i64),
    Text(String),
    Null,
    NotNull,
    List(Vec<Literal>),
}

impl Literal {
    fn parse(raw: &str) -> Literal {
        let raw = raw.trim();
        if raw == "''" || raw == "\"\"" {
            return Literal::Text(String::new());
        }
        if let Ok(i) = raw.parse::<i64>() {
            return Literal::Int(i);
        }
        Literal::Text(unquote(raw).to_string())
    }
}

fn unquote(raw: &str) -> &str {
    let bytes = raw.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'\'' || bytes[0] == b'"')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        &raw[1..raw.len() - 1]
    } else {
        raw
    }
}

/// `column <op> literal`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub column: String,
    pub operator: Operator,
    pub value: Literal,
}

impl FilterCondition {
    /// Parse one comparison such as `` `id`>=10 ``, `name IS NULL` or
    /// `status IN (1,2,'x')`.
    pub fn parse(text: &str) -> Result<Self> {
        let (at, token, operator) = unquoted_offsets(text)
            .into_iter()
            .find_map(|at| {
                Operator::SEARCH_ORDER
                    .iter()
                    .find(|(token, _)| keyword_at(text, at, token))
                    .map(|(token, op)| (at, *token, *op))
            })
            .ok_or_else(|| {
                Binlog2SqlError::ConditionError(format!("unsupported condition: {}", text))
            })?;

        let column = &text[..at];
        let raw = &text[at + token.len()..];
        let column = column.trim().replace('`', "");
        if column.is_empty() {
            return Err(Binlog2SqlError::ConditionError(format!(
                "missing column in condition: {}",
                text
            )));
        }
        let raw = raw.trim();

        let value = match operator {
            Operator::Is => match raw.to_ascii_uppercase().as_str() {
                "NULL" => Literal::Null,
                "NOT NULL" => Literal::NotNull,
                _ => Literal::parse(raw),
            },
            Operator::In => {
                let (open, close) = match (raw.find('('), raw.rfind(')')) {
                    (Some(open), Some(close)) if open < close => (open, close),
                    _ => {
                        return Err(Binlog2SqlError::ConditionError(format!(
                            "IN list must be parenthesised: {}",
                            text
                        )))
                    }
                };
                Literal::List(
                    split_unquoted(&raw[open + 1..close], ",")
                        .into_iter()
                        .map(Literal::parse)
                        .collect(),
                )
            }
            _ => Literal::parse(raw),
        };

        Ok(FilterCondition {
            column,
            operator,
            value,
        })
    }

    /// Evaluate against a row image. A column missing from the row never
    /// matches.
    pub fn matches(&self, row: &Row) -> bool {
        let actual = match row.get(&self.column) {
            Some(v) => v,
            None => return false,
        };

        match (&self.operator, &self.value) {
            (Operator::Is, Literal::Null) => actual.is_null(),
            (Operator::Is, Literal::NotNull) => !actual.is_null(),
            (Operator::In, Literal::List(items)) => items
                .iter()
                .any(|item| compare(actual, item) == Some(Ordering::Equal)),
            (op, literal) => {
                let ord = compare(actual, literal);
                match op {
                    Operator::Eq | Operator::Is => ord == Some(Ordering::Equal),
                    Operator::Ne => ord != Some(Ordering::Equal),
                    Operator::Gt => ord == Some(Ordering::Greater),
                    Operator::Ge => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
                    Operator::Lt => ord == Some(Ordering::Less),
                    Operator::Le => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
                    Operator::In => false,
                }
            }
        }
    }
}

/// Order a decoded value against a literal; `None` when incomparable
fn compare(actual: &Value, literal: &Literal) -> Option<Ordering> {
    match (actual, literal) {
        (Value::Null, _) => None,
        (Value::Int(a), Literal::Int(b)) => Some(a.cmp(b)),
        (Value::UInt(a), Literal::Int(b)) => Some((*a as i128).cmp(&(*b as i128))),
        (Value::Bool(a), Literal::Int(b)) => Some((*a as i64).cmp(b)),
        (Value::Float(_) | Value::Decimal(_), Literal::Int(b)) => {
            actual.as_f64()?.partial_cmp(&(*b as f64))
        }
        (Value::Float(a), Literal::Text(b)) => a.partial_cmp(&b.parse::<f64>().ok()?),
        (Value::Decimal(a), Literal::Text(b)) => {
            match (a.parse::<f64>(), b.parse::<f64>()) {
                (Ok(x), Ok(y)) => x.partial_cmp(&y),
                _ => Some(a.as_str().cmp(b.as_str())),
            }
        }
        (Value::String(a), Literal::Text(b)) => Some(a.as_str().cmp(b.as_str())),
        (Value::String(a), Literal::Int(b)) => Some(a.as_str().cmp(b.to_string().as_str())),
        (Value::Set(items), Literal::Text(b)) => Some(items.join(",").as_str().cmp(b.as_str())),
        _ => None,
    }
}

/// One entry of the implicit AND list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConditionGroup {
    Single(FilterCondition),
    /// Any member holding satisfies the group
    Any(Vec<FilterCondition>),
}

impl ConditionGroup {
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            ConditionGroup::Single(cond) => cond.matches(row),
            ConditionGroup::Any(conds) => conds.iter().any(|c| c.matches(row)),
        }
    }
}

/// Row predicate assembled from several `--where` arguments
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowFilter {
    pub groups: Vec<ConditionGroup>,
}

impl RowFilter {
    /// Each argument is one AND term; ` OR ` inside an argument makes it an
    /// OR group. Explicit `AND` and fully parenthesised terms are rejected.
    pub fn parse<S: AsRef<str>>(conditions: &[S]) -> Result<Self> {
        let mut groups = Vec::with_capacity(conditions.len());
        for condition in conditions {
            let condition = condition.as_ref();
            if contains_unquoted(condition, " AND ") {
                return Err(Binlog2SqlError::ConditionError(format!(
                    "{}: pass each AND term as a separate condition",
                    condition
                )));
            }
            let trimmed = condition.trim();
            if trimmed.starts_with('(') && trimmed.ends_with(')') {
                return Err(Binlog2SqlError::ConditionError(format!(
                    "{}: do not wrap a condition in parentheses",
                    condition
                )));
            }

            let mut members = Vec::new();
            for part in split_unquoted(trimmed, " OR ") {
                members.push(FilterCondition::parse(part)?);
            }
            let group = if members.len() == 1 {
                ConditionGroup::Single(members.remove(0))
            } else {
                ConditionGroup::Any(members)
            };
            groups.push(group);
        }
        Ok(RowFilter { groups })
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Every group must hold; an empty filter accepts everything
    pub fn matches(&self, row: &Row) -> bool {
        self.groups.iter().all(|g| g.matches(row))
    }
}

/// `old -> new` name mapping with `*` as the fallback key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameMap {
    map: HashMap<String, String>,
}

impl RenameMap {
    /// Entries are `"old new"` or just `"new"` (which renames everything)
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let mut map = HashMap::new();
        for entry in entries {
            let fields: Vec<&str> = entry.as_ref().split_whitespace().collect();
            match fields.as_slice() {
                [new] => {
                    map.insert("*".to_string(), new.to_string());
                }
                [old, new] => {
                    map.insert(old.to_string(), new.to_string());
                }
                _ => {
                    return Err(Binlog2SqlError::IncompatibleOptions(format!(
                        "invalid rename entry: {:?}",
                        entry.as_ref()
                    )))
                }
            }
        }
        Ok(RenameMap { map })
    }

    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.map
            .get(name)
            .or_else(|| self.map.get("*"))
            .map(String::as_str)
            .unwrap_or(name)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Allow and deny lists for schemas and tables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaFilter {
    pub only_schemas: HashSet<String>,
    pub only_tables: HashSet<String>,
    pub ignored_schemas: HashSet<String>,
    pub ignored_tables: HashSet<String>,
}

impl SchemaFilter {
    pub fn is_wanted(&self, schema: &str, table: &str) -> bool {
        if !self.only_schemas.is_empty() && !self.only_schemas.contains(schema) {
            return false;
        }
        if !self.only_tables.is_empty() && !self.only_tables.contains(table) {
            return false;
        }
        !(self.ignored_schemas.contains(schema) || self.ignored_tables.contains(table))
    }

    /// Query events are only subject to the schema lists
    pub fn is_schema_wanted(&self, schema: &str) -> bool {
        (self.only_schemas.is_empty() || self.only_schemas.contains(schema))
            && !self.ignored_schemas.contains(schema)
    }
}

/// Remove ignored columns; without an explicit list, optionally remove the
/// placeholder names given to columns the catalog no longer knows.
pub fn strip_columns(row: &mut Row, ignore_columns: &HashSet<String>, ignore_virtual_columns: bool) {
    if !ignore_columns.is_empty() {
        row.retain(|name, _| !ignore_columns.contains(name));
    } else if ignore_virtual_columns {
        row.retain(|name, _| !dropped_column_regex().is_match(name));
    }
}

/// Drop columns an update did not change.
///
/// `matching` is the image that becomes the WHERE clause and `set` the one
/// that becomes the SET clause; which row image plays which role depends on
/// the direction. Unchanged primary key columns stay in `matching` and leave
/// only `set`. Columns listed in `keep` are left alone.
pub fn prune_unchanged(matching: &mut Row, set: &mut Row, primary_key: &[String], keep: &HashSet<String>) {
    let unchanged: Vec<String> = matching
        .iter()
        .filter(|(name, value)| set.get(name) == Some(*value))
        .map(|(name, _)| name.to_string())
        .collect();

    for name in unchanged {
        if primary_key.iter().any(|pk| *pk == name) {
            set.remove(&name);
        } else if keep.contains(&name) {
            continue;
        } else {
            matching.remove(&name);
            set.remove(&name);
        }
    }

    if set.is_empty() {
        warn!("Update leaves no column to SET after pruning unchanged columns");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_parse_operators() {
        let c = FilterCondition::parse("`id` >= 10").unwrap();
        assert_eq!(c.column, "id");
        assert_eq!(c.operator, Operator::Ge);
        assert_eq!(c.value, Literal::Int(10));

        let c = FilterCondition::parse("name<>'bob'").unwrap();
        assert_eq!(c.operator, Operator::Ne);
        assert_eq!(c.value, Literal::Text("bob".to_string()));

        let c = FilterCondition::parse("deleted_at is null").unwrap();
        assert_eq!(c.operator, Operator::Is);
        assert_eq!(c.value, Literal::Null);

        let c = FilterCondition::parse("status in (1, 2,'x')").unwrap();
        assert_eq!(
            c.value,
            Literal::List(vec![
                Literal::Int(1),
                Literal::Int(2),
                Literal::Text("x".to_string())
            ])
        );

        let c = FilterCondition::parse("note=''").unwrap();
        assert_eq!(c.value, Literal::Text(String::new()));

        assert!(FilterCondition::parse("id LIKE 3").is_err());
    }

    #[test]
    fn test_operators_inside_quotes_are_literal() {
        let c = FilterCondition::parse("x IN ('a=b', 'c,d')").unwrap();
        assert_eq!(c.column, "x");
        assert_eq!(c.operator, Operator::In);
        assert_eq!(
            c.value,
            Literal::List(vec![
                Literal::Text("a=b".to_string()),
                Literal::Text("c,d".to_string())
            ])
        );

        let c = FilterCondition::parse("name > 'a=b'").unwrap();
        assert_eq!(c.column, "name");
        assert_eq!(c.operator, Operator::Gt);
        assert_eq!(c.value, Literal::Text("a=b".to_string()));

        let c = FilterCondition::parse("note='this is it'").unwrap();
        assert_eq!(c.operator, Operator::Eq);
        assert_eq!(c.value, Literal::Text("this is it".to_string()));
    }

    #[test]
    fn test_or_and_inside_quotes_do_not_split() {
        let filter = RowFilter::parse(&["name='tom or jerry'", "tag='salt and pepper'"]).unwrap();
        assert!(matches!(filter.groups[0], ConditionGroup::Single(_)));
        let hit = row(&[
            ("name", Value::from("tom or jerry")),
            ("tag", Value::from("salt and pepper")),
        ]);
        assert!(filter.matches(&hit));

        let filter = RowFilter::parse(&["name='a or b' or id=3"]).unwrap();
        assert!(matches!(filter.groups[0], ConditionGroup::Any(ref m) if m.len() == 2));
    }

    #[test]
    fn test_reject_and_and_parentheses() {
        assert!(RowFilter::parse(&["a=1 and b=2"]).is_err());
        assert!(RowFilter::parse(&["(a=1 or b=2)"]).is_err());
    }

    #[test]
    fn test_and_list_requires_every_term() {
        let filter = RowFilter::parse(&["id>5", "status='new'"]).unwrap();
        let hit = row(&[("id", Value::Int(6)), ("status", Value::from("new"))]);
        let miss = row(&[("id", Value::Int(6)), ("status", Value::from("old"))]);
        let missing = row(&[("id", Value::Int(6))]);
        assert!(filter.matches(&hit));
        assert!(!filter.matches(&miss));
        assert!(!filter.matches(&missing));
        assert!(RowFilter::default().matches(&miss));
    }

    #[test]
    fn test_or_group() {
        let filter = RowFilter::parse(&["id=1 OR id IN (7,8)"]).unwrap();
        assert!(matches!(filter.groups[0], ConditionGroup::Any(ref m) if m.len() == 2));
        assert!(filter.matches(&row(&[("id", Value::Int(1))])));
        assert!(filter.matches(&row(&[("id", Value::UInt(8))])));
        assert!(!filter.matches(&row(&[("id", Value::Int(2))])));
    }

    #[test]
    fn test_null_checks() {
        let is_null = RowFilter::parse(&["c IS NULL"]).unwrap();
        let not_null = RowFilter::parse(&["c IS NOT NULL"]).unwrap();
        let null_row = row(&[("c", Value::Null)]);
        let value_row = row(&[("c", Value::from("x"))]);
        assert!(is_null.matches(&null_row));
        assert!(!is_null.matches(&value_row));
        assert!(not_null.matches(&value_row));
    }

    #[test]
    fn test_rename_map() {
        let map = RenameMap::parse(&["db1 db1_bak", "archive"]).unwrap();
        assert_eq!(map.resolve("db1"), "db1_bak");
        assert_eq!(map.resolve("db2"), "archive");

        let specific = RenameMap::parse(&["t1 t1_new"]).unwrap();
        assert_eq!(specific.resolve("t2"), "t2");
        assert!(RenameMap::parse(&["a b c"]).is_err());
    }

    #[test]
    fn test_schema_filter() {
        let filter = SchemaFilter {
            only_schemas: ["db1".to_string()].into_iter().collect(),
            ignored_tables: ["audit".to_string()].into_iter().collect(),
            ..Default::default()
        };
        assert!(filter.is_wanted("db1", "orders"));
        assert!(!filter.is_wanted("db1", "audit"));
        assert!(!filter.is_wanted("db2", "orders"));
        assert!(filter.is_schema_wanted("db1"));
    }

    #[test]
    fn test_strip_columns() {
        let mut r = row(&[
            ("id", Value::Int(1)),
            ("__dropped_col_3__", Value::Int(0)),
            ("secret", Value::from("x")),
        ]);
        strip_columns(&mut r, &HashSet::new(), true);
        assert_eq!(r.names().collect::<Vec<_>>(), vec!["id", "secret"]);

        let ignore: HashSet<String> = ["secret".to_string()].into_iter().collect();
        strip_columns(&mut r, &ignore, true);
        assert_eq!(r.names().collect::<Vec<_>>(), vec!["id"]);
    }

    #[test]
    fn test_prune_unchanged() {
        let mut before = row(&[
            ("a", Value::Int(1)),
            ("b", Value::Int(2)),
            ("c", Value::Int(3)),
            ("id", Value::Int(9)),
        ]);
        let mut after = row(&[
            ("a", Value::Int(1)),
            ("b", Value::Int(20)),
            ("c", Value::Int(3)),
            ("id", Value::Int(9)),
        ]);
        prune_unchanged(&mut before, &mut after, &["id".to_string()], &HashSet::new());
        assert_eq!(before.names().collect::<Vec<_>>(), vec!["b", "id"]);
        assert_eq!(after.names().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn test_prune_with_after_image_as_where() {
        // flashback matches on the after image and restores the before image
        let mut after = row(&[("a", Value::Int(1)), ("b", Value::Int(20)), ("id", Value::Int(9))]);
        let mut before = row(&[("a", Value::Int(1)), ("b", Value::Int(2)), ("id", Value::Int(9))]);
        prune_unchanged(&mut after, &mut before, &["id".to_string()], &HashSet::new());
        assert_eq!(after.get("id"), Some(&Value::Int(9)));
        assert_eq!(after.names().collect::<Vec<_>>(), vec!["b", "id"]);
        assert_eq!(before.names().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn test_prune_keeps_listed_columns() {
        let mut before = row(&[("id", Value::Int(1)), ("v", Value::Int(1)), ("w", Value::Int(1))]);
        let mut after = row(&[("id", Value::Int(1)), ("v", Value::Int(1)), ("w", Value::Int(2))]);
        let keep: HashSet<String> = ["v".to_string()].into_iter().collect();
        prune_unchanged(&mut before, &mut after, &["id".to_string()], &keep);
        assert_eq!(before.names().collect::<Vec<_>>(), vec!["id", "v", "w"]);
        assert_eq!(after.names().collect::<Vec<_>>(), vec!["v", "w"]);
    }
}
