//! Dynamically typed column values and ordered row images

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// A single decoded column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    /// Exact numeric rendered from its decimal digits
    Decimal(String),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    Set(Vec<String>),
    List(Vec<Value>),
    /// Ordered JSON object; keys may still be raw bytes until fixed
    Map(Vec<(Value, Value)>),
}

/// The declared type of a value before rendering.
///
/// The SQL engine keeps one of these per bound parameter so it can tell a
/// hex literal apart from a string that merely starts with `0x`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Null,
    Number,
    Bool,
    String,
    Bytes,
    Set,
    Structured,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Int(_) | Value::UInt(_) | Value::Float(_) | Value::Decimal(_) => {
                ValueKind::Number
            }
            Value::Bool(_) => ValueKind::Bool,
            Value::String(_) => ValueKind::String,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Set(_) => ValueKind::Set,
            Value::List(_) | Value::Map(_) => ValueKind::Structured,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::UInt(u) => Some(*u as f64),
            Value::Float(f) => Some(*f),
            Value::Decimal(d) => d.parse().ok(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Replace raw bytes with text so the value can be bound into SQL.
    ///
    /// Top-level bytes come from binary/blob columns and always become a
    /// `0x..` literal. Bytes nested inside structured values are decoded as
    /// text when possible and fall back to the hex literal otherwise.
    pub fn fix_bytes(self) -> Value {
        self.fix_at(false)
    }

    fn fix_at(self, nested: bool) -> Value {
        match self {
            Value::Bytes(bytes) if nested => Value::String(decode_text_or_hex(&bytes)),
            Value::Bytes(bytes) => Value::String(hex_literal(&bytes)),
            Value::List(items) => Value::List(items.into_iter().map(|v| v.fix_at(true)).collect()),
            Value::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.fix_at(true), v.fix_at(true)))
                    .collect(),
            ),
            other => other,
        }
    }

    /// JSON view of the value; bytes are rendered as hex literals.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Int(i) => serde_json::Value::from(*i),
            Value::UInt(u) => serde_json::Value::from(*u),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Decimal(d) => serde_json::Value::String(d.clone()),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(hex_literal(b)),
            Value::Set(items) => serde_json::Value::String(items.join(",")),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(entries) => {
                let mut map = serde_json::Map::with_capacity(entries.len());
                for (k, v) in entries {
                    map.insert(k.key_text(), v.to_json());
                }
                serde_json::Value::Object(map)
            }
        }
    }

    fn key_text(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Bytes(b) => decode_text_or_hex(b),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(i) => write!(f, "{}", i),
            Value::UInt(u) => write!(f, "{}", u),
            Value::Float(v) => write!(f, "{}", v),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Bool(b) => write!(f, "{}", if *b { 1 } else { 0 }),
            Value::String(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "{}", hex_literal(b)),
            Value::Set(items) => write!(f, "{}", items.join(",")),
            Value::List(_) | Value::Map(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

/// `0x` followed by upper-case hex digits
pub fn hex_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        out.push_str(&format!("{:02X}", b));
    }
    out
}

/// Inverse of [`hex_literal`].
pub fn parse_hex_literal(literal: &str) -> Option<Vec<u8>> {
    let digits = literal.strip_prefix("0x")?;
    if digits.len() % 2 != 0 {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).ok())
        .collect()
}

/// Best-effort text decoding of a nested byte string.
fn decode_text_or_hex(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(err) => {
            warn!(
                "Encoding fallback: {} bytes not decodable as text ({}), rendering as hex",
                bytes.len(),
                err
            );
            hex_literal(bytes)
        }
    }
}

/// Column name to value mapping preserving column order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Row {
            columns: Vec::new(),
        }
    }

    /// Insert or overwrite, keeping the original position on overwrite.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.columns.iter().position(|(n, _)| n == name)?;
        Some(self.columns.remove(idx).1)
    }

    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str, &Value) -> bool,
    {
        self.columns.retain(|(n, v)| keep(n, v));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.columns.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Sub-row restricted to `names`, in the order given.
    pub fn project<'a, I>(&self, names: I) -> Row
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut row = Row::new();
        for name in names {
            let value = self.get(name).cloned().unwrap_or(Value::Null);
            row.insert(name, value);
        }
        row
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Row {
    fn from_iter<T: IntoIterator<Item = (K, Value)>>(iter: T) -> Self {
        let mut row = Row::new();
        for (k, v) in iter {
            row.insert(k, v);
        }
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_literal_roundtrip() {
        let bytes = vec![0x00, 0xab, 0x10, 0xff];
        let lit = hex_literal(&bytes);
        assert_eq!(lit, "0x00AB10FF");
        assert_eq!(parse_hex_literal(&lit), Some(bytes));
        assert_eq!(parse_hex_literal("0xABC"), None);
    }

    #[test]
    fn test_top_level_bytes_become_hex() {
        let fixed = Value::Bytes(b"abc".to_vec()).fix_bytes();
        assert_eq!(fixed, Value::String("0x616263".to_string()));
    }

    #[test]
    fn test_nested_bytes_decoded_keys_and_values() {
        let value = Value::Map(vec![
            (Value::Bytes(b"name".to_vec()), Value::Bytes(b"bob".to_vec())),
            (
                Value::String("blob".to_string()),
                Value::List(vec![Value::Bytes(vec![0xff, 0xfe]), Value::Int(1)]),
            ),
        ]);
        let fixed = value.fix_bytes();
        assert_eq!(
            fixed.to_json(),
            serde_json::json!({"name": "bob", "blob": ["0xFFFE", 1]})
        );
    }

    #[test]
    fn test_row_preserves_order() {
        let mut row = Row::new();
        row.insert("id", Value::Int(1));
        row.insert("name", Value::from("a"));
        row.insert("id", Value::Int(2));
        assert_eq!(row.names().collect::<Vec<_>>(), vec!["id", "name"]);
        assert_eq!(row.get("id"), Some(&Value::Int(2)));
        assert_eq!(row.remove("name"), Some(Value::from("a")));
        assert_eq!(row.len(), 1);
    }

    #[test]
    fn test_project() {
        let row: Row = vec![("a", Value::Int(1)), ("b", Value::Int(2)), ("c", Value::Int(3))]
            .into_iter()
            .collect();
        let pk = row.project(["c", "a"]);
        assert_eq!(pk.names().collect::<Vec<_>>(), vec!["c", "a"]);
    }
}
