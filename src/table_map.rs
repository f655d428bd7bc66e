//! Table metadata resolution and caching
//!
//! Row events only carry a numeric table id plus raw column type codes. The
//! cache joins the table map seen in the stream with the catalog's column
//! descriptions (names, charsets, key flags) so row images can be decoded
//! into named, typed values.

use crate::error::{Binlog2SqlError, Result};
use crate::events::TableMapData;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Catalog lookups are attempted at most this many times per table
pub const MAX_CATALOG_ATTEMPTS: usize = 2;

static MEMBER_REGEX: OnceLock<Regex> = OnceLock::new();

fn member_regex() -> &'static Regex {
    MEMBER_REGEX.get_or_init(|| Regex::new(r"'((?:[^']|'')*)'").unwrap())
}

/// One row of `information_schema.columns`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub collation: Option<String>,
    pub charset: Option<String>,
    pub comment: String,
    /// Full SQL type, e.g. `int(10) unsigned` or `enum('a','b')`
    pub column_type: String,
    pub column_key: String,
    pub ordinal_position: u32,
}

impl ColumnInfo {
    pub fn new(name: &str, column_type: &str) -> Self {
        ColumnInfo {
            name: name.to_string(),
            collation: None,
            charset: None,
            comment: String::new(),
            column_type: column_type.to_string(),
            column_key: String::new(),
            ordinal_position: 0,
        }
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.column_key = key.to_string();
        self
    }

    pub fn with_charset(mut self, charset: &str) -> Self {
        self.charset = Some(charset.to_string());
        self
    }

    pub fn is_primary(&self) -> bool {
        self.column_key == "PRI"
    }

    pub fn is_unsigned(&self) -> bool {
        self.column_type.to_ascii_lowercase().contains("unsigned")
    }

    /// Member list of an `enum(...)`/`set(...)` type, in declaration order
    pub fn members(&self) -> Vec<String> {
        let lower = self.column_type.to_ascii_lowercase();
        if !(lower.starts_with("enum(") || lower.starts_with("set(")) {
            return Vec::new();
        }
        member_regex()
            .captures_iter(&self.column_type)
            .map(|c| c[1].replace("''", "'"))
            .collect()
    }
}

/// Schema catalog used to describe tables referenced by row events
#[async_trait]
pub trait Catalog: Send {
    /// Columns of `schema.table` ordered by ordinal position
    async fn table_columns(
        &mut self,
        schema: &str,
        table: &str,
        ignore_virtual_columns: bool,
    ) -> Result<Vec<ColumnInfo>>;

    /// Drop and re-open the underlying connection
    async fn reconnect(&mut self) -> Result<()>;

    /// Whether the source writes CRC32 checksums after every event
    async fn checksum_enabled(&mut self) -> Result<bool> {
        Ok(false)
    }
}

/// A fully described column as used by the row decoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub type_code: u8,
    pub meta: u16,
    pub sql_type: String,
    pub charset: Option<String>,
    pub is_primary: bool,
    pub unsigned: bool,
    pub members: Vec<String>,
}

impl ColumnDescriptor {
    /// Character columns are decoded to text, everything else stays bytes
    pub fn is_binary(&self) -> bool {
        match &self.charset {
            None => true,
            Some(cs) => cs.eq_ignore_ascii_case("binary"),
        }
    }
}

/// Resolved metadata for one table id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMapEntry {
    pub table_id: u64,
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnDescriptor>,
    pub primary_key: Vec<String>,
}

impl TableMapEntry {
    /// Join a binlog table map with catalog column descriptions.
    ///
    /// Columns the catalog no longer knows about (dropped since the event
    /// was written) are named `__dropped_col_<n>__`.
    pub fn build(map: &TableMapData, catalog_columns: &[ColumnInfo]) -> Self {
        let columns: Vec<ColumnDescriptor> = map
            .column_types
            .iter()
            .enumerate()
            .map(|(idx, &type_code)| {
                let meta = map.column_meta.get(idx).copied().unwrap_or(0);
                match catalog_columns.get(idx) {
                    Some(info) => ColumnDescriptor {
                        name: info.name.clone(),
                        type_code,
                        meta,
                        sql_type: info.column_type.clone(),
                        charset: info.charset.clone(),
                        is_primary: info.is_primary(),
                        unsigned: info.is_unsigned(),
                        members: info.members(),
                    },
                    None => ColumnDescriptor {
                        name: format!("__dropped_col_{}__", idx),
                        type_code,
                        meta,
                        sql_type: String::new(),
                        charset: None,
                        is_primary: false,
                        unsigned: false,
                        members: Vec::new(),
                    },
                }
            })
            .collect();

        let primary_key = columns
            .iter()
            .filter(|c| c.is_primary)
            .map(|c| c.name.clone())
            .collect();

        TableMapEntry {
            table_id: map.table_id,
            schema: map.schema.clone(),
            table: map.table.clone(),
            columns,
            primary_key,
        }
    }
}

/// Per-session cache of table id -> metadata.
///
/// Owned by a single `DecoderSession`; cleared wholesale on rotation since
/// table ids are reassigned when the server restarts.
pub struct TableMetadataCache {
    /// Table maps seen in the stream but not yet described by the catalog
    pending: HashMap<u64, TableMapData>,
    entries: HashMap<u64, TableMapEntry>,
    unavailable: HashSet<u64>,
    ignore_virtual_columns: bool,
    fail_on_unavailable: bool,
}

impl TableMetadataCache {
    pub fn new(ignore_virtual_columns: bool, fail_on_unavailable: bool) -> Self {
        TableMetadataCache {
            pending: HashMap::new(),
            entries: HashMap::new(),
            unavailable: HashSet::new(),
            ignore_virtual_columns,
            fail_on_unavailable,
        }
    }

    /// Record a table map event. A previously resolved entry for the same
    /// id is kept unless the id now names a different table.
    pub fn observe(&mut self, map: TableMapData) {
        if let Some(entry) = self.entries.get(&map.table_id) {
            if entry.schema == map.schema && entry.table == map.table {
                return;
            }
            self.entries.remove(&map.table_id);
        }
        self.unavailable.remove(&map.table_id);
        self.pending.insert(map.table_id, map);
    }

    /// Names the table id was last mapped to, resolved or not
    pub fn table_name(&self, table_id: u64) -> Option<(&str, &str)> {
        if let Some(entry) = self.entries.get(&table_id) {
            return Some((&entry.schema, &entry.table));
        }
        self.pending
            .get(&table_id)
            .map(|m| (m.schema.as_str(), m.table.as_str()))
    }

    /// Metadata for `table_id`, querying the catalog on first use.
    ///
    /// `Ok(None)` means the metadata is unavailable and the row event should
    /// be skipped; with fail-on-unavailable set this is an error instead.
    pub async fn resolve(
        &mut self,
        table_id: u64,
        catalog: &mut dyn Catalog,
        position: u64,
    ) -> Result<Option<&TableMapEntry>> {
        if self.entries.contains_key(&table_id) {
            return Ok(self.entries.get(&table_id));
        }
        if self.unavailable.contains(&table_id) {
            return self.unavailable_result(table_id, position, "previous lookup failed");
        }

        let map = match self.pending.remove(&table_id) {
            Some(map) => map,
            None => {
                return self.unavailable_result(table_id, position, "no table map event seen")
            }
        };

        match fetch_columns(catalog, &map, self.ignore_virtual_columns).await {
            Ok(columns) if !columns.is_empty() => {
                debug!(
                    "Resolved table {}.{} (id {}) with {} columns",
                    map.schema,
                    map.table,
                    table_id,
                    columns.len()
                );
                let entry = TableMapEntry::build(&map, &columns);
                self.entries.insert(table_id, entry);
                Ok(self.entries.get(&table_id))
            }
            Ok(_) => {
                let reason = format!("{}.{} not found in catalog", map.schema, map.table);
                self.unavailable.insert(table_id);
                self.unavailable_result(table_id, position, &reason)
            }
            Err(e) => {
                let reason = format!("{}.{}: {}", map.schema, map.table, e);
                self.unavailable.insert(table_id);
                self.unavailable_result(table_id, position, &reason)
            }
        }
    }

    fn unavailable_result(
        &self,
        table_id: u64,
        position: u64,
        reason: &str,
    ) -> Result<Option<&TableMapEntry>> {
        if self.fail_on_unavailable {
            return Err(Binlog2SqlError::MetadataUnavailable {
                table_id,
                position,
                reason: reason.to_string(),
            });
        }
        warn!(
            "Skipping row event at position {}: metadata for table id {} unavailable ({})",
            position, table_id, reason
        );
        Ok(None)
    }

    /// Drop everything; called on every rotate event
    pub fn invalidate(&mut self) {
        debug!(
            "Invalidating table metadata cache ({} entries)",
            self.entries.len()
        );
        self.pending.clear();
        self.entries.clear();
        self.unavailable.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Catalog query with bounded retry on lost connections
async fn fetch_columns(
    catalog: &mut dyn Catalog,
    map: &TableMapData,
    ignore_virtual_columns: bool,
) -> Result<Vec<ColumnInfo>> {
    let mut last_error = None;

    for attempt in 1..=MAX_CATALOG_ATTEMPTS {
        match catalog
            .table_columns(&map.schema, &map.table, ignore_virtual_columns)
            .await
        {
            Ok(columns) => return Ok(columns),
            Err(e) if e.is_transient() => {
                warn!(
                    "Catalog lookup for {}.{} failed (attempt {}/{}): {}",
                    map.schema, map.table, attempt, MAX_CATALOG_ATTEMPTS, e
                );
                if attempt < MAX_CATALOG_ATTEMPTS {
                    if let Err(reconnect_err) = catalog.reconnect().await {
                        warn!("Catalog reconnect failed: {}", reconnect_err);
                    }
                }
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        Binlog2SqlError::ConnectionError("catalog lookup exhausted retries".to_string())
    }))
}

/// In-memory catalog for tests
#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use crate::error::CR_SERVER_LOST;
    use std::collections::VecDeque;

    #[derive(Default)]
    pub(crate) struct MemoryCatalog {
        pub tables: HashMap<(String, String), Vec<ColumnInfo>>,
        /// Errors returned, in order, before any successful lookup
        pub failures: VecDeque<Binlog2SqlError>,
        pub lookups: usize,
        pub reconnects: usize,
        pub checksum: bool,
    }

    impl MemoryCatalog {
        pub(crate) fn with_table(mut self, schema: &str, table: &str, cols: Vec<ColumnInfo>) -> Self {
            self.tables
                .insert((schema.to_string(), table.to_string()), cols);
            self
        }

        pub(crate) fn lost_connection() -> Binlog2SqlError {
            Binlog2SqlError::QueryError {
                code: CR_SERVER_LOST,
                message: "Lost connection to MySQL server during query".to_string(),
            }
        }
    }

    #[async_trait]
    impl Catalog for MemoryCatalog {
        async fn table_columns(
            &mut self,
            schema: &str,
            table: &str,
            _ignore_virtual_columns: bool,
        ) -> Result<Vec<ColumnInfo>> {
            self.lookups += 1;
            if let Some(err) = self.failures.pop_front() {
                return Err(err);
            }
            Ok(self
                .tables
                .get(&(schema.to_string(), table.to_string()))
                .cloned()
                .unwrap_or_default())
        }

        async fn reconnect(&mut self) -> Result<()> {
            self.reconnects += 1;
            Ok(())
        }

        async fn checksum_enabled(&mut self) -> Result<bool> {
            Ok(self.checksum)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryCatalog;
    use super::*;

    fn orders_map(table_id: u64) -> TableMapData {
        TableMapData {
            table_id,
            schema: "db1".to_string(),
            table: "orders".to_string(),
            column_types: vec![3, 15],
            column_meta: vec![0, 64],
            null_bitmap: vec![0b10],
        }
    }

    fn orders_catalog() -> MemoryCatalog {
        MemoryCatalog::default().with_table(
            "db1",
            "orders",
            vec![
                ColumnInfo::new("id", "int(11)").with_key("PRI"),
                ColumnInfo::new("status", "varchar(16)").with_charset("utf8mb4"),
            ],
        )
    }

    #[test]
    fn test_column_members() {
        let col = ColumnInfo::new("c", "enum('a','it''s','b,c')");
        assert_eq!(col.members(), vec!["a", "it's", "b,c"]);
        let set = ColumnInfo::new("s", "set('x','y')");
        assert_eq!(set.members(), vec!["x", "y"]);
        assert!(ColumnInfo::new("v", "varchar(10)").members().is_empty());
        assert!(ColumnInfo::new("u", "int(10) unsigned").is_unsigned());
    }

    #[test]
    fn test_build_names_dropped_columns() {
        let mut map = orders_map(1);
        map.column_types.push(3);
        map.column_meta.push(0);
        let entry = TableMapEntry::build(&map, &[ColumnInfo::new("id", "int").with_key("PRI")]);
        let names: Vec<_> = entry.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "__dropped_col_1__", "__dropped_col_2__"]);
        assert_eq!(entry.primary_key, vec!["id"]);
    }

    #[tokio::test]
    async fn test_resolve_queries_catalog_once() {
        let mut catalog = orders_catalog();
        let mut cache = TableMetadataCache::new(false, false);
        cache.observe(orders_map(7));

        let entry = cache.resolve(7, &mut catalog, 100).await.unwrap().unwrap();
        assert_eq!(entry.primary_key, vec!["id"]);
        assert_eq!(entry.columns[1].charset.as_deref(), Some("utf8mb4"));

        cache.observe(orders_map(7));
        assert!(cache.resolve(7, &mut catalog, 200).await.unwrap().is_some());
        assert_eq!(catalog.lookups, 1);
    }

    #[tokio::test]
    async fn test_invalidate_on_rotate() {
        let mut catalog = orders_catalog();
        let mut cache = TableMetadataCache::new(false, false);
        cache.observe(orders_map(7));
        cache.resolve(7, &mut catalog, 100).await.unwrap();
        assert_eq!(cache.len(), 1);

        cache.invalidate();
        assert!(cache.is_empty());
        assert!(cache.resolve(7, &mut catalog, 300).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_error_retried_once() {
        let mut catalog = orders_catalog();
        catalog.failures.push_back(MemoryCatalog::lost_connection());
        let mut cache = TableMetadataCache::new(false, true);
        cache.observe(orders_map(7));

        assert!(cache.resolve(7, &mut catalog, 100).await.unwrap().is_some());
        assert_eq!(catalog.lookups, 2);
        assert_eq!(catalog.reconnects, 1);
    }

    #[tokio::test]
    async fn test_unavailable_fail_fast() {
        let mut catalog = orders_catalog();
        catalog.failures.push_back(MemoryCatalog::lost_connection());
        catalog.failures.push_back(MemoryCatalog::lost_connection());
        let mut cache = TableMetadataCache::new(false, true);
        cache.observe(orders_map(7));

        let err = cache.resolve(7, &mut catalog, 120).await.unwrap_err();
        assert!(matches!(
            err,
            Binlog2SqlError::MetadataUnavailable {
                table_id: 7,
                position: 120,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unavailable_skips_without_fail_fast() {
        let mut catalog = MemoryCatalog::default();
        let mut cache = TableMetadataCache::new(false, false);
        cache.observe(orders_map(9));
        assert!(cache.resolve(9, &mut catalog, 50).await.unwrap().is_none());
        // not re-queried until the next table map
        assert!(cache.resolve(9, &mut catalog, 60).await.unwrap().is_none());
        assert_eq!(catalog.lookups, 1);
    }
}
