//! GTID (Global Transaction ID) sets and filtering
//!
//! GTID format: UUID:transaction-number
//! Set format: "uuid1:1-100:200,uuid2:1-50"

use crate::error::{Binlog2SqlError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Inclusive range of transaction numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GtidRange {
    pub start: u64,
    pub end: u64,
}

impl GtidRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(Binlog2SqlError::GtidError(format!(
                "invalid range: {} > {}",
                start, end
            )));
        }
        Ok(GtidRange { start, end })
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value <= self.end
    }

    /// Union of two overlapping or adjacent ranges
    pub fn merge(&self, other: &GtidRange) -> Option<GtidRange> {
        if self.end.saturating_add(1) >= other.start && other.end.saturating_add(1) >= self.start {
            Some(GtidRange {
                start: self.start.min(other.start),
                end: self.end.max(other.end),
            })
        } else {
            None
        }
    }

    /// `n` or `n-m`
    fn parse(text: &str) -> Result<Self> {
        let invalid = || Binlog2SqlError::GtidError(format!("invalid interval: {}", text));
        match text.split_once('-') {
            Some((start, end)) => GtidRange::new(
                start.trim().parse().map_err(|_| invalid())?,
                end.trim().parse().map_err(|_| invalid())?,
            ),
            None => {
                let n = text.trim().parse().map_err(|_| invalid())?;
                GtidRange::new(n, n)
            }
        }
    }
}

impl fmt::Display for GtidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Source uuid -> ordered transaction ranges
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidRangeSet {
    pub sets: BTreeMap<String, Vec<GtidRange>>,
}

impl GtidRangeSet {
    pub fn new() -> Self {
        GtidRangeSet {
            sets: BTreeMap::new(),
        }
    }

    /// Parse `uuid:n-m:n2-m2,uuid2:...`. Whitespace and newlines (as
    /// printed by `SHOW MASTER STATUS`) are ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let mut set = GtidRangeSet::new();
        let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        if cleaned.is_empty() || cleaned.eq_ignore_ascii_case("NULL") {
            return Ok(set);
        }

        for part in cleaned.split(',').filter(|p| !p.is_empty()) {
            let mut fields = part.split(':');
            let uuid = fields.next().unwrap_or_default().to_ascii_lowercase();
            if uuid.is_empty() {
                return Err(Binlog2SqlError::GtidError(format!(
                    "missing uuid in {}",
                    part
                )));
            }
            let mut ranges = Vec::new();
            for interval in fields {
                ranges.push(GtidRange::parse(interval)?);
            }
            if ranges.is_empty() {
                return Err(Binlog2SqlError::GtidError(format!(
                    "no transaction ranges for {}",
                    uuid
                )));
            }
            for range in ranges {
                set.insert_range(&uuid, range);
            }
        }

        Ok(set)
    }

    fn insert_range(&mut self, uuid: &str, range: GtidRange) {
        let ranges = self.sets.entry(uuid.to_string()).or_default();
        ranges.push(range);
        ranges.sort();

        let mut merged: Vec<GtidRange> = Vec::with_capacity(ranges.len());
        for r in ranges.drain(..) {
            match merged.last_mut() {
                Some(last) => match last.merge(&r) {
                    Some(m) => *last = m,
                    None => merged.push(r),
                },
                None => merged.push(r),
            }
        }
        *ranges = merged;
    }

    /// Add a single transaction
    pub fn add(&mut self, uuid: &str, gno: u64) {
        self.insert_range(&uuid.to_ascii_lowercase(), GtidRange { start: gno, end: gno });
    }

    pub fn contains(&self, uuid: &str, gno: u64) -> bool {
        self.sets
            .get(&uuid.to_ascii_lowercase())
            .map(|ranges| ranges.iter().any(|r| r.contains(gno)))
            .unwrap_or(false)
    }

    pub fn has_uuid(&self, uuid: &str) -> bool {
        self.sets.contains_key(&uuid.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(|ranges| ranges.is_empty())
    }
}

impl fmt::Display for GtidRangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .sets
            .iter()
            .filter(|(_, ranges)| !ranges.is_empty())
            .map(|(uuid, ranges)| {
                let intervals: Vec<String> = ranges.iter().map(|r| r.to_string()).collect();
                format!("{}:{}", uuid, intervals.join(":"))
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

/// Split `uuid:gno`
pub fn parse_gtid(gtid: &str) -> Result<(String, u64)> {
    let (uuid, gno) = gtid
        .trim()
        .rsplit_once(':')
        .ok_or_else(|| Binlog2SqlError::GtidError(format!("invalid GTID: {}", gtid)))?;
    let gno = gno
        .parse()
        .map_err(|_| Binlog2SqlError::GtidError(format!("invalid transaction number: {}", gtid)))?;
    Ok((uuid.to_ascii_lowercase(), gno))
}

/// Include/exclude gate for transactions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidFilter {
    pub include: GtidRangeSet,
    pub exclude: GtidRangeSet,
}

impl GtidFilter {
    pub fn new(include: Option<&str>, exclude: Option<&str>) -> Result<Self> {
        Ok(GtidFilter {
            include: include.map(GtidRangeSet::parse).transpose()?.unwrap_or_default(),
            exclude: exclude.map(GtidRangeSet::parse).transpose()?.unwrap_or_default(),
        })
    }

    pub fn is_active(&self) -> bool {
        !self.include.is_empty() || !self.exclude.is_empty()
    }

    /// Include lists are allow-lists and take precedence for their uuid;
    /// exclude lists are deny-lists; other uuids pass.
    pub fn is_wanted(&self, uuid: &str, gno: u64) -> bool {
        if self.include.has_uuid(uuid) {
            return self.include.contains(uuid, gno);
        }
        if self.exclude.has_uuid(uuid) {
            return !self.exclude.contains(uuid, gno);
        }
        true
    }

    pub fn is_wanted_gtid(&self, gtid: &str) -> Result<bool> {
        let (uuid, gno) = parse_gtid(gtid)?;
        Ok(self.is_wanted(&uuid, gno))
    }

    /// Statements seen before any GTID event cannot be placed in a set;
    /// they pass unless an allow-list is configured.
    pub fn wants_unknown(&self) -> bool {
        self.include.is_empty()
    }
}

/// Highest transaction number still required per uuid by the include set.
///
/// Once every uuid has been passed the stream holds nothing more of
/// interest and reading can stop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaxPending {
    pending: BTreeMap<String, u64>,
}

impl MaxPending {
    pub fn from_include(include: &GtidRangeSet) -> Self {
        let pending = include
            .sets
            .iter()
            .filter_map(|(uuid, ranges)| ranges.iter().map(|r| r.end).max().map(|m| (uuid.clone(), m)))
            .collect();
        MaxPending { pending }
    }

    /// Record a transaction; drops the uuid once it has moved past its maximum
    pub fn observe(&mut self, uuid: &str, gno: u64) {
        let uuid = uuid.to_ascii_lowercase();
        if let Some(&max) = self.pending.get(&uuid) {
            if gno > max {
                debug!("GTID {}:{} passed last wanted transaction {}", uuid, gno, max);
                self.pending.remove(&uuid);
            }
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn get(&self, uuid: &str) -> Option<u64> {
        self.pending.get(&uuid.to_ascii_lowercase()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID1: &str = "550e8400-e29b-41d4-a716-446655440000";
    const UUID2: &str = "6ea67fc8-c260-11eb-8c17-00163e0ef40e";

    #[test]
    fn test_parse_multiple_intervals() {
        let text = format!("{}:1-100:200:300-400,\n{}:5", UUID1, UUID2);
        let set = GtidRangeSet::parse(&text).unwrap();
        assert_eq!(set.sets[UUID1].len(), 3);
        assert!(set.contains(UUID1, 200));
        assert!(!set.contains(UUID1, 201));
        assert!(set.contains(UUID2, 5));
        assert_eq!(set.to_string(), format!("{}:1-100:200:300-400,{}:5", UUID1, UUID2));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(GtidRangeSet::parse(&format!("{}:20-10", UUID1)).is_err());
        assert!(GtidRangeSet::parse(&format!("{}:abc", UUID1)).is_err());
        assert!(GtidRangeSet::parse(UUID1).is_err());
        assert!(GtidRangeSet::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_add_merges_adjacent() {
        let mut set = GtidRangeSet::new();
        set.add(UUID1, 1);
        set.add(UUID1, 3);
        set.add(UUID1, 2);
        assert_eq!(set.sets[UUID1], vec![GtidRange::new(1, 3).unwrap()]);
    }

    #[test]
    fn test_include_filter() {
        let filter = GtidFilter::new(Some(&format!("{}:10-20", UUID1)), None).unwrap();
        for gno in [10, 15, 20] {
            assert!(filter.is_wanted(UUID1, gno));
        }
        for gno in [9, 21] {
            assert!(!filter.is_wanted(UUID1, gno));
        }
    }

    #[test]
    fn test_exclude_filter() {
        let filter = GtidFilter::new(None, Some(&format!("{}:10-20", UUID1))).unwrap();
        for gno in [10, 15, 20] {
            assert!(!filter.is_wanted(UUID1, gno));
        }
        for gno in [9, 21] {
            assert!(filter.is_wanted(UUID1, gno));
        }
        assert!(filter.wants_unknown());
    }

    #[test]
    fn test_include_takes_precedence() {
        let filter = GtidFilter::new(
            Some(&format!("{}:10-20", UUID1)),
            Some(&format!("{}:15", UUID1)),
        )
        .unwrap();
        assert!(filter.is_wanted(UUID1, 15));
        assert!(filter.is_wanted(UUID2, 1));
        assert!(!filter.wants_unknown());
        assert!(filter.is_wanted_gtid(&format!("{}:12", UUID1)).unwrap());
    }

    #[test]
    fn test_max_pending() {
        let include = GtidRangeSet::parse(&format!("{}:1-5:8-10,{}:3", UUID1, UUID2)).unwrap();
        let mut pending = MaxPending::from_include(&include);
        assert_eq!(pending.get(UUID1), Some(10));

        pending.observe(UUID1, 10);
        assert!(!pending.is_exhausted());
        pending.observe(UUID1, 11);
        pending.observe(UUID2, 4);
        assert!(pending.is_exhausted());
    }
}
