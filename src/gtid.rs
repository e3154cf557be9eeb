//! GTID (Global Transaction ID) 집합
//!
//! GTID 형식: UUID:sequence-number
//! MySQL이 출력하는 집합 형식: "uuid1:1-100:200,uuid2:1-50"

use crate::error::{CdcError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// GTID 범위 (양 끝 포함)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GtidRange {
    pub start: u64,
    pub end: u64,
}

impl GtidRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(CdcError::GtidError(format!(
                "Invalid range: {} > {}",
                start, end
            )));
        }
        Ok(GtidRange { start, end })
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value <= self.end
    }

    pub fn covers(&self, other: &GtidRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    fn merge(&self, other: &GtidRange) -> Option<GtidRange> {
        // 겹치거나 연접한 범위만 병합
        if self.end.saturating_add(1) >= other.start && other.end.saturating_add(1) >= self.start {
            Some(GtidRange {
                start: self.start.min(other.start),
                end: self.end.max(other.end),
            })
        } else {
            None
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

/// 한 서버(UUID)의 GTID 범위들. 항상 정렬/병합된 상태를 유지한다.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UuidGtidSet {
    pub uuid: String,
    pub ranges: Vec<GtidRange>,
}

impl UuidGtidSet {
    pub fn new(uuid: impl Into<String>) -> Self {
        UuidGtidSet {
            uuid: uuid.into(),
            ranges: Vec::new(),
        }
    }

    pub fn add_range(&mut self, range: GtidRange) {
        self.ranges.push(range);
        self.ranges.sort();

        let mut merged: Vec<GtidRange> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) => match last.merge(&r) {
                    Some(m) => *last = m,
                    None => merged.push(r),
                },
                None => merged.push(r),
            }
        }
        self.ranges = merged;
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(sequence))
    }

    /// 모든 범위가 `other`의 어떤 범위 안에 완전히 들어가는지
    pub fn is_contained_within(&self, other: &UuidGtidSet) -> bool {
        self.ranges
            .iter()
            .all(|r| other.ranges.iter().any(|o| o.covers(r)))
    }
}

impl fmt::Display for UuidGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)?;
        for r in &self.ranges {
            write!(f, ":{}", r)?;
        }
        Ok(())
    }
}

/// 전체 GTID 집합 (여러 UUID)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidSet {
    pub sets: BTreeMap<String, UuidGtidSet>,
}

impl GtidSet {
    pub fn new() -> Self {
        GtidSet {
            sets: BTreeMap::new(),
        }
    }

    /// GTID 집합 문자열 파싱.
    ///
    /// `uuid:1-100:200,uuid2:1-50` 형식과 `uuid:1-100,200` 형식 모두 허용한다.
    /// 콤마 뒤의 공백/개행(`SHOW MASTER STATUS` 출력)은 무시한다.
    pub fn parse(gtid_str: &str) -> Result<Self> {
        let mut gtid_set = GtidSet::new();
        let trimmed = gtid_str.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("NULL") {
            return Ok(gtid_set);
        }

        let mut current: Option<String> = None;
        for part in trimmed.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let mut pieces = part.split(':');
            let head = pieces.next().unwrap_or_default();
            let intervals: Vec<&str> = if part.contains(':') {
                current = Some(head.to_lowercase());
                pieces.collect()
            } else {
                vec![head]
            };

            let uuid = current.clone().ok_or_else(|| {
                CdcError::GtidError(format!("Interval without server uuid: {}", part))
            })?;
            let uuid_set = gtid_set
                .sets
                .entry(uuid.clone())
                .or_insert_with(|| UuidGtidSet::new(uuid));

            for interval in intervals {
                uuid_set.add_range(parse_interval(interval)?);
            }
        }

        Ok(gtid_set)
    }

    pub fn add_gtid(&mut self, gtid: &str) -> Result<()> {
        let (uuid, seq) = gtid
            .split_once(':')
            .ok_or_else(|| CdcError::GtidError(format!("Invalid GTID format: {}", gtid)))?;
        let sequence = seq
            .parse::<u64>()
            .map_err(|_| CdcError::GtidError(format!("Invalid sequence: {}", seq)))?;

        let uuid = uuid.to_lowercase();
        self.sets
            .entry(uuid.clone())
            .or_insert_with(|| UuidGtidSet::new(uuid))
            .add_range(GtidRange::new(sequence, sequence)?);
        Ok(())
    }

    pub fn contains(&self, gtid: &str) -> bool {
        let Some((uuid, seq)) = gtid.split_once(':') else {
            return false;
        };
        match (seq.parse::<u64>(), self.sets.get(&uuid.to_lowercase())) {
            (Ok(sequence), Some(set)) => set.contains(sequence),
            _ => false,
        }
    }

    /// self의 모든 트랜잭션이 `other`에도 포함되는지
    pub fn is_contained_within(&self, other: &GtidSet) -> bool {
        self.sets.iter().all(|(uuid, set)| {
            if set.ranges.is_empty() {
                return true;
            }
            other
                .sets
                .get(uuid)
                .map(|o| set.is_contained_within(o))
                .unwrap_or(false)
        })
    }

    pub fn union(&self, other: &GtidSet) -> GtidSet {
        let mut result = self.clone();
        for (uuid, other_set) in &other.sets {
            let target = result
                .sets
                .entry(uuid.clone())
                .or_insert_with(|| UuidGtidSet::new(uuid.clone()));
            for r in &other_set.ranges {
                target.add_range(*r);
            }
        }
        result
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(|set| set.ranges.is_empty())
    }
}

fn parse_interval(interval: &str) -> Result<GtidRange> {
    let invalid = || CdcError::GtidError(format!("Invalid interval: {}", interval));
    match interval.split_once('-') {
        Some((start, end)) => {
            let start = start.trim().parse::<u64>().map_err(|_| invalid())?;
            let end = end.trim().parse::<u64>().map_err(|_| invalid())?;
            GtidRange::new(start, end)
        }
        None => {
            let seq = interval.trim().parse::<u64>().map_err(|_| invalid())?;
            GtidRange::new(seq, seq)
        }
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .sets
            .values()
            .filter(|s| !s.ranges.is_empty())
            .map(|s| s.to_string())
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

impl std::str::FromStr for GtidSet {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        GtidSet::parse(s)
    }
}

impl Serialize for GtidSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for GtidSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        GtidSet::parse(&s).map_err(serde::de::Error::custom)
    }
}
