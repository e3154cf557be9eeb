//! 복제 위치 (Binlog 좌표 + 하트비트)
//!
//! Binlog 파일명 + 위치로 정확한 재시작 지점을 추적합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치

use crate::gtid::GtidSet;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::fmt;

/// Binlog 파일은 4 바이트 매직 헤더 뒤부터 이벤트가 시작된다
pub const BINLOG_START_OFFSET: u64 = 4;

/// Binlog 파일 위치 정보
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub file: String,
    /// 바이트 위치
    pub offset: u64,
    /// GTID 모드일 때 이 지점까지 실행된 GTID 집합
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid_set: Option<GtidSet>,
}

impl BinlogPosition {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        BinlogPosition {
            file: file.into(),
            offset,
            gtid_set: None,
        }
    }

    pub fn with_gtid_set(mut self, gtid_set: GtidSet) -> Self {
        self.gtid_set = Some(gtid_set);
        self
    }

    pub fn start_of(file: impl Into<String>) -> Self {
        BinlogPosition::new(file, BINLOG_START_OFFSET)
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        file_sequence(&self.file)
    }

    /// 파일/오프셋 기준 비교 (GTID는 보지 않음)
    pub fn cmp_coordinates(&self, other: &BinlogPosition) -> Ordering {
        compare_files(&self.file, &other.file).then(self.offset.cmp(&other.offset))
    }

    /// GTID 집합이 있으면 포함 관계로, 없으면 파일/오프셋으로 비교한다
    pub fn newer_than(&self, other: &BinlogPosition) -> bool {
        if let (Some(mine), Some(theirs)) = (&self.gtid_set, &other.gtid_set) {
            return !mine.is_contained_within(theirs);
        }
        self.cmp_coordinates(other) == Ordering::Greater
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)?;
        if let Some(gtid) = &self.gtid_set {
            write!(f, "[{}]", gtid)?;
        }
        Ok(())
    }
}

pub fn file_sequence(file: &str) -> Option<u64> {
    file.rsplit('.').next().and_then(|s| s.parse().ok())
}

/// `mysql-bin.000009` < `mysql-bin.000010`; 번호가 없으면 문자열 비교
pub fn compare_files(a: &str, b: &str) -> Ordering {
    match (file_sequence(a), file_sequence(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// 복제 위치: binlog 좌표 + 마지막으로 읽은 하트비트 값
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Position {
    #[serde(flatten)]
    pub binlog: BinlogPosition,
    #[serde(default)]
    pub last_heartbeat_read: u64,
}

impl Position {
    pub fn new(binlog: BinlogPosition, last_heartbeat_read: u64) -> Self {
        Position {
            binlog,
            last_heartbeat_read,
        }
    }

    pub fn at(file: impl Into<String>, offset: u64) -> Self {
        Position::new(BinlogPosition::new(file, offset), 0)
    }

    pub fn with_heartbeat(&self, heartbeat: u64) -> Position {
        Position {
            binlog: self.binlog.clone(),
            last_heartbeat_read: heartbeat,
        }
    }

    pub fn newer_than(&self, other: &Position) -> bool {
        if self.binlog.newer_than(&other.binlog) {
            return true;
        }
        self.binlog == other.binlog && self.last_heartbeat_read > other.last_heartbeat_read
    }

    /// 스키마 스냅샷 중복 판정용 지문: sha1("server/file/offset/heartbeat")
    pub fn sha(&self, server_id: u64) -> String {
        let mut hasher = Sha1::new();
        hasher.update(
            format!(
                "{}/{}/{}/{}",
                server_id, self.binlog.file, self.binlog.offset, self.last_heartbeat_read
            )
            .as_bytes(),
        );
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (heartbeat {})", self.binlog, self.last_heartbeat_read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binlog_position_sequence() {
        let pos = BinlogPosition::new("mysql-bin.000123", 4096);
        assert_eq!(pos.file_sequence(), Some(123));
    }

    #[test]
    fn test_newer_than_across_files() {
        let a = Position::at("mysql-bin.000009", 9000);
        let b = Position::at("mysql-bin.000010", 4);
        assert!(b.newer_than(&a));
        assert!(!a.newer_than(&b));
        assert!(!a.newer_than(&a));
    }

    #[test]
    fn test_newer_than_heartbeat_tiebreak() {
        let a = Position::at("bin.3", 500);
        assert!(a.with_heartbeat(7).newer_than(&a));
    }

    #[test]
    fn test_newer_than_gtid() {
        let uuid = "550e8400-e29b-41d4-a716-446655440000";
        let old = BinlogPosition::new("bin.1", 100)
            .with_gtid_set(GtidSet::parse(&format!("{}:1-5", uuid)).unwrap());
        let new = BinlogPosition::new("bin.1", 50)
            .with_gtid_set(GtidSet::parse(&format!("{}:1-6", uuid)).unwrap());
        assert!(new.newer_than(&old));
        assert!(!old.newer_than(&new));
    }

    #[test]
    fn test_position_sha_is_stable() {
        let pos = Position::new(BinlogPosition::new("mysql-bin.000001", 1234), 99);
        let sha = pos.sha(5);
        assert_eq!(sha.len(), 40);
        assert_eq!(sha, pos.sha(5));
        assert_ne!(sha, pos.sha(6));
        assert_ne!(sha, pos.with_heartbeat(100).sha(5));
    }
}
