//! 저장소 추상화
//!
//! 스키마 버전, 복제 위치, 하트비트, 부트스트랩 작업은 모두 스키마 데이터베이스
//! (기본 `maxwell`)에 저장된다. 운영 환경은 [`MysqlStorage`], 임베딩과 테스트는
//! [`MemoryStorage`]를 쓴다. 두 구현 모두 아래 트레이트를 전부 구현한다.

pub mod memory;
pub mod mysql;

pub use memory::MemoryStorage;
pub use mysql::MysqlStorage;

use crate::bootstrap::task::BootstrapTask;
use crate::error::Result;
use crate::offset::{BinlogPosition, Position};
use crate::schema::{CaseSensitivity, Schema, Table};
use async_trait::async_trait;
use mysql_async::Value;
use tokio::sync::mpsc;

/// `schemas` 테이블 한 행
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaRecord {
    pub id: u64,
    pub server_id: u64,
    pub position: Position,
    /// 델타 스냅샷이면 기준 스냅샷 id, 전체 스냅샷이면 None
    pub base_schema_id: Option<u64>,
    /// 직렬화된 `ResolvedSchemaChange` 배열 (JSON)
    pub deltas: Option<String>,
    pub version: u32,
    pub position_sha: String,
    pub charset: String,
    pub deleted: bool,
}

impl SchemaRecord {
    pub fn is_full(&self) -> bool {
        self.base_schema_id.is_none()
    }
}

/// 지문 유일성 제약 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(u64),
    /// 같은 position_sha가 이미 있음
    Duplicate,
}

/// `positions` 테이블 한 행. 예전 버전이 남긴 행은 하트비트가 NULL일 수 있다
#[derive(Debug, Clone, PartialEq)]
pub struct PositionRecord {
    pub server_id: u64,
    pub client_id: String,
    pub binlog: BinlogPosition,
    pub last_heartbeat_read: Option<u64>,
}

impl PositionRecord {
    pub fn position(&self) -> Position {
        Position::new(self.binlog.clone(), self.last_heartbeat_read.unwrap_or(0))
    }
}

#[async_trait]
pub trait SchemaStorage: Send + Sync {
    async fn find_schema_by_sha(&self, position_sha: &str) -> Result<Option<u64>>;

    /// 새 스냅샷 저장. `full`이 있으면 databases/tables/columns 행도 같이 쓴다.
    /// `record.id`는 무시된다.
    async fn insert_schema(&self, record: &SchemaRecord, full: Option<&Schema>) -> Result<InsertOutcome>;

    async fn schema_record(&self, id: u64) -> Result<Option<SchemaRecord>>;

    /// 서버의 삭제되지 않은 스냅샷 전부 (id 오름차순)
    async fn schema_records(&self, server_id: u64) -> Result<Vec<SchemaRecord>>;

    /// 전체 스냅샷 내용 읽기
    async fn load_full_schema(&self, id: u64, sensitivity: CaseSensitivity) -> Result<Schema>;

    /// 델타 스냅샷을 전체 스냅샷으로 바꾼다 (압축)
    async fn replace_with_full(&self, id: u64, schema: &Schema) -> Result<()>;

    /// `replace_with_full` 되돌리기
    async fn revert_to_delta(&self, id: u64, base_schema_id: u64, deltas: &str) -> Result<()>;

    async fn mark_deleted(&self, ids: &[u64]) -> Result<()>;

    /// deleted 표시된 스냅샷 id (최대 limit개)
    async fn deleted_schema_ids(&self, limit: usize) -> Result<Vec<u64>>;

    /// 스냅샷과 딸린 행들을 물리적으로 삭제
    async fn purge_schema(&self, id: u64) -> Result<()>;
}

#[async_trait]
pub trait PositionStorage: Send + Sync {
    async fn set_position(&self, server_id: u64, client_id: &str, position: &Position) -> Result<()>;

    async fn get_position(&self, server_id: u64, client_id: &str) -> Result<Option<Position>>;

    /// 클라이언트가 모든 서버에 남긴 위치 (최근 하트비트 순)
    async fn client_positions(&self, client_id: &str) -> Result<Vec<PositionRecord>>;

    /// 서버에 기록된 모든 클라이언트의 위치
    async fn server_positions(&self, server_id: u64) -> Result<Vec<PositionRecord>>;

    /// 현재 서버 외의 위치 삭제. 삭제한 행 수
    async fn delete_other_positions(&self, client_id: &str, server_id: u64) -> Result<u64>;

    async fn read_heartbeat(&self, server_id: u64, client_id: &str) -> Result<Option<u64>>;

    /// 최초 하트비트. 이미 행이 있으면 false
    async fn insert_heartbeat(&self, server_id: u64, client_id: &str, value: u64) -> Result<bool>;

    /// `expected`와 저장된 값이 같을 때만 갱신. 영향받은 행 수
    async fn update_heartbeat(&self, server_id: u64, client_id: &str, expected: u64, value: u64) -> Result<u64>;
}

#[async_trait]
pub trait BootstrapStorage: Send + Sync {
    /// 완료되지 않은 작업 (시작된 것 먼저, 그다음 id 순)
    async fn incomplete_tasks(&self, client_id: &str) -> Result<Vec<BootstrapTask>>;

    async fn find_task(&self, id: u64) -> Result<Option<BootstrapTask>>;

    async fn insert_task(&self, task: &BootstrapTask) -> Result<u64>;

    async fn delete_task(&self, id: u64) -> Result<bool>;

    /// started_at/시작 위치/total_rows 기록. 영향받은 행 수 (0이면 작업이 사라짐)
    async fn mark_started(&self, id: u64, position: &Position, total_rows: u64) -> Result<u64>;

    async fn update_progress(&self, id: u64, inserted_rows: u64) -> Result<u64>;

    async fn mark_complete(&self, id: u64, inserted_rows: u64) -> Result<u64>;

    /// 크래시로 남은 STARTED 작업을 PENDING으로 되돌린다
    async fn reset_started(&self, id: u64) -> Result<()>;
}

/// 부트스트랩 대상 테이블 읽기
#[async_trait]
pub trait TableScanner: Send + Sync {
    async fn count_rows(&self, table: &Table, where_clause: Option<&str>) -> Result<u64>;

    /// 기본 키 순서로 읽어 `tx`로 흘려보낸다. 보낸 행 수를 돌려준다.
    /// 받는 쪽이 닫히면 조용히 멈춘다.
    async fn scan(&self, table: &Table, where_clause: Option<&str>, tx: mpsc::Sender<Vec<Value>>) -> Result<u64>;
}

/// 부트스트랩 스캔 쿼리
pub fn scan_query(table: &Table, where_clause: Option<&str>) -> String {
    use crate::connection::quote_ident;

    let columns = table
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!(
        "SELECT {} FROM {}.{}",
        columns,
        quote_ident(&table.database),
        quote_ident(&table.name)
    );
    if let Some(w) = where_clause.filter(|w| !w.trim().is_empty()) {
        sql.push_str(&format!(" WHERE {}", w));
    }
    if !table.pk.is_empty() {
        let order = table
            .pk
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" ORDER BY {}", order));
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDef;

    #[test]
    fn test_scan_query() {
        let table = Table::new(
            "shop",
            "orders",
            None,
            vec![
                ColumnDef::build("id", "int", 0, None, true, None, None).unwrap(),
                ColumnDef::build("note", "text", 1, None, true, None, None).unwrap(),
            ],
            vec!["id".into()],
        );
        assert_eq!(
            scan_query(&table, Some("id > 5")),
            "SELECT `id`, `note` FROM `shop`.`orders` WHERE id > 5 ORDER BY `id`"
        );
        assert_eq!(
            scan_query(&table, None),
            "SELECT `id`, `note` FROM `shop`.`orders` ORDER BY `id`"
        );
    }
}
