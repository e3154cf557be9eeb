//! 인메모리 저장소
//!
//! MySQL 저장소와 같은 제약(지문 유일성, 하트비트 CAS, 영향받은 행 수)을 흉내 낸다.
//! 부트스트랩 스캔 대상 테이블도 여기 넣어 둘 수 있다.

use super::{
    BootstrapStorage, InsertOutcome, PositionRecord, PositionStorage, SchemaRecord,
    SchemaStorage, TableScanner,
};
use crate::bootstrap::task::BootstrapTask;
use crate::error::{CdcError, Result};
use crate::offset::Position;
use crate::schema::{CaseSensitivity, ColumnDef, Schema, Table};
use async_trait::async_trait;
use chrono::Utc;
use mysql_async::Value;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use tokio::sync::mpsc;

#[derive(Default)]
struct Inner {
    next_schema_id: u64,
    schemas: BTreeMap<u64, SchemaRecord>,
    full_schemas: HashMap<u64, Schema>,
    positions: BTreeMap<(u64, String), PositionRecord>,
    heartbeats: HashMap<(u64, String), u64>,
    next_task_id: u64,
    tasks: BTreeMap<u64, BootstrapTask>,
    rows: HashMap<(String, String), Vec<Vec<Value>>>,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 스캔 대상 테이블에 행 추가
    pub fn insert_row(&self, database: &str, table: &str, row: Vec<Value>) {
        self.inner
            .lock()
            .rows
            .entry((database.to_string(), table.to_string()))
            .or_default()
            .push(row);
    }

    /// 옛 버전이 남긴, 하트비트 없는 위치 행
    pub fn insert_legacy_position(&self, record: PositionRecord) {
        self.inner
            .lock()
            .positions
            .insert((record.server_id, record.client_id.clone()), record);
    }

    pub fn schema_count(&self) -> usize {
        self.inner.lock().schemas.len()
    }

    pub fn full_schema_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.lock().full_schemas.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[async_trait]
impl SchemaStorage for MemoryStorage {
    async fn find_schema_by_sha(&self, position_sha: &str) -> Result<Option<u64>> {
        Ok(self
            .inner
            .lock()
            .schemas
            .values()
            .find(|r| r.position_sha == position_sha)
            .map(|r| r.id))
    }

    async fn insert_schema(&self, record: &SchemaRecord, full: Option<&Schema>) -> Result<InsertOutcome> {
        let mut inner = self.inner.lock();
        if inner.schemas.values().any(|r| r.position_sha == record.position_sha) {
            return Ok(InsertOutcome::Duplicate);
        }

        inner.next_schema_id += 1;
        let id = inner.next_schema_id;
        let mut stored = record.clone();
        stored.id = id;
        inner.schemas.insert(id, stored);
        if let Some(schema) = full {
            inner.full_schemas.insert(id, schema.clone());
        }
        Ok(InsertOutcome::Inserted(id))
    }

    async fn schema_record(&self, id: u64) -> Result<Option<SchemaRecord>> {
        Ok(self.inner.lock().schemas.get(&id).cloned())
    }

    async fn schema_records(&self, server_id: u64) -> Result<Vec<SchemaRecord>> {
        Ok(self
            .inner
            .lock()
            .schemas
            .values()
            .filter(|r| r.server_id == server_id && !r.deleted)
            .cloned()
            .collect())
    }

    async fn load_full_schema(&self, id: u64, sensitivity: CaseSensitivity) -> Result<Schema> {
        let inner = self.inner.lock();
        let mut schema = inner.full_schemas.get(&id).cloned().ok_or_else(|| {
            CdcError::SchemaStoreError(format!("schema {} has no full snapshot", id))
        })?;
        schema.sensitivity = sensitivity;
        Ok(schema)
    }

    async fn replace_with_full(&self, id: u64, schema: &Schema) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .schemas
            .get_mut(&id)
            .ok_or_else(|| CdcError::SchemaStoreError(format!("schema {} not found", id)))?;
        record.base_schema_id = None;
        record.deltas = None;
        inner.full_schemas.insert(id, schema.clone());
        Ok(())
    }

    async fn revert_to_delta(&self, id: u64, base_schema_id: u64, deltas: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.full_schemas.remove(&id);
        if let Some(record) = inner.schemas.get_mut(&id) {
            record.base_schema_id = Some(base_schema_id);
            record.deltas = Some(deltas.to_string());
        }
        Ok(())
    }

    async fn mark_deleted(&self, ids: &[u64]) -> Result<()> {
        let mut inner = self.inner.lock();
        for id in ids {
            if let Some(record) = inner.schemas.get_mut(id) {
                record.deleted = true;
            }
        }
        Ok(())
    }

    async fn deleted_schema_ids(&self, limit: usize) -> Result<Vec<u64>> {
        Ok(self
            .inner
            .lock()
            .schemas
            .values()
            .filter(|r| r.deleted)
            .map(|r| r.id)
            .take(limit)
            .collect())
    }

    async fn purge_schema(&self, id: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.schemas.remove(&id);
        inner.full_schemas.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl PositionStorage for MemoryStorage {
    async fn set_position(&self, server_id: u64, client_id: &str, position: &Position) -> Result<()> {
        self.inner.lock().positions.insert(
            (server_id, client_id.to_string()),
            PositionRecord {
                server_id,
                client_id: client_id.to_string(),
                binlog: position.binlog.clone(),
                last_heartbeat_read: Some(position.last_heartbeat_read),
            },
        );
        Ok(())
    }

    async fn get_position(&self, server_id: u64, client_id: &str) -> Result<Option<Position>> {
        Ok(self
            .inner
            .lock()
            .positions
            .get(&(server_id, client_id.to_string()))
            .map(PositionRecord::position))
    }

    async fn client_positions(&self, client_id: &str) -> Result<Vec<PositionRecord>> {
        let mut records: Vec<PositionRecord> = self
            .inner
            .lock()
            .positions
            .values()
            .filter(|r| r.client_id == client_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.last_heartbeat_read.cmp(&a.last_heartbeat_read));
        Ok(records)
    }

    async fn server_positions(&self, server_id: u64) -> Result<Vec<PositionRecord>> {
        Ok(self
            .inner
            .lock()
            .positions
            .values()
            .filter(|r| r.server_id == server_id)
            .cloned()
            .collect())
    }

    async fn delete_other_positions(&self, client_id: &str, server_id: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let before = inner.positions.len();
        inner
            .positions
            .retain(|(sid, cid), _| cid != client_id || *sid == server_id);
        Ok((before - inner.positions.len()) as u64)
    }

    async fn read_heartbeat(&self, server_id: u64, client_id: &str) -> Result<Option<u64>> {
        Ok(self
            .inner
            .lock()
            .heartbeats
            .get(&(server_id, client_id.to_string()))
            .copied())
    }

    async fn insert_heartbeat(&self, server_id: u64, client_id: &str, value: u64) -> Result<bool> {
        let mut inner = self.inner.lock();
        let key = (server_id, client_id.to_string());
        if inner.heartbeats.contains_key(&key) {
            return Ok(false);
        }
        inner.heartbeats.insert(key, value);
        Ok(true)
    }

    async fn update_heartbeat(&self, server_id: u64, client_id: &str, expected: u64, value: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        match inner.heartbeats.get_mut(&(server_id, client_id.to_string())) {
            Some(current) if *current == expected => {
                *current = value;
                Ok(1)
            }
            _ => Ok(0),
        }
    }
}

#[async_trait]
impl BootstrapStorage for MemoryStorage {
    async fn incomplete_tasks(&self, client_id: &str) -> Result<Vec<BootstrapTask>> {
        let mut tasks: Vec<BootstrapTask> = self
            .inner
            .lock()
            .tasks
            .values()
            .filter(|t| t.client_id == client_id && !t.is_complete)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.started_at.is_none(), t.id));
        Ok(tasks)
    }

    async fn find_task(&self, id: u64) -> Result<Option<BootstrapTask>> {
        Ok(self.inner.lock().tasks.get(&id).cloned())
    }

    async fn insert_task(&self, task: &BootstrapTask) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.next_task_id += 1;
        let id = inner.next_task_id;
        let mut stored = task.clone();
        stored.id = id;
        stored.created_at.get_or_insert_with(Utc::now);
        inner.tasks.insert(id, stored);
        Ok(id)
    }

    async fn delete_task(&self, id: u64) -> Result<bool> {
        Ok(self.inner.lock().tasks.remove(&id).is_some())
    }

    async fn mark_started(&self, id: u64, position: &Position, total_rows: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(0);
        };
        task.started_at = Some(Utc::now());
        task.start_position = Some(position.clone());
        task.total_rows = total_rows;
        task.inserted_rows = 0;
        Ok(1)
    }

    async fn update_progress(&self, id: u64, inserted_rows: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(0);
        };
        task.inserted_rows = inserted_rows;
        Ok(1)
    }

    async fn mark_complete(&self, id: u64, inserted_rows: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(0);
        };
        task.is_complete = true;
        task.inserted_rows = inserted_rows;
        task.completed_at = Some(Utc::now());
        Ok(1)
    }

    async fn reset_started(&self, id: u64) -> Result<()> {
        if let Some(task) = self.inner.lock().tasks.get_mut(&id) {
            task.started_at = None;
            task.inserted_rows = 0;
        }
        Ok(())
    }
}

impl MemoryStorage {
    /// where 조건을 적용하고 기본 키 순으로 정렬한 행들
    fn filtered_rows(&self, table: &Table, where_clause: Option<&str>) -> Result<Vec<Vec<Value>>> {
        let filter = where_clause
            .filter(|w| !w.trim().is_empty())
            .map(WhereFilter::parse)
            .transpose()?;

        let mut rows: Vec<Vec<Value>> = self
            .inner
            .lock()
            .rows
            .get(&(table.database.clone(), table.name.clone()))
            .cloned()
            .unwrap_or_default();

        if let Some(filter) = &filter {
            let index = table.find_column_index(&filter.column).ok_or_else(|| {
                CdcError::QueryError(format!("Unknown column '{}' in where clause", filter.column))
            })?;
            let column = &table.columns[index];
            rows.retain(|row| row.get(index).map_or(false, |v| filter.matches(column, v)));
        }

        let pk_indexes: Vec<usize> = table
            .pk
            .iter()
            .filter_map(|c| table.find_column_index(c))
            .collect();
        rows.sort_by(|a, b| {
            pk_indexes
                .iter()
                .map(|&i| compare_values(&table.columns[i], &a[i], &b[i]))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
        Ok(rows)
    }
}

#[async_trait]
impl TableScanner for MemoryStorage {
    async fn count_rows(&self, table: &Table, where_clause: Option<&str>) -> Result<u64> {
        Ok(self.filtered_rows(table, where_clause)?.len() as u64)
    }

    async fn scan(&self, table: &Table, where_clause: Option<&str>, tx: mpsc::Sender<Vec<Value>>) -> Result<u64> {
        let rows = self.filtered_rows(table, where_clause)?;
        let mut sent = 0;
        for row in rows {
            if tx.send(row).await.is_err() {
                break;
            }
            sent += 1;
        }
        Ok(sent)
    }
}

/// `column <op> literal` 형태의 단순 조건만 지원한다
struct WhereFilter {
    column: String,
    op: String,
    literal: String,
}

impl WhereFilter {
    fn parse(clause: &str) -> Result<WhereFilter> {
        static RE: OnceLock<Option<Regex>> = OnceLock::new();
        let caps = RE
            .get_or_init(|| Regex::new(r"^\s*`?(\w+)`?\s*(>=|<=|!=|<>|=|>|<)\s*'?(.*?)'?\s*$").ok())
            .as_ref()
            .and_then(|re| re.captures(clause))
            .ok_or_else(|| {
                CdcError::QueryError(format!("Unsupported where clause: {}", clause))
            })?;
        Ok(WhereFilter {
            column: caps[1].to_string(),
            op: caps[2].to_string(),
            literal: caps[3].to_string(),
        })
    }

    fn matches(&self, column: &ColumnDef, value: &Value) -> bool {
        let left = column.as_json(value);
        let ordering = compare_json(&left, &JsonValue::String(self.literal.clone()));
        match self.op.as_str() {
            "=" => ordering == Ordering::Equal,
            "!=" | "<>" => ordering != Ordering::Equal,
            ">" => ordering == Ordering::Greater,
            "<" => ordering == Ordering::Less,
            ">=" => ordering != Ordering::Less,
            "<=" => ordering != Ordering::Greater,
            _ => false,
        }
    }
}

fn compare_values(column: &ColumnDef, a: &Value, b: &Value) -> Ordering {
    compare_json(&column.as_json(a), &column.as_json(b))
}

/// 숫자로 읽히면 숫자로, 아니면 문자열로 비교
fn compare_json(a: &JsonValue, b: &JsonValue) -> Ordering {
    let as_number = |v: &JsonValue| match v {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.parse::<f64>().ok(),
        _ => None,
    };
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    let as_text = |v: &JsonValue| match v {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    };
    as_text(a).cmp(&as_text(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset::BinlogPosition;

    fn record(sha: &str) -> SchemaRecord {
        SchemaRecord {
            id: 0,
            server_id: 1,
            position: Position::at("bin.000001", 4),
            base_schema_id: None,
            deltas: None,
            version: 4,
            position_sha: sha.to_string(),
            charset: "utf8".to_string(),
            deleted: false,
        }
    }

    #[tokio::test]
    async fn test_sha_uniqueness() {
        let storage = MemoryStorage::new();
        let schema = Schema::new("utf8", CaseSensitivity::CaseSensitive);
        assert_eq!(
            storage.insert_schema(&record("a"), Some(&schema)).await.unwrap(),
            InsertOutcome::Inserted(1)
        );
        assert_eq!(
            storage.insert_schema(&record("a"), None).await.unwrap(),
            InsertOutcome::Duplicate
        );
        assert_eq!(storage.find_schema_by_sha("a").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_heartbeat_cas() {
        let storage = MemoryStorage::new();
        assert!(storage.insert_heartbeat(1, "c", 10).await.unwrap());
        assert!(!storage.insert_heartbeat(1, "c", 11).await.unwrap());
        assert_eq!(storage.update_heartbeat(1, "c", 10, 20).await.unwrap(), 1);
        assert_eq!(storage.update_heartbeat(1, "c", 10, 30).await.unwrap(), 0);
        assert_eq!(storage.read_heartbeat(1, "c").await.unwrap(), Some(20));
    }

    #[tokio::test]
    async fn test_delete_other_positions() {
        let storage = MemoryStorage::new();
        let pos = Position::new(BinlogPosition::new("bin.000001", 4), 5);
        storage.set_position(1, "c", &pos).await.unwrap();
        storage.set_position(2, "c", &pos).await.unwrap();
        storage.set_position(1, "other", &pos).await.unwrap();
        assert_eq!(storage.delete_other_positions("c", 2).await.unwrap(), 1);
        assert_eq!(storage.client_positions("c").await.unwrap().len(), 1);
        assert_eq!(storage.server_positions(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scan_orders_by_pk_and_filters() {
        let storage = MemoryStorage::new();
        for id in [10i64, 2, 33] {
            storage.insert_row("shop", "t", vec![Value::Int(id), Value::Bytes(b"x".to_vec())]);
        }
        let table = Table::new(
            "shop",
            "t",
            None,
            vec![
                ColumnDef::build("id", "int", 0, None, true, None, None).unwrap(),
                ColumnDef::build("v", "varchar", 1, None, true, None, None).unwrap(),
            ],
            vec!["id".into()],
        );

        let (tx, mut rx) = mpsc::channel(8);
        assert_eq!(storage.scan(&table, None, tx).await.unwrap(), 3);
        let mut ids = Vec::new();
        while let Some(row) = rx.recv().await {
            ids.push(row[0].clone());
        }
        assert_eq!(ids, vec![Value::Int(2), Value::Int(10), Value::Int(33)]);

        let (tx, _rx) = mpsc::channel(8);
        assert_eq!(storage.scan(&table, Some("id >= 10"), tx).await.unwrap(), 2);
        assert_eq!(storage.count_rows(&table, Some("`id` = 33")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let storage = MemoryStorage::new();
        let id = storage
            .insert_task(&BootstrapTask::new("shop", "t", "maxwell"))
            .await
            .unwrap();
        let pos = Position::at("bin.000001", 100);
        assert_eq!(storage.mark_started(id, &pos, 3).await.unwrap(), 1);
        assert_eq!(storage.update_progress(id, 2).await.unwrap(), 1);
        assert!(storage.delete_task(id).await.unwrap());
        assert_eq!(storage.update_progress(id, 3).await.unwrap(), 0);
    }
}
