//! 부트스트랩 테이블 스캔

use super::task::BootstrapTask;
use crate::error::{CdcError, Result};
use crate::events::{RowData, RowMap, RowType};
use crate::offset::Position;
use crate::producer::Producer;
use crate::schema::Table;
use crate::storage::{BootstrapStorage, TableScanner};
use mysql_async::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const SCAN_CHANNEL_CAPACITY: usize = 1000;

/// 스캔 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed { inserted_rows: u64 },
    /// 종료 요청으로 중단. 작업은 STARTED로 남아 다음 기동 때 처음부터 다시 한다
    Cancelled { inserted_rows: u64 },
}

pub struct BootstrapScanner {
    tasks: Arc<dyn BootstrapStorage>,
    scanner: Arc<dyn TableScanner>,
    producer: Arc<dyn Producer>,
    progress_interval: Duration,
}

impl BootstrapScanner {
    pub fn new(
        tasks: Arc<dyn BootstrapStorage>,
        scanner: Arc<dyn TableScanner>,
        producer: Arc<dyn Producer>,
        progress_interval: Duration,
    ) -> Self {
        BootstrapScanner {
            tasks,
            scanner,
            producer,
            progress_interval,
        }
    }

    /// 테이블을 기본 키 순으로 읽어 `bootstrap-insert` 행을 내보낸다.
    ///
    /// 모든 출력 행에는 `position`(작업 시작 시점의 복제 위치)과 `schema_id`가 찍힌다.
    /// 진행 중 작업 행이 사라지면 `BootstrapTaskVanished`.
    pub async fn perform_bootstrap(
        &self,
        task: &BootstrapTask,
        table: Arc<Table>,
        schema_id: Option<u64>,
        position: &Position,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ScanOutcome> {
        let where_clause = task.where_clause.clone();
        let total_rows = self
            .scanner
            .count_rows(&table, where_clause.as_deref())
            .await?;

        if self.tasks.mark_started(task.id, position, total_rows).await? == 0 {
            return Err(CdcError::BootstrapTaskVanished { id: task.id });
        }
        info!("bootstrapping {} ({} rows) @{}", task, total_rows, position);

        self.push_marker(task, RowType::BootstrapStart, schema_id, position)
            .await?;

        let (tx, mut rx) = mpsc::channel::<Vec<Value>>(SCAN_CHANNEL_CAPACITY);
        let scan = {
            let scanner = self.scanner.clone();
            let table = table.clone();
            let where_clause = where_clause.clone();
            tokio::spawn(async move { scanner.scan(&table, where_clause.as_deref(), tx).await })
        };

        let mut inserted_rows = 0u64;
        let mut last_progress = Instant::now();
        let mut cancelled = false;

        while let Some(values) = rx.recv().await {
            if *cancel.borrow() {
                cancelled = true;
                break;
            }

            let row = RowMap::new(&task.database, &task.table, RowType::BootstrapInsert, position.clone())
                .with_schema_id(schema_id)
                .with_data(row_data(&table, &values));
            self.producer.push(row).await?;
            inserted_rows += 1;

            if last_progress.elapsed() >= self.progress_interval {
                last_progress = Instant::now();
                match self.tasks.update_progress(task.id, inserted_rows).await {
                    Ok(0) => {
                        // 받는 쪽을 닫으면 스캔 태스크도 멈춘다
                        drop(rx);
                        scan.abort();
                        return Err(CdcError::BootstrapTaskVanished { id: task.id });
                    }
                    Ok(_) => debug!("bootstrap {}: {}/{} rows", task, inserted_rows, total_rows),
                    Err(e) => warn!("Failed to update progress of bootstrap {}: {}", task, e),
                }
            }
        }

        if cancelled {
            drop(rx);
            scan.abort();
            info!("bootstrap {} cancelled after {} rows", task, inserted_rows);
            return Ok(ScanOutcome::Cancelled { inserted_rows });
        }

        scan.await
            .map_err(|e| CdcError::Other(format!("bootstrap scan task failed: {}", e)))??;

        if self.tasks.mark_complete(task.id, inserted_rows).await? == 0 {
            return Err(CdcError::BootstrapTaskVanished { id: task.id });
        }
        self.push_marker(task, RowType::BootstrapComplete, schema_id, position)
            .await?;
        info!("bootstrap {} complete: {} rows", task, inserted_rows);
        Ok(ScanOutcome::Completed { inserted_rows })
    }

    async fn push_marker(
        &self,
        task: &BootstrapTask,
        row_type: RowType,
        schema_id: Option<u64>,
        position: &Position,
    ) -> Result<()> {
        let row = RowMap::new(&task.database, &task.table, row_type, position.clone())
            .with_schema_id(schema_id);
        self.producer.push(row).await
    }
}

fn row_data(table: &Table, values: &[Value]) -> RowData {
    table
        .columns
        .iter()
        .zip(values)
        .map(|(column, value)| (column.name.clone(), column.as_json(value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::MemoryProducer;
    use crate::schema::ColumnDef;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn orders() -> Arc<Table> {
        Arc::new(Table::new(
            "shop",
            "orders",
            Some("utf8mb4".into()),
            vec![
                ColumnDef::build("id", "int", 0, None, true, None, None).unwrap(),
                ColumnDef::build("note", "varchar", 1, Some("utf8mb4".into()), true, None, None).unwrap(),
            ],
            vec!["id".into()],
        ))
    }

    #[tokio::test]
    async fn test_perform_bootstrap() {
        let storage = Arc::new(MemoryStorage::new());
        for id in [3i64, 1, 2] {
            storage.insert_row("shop", "orders", vec![Value::Int(id), Value::Bytes(format!("n{}", id).into_bytes())]);
        }
        let id = storage
            .insert_task(&BootstrapTask::new("shop", "orders", "maxwell").with_where("id > 1"))
            .await
            .unwrap();
        let task = storage.find_task(id).await.unwrap().unwrap();

        let producer = Arc::new(MemoryProducer::new());
        let scanner = BootstrapScanner::new(storage.clone(), storage.clone(), producer.clone(), Duration::from_millis(250));
        let (_cancel_tx, cancel) = watch::channel(false);
        let start = Position::at("bin.000004", 1200);

        let outcome = scanner
            .perform_bootstrap(&task, orders(), Some(9), &start, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, ScanOutcome::Completed { inserted_rows: 2 });

        let rows = producer.rows();
        let types: Vec<RowType> = rows.iter().map(|r| r.row_type).collect();
        assert_eq!(
            types,
            vec![RowType::BootstrapStart, RowType::BootstrapInsert, RowType::BootstrapInsert, RowType::BootstrapComplete]
        );
        assert_eq!(rows[1].get("id"), Some(&json!(2)));
        assert_eq!(rows[2].get("note"), Some(&json!("n3")));
        assert!(rows.iter().all(|r| r.position == start && r.schema_id == Some(9)));

        let stored = storage.find_task(id).await.unwrap().unwrap();
        assert!(stored.is_complete);
        assert_eq!(stored.inserted_rows, 2);
        assert_eq!(stored.total_rows, 2);
        assert_eq!(stored.start_position, Some(start));
    }

    #[tokio::test]
    async fn test_vanished_task() {
        let storage = Arc::new(MemoryStorage::new());
        for id in 0..50i64 {
            storage.insert_row("shop", "orders", vec![Value::Int(id), Value::NULL]);
        }
        let id = storage
            .insert_task(&BootstrapTask::new("shop", "orders", "maxwell"))
            .await
            .unwrap();
        let task = storage.find_task(id).await.unwrap().unwrap();

        let producer = Arc::new(MemoryProducer::new());
        let scanner = BootstrapScanner::new(storage.clone(), storage.clone(), producer.clone(), Duration::ZERO);
        let (_cancel_tx, cancel) = watch::channel(false);

        // 시작 전에 운영자가 작업을 지움
        BootstrapTask::abort(storage.as_ref(), id).await.unwrap();
        let err = scanner
            .perform_bootstrap(&task, orders(), None, &Position::at("bin.1", 4), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CdcError::BootstrapTaskVanished { .. }));
        assert!(!err.is_fatal());
    }
}
