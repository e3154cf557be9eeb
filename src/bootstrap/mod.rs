//! 부트스트랩 (전체 테이블 스냅샷) 엔진
//!
//! 운영자가 `bootstrap` 테이블에 행을 넣으면 폴러가 작업을 발견해 큐에 넣는다.
//! 작업이 활성(스캔 중)이거나 대기 중인 테이블의 라이브 행은 버려지지 않고
//! 테이블별 버퍼에 쌓였다가, 스캔이 끝나면 원래 순서대로 다시 내보내진다.
//! 그래서 같은 기본 키의 행은 항상 부트스트랩 기준 행 뒤에 나온다.
//!
//! 워커는 한 번에 하나만 돈다. 동기 모드에서는 이벤트 루프가 직접 워커를 돌리고,
//! 비동기 모드에서는 별도 태스크로 돈다.

pub mod buffer;
pub mod scanner;
pub mod task;

pub use buffer::RowBuffer;
pub use scanner::{BootstrapScanner, ScanOutcome};
pub use task::{BootstrapTask, TaskStatus};

use crate::config::BootstrapMode;
use crate::error::{CdcError, Result};
use crate::events::RowMap;
use crate::offset::Position;
use crate::position_tracker::PositionTracker;
use crate::producer::Producer;
use crate::schema::{CaseSensitivity, Schema};
use crate::storage::BootstrapStorage;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type TableKey = (String, String);

struct ActiveTask {
    task: BootstrapTask,
    key: TableKey,
    start_position: Option<Position>,
}

#[derive(Default)]
struct ControllerState {
    active: Option<ActiveTask>,
    queue: VecDeque<BootstrapTask>,
    buffers: HashMap<TableKey, RowBuffer>,
    /// 테이블을 찾지 못하는 등 실패한 작업. 다시 큐에 넣지 않는다
    failed: HashSet<u64>,
}

impl ControllerState {
    fn knows(&self, id: u64) -> bool {
        self.failed.contains(&id)
            || self.active.as_ref().is_some_and(|a| a.task.id == id)
            || self.queue.iter().any(|t| t.id == id)
    }
}

/// 현재 스키마 (부트스트랩 시작 시점의 테이블 정의용)
struct SchemaView {
    schema_id: Option<u64>,
    schema: Schema,
}

pub struct BootstrapController {
    mode: BootstrapMode,
    client_id: String,
    sensitivity: CaseSensitivity,
    storage: Arc<dyn BootstrapStorage>,
    scanner: BootstrapScanner,
    producer: Arc<dyn Producer>,
    tracker: Arc<PositionTracker>,
    state: Mutex<ControllerState>,
    /// 테이블별 버퍼가 메모리에 둘 최대 행 수
    buffer_limit: usize,
    schema: Mutex<SchemaView>,
    /// 작업이 끝날 때마다 깨운다 (DDL 대기용)
    finished: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
    failure: Mutex<Option<String>>,
    shutdown: watch::Receiver<bool>,
}

impl BootstrapController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: BootstrapMode,
        client_id: impl Into<String>,
        storage: Arc<dyn BootstrapStorage>,
        scanner: BootstrapScanner,
        producer: Arc<dyn Producer>,
        tracker: Arc<PositionTracker>,
        schema: Schema,
        schema_id: Option<u64>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        BootstrapController {
            mode,
            client_id: client_id.into(),
            sensitivity: schema.sensitivity,
            storage,
            scanner,
            producer,
            tracker,
            state: Mutex::new(ControllerState::default()),
            buffer_limit: buffer::DEFAULT_MAX_IN_MEMORY,
            schema: Mutex::new(SchemaView { schema_id, schema }),
            finished: Notify::new(),
            worker: Mutex::new(None),
            failure: Mutex::new(None),
            shutdown,
        }
    }

    pub fn with_buffer_limit(mut self, rows: usize) -> Self {
        self.buffer_limit = rows;
        self
    }

    pub fn mode(&self) -> BootstrapMode {
        self.mode
    }

    fn key(&self, database: &str, table: &str) -> TableKey {
        match self.sensitivity {
            CaseSensitivity::CaseSensitive => (database.to_string(), table.to_string()),
            _ => (database.to_lowercase(), table.to_lowercase()),
        }
    }

    /// DDL 적용 후 호출. 이후 시작하는 작업은 이 스키마로 스캔한다
    pub fn update_schema(&self, schema_id: Option<u64>, schema: &Schema) {
        let mut view = self.schema.lock();
        view.schema_id = schema_id;
        view.schema = schema.clone();
    }

    /// 비동기 워커가 치명적 에러로 멈췄으면 그 에러
    pub fn check_fatal(&self) -> Result<()> {
        match &*self.failure.lock() {
            Some(message) => Err(CdcError::Other(format!("bootstrap failed: {}", message))),
            None => Ok(()),
        }
    }

    /// 라이브 행 분류. 부트스트랩 중이거나 대기 중인 테이블의 행은 버퍼에 넣고 None
    pub fn route(&self, row: RowMap) -> Result<Option<RowMap>> {
        if row.row_type.is_bootstrap() {
            return Ok(Some(row));
        }
        let key = self.key(&row.database, &row.table);
        let mut state = self.state.lock();
        let busy = state.active.as_ref().is_some_and(|a| a.key == key)
            || state
                .queue
                .iter()
                .any(|t| t.matches(&key.0, &key.1, self.sensitivity));
        if busy {
            let limit = self.buffer_limit;
            state
                .buffers
                .entry(key)
                .or_insert_with(|| RowBuffer::new(limit))
                .push(row)?;
            Ok(None)
        } else {
            Ok(Some(row))
        }
    }

    /// 이 테이블이 부트스트랩 중이거나 대기 중인지
    pub fn is_busy(&self, database: &str, table: &str) -> bool {
        let key = self.key(database, table);
        let state = self.state.lock();
        state.active.as_ref().is_some_and(|a| a.key == key)
            || state
                .queue
                .iter()
                .any(|t| t.matches(&key.0, &key.1, self.sensitivity))
    }

    /// 테이블의 부트스트랩이 끝날 때까지 기다린다 (그 테이블에 대한 DDL 적용 전)
    pub async fn wait_for_table(&self, database: &str, table: &str) {
        let mut logged = false;
        loop {
            let notified = self.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_busy(database, table) {
                return;
            }
            if !logged {
                info!(
                    "Waiting for bootstrap of {}.{} to finish before applying DDL",
                    database, table
                );
                logged = true;
            }
            notified.await;
        }
    }

    /// 크래시로 STARTED에 남은 작업을 PENDING으로 되돌리고 모든 미완료 작업을 큐에 넣는다
    pub async fn resume(self: &Arc<Self>) -> Result<usize> {
        let tasks = self.storage.incomplete_tasks(&self.client_id).await?;
        for task in &tasks {
            if task.status() == TaskStatus::Started {
                info!("Resetting bootstrap task {} left in progress, restarting from the top", task);
                self.storage.reset_started(task.id).await?;
            }
        }
        let queued = self.enqueue(tasks);
        self.kick().await?;
        Ok(queued)
    }

    /// 새 작업 확인
    pub async fn poll(self: &Arc<Self>) -> Result<usize> {
        let tasks = self.storage.incomplete_tasks(&self.client_id).await?;
        let queued = self.enqueue(tasks);
        if queued > 0 {
            self.kick().await?;
        }
        Ok(queued)
    }

    fn enqueue(&self, tasks: Vec<BootstrapTask>) -> usize {
        let mut state = self.state.lock();
        let mut queued = 0;
        for task in tasks {
            if state.knows(task.id) {
                continue;
            }
            info!("Queued bootstrap task {}", task);
            state.queue.push_back(task);
            queued += 1;
        }
        queued
    }

    /// 대기 작업 처리 시작. 동기 모드면 끝날 때까지 기다린다
    async fn kick(self: &Arc<Self>) -> Result<()> {
        match self.mode {
            BootstrapMode::Sync => self.drain().await,
            BootstrapMode::Async => {
                let mut worker = self.worker.lock();
                if worker.as_ref().is_some_and(|h| !h.is_finished()) {
                    return Ok(());
                }
                let this = self.clone();
                *worker = Some(tokio::spawn(async move {
                    if let Err(e) = this.drain().await {
                        error!("Bootstrap worker failed: {}", e);
                        *this.failure.lock() = Some(e.to_string());
                    }
                }));
                Ok(())
            }
        }
    }

    /// 큐가 빌 때까지 작업을 하나씩 실행
    async fn drain(&self) -> Result<()> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }
            let next = {
                let mut state = self.state.lock();
                if state.active.is_some() {
                    return Ok(());
                }
                let Some(task) = state.queue.pop_front() else {
                    return Ok(());
                };
                let key = self.key(&task.database, &task.table);
                state.active = Some(ActiveTask {
                    task: task.clone(),
                    key,
                    start_position: None,
                });
                task
            };
            self.run_task(next).await?;
        }
    }

    async fn run_task(&self, task: BootstrapTask) -> Result<()> {
        let (table, schema_id) = {
            let view = self.schema.lock();
            (
                view.schema.find_table(&task.database, &task.table).cloned(),
                view.schema_id,
            )
        };
        let Some(table) = table else {
            error!("Couldn't find table {}.{} for bootstrap {}", task.database, task.table, task);
            self.state.lock().failed.insert(task.id);
            self.finish(&task, true).await?;
            return Ok(());
        };

        let Some(position) = self.tracker.position() else {
            self.finish(&task, true).await?;
            return Err(CdcError::Other(
                "bootstrap started before replication position is known".to_string(),
            ));
        };
        if let Some(active) = self.state.lock().active.as_mut() {
            active.start_position = Some(position.clone());
        }

        let result = self
            .scanner
            .perform_bootstrap(&task, table, schema_id, &position, &self.shutdown)
            .await;

        match result {
            Ok(ScanOutcome::Completed { .. }) => self.finish(&task, false).await,
            Ok(ScanOutcome::Cancelled { .. }) => self.finish(&task, true).await,
            Err(CdcError::BootstrapTaskVanished { id }) => {
                warn!("Bootstrap task #{} was removed, cancelling scan of {}.{}", id, task.database, task.table);
                self.finish(&task, true).await
            }
            Err(e) => {
                // 버퍼는 내보내고 에러를 올린다
                self.finish(&task, true).await?;
                Err(e)
            }
        }
    }

    /// 버퍼 재생 후 작업을 비활성으로.
    ///
    /// 완료된 작업이면 시작 위치보다 새로운 행만, 중단된 작업이면 전부 내보낸다.
    /// 재생 중 새로 들어온 행도 버퍼에 쌓이므로 버퍼가 빌 때까지 반복한다.
    async fn finish(&self, task: &BootstrapTask, aborted: bool) -> Result<()> {
        let key = self.key(&task.database, &task.table);
        let mut replayed = 0usize;
        let mut skipped = 0usize;

        loop {
            let (mut rows, start) = {
                let mut state = self.state.lock();
                let rows = match state.buffers.remove(&key) {
                    Some(rows) if !rows.is_empty() => rows,
                    _ => {
                        // 같은 테이블이 큐에 또 있으면 버퍼링은 계속된다
                        state.active = None;
                        break;
                    }
                };
                let start = state.active.as_ref().and_then(|a| a.start_position.clone());
                (rows, start)
            };

            if rows.spilled() > 0 {
                info!("Replaying {} buffered rows from disk for {}.{}", rows.spilled(), task.database, task.table);
            }
            while let Some(row) = rows.pop()? {
                let newer = match &start {
                    Some(start) if !aborted => row.position.newer_than(start),
                    _ => true,
                };
                if newer {
                    self.producer.push(row).await?;
                    replayed += 1;
                } else {
                    skipped += 1;
                }
            }
        }

        debug!("Bootstrap {} finished", task);
        if replayed > 0 || skipped > 0 {
            info!(
                "Replayed {} buffered rows for {}.{} ({} already covered by bootstrap)",
                replayed, task.database, task.table, skipped
            );
        }
        self.finished.notify_waiters();
        Ok(())
    }

    /// 주기적으로 새 작업 확인 (비동기 모드)
    pub async fn run_poller(self: Arc<Self>, interval: Duration) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll().await {
                        warn!("Failed to poll bootstrap tasks: {}", e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Bootstrap poller stopped");
    }

    /// 워커 종료 대기
    pub async fn stop(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Bootstrap worker ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RowType;
    use crate::position_store::PositionStore;
    use crate::position_tracker::TrackerConfig;
    use crate::producer::MemoryProducer;
    use crate::schema::{ColumnDef, Database, Table};
    use crate::storage::MemoryStorage;
    use mysql_async::Value;
    use serde_json::json;

    fn schema() -> Schema {
        let mut schema = Schema::new("utf8mb4", CaseSensitivity::CaseSensitive);
        let mut db = Database::new("shop", "utf8mb4");
        db.add_table(Table::new(
            "shop",
            "orders",
            None,
            vec![ColumnDef::build("id", "int", 0, None, true, None, None).unwrap()],
            vec!["id".into()],
        ));
        schema.add_database(db);
        schema
    }

    fn build(
        mode: BootstrapMode,
        storage: Arc<MemoryStorage>,
        producer: Arc<dyn Producer>,
        position: Position,
        progress_interval: Duration,
        buffer_limit: usize,
    ) -> (Arc<BootstrapController>, watch::Sender<bool>) {
        let tracker = Arc::new(PositionTracker::new(
            PositionStore::new(storage.clone(), 1, "maxwell"),
            TrackerConfig::default(),
        ));
        tracker.initialize(position, None);
        let scanner = BootstrapScanner::new(storage.clone(), storage.clone(), producer.clone(), progress_interval);
        let (tx, rx) = watch::channel(false);
        let controller = BootstrapController::new(
            mode,
            "maxwell",
            storage,
            scanner,
            producer,
            tracker,
            schema(),
            Some(1),
            rx,
        )
        .with_buffer_limit(buffer_limit);
        (Arc::new(controller), tx)
    }

    fn controller(
        mode: BootstrapMode,
        storage: Arc<MemoryStorage>,
        producer: Arc<MemoryProducer>,
        position: Position,
    ) -> (Arc<BootstrapController>, watch::Sender<bool>) {
        build(mode, storage, producer, position, Duration::from_millis(250), buffer::DEFAULT_MAX_IN_MEMORY)
    }

    /// n번째 bootstrap-insert를 받으면 작업 행을 지운다 (운영자가 스캔 도중 중단)
    struct AbortingProducer {
        inner: MemoryProducer,
        storage: Arc<MemoryStorage>,
        task_id: u64,
        after: usize,
        seen: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl Producer for AbortingProducer {
        async fn push(&self, row: RowMap) -> Result<()> {
            let abort = row.row_type == RowType::BootstrapInsert && {
                let mut seen = self.seen.lock();
                *seen += 1;
                *seen == self.after
            };
            self.inner.push(row).await?;
            if abort {
                self.storage.delete_task(self.task_id).await?;
            }
            Ok(())
        }
    }

    fn live(row_type: RowType, id: i64, offset: u64) -> RowMap {
        let mut row = RowMap::new("shop", "orders", row_type, Position::at("bin.000001", offset));
        row.data.insert("id".into(), json!(id));
        row
    }

    #[tokio::test]
    async fn test_route_buffers_queued_table() {
        let storage = Arc::new(MemoryStorage::new());
        let producer = Arc::new(MemoryProducer::new());
        let (controller, _tx) = controller(BootstrapMode::Async, storage.clone(), producer, Position::at("bin.000001", 100));

        assert!(controller.route(live(RowType::Insert, 1, 50)).unwrap().is_some());

        storage
            .insert_task(&BootstrapTask::new("shop", "orders", "maxwell"))
            .await
            .unwrap();
        controller.enqueue(storage.incomplete_tasks("maxwell").await.unwrap());
        assert!(controller.is_busy("shop", "orders"));
        assert!(controller.route(live(RowType::Insert, 2, 150)).unwrap().is_none());

        let mut other = live(RowType::Insert, 3, 160);
        other.table = "customers".into();
        assert!(controller.route(other).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sync_bootstrap_replays_newer_buffered_rows() {
        let storage = Arc::new(MemoryStorage::new());
        storage.insert_row("shop", "orders", vec![Value::Int(1)]);
        let producer = Arc::new(MemoryProducer::new());
        let (controller, _tx) = controller(BootstrapMode::Sync, storage.clone(), producer.clone(), Position::at("bin.000001", 100));

        storage
            .insert_task(&BootstrapTask::new("shop", "orders", "maxwell"))
            .await
            .unwrap();
        controller.enqueue(storage.incomplete_tasks("maxwell").await.unwrap());
        // 대기 중에 들어온 행: 하나는 시작 위치 이전, 하나는 이후
        assert!(controller.route(live(RowType::Update, 1, 90)).unwrap().is_none());
        assert!(controller.route(live(RowType::Update, 1, 120)).unwrap().is_none());

        controller.kick().await.unwrap();

        let rows = producer.rows();
        let types: Vec<RowType> = rows.iter().map(|r| r.row_type).collect();
        assert_eq!(
            types,
            vec![RowType::BootstrapStart, RowType::BootstrapInsert, RowType::BootstrapComplete, RowType::Update]
        );
        assert_eq!(rows[3].position.binlog.offset, 120);
        assert!(!controller.is_busy("shop", "orders"));
        assert!(storage.incomplete_tasks("maxwell").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resume_resets_started_task() {
        let storage = Arc::new(MemoryStorage::new());
        let id = storage
            .insert_task(&BootstrapTask::new("shop", "orders", "maxwell"))
            .await
            .unwrap();
        storage.mark_started(id, &Position::at("bin.000001", 4), 10).await.unwrap();

        let producer = Arc::new(MemoryProducer::new());
        let (controller, _tx) = controller(BootstrapMode::Sync, storage.clone(), producer.clone(), Position::at("bin.000002", 4));
        assert_eq!(controller.resume().await.unwrap(), 1);

        let task = storage.find_task(id).await.unwrap().unwrap();
        assert!(task.is_complete);
        assert_eq!(task.start_position, Some(Position::at("bin.000002", 4)));
        assert_eq!(producer.rows().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_table_fails_task_only() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .insert_task(&BootstrapTask::new("shop", "nope", "maxwell"))
            .await
            .unwrap();
        let producer = Arc::new(MemoryProducer::new());
        let (controller, _tx) = controller(BootstrapMode::Sync, storage.clone(), producer.clone(), Position::at("bin.000001", 4));

        assert_eq!(controller.poll().await.unwrap(), 1);
        assert_eq!(controller.poll().await.unwrap(), 0);
        assert!(producer.rows().is_empty());
    }

    #[tokio::test]
    async fn test_spilled_buffer_replays_in_order() {
        let storage = Arc::new(MemoryStorage::new());
        storage.insert_row("shop", "orders", vec![Value::Int(1)]);
        let producer = Arc::new(MemoryProducer::new());
        let (controller, _tx) = build(
            BootstrapMode::Sync,
            storage.clone(),
            producer.clone(),
            Position::at("bin.000001", 100),
            Duration::from_millis(250),
            2,
        );

        storage
            .insert_task(&BootstrapTask::new("shop", "orders", "maxwell"))
            .await
            .unwrap();
        controller.enqueue(storage.incomplete_tasks("maxwell").await.unwrap());
        for offset in [90, 95, 110, 120, 130] {
            assert!(controller.route(live(RowType::Update, 1, offset)).unwrap().is_none());
        }
        assert_eq!(controller.state.lock().buffers.values().map(|b| b.spilled()).sum::<usize>(), 3);

        controller.kick().await.unwrap();

        let replayed: Vec<u64> = producer
            .rows()
            .iter()
            .filter(|r| r.row_type == RowType::Update)
            .map(|r| r.position.binlog.offset)
            .collect();
        assert_eq!(replayed, vec![110, 120, 130]);
        assert!(controller.state.lock().buffers.is_empty());
    }

    #[tokio::test]
    async fn test_task_removed_mid_scan_releases_buffer() {
        let storage = Arc::new(MemoryStorage::new());
        for id in 1..=100i64 {
            storage.insert_row("shop", "orders", vec![Value::Int(id)]);
        }
        let task_id = storage
            .insert_task(&BootstrapTask::new("shop", "orders", "maxwell"))
            .await
            .unwrap();
        let producer = Arc::new(AbortingProducer {
            inner: MemoryProducer::new(),
            storage: storage.clone(),
            task_id,
            after: 10,
            seen: Mutex::new(0),
        });
        let (controller, _tx) = build(
            BootstrapMode::Sync,
            storage.clone(),
            producer.clone(),
            Position::at("bin.000001", 100),
            Duration::ZERO,
            buffer::DEFAULT_MAX_IN_MEMORY,
        );

        controller.enqueue(storage.incomplete_tasks("maxwell").await.unwrap());
        assert!(controller.route(live(RowType::Update, 5, 90)).unwrap().is_none());
        assert!(controller.route(live(RowType::Delete, 7, 120)).unwrap().is_none());

        // 작업이 사라져도 에러로 올라오지 않는다
        controller.kick().await.unwrap();

        let rows = producer.inner.rows();
        let inserts = rows.iter().filter(|r| r.row_type == RowType::BootstrapInsert).count();
        assert_eq!(inserts, 10);
        assert!(rows.iter().all(|r| r.row_type != RowType::BootstrapComplete));
        // 중단된 작업의 버퍼는 위치와 상관없이 전부 내보낸다
        let replayed: Vec<RowType> = rows.iter().filter(|r| !r.row_type.is_bootstrap()).map(|r| r.row_type).collect();
        assert_eq!(replayed, vec![RowType::Update, RowType::Delete]);

        assert!(!controller.is_busy("shop", "orders"));
        assert!(storage.find_task(task_id).await.unwrap().is_none());
        controller.check_fatal().unwrap();
        assert!(controller.route(live(RowType::Insert, 8, 130)).unwrap().is_some());
    }
}
