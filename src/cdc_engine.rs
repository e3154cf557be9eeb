//! MySQL CDC 엔진
//!
//! 엔진은 다음 단계로 진행됩니다:
//! 1. 시작 위치 결정 (저장된 위치 → 마스터 복구 → 현재 마스터 위치)
//! 2. 그 위치에 맞는 스키마 복원 (없으면 라이브 캡처)
//! 3. 미완료 부트스트랩 재개, 위치 저장/압축 백그라운드 작업 시작
//! 4. binlog 이벤트를 순서대로 처리 (행 출력, DDL 적용, 위치 갱신)

use crate::bootstrap::{BootstrapController, BootstrapScanner};
use crate::compactor::SchemaCompactor;
use crate::config::BootstrapMode;
use crate::context::CdcContext;
use crate::ddl;
use crate::error::{CdcError, Result};
use crate::events::{RowMap, RowType, SourceEvent};
use crate::offset::Position;
use crate::position_tracker::PositionTracker;
use crate::producer::Producer;
use crate::recovery::RecoveryResolver;
use crate::schema::SchemaCapture;
use crate::schema_store::SchemaStore;
use crate::source::BinlogSource;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 엔진 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Streaming,
    Stopped,
}

/// 시작이 끝난 뒤에만 존재하는 부분
struct Running {
    start_position: Position,
    schema: SchemaStore,
    tracker: Arc<PositionTracker>,
    bootstrap: Arc<BootstrapController>,
    last_heartbeat: u64,
    last_poll: Instant,
}

/// MySQL CDC 엔진
pub struct CdcEngine {
    context: CdcContext,
    source: Arc<dyn BinlogSource>,
    producer: Arc<dyn Producer>,
    capture: Option<Arc<dyn SchemaCapture>>,
    running: Option<Running>,
    background: Vec<JoinHandle<()>>,
    state: EngineState,
}

impl CdcEngine {
    /// 새 CDC 엔진 생성
    pub fn new(
        context: CdcContext,
        source: Arc<dyn BinlogSource>,
        producer: Arc<dyn Producer>,
        capture: Option<Arc<dyn SchemaCapture>>,
    ) -> Self {
        CdcEngine {
            context,
            source,
            producer,
            capture,
            running: None,
            background: Vec::new(),
            state: EngineState::Created,
        }
    }

    pub fn context(&self) -> &CdcContext {
        &self.context
    }

    pub fn get_state(&self) -> EngineState {
        self.state
    }

    /// 현재 복제 위치
    pub fn position(&self) -> Option<Position> {
        self.running.as_ref().and_then(|r| r.tracker.position())
    }

    pub fn schema_store(&self) -> Option<&SchemaStore> {
        self.running.as_ref().map(|r| &r.schema)
    }

    pub fn bootstrap(&self) -> Option<&Arc<BootstrapController>> {
        self.running.as_ref().map(|r| &r.bootstrap)
    }

    /// 엔진 초기화. 시작 위치를 돌려준다
    pub async fn start(&mut self) -> Result<Position> {
        info!(
            "Starting CDC Engine (server {}, client {})",
            self.context.server_id,
            self.context.client_id()
        );

        let positions = self.context.position_store();
        let stored = positions.get().await?;
        let position = match &stored {
            Some(position) => {
                info!("Resuming from stored position {}", position);
                position.clone()
            }
            None => self.initial_position().await?,
        };
        let position = self.apply_gtid_mode(position);

        let mut registry = self.context.schema_registry();
        if let Some(capture) = &self.capture {
            registry = registry.with_capture(capture.clone());
        }
        let schema = SchemaStore::initialize(registry, self.context.server_id, &position).await?;
        info!(
            "Schema ready: {} databases, {} tables (schema #{:?})",
            schema.schema().databases.len(),
            schema.schema().table_count(),
            schema.schema_id()
        );

        let tracker = Arc::new(PositionTracker::new(positions, self.context.config.tracker_config()));
        tracker.initialize(position.clone(), stored);

        let config = &self.context.config;
        let scanner = BootstrapScanner::new(
            self.context.tasks.clone(),
            self.context.scanner.clone(),
            self.producer.clone(),
            config.bootstrap_progress_interval,
        );
        let bootstrap = Arc::new(BootstrapController::new(
            config.bootstrap_mode,
            config.client_id.clone(),
            self.context.tasks.clone(),
            scanner,
            self.producer.clone(),
            tracker.clone(),
            schema.schema().clone(),
            schema.schema_id(),
            self.context.subscribe_shutdown(),
        )
        .with_buffer_limit(config.bootstrap_buffer_rows));

        self.background.push(tokio::spawn(
            tracker.clone().run(self.context.subscribe_shutdown()),
        ));

        let resumed = bootstrap.resume().await?;
        if resumed > 0 {
            info!("Resumed {} bootstrap tasks", resumed);
        }
        if config.bootstrap_mode == BootstrapMode::Async {
            self.background.push(tokio::spawn(
                bootstrap.clone().run_poller(config.bootstrap_poll_interval),
            ));
        }

        if let Some(max_deltas) = config.max_schema_deltas {
            let compactor = SchemaCompactor::new(
                self.context.schemas.clone(),
                self.context.positions.clone(),
                self.context.sensitivity,
                self.context.server_id,
                max_deltas,
            );
            self.background.push(tokio::spawn(
                compactor.run(config.compaction_interval, self.context.subscribe_shutdown()),
            ));
        }

        self.running = Some(Running {
            last_heartbeat: position.last_heartbeat_read,
            start_position: position.clone(),
            schema,
            tracker,
            bootstrap,
            last_poll: Instant::now(),
        });
        self.state = EngineState::Streaming;

        info!("CDC Engine started at {}", position);
        Ok(position)
    }

    /// GTID 모드가 아니면 GTID 집합을 버려 파일/오프셋으로만 비교·복원한다
    fn apply_gtid_mode(&self, mut position: Position) -> Position {
        if !self.context.config.gtid_mode {
            position.binlog.gtid_set = None;
        } else if position.binlog.gtid_set.is_none() {
            warn!(
                "GTID mode is enabled but position {} has no GTID set, falling back to file coordinates",
                position
            );
        }
        position
    }

    /// 저장된 위치가 없을 때: 설정된 시작 위치, 마스터 복구, 현재 마스터 위치 순
    async fn initial_position(&self) -> Result<Position> {
        if let Some(position) = &self.context.config.init_position {
            info!("Starting from configured position {}", position);
            return Ok(position.clone());
        }

        if self.context.config.master_recovery {
            if let Some(position) = self.attempt_master_recovery().await? {
                return Ok(position);
            }
        }

        let position = self.source.capture_position().await?;
        info!("No stored position, starting at current master position {}", position);
        Ok(position)
    }

    async fn attempt_master_recovery(&self) -> Result<Option<Position>> {
        let positions = self.context.position_store();
        let info = match positions.get_recovery_info().await {
            Ok(info) => info,
            Err(CdcError::RecoveryAmbiguous { candidates }) => {
                if candidates > 1 {
                    warn!("Master recovery skipped: {} candidate servers", candidates);
                }
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if info.server_id == self.context.server_id {
            return Ok(None);
        }

        let registry = self.context.schema_registry();
        let recovered = RecoveryResolver::new(self.source.clone())
            .recover(&info, &registry, &positions)
            .await?;
        if recovered.is_none() {
            warn!(
                "Master recovery failed for server {}, falling back to current master position",
                info.server_id
            );
        }
        Ok(recovered)
    }

    fn running(&mut self) -> Result<&mut Running> {
        self.running
            .as_mut()
            .ok_or_else(|| CdcError::Other("engine is not started".to_string()))
    }

    /// 이벤트 하나 처리
    pub async fn process(&mut self, mut event: SourceEvent) -> Result<()> {
        if !self.context.config.gtid_mode {
            event.position_mut().binlog.gtid_set = None;
        }
        let output_ddl = self.context.config.output_ddl;
        let poll_interval = self.context.config.bootstrap_poll_interval;
        let producer = self.producer.clone();
        let running = self.running()?;

        running.tracker.check_fatal()?;
        running.bootstrap.check_fatal()?;

        // 시작 위치와 같거나 이전인 이벤트는 이미 처리됐다
        if !event.position().binlog.newer_than(&running.start_position.binlog) {
            debug!("Skipping already processed event at {}", event.position());
            return Ok(());
        }

        match event {
            SourceEvent::Row {
                database,
                table,
                row_type,
                data,
                old,
                position,
            } => {
                let position = position.with_heartbeat(running.last_heartbeat.max(position.last_heartbeat_read));
                let mut row = RowMap::new(database, table, row_type, position)
                    .with_schema_id(running.schema.schema_id())
                    .with_data(data);
                row.old = old;
                if let Some(row) = running.bootstrap.route(row)? {
                    producer.push(row).await?;
                }
            }
            SourceEvent::Ddl {
                database,
                sql,
                position,
            } => {
                let position = position.with_heartbeat(running.last_heartbeat.max(position.last_heartbeat_read));
                if ddl::is_ignored(&sql) {
                    debug!("Ignoring statement: {}", sql);
                } else {
                    // 부트스트랩 중인 테이블의 구조가 바뀌기 전에 스캔을 끝낸다
                    if let Ok(changes) = ddl::parse(&sql, database.as_deref()) {
                        for change in &changes {
                            for (db, table) in change.targets() {
                                if let Some(table) = table {
                                    running.bootstrap.wait_for_table(&db, &table).await;
                                }
                            }
                        }
                    }

                    let resolved = running
                        .schema
                        .process_sql(&sql, database.as_deref(), &position)
                        .await?;
                    if !resolved.is_empty() {
                        running
                            .bootstrap
                            .update_schema(running.schema.schema_id(), running.schema.schema());

                        if output_ddl {
                            let first = &resolved[0];
                            let mut row = RowMap::new(
                                first.database(),
                                first.table().unwrap_or_default(),
                                RowType::Ddl,
                                position.clone(),
                            )
                            .with_schema_id(running.schema.schema_id());
                            row.sql = Some(sql.clone());
                            producer.push(row).await?;
                        }
                    }
                }
                running.tracker.set_position(&position);
            }
            SourceEvent::TransactionCommit { position } => {
                let position = position.with_heartbeat(running.last_heartbeat.max(position.last_heartbeat_read));
                running.tracker.set_position(&position);
            }
            SourceEvent::Heartbeat { value, position } => {
                debug!("Read heartbeat {} at {}", value, position.binlog);
                running.last_heartbeat = running.last_heartbeat.max(value);
                running.tracker.set_position(&position.with_heartbeat(running.last_heartbeat));
            }
        }

        if running.bootstrap.mode() == BootstrapMode::Sync && running.last_poll.elapsed() >= poll_interval {
            running.last_poll = Instant::now();
            running.bootstrap.poll().await?;
        }
        Ok(())
    }

    /// 수신 채널이 닫히거나 종료 요청이 올 때까지 이벤트 처리
    pub async fn run(&mut self, mut rx: mpsc::Receiver<SourceEvent>) -> Result<()> {
        let mut shutdown = self.context.subscribe_shutdown();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.process(event).await?,
                    None => {
                        info!("Binlog stream ended");
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        Ok(())
    }

    /// 시작 위치부터 binlog를 열어 처리
    pub async fn stream_binlog(&mut self) -> Result<()> {
        let from = self.running()?.start_position.binlog.clone();
        info!("Starting binlog streaming from {}", from);
        let rx = self.source.open(&from).await?;
        self.run(rx).await
    }

    /// 엔진 종료. 백그라운드 작업을 멈추고 마지막 위치를 저장한다
    pub async fn stop(&mut self) -> Result<()> {
        if self.state == EngineState::Stopped {
            return Ok(());
        }
        info!("Stopping CDC Engine");
        self.context.terminate();

        let timeout = self.context.config.shutdown_timeout;
        for handle in self.background.drain(..) {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Background task ended abnormally: {}", e),
                Err(_) => warn!("Background task did not stop within {:?}", timeout),
            }
        }

        if let Some(running) = &self.running {
            running.bootstrap.stop().await;
            running.tracker.store_final_position(timeout).await?;
        }

        self.state = EngineState::Stopped;
        info!("CDC Engine stopped");
        Ok(())
    }
}
