//! 마스터 교체 후 복제 위치 복구
//!
//! 서버가 바뀌면 binlog 오프셋은 의미가 없어진다. 대신 이전 서버에서 마지막으로
//! 읽은 하트비트 값을 새 서버의 binlog에서 찾아 정확한 좌표를 다시 얻는다.

use crate::error::{CdcError, Result};
use crate::offset::{BinlogPosition, Position, BINLOG_START_OFFSET};
use crate::position_store::{PositionStore, RecoveryInfo};
use crate::schema_store::{SavedSchema, SchemaRegistry};
use crate::source::BinlogSource;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct RecoveryResolver {
    source: Arc<dyn BinlogSource>,
    /// 이 시간 동안 이벤트가 없으면 파일 끝으로 본다
    idle_timeout: Duration,
}

impl RecoveryResolver {
    pub fn new(source: Arc<dyn BinlogSource>) -> Self {
        RecoveryResolver {
            source,
            idle_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// 하트비트 이벤트를 찾아 새 서버에서의 위치를 돌려준다. 못 찾으면 None
    pub async fn find_position(&self, info: &RecoveryInfo) -> Result<Option<Position>> {
        let heartbeat = info.heartbeat();
        let files = self.source.binary_logs().await?;
        info!(
            "Attempting master recovery: looking for heartbeat {} from server {} in {} binlogs",
            heartbeat,
            info.server_id,
            files.len()
        );

        // 기록된 좌표부터 시도
        let recorded = &info.position.binlog;
        if files.contains(&recorded.file) {
            if let Some(found) = self.scan_file(&recorded.file, recorded.offset, heartbeat).await? {
                return Ok(Some(found));
            }
        }

        for file in files.iter().rev() {
            if let Some(found) = self.scan_file(file, BINLOG_START_OFFSET, heartbeat).await? {
                return Ok(Some(found));
            }
        }

        warn!("Could not find heartbeat {} in any binlog", heartbeat);
        Ok(None)
    }

    async fn scan_file(&self, file: &str, offset: u64, heartbeat: u64) -> Result<Option<Position>> {
        debug!("Scanning {}:{} for heartbeat {}", file, offset, heartbeat);
        let mut rx = self.source.open(&BinlogPosition::new(file, offset)).await?;

        loop {
            let event = match tokio::time::timeout(self.idle_timeout, rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) | Err(_) => return Ok(None),
            };
            let position = event.position();
            if position.binlog.file != file {
                return Ok(None);
            }
            if event.is_heartbeat(heartbeat) {
                let found = Position::new(position.binlog.clone(), heartbeat);
                info!("Found heartbeat {} at {}", heartbeat, found.binlog);
                return Ok(Some(found));
            }
        }
    }

    /// 복구 전체 과정.
    ///
    /// 이전 서버의 스키마를 새 서버 id의 전체 스냅샷으로 복제한 뒤 위치를 저장하고
    /// 다른 서버의 기록을 지운다. 하트비트를 못 찾으면 None
    pub async fn recover(
        &self,
        info: &RecoveryInfo,
        registry: &SchemaRegistry,
        positions: &PositionStore,
    ) -> Result<Option<Position>> {
        let Some(position) = self.find_position(info).await? else {
            return Ok(None);
        };

        let restored = registry
            .restore(info.server_id, &info.position)
            .await?
            .ok_or_else(|| {
                CdcError::SchemaStoreError(format!(
                    "no schema stored for server {} at {}",
                    info.server_id, info.position
                ))
            })?;

        let saved = SavedSchema::full(restored.saved.schema, position.clone(), positions.server_id());
        let schema_id = registry.save(&saved, true).await?;
        info!(
            "Recovered schema from server {} as #{} for server {}",
            info.server_id,
            schema_id,
            positions.server_id()
        );

        positions.set(&position).await?;
        positions.cleanup_old_recovery_infos().await?;
        info!("Master recovery complete, resuming at {}", position);
        Ok(Some(position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SourceEvent;
    use crate::source::ReplaySource;

    fn heartbeat(value: u64, file: &str, offset: u64) -> SourceEvent {
        SourceEvent::Heartbeat {
            value,
            position: Position::at(file, offset),
        }
    }

    fn info(file: &str, offset: u64, hb: u64) -> RecoveryInfo {
        RecoveryInfo {
            server_id: 1,
            client_id: "maxwell".into(),
            position: Position::at(file, offset).with_heartbeat(hb),
        }
    }

    #[tokio::test]
    async fn test_finds_heartbeat_in_older_file() {
        let source = ReplaySource::from_events(vec![
            heartbeat(100, "bin.000001", 400),
            heartbeat(200, "bin.000001", 900),
            heartbeat(300, "bin.000002", 120),
        ]);
        let resolver = RecoveryResolver::new(Arc::new(source)).with_idle_timeout(Duration::from_millis(100));

        // 기록된 파일은 새 서버에 없다
        let found = resolver.find_position(&info("old.000050", 777, 200)).await.unwrap();
        assert_eq!(found, Some(Position::at("bin.000001", 900).with_heartbeat(200)));

        let missing = resolver.find_position(&info("old.000050", 777, 999)).await.unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn test_recorded_file_scanned_first() {
        let source = ReplaySource::from_events(vec![
            heartbeat(100, "bin.000001", 400),
            heartbeat(100, "bin.000002", 120),
        ]);
        let resolver = RecoveryResolver::new(Arc::new(source)).with_idle_timeout(Duration::from_millis(100));
        let found = resolver.find_position(&info("bin.000001", 4, 100)).await.unwrap();
        assert_eq!(found.unwrap().binlog.file, "bin.000001");
    }
}
