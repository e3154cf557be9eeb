//! 복제 위치 추적
//!
//! 이벤트 루프는 트랜잭션 경계마다 `set_position`을 호출하고, 별도 태스크가
//! 주기적으로 `work`를 돌려 위치를 저장하고 하트비트를 쓴다.

use crate::error::{CdcError, Result};
use crate::offset::{BinlogPosition, Position};
use crate::position_store::PositionStore;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub flush_interval: Duration,
    pub heartbeat_interval: Duration,
    /// 마지막 하트비트 이후 이만큼 binlog가 진행하면 하트비트
    pub heartbeat_bytes: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            flush_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_bytes: 3000,
        }
    }
}

#[derive(Default)]
struct TrackerState {
    position: Option<Position>,
    stored: Option<Position>,
    last_heartbeat: Option<u64>,
    last_heartbeat_at: Option<Instant>,
    last_heartbeat_binlog: Option<BinlogPosition>,
    /// 중복 프로세스 등 치명적 에러. 이벤트 루프가 확인한다
    fatal: Option<String>,
}

pub struct PositionTracker {
    store: PositionStore,
    config: TrackerConfig,
    state: Mutex<TrackerState>,
}

impl PositionTracker {
    pub fn new(store: PositionStore, config: TrackerConfig) -> Self {
        PositionTracker {
            store,
            config,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// 시작 위치 지정. 이미 저장되어 있던 위치라면 `stored`도 같이 준다
    pub fn initialize(&self, position: Position, stored: Option<Position>) {
        let mut state = self.state.lock();
        state.position = Some(position);
        state.stored = stored;
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }

    /// 메모리상 위치 갱신. 더 새로운 위치일 때만 바뀐다
    pub fn set_position(&self, position: &Position) {
        let mut state = self.state.lock();
        let advance = match &state.position {
            Some(current) => position.newer_than(current),
            None => true,
        };
        if advance {
            state.position = Some(position.clone());
        }
    }

    pub fn position(&self) -> Option<Position> {
        self.state.lock().position.clone()
    }

    pub fn stored_position(&self) -> Option<Position> {
        self.state.lock().stored.clone()
    }

    pub fn last_heartbeat(&self) -> Option<u64> {
        self.state.lock().last_heartbeat
    }

    /// 백그라운드 작업이 치명적 에러로 멈췄으면 그 에러
    pub fn check_fatal(&self) -> Result<()> {
        match &self.state.lock().fatal {
            Some(message) => Err(CdcError::DuplicateProcess(message.clone())),
            None => Ok(()),
        }
    }

    /// 필요하면 위치를 저장하고 하트비트를 쓴다
    pub async fn work(&self) -> Result<()> {
        let (to_store, heartbeat) = {
            let state = self.state.lock();
            let to_store = match (&state.position, &state.stored) {
                (Some(p), Some(s)) if !p.newer_than(s) => None,
                (Some(p), _) => Some(p.clone()),
                (None, _) => None,
            };
            let heartbeat = self.heartbeat_due(&state).then_some(state.last_heartbeat);
            (to_store, heartbeat)
        };

        if let Some(position) = to_store {
            self.store.set(&position).await?;
            debug!("Stored position {}", position);
            let mut state = self.state.lock();
            let newer = state.stored.as_ref().map_or(true, |s| position.newer_than(s));
            if newer {
                state.stored = Some(position);
            }
        }

        if let Some(previous) = heartbeat {
            let value = next_heartbeat_value(previous);
            self.store.heartbeat(previous, value).await?;
            let mut state = self.state.lock();
            state.last_heartbeat = Some(value);
            state.last_heartbeat_at = Some(Instant::now());
            state.last_heartbeat_binlog = state.position.as_ref().map(|p| p.binlog.clone());
        }
        Ok(())
    }

    fn heartbeat_due(&self, state: &TrackerState) -> bool {
        let (Some(at), Some(last_binlog)) = (state.last_heartbeat_at, &state.last_heartbeat_binlog) else {
            return true;
        };
        if at.elapsed() >= self.config.heartbeat_interval {
            return true;
        }
        match &state.position {
            Some(current) => {
                current.binlog.file != last_binlog.file
                    || current.binlog.offset.saturating_sub(last_binlog.offset) > self.config.heartbeat_bytes
            }
            None => false,
        }
    }

    /// 종료 신호가 올 때까지 `flush_interval`마다 `work`
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.work().await {
                        Ok(()) => {}
                        Err(e @ CdcError::DuplicateProcess(_)) => {
                            error!("Position tracker stopping: {}", e);
                            self.state.lock().fatal = Some(e.to_string());
                            break;
                        }
                        // 일시적인 저장소 오류는 다음 주기에 다시 시도
                        Err(e) => warn!("Failed to store position: {}", e),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Position tracker loop finished");
    }

    /// 종료 시 마지막 위치 저장. `timeout` 안에 끝나지 않으면 로그만 남긴다
    pub async fn store_final_position(&self, timeout: Duration) -> Result<()> {
        let position = {
            let state = self.state.lock();
            match (&state.position, &state.stored) {
                (Some(p), Some(s)) if p == s => None,
                (Some(p), _) => Some(p.clone()),
                (None, _) => None,
            }
        };
        let Some(position) = position else {
            debug!("Final position already stored");
            return Ok(());
        };

        match tokio::time::timeout(timeout, self.store.set(&position)).await {
            Ok(Ok(())) => {
                info!("Stored final position {}", position);
                self.state.lock().stored = Some(position);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    "Timed out after {:?} storing final position {}, continuing shutdown",
                    timeout, position
                );
                Ok(())
            }
        }
    }
}

/// 현재 시각(ms). 이전 값보다는 항상 크다
fn next_heartbeat_value(previous: Option<u64>) -> u64 {
    let now = Utc::now().timestamp_millis().max(0) as u64;
    match previous {
        Some(p) if p >= now => p + 1,
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, PositionStorage};

    fn tracker(storage: Arc<MemoryStorage>) -> PositionTracker {
        PositionTracker::new(PositionStore::new(storage, 1, "maxwell"), TrackerConfig::default())
    }

    #[tokio::test]
    async fn test_position_only_advances() {
        let t = tracker(Arc::new(MemoryStorage::new()));
        t.set_position(&Position::at("bin.3", 800));
        t.set_position(&Position::at("bin.3", 500));
        assert_eq!(t.position(), Some(Position::at("bin.3", 800)));
    }

    #[tokio::test]
    async fn test_work_flushes_and_heartbeats() {
        let storage = Arc::new(MemoryStorage::new());
        let t = tracker(storage.clone());
        t.set_position(&Position::at("bin.3", 500));
        t.work().await.unwrap();
        assert_eq!(storage.get_position(1, "maxwell").await.unwrap(), Some(Position::at("bin.3", 500)));
        let first = t.last_heartbeat().unwrap();
        assert_eq!(storage.read_heartbeat(1, "maxwell").await.unwrap(), Some(first));

        // 조금 진행: 하트비트 없음
        t.set_position(&Position::at("bin.3", 800));
        t.work().await.unwrap();
        assert_eq!(t.last_heartbeat(), Some(first));
        assert_eq!(storage.get_position(1, "maxwell").await.unwrap(), Some(Position::at("bin.3", 800)));

        // 파일이 바뀌면 하트비트
        t.set_position(&Position::at("bin.4", 4));
        t.work().await.unwrap();
        assert!(t.last_heartbeat().unwrap() > first);
    }

    #[tokio::test]
    async fn test_duplicate_process_is_fatal() {
        let storage = Arc::new(MemoryStorage::new());
        let t = tracker(storage.clone());
        t.set_position(&Position::at("bin.3", 500));
        t.work().await.unwrap();

        let hb = t.last_heartbeat().unwrap();
        storage.update_heartbeat(1, "maxwell", hb, hb + 1000).await.unwrap();

        t.set_position(&Position::at("bin.5", 4));
        let err = t.work().await.unwrap_err();
        assert!(matches!(err, CdcError::DuplicateProcess(_)));
    }

    #[tokio::test]
    async fn test_store_final_position_only_when_changed() {
        let storage = Arc::new(MemoryStorage::new());
        let t = tracker(storage.clone());
        t.initialize(Position::at("bin.1", 4), Some(Position::at("bin.1", 4)));
        t.store_final_position(Duration::from_secs(5)).await.unwrap();
        assert_eq!(storage.get_position(1, "maxwell").await.unwrap(), None);

        t.set_position(&Position::at("bin.1", 90));
        t.store_final_position(Duration::from_secs(5)).await.unwrap();
        assert_eq!(storage.get_position(1, "maxwell").await.unwrap(), Some(Position::at("bin.1", 90)));
    }
}
