//! 복제 위치와 하트비트 저장

use crate::error::{CdcError, Result};
use crate::offset::Position;
use crate::storage::{PositionRecord, PositionStorage};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 마스터 교체 후 위치를 찾는 데 쓰는 이전 서버의 기록
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryInfo {
    pub server_id: u64,
    pub client_id: String,
    pub position: Position,
}

impl RecoveryInfo {
    pub fn heartbeat(&self) -> u64 {
        self.position.last_heartbeat_read
    }
}

pub struct PositionStore {
    storage: Arc<dyn PositionStorage>,
    server_id: u64,
    client_id: String,
}

impl PositionStore {
    pub fn new(storage: Arc<dyn PositionStorage>, server_id: u64, client_id: impl Into<String>) -> Self {
        PositionStore {
            storage,
            server_id,
            client_id: client_id.into(),
        }
    }

    pub fn server_id(&self) -> u64 {
        self.server_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn set(&self, position: &Position) -> Result<()> {
        self.storage
            .set_position(self.server_id, &self.client_id, position)
            .await
    }

    pub async fn get(&self) -> Result<Option<Position>> {
        self.storage.get_position(self.server_id, &self.client_id).await
    }

    /// 하트비트 기록.
    ///
    /// 저장된 값이 이 프로세스가 마지막으로 쓴 값과 다르면 다른 프로세스가 같은
    /// (server_id, client_id)로 돌고 있다는 뜻이므로 `DuplicateProcess`를 돌려준다.
    pub async fn heartbeat(&self, previous: Option<u64>, value: u64) -> Result<()> {
        let ok = match previous {
            None => {
                if self
                    .storage
                    .insert_heartbeat(self.server_id, &self.client_id, value)
                    .await?
                {
                    true
                } else {
                    // 이전 실행이 남긴 행: 아직 아무도 갱신하지 않았다면 그 값을 기준으로 CAS
                    let stored = self
                        .storage
                        .read_heartbeat(self.server_id, &self.client_id)
                        .await?;
                    match stored {
                        Some(stored) if stored < value => {
                            self.storage
                                .update_heartbeat(self.server_id, &self.client_id, stored, value)
                                .await?
                                == 1
                        }
                        _ => false,
                    }
                }
            }
            Some(previous) => {
                self.storage
                    .update_heartbeat(self.server_id, &self.client_id, previous, value)
                    .await?
                    == 1
            }
        };

        if ok {
            return Ok(());
        }

        let stored = self
            .storage
            .read_heartbeat(self.server_id, &self.client_id)
            .await?;
        error!(
            "Heartbeat for server {} client {} was changed by another process (expected {:?}, found {:?})",
            self.server_id, self.client_id, previous, stored
        );
        Err(CdcError::DuplicateProcess(format!(
            "another process is running with server_id={} client_id={} (expected heartbeat {:?}, found {:?})",
            self.server_id, self.client_id, previous, stored
        )))
    }

    /// 이 클라이언트가 다른 서버에 남긴 위치 중 복구에 쓸 수 있는 것.
    ///
    /// 서버 id가 정확히 하나일 때만 후보를 돌려준다. 0개나 2개 이상이면
    /// 추측하지 않고 `RecoveryAmbiguous`를 돌려준다.
    pub async fn get_recovery_info(&self) -> Result<RecoveryInfo> {
        let records = self.storage.client_positions(&self.client_id).await?;

        let mut candidates: Vec<PositionRecord> = Vec::new();
        for record in records {
            if record.last_heartbeat_read.is_none() {
                warn!(
                    "Ignoring recovery candidate for server {} without heartbeat (left by an older version)",
                    record.server_id
                );
                continue;
            }
            candidates.push(record);
        }

        let server_ids: BTreeSet<u64> = candidates.iter().map(|r| r.server_id).collect();
        if server_ids.len() != 1 {
            if candidates.is_empty() {
                info!("No recovery candidates found for client {}", self.client_id);
            } else {
                error!(
                    "Found multiple recovery candidates for client {}, refusing to guess",
                    self.client_id
                );
                for candidate in &candidates {
                    error!(
                        "  candidate: server_id={} position={} heartbeat={:?}",
                        candidate.server_id, candidate.binlog, candidate.last_heartbeat_read
                    );
                }
            }
            return Err(CdcError::RecoveryAmbiguous {
                candidates: server_ids.len(),
            });
        }

        // 최근 하트비트 순으로 정렬되어 있다
        let best = candidates.remove(0);
        Ok(RecoveryInfo {
            server_id: best.server_id,
            client_id: best.client_id.clone(),
            position: best.position(),
        })
    }

    /// 복구 성공 후 다른 서버의 위치를 지운다
    pub async fn cleanup_old_recovery_infos(&self) -> Result<u64> {
        let deleted = self
            .storage
            .delete_other_positions(&self.client_id, self.server_id)
            .await?;
        if deleted > 0 {
            info!(
                "Removed {} stale positions for client {} from other servers",
                deleted, self.client_id
            );
        }
        Ok(deleted)
    }
}
