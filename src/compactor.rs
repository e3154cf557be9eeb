//! 델타 체인 압축과 삭제된 스냅샷 정리

use crate::error::{CdcError, Result};
use crate::schema::CaseSensitivity;
use crate::schema_store::SchemaRegistry;
use crate::storage::{PositionStorage, SchemaStorage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// 한 번의 `scavenge`에서 지우는 최대 스냅샷 수
pub const SCAVENGE_BATCH: usize = 100;

pub struct SchemaCompactor {
    schemas: Arc<dyn SchemaStorage>,
    positions: Arc<dyn PositionStorage>,
    registry: SchemaRegistry,
    server_id: u64,
    max_deltas: usize,
}

impl SchemaCompactor {
    pub fn new(
        schemas: Arc<dyn SchemaStorage>,
        positions: Arc<dyn PositionStorage>,
        sensitivity: CaseSensitivity,
        server_id: u64,
        max_deltas: usize,
    ) -> Self {
        SchemaCompactor {
            registry: SchemaRegistry::new(schemas.clone(), sensitivity),
            schemas,
            positions,
            server_id,
            max_deltas,
        }
    }

    /// 가장 최근 스냅샷을 전체 스냅샷으로 만들고 이전 스냅샷들을 삭제 표시한다.
    /// 압축했으면 true
    pub async fn compact(&self) -> Result<bool> {
        let records = self.schemas.schema_records(self.server_id).await?;
        if records.len() < self.max_deltas.max(2) {
            debug!(
                "Not compacting: {} snapshots for server {} (threshold {})",
                records.len(),
                self.server_id,
                self.max_deltas
            );
            return Ok(false);
        }
        let Some(newest) = records.last() else {
            return Ok(false);
        };

        // 모든 클라이언트가 가장 최근 스냅샷을 지나야 그 이전 스냅샷이 필요 없어진다
        let positions = self.positions.server_positions(self.server_id).await?;
        if positions.is_empty() {
            debug!("Not compacting: no stored positions for server {}", self.server_id);
            return Ok(false);
        }
        if let Some(behind) = positions
            .iter()
            .find(|p| !p.position().newer_than(&newest.position))
        {
            info!(
                "Not compacting: client {} at {} has not passed schema #{} @{}",
                behind.client_id,
                behind.binlog,
                newest.id,
                newest.position
            );
            return Ok(false);
        }

        let (schema, _) = self.registry.resolve(newest.id).await?;

        if let (Some(base), Some(deltas)) = (newest.base_schema_id, newest.deltas.as_deref()) {
            info!("Compacting schema #{} into a full snapshot", newest.id);
            self.schemas.replace_with_full(newest.id, &schema).await?;

            let written = self
                .schemas
                .load_full_schema(newest.id, self.registry.sensitivity())
                .await?;
            let diffs = schema.diff(&written, "resolved", "compacted");
            if !diffs.is_empty() {
                for diff in &diffs {
                    error!("compaction mismatch: {}", diff);
                }
                self.schemas.revert_to_delta(newest.id, base, deltas).await?;
                return Err(CdcError::SchemaStoreError(format!(
                    "compacted schema #{} differs from its delta chain",
                    newest.id
                )));
            }
        }

        let older: Vec<u64> = records
            .iter()
            .filter(|r| r.id != newest.id)
            .map(|r| r.id)
            .collect();
        self.schemas.mark_deleted(&older).await?;
        info!(
            "Compacted {} snapshots for server {} into schema #{}",
            older.len(),
            self.server_id,
            newest.id
        );
        Ok(true)
    }

    /// 삭제 표시된 스냅샷을 한 묶음 물리적으로 지운다. 지운 수
    pub async fn scavenge(&self) -> Result<usize> {
        let ids = self.schemas.deleted_schema_ids(SCAVENGE_BATCH).await?;
        for id in &ids {
            self.schemas.purge_schema(*id).await?;
        }
        if !ids.is_empty() {
            debug!("Scavenged {} deleted schema snapshots", ids.len());
        }
        Ok(ids.len())
    }

    /// 종료 신호가 올 때까지 주기적으로 압축/정리
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!("Schema compactor started (every {:?})", interval);
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.compact().await {
                        warn!("Schema compaction failed: {}", e);
                    }
                    if let Err(e) = self.scavenge().await {
                        warn!("Schema scavenging failed: {}", e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Schema compactor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset::Position;
    use crate::schema::{ColumnDef, Database, Schema, Table};
    use crate::schema_store::SchemaStore;
    use crate::storage::MemoryStorage;

    fn base_schema() -> Schema {
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

    async fn store_with_deltas(storage: Arc<MemoryStorage>) -> SchemaStore {
        let registry = SchemaRegistry::new(storage, CaseSensitivity::CaseSensitive);
        let mut store = SchemaStore::from_schema(registry, 1, base_schema(), &Position::at("bin.000001", 4))
            .await
            .unwrap();
        for (i, col) in ["a", "b", "c"].iter().enumerate() {
            store
                .process_sql(
                    &format!("ALTER TABLE orders ADD COLUMN {} int", col),
                    Some("shop"),
                    &Position::at("bin.000001", 100 * (i as u64 + 1)),
                )
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_compact_waits_for_clients() {
        let storage = Arc::new(MemoryStorage::new());
        let store = store_with_deltas(storage.clone()).await;
        let compactor = SchemaCompactor::new(storage.clone(), storage.clone(), CaseSensitivity::CaseSensitive, 1, 2);

        storage
            .set_position(1, "maxwell", &Position::at("bin.000001", 250))
            .await
            .unwrap();
        assert!(!compactor.compact().await.unwrap());

        storage
            .set_position(1, "maxwell", &Position::at("bin.000002", 4))
            .await
            .unwrap();
        assert!(compactor.compact().await.unwrap());

        let newest = store.schema_id().unwrap();
        assert_eq!(storage.schema_records(1).await.unwrap().len(), 1);
        assert!(storage.schema_record(newest).await.unwrap().unwrap().is_full());

        let registry = SchemaRegistry::new(storage.clone(), CaseSensitivity::CaseSensitive);
        let (compacted, _) = registry.resolve(newest).await.unwrap();
        assert!(compacted.equals(store.schema()));

        assert_eq!(compactor.scavenge().await.unwrap(), 3);
        assert_eq!(storage.schema_count(), 1);
    }

    #[tokio::test]
    async fn test_compact_below_threshold() {
        let storage = Arc::new(MemoryStorage::new());
        store_with_deltas(storage.clone()).await;
        storage
            .set_position(1, "maxwell", &Position::at("bin.000009", 4))
            .await
            .unwrap();
        let compactor = SchemaCompactor::new(storage.clone(), storage.clone(), CaseSensitivity::CaseSensitive, 1, 10);
        assert!(!compactor.compact().await.unwrap());
    }
}
