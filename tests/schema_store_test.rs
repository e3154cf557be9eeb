mod common;

use async_trait::async_trait;
use common::{registry, sample_schema};
use mysql_cdc::compactor::SchemaCompactor;
use mysql_cdc::offset::BinlogPosition;
use mysql_cdc::schema::{CaseSensitivity, Schema};
use mysql_cdc::schema_store::{SavedSchema, SchemaRegistry, SchemaStore};
use mysql_cdc::storage::{InsertOutcome, MemoryStorage, PositionStorage, SchemaRecord, SchemaStorage};
use mysql_cdc::{CdcError, GtidSet, Position};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const SERVER_UUID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

fn gtid_position(offset: u64, last: u64) -> Position {
    let gtid = GtidSet::parse(&format!("{}:1-{}", SERVER_UUID, last)).unwrap();
    Position::new(BinlogPosition::new("bin.000001", offset).with_gtid_set(gtid), 0)
}

/// 다른 프로세스가 먼저 저장한 상황: 첫 지문 조회는 못 보고 지나간다
struct LateWriterStorage {
    inner: Arc<MemoryStorage>,
    misses: AtomicUsize,
}

#[async_trait]
impl SchemaStorage for LateWriterStorage {
    async fn find_schema_by_sha(&self, position_sha: &str) -> mysql_cdc::Result<Option<u64>> {
        if self
            .misses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(None);
        }
        self.inner.find_schema_by_sha(position_sha).await
    }

    async fn insert_schema(&self, record: &SchemaRecord, full: Option<&Schema>) -> mysql_cdc::Result<InsertOutcome> {
        self.inner.insert_schema(record, full).await
    }

    async fn schema_record(&self, id: u64) -> mysql_cdc::Result<Option<SchemaRecord>> {
        self.inner.schema_record(id).await
    }

    async fn schema_records(&self, server_id: u64) -> mysql_cdc::Result<Vec<SchemaRecord>> {
        self.inner.schema_records(server_id).await
    }

    async fn load_full_schema(&self, id: u64, sensitivity: CaseSensitivity) -> mysql_cdc::Result<Schema> {
        self.inner.load_full_schema(id, sensitivity).await
    }

    async fn replace_with_full(&self, id: u64, schema: &Schema) -> mysql_cdc::Result<()> {
        self.inner.replace_with_full(id, schema).await
    }

    async fn revert_to_delta(&self, id: u64, base_schema_id: u64, deltas: &str) -> mysql_cdc::Result<()> {
        self.inner.revert_to_delta(id, base_schema_id, deltas).await
    }

    async fn mark_deleted(&self, ids: &[u64]) -> mysql_cdc::Result<()> {
        self.inner.mark_deleted(ids).await
    }

    async fn deleted_schema_ids(&self, limit: usize) -> mysql_cdc::Result<Vec<u64>> {
        self.inner.deleted_schema_ids(limit).await
    }

    async fn purge_schema(&self, id: u64) -> mysql_cdc::Result<()> {
        self.inner.purge_schema(id).await
    }
}

#[tokio::test]
async fn test_add_column_after() {
    let storage = Arc::new(MemoryStorage::new());
    let start = Position::at("bin.000003", 4);
    let mut store = SchemaStore::from_schema(registry(&storage), 1, sample_schema(), &start)
        .await
        .unwrap();

    let resolved = store
        .process_sql(
            "ALTER TABLE t ADD COLUMN age INT AFTER id",
            Some("s1"),
            &Position::at("bin.000003", 120),
        )
        .await
        .unwrap();
    assert_eq!(resolved.len(), 1);

    let table = store.find_table("s1", "t").unwrap();
    assert_eq!(table.column_names(), vec!["id", "age", "name"]);
}

#[tokio::test]
async fn test_save_restore_round_trip() {
    let storage = Arc::new(MemoryStorage::new());
    let start = Position::at("bin.000003", 4);
    let mut store = SchemaStore::from_schema(registry(&storage), 1, sample_schema(), &start)
        .await
        .unwrap();

    let statements = [
        "CREATE TABLE s1.orders (id bigint unsigned NOT NULL AUTO_INCREMENT, total decimal(10,2), PRIMARY KEY (id))",
        "ALTER TABLE t ADD COLUMN created_at datetime FIRST",
        "CREATE DATABASE s2 DEFAULT CHARACTER SET latin1",
        "ALTER TABLE s1.orders DROP COLUMN total",
    ];
    for (i, sql) in statements.iter().enumerate() {
        let position = Position::at("bin.000003", 100 * (i as u64 + 1));
        store.process_sql(sql, Some("s1"), &position).await.unwrap();
    }
    let expected = store.schema().clone();

    let restored = registry(&storage)
        .restore(1, &Position::at("bin.000003", 400))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(restored.saved.schema_id, store.schema_id());
    assert!(
        restored.saved.schema.equals(&expected),
        "{:?}",
        restored.saved.schema.diff(&expected, "restored", "live")
    );

    // 중간 지점으로 복원하면 그 시점의 스키마
    let earlier = registry(&storage)
        .restore(1, &Position::at("bin.000003", 250))
        .await
        .unwrap()
        .unwrap();
    let t = earlier.saved.schema.find_table("s1", "t").unwrap();
    assert_eq!(t.column_names(), vec!["created_at", "id", "name"]);
    assert!(!earlier.saved.schema.has_database("s2"));
}

#[tokio::test]
async fn test_idempotent_save() {
    let storage = Arc::new(MemoryStorage::new());
    let registry = registry(&storage);
    let position = Position::at("bin.000001", 1000).with_heartbeat(55);

    let first = registry
        .save(&SavedSchema::full(sample_schema(), position.clone(), 1), true)
        .await
        .unwrap();
    let second = registry
        .save(&SavedSchema::full(sample_schema(), position.clone(), 1), true)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(storage.schema_count(), 1);

    // 서버 id가 다르면 다른 스냅샷
    let other = registry
        .save(&SavedSchema::full(sample_schema(), position, 2), true)
        .await
        .unwrap();
    assert_ne!(first, other);
}

#[tokio::test]
async fn test_compaction_matches_delta_chain() {
    let storage = Arc::new(MemoryStorage::new());
    let mut store = SchemaStore::from_schema(registry(&storage), 1, sample_schema(), &Position::at("bin.000001", 4))
        .await
        .unwrap();
    for (offset, sql) in [
        (100, "ALTER TABLE t ADD COLUMN email varchar(255) CHARACTER SET latin1"),
        (200, "ALTER TABLE t MODIFY COLUMN name varchar(64) NOT NULL"),
        (300, "CREATE TABLE audit LIKE t"),
        (400, "RENAME TABLE audit TO audit_log"),
    ] {
        store
            .process_sql(sql, Some("s1"), &Position::at("bin.000001", offset))
            .await
            .unwrap();
    }
    let via_deltas = store.schema().clone();
    assert_eq!(storage.full_schema_ids().len(), 1);

    storage
        .set_position(1, "maxwell", &Position::at("bin.000001", 900))
        .await
        .unwrap();
    let compactor = SchemaCompactor::new(storage.clone(), storage.clone(), CaseSensitivity::CaseSensitive, 1, 3);
    assert!(compactor.compact().await.unwrap());
    assert_eq!(compactor.scavenge().await.unwrap(), 4);

    let restored = registry(&storage)
        .restore(1, &Position::at("bin.000001", 900))
        .await
        .unwrap()
        .unwrap();
    assert!(restored.saved.schema.equals(&via_deltas));
    assert_eq!(restored.saved.base_schema_id, None);
    assert_eq!(storage.schema_records(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_ddl_is_fatal() {
    let storage = Arc::new(MemoryStorage::new());
    let mut store = SchemaStore::from_schema(registry(&storage), 1, sample_schema(), &Position::at("bin.000001", 4))
        .await
        .unwrap();

    let err = store
        .process_sql("ALTER TABLE missing ADD COLUMN x int", Some("s1"), &Position::at("bin.000001", 10))
        .await
        .unwrap_err();
    assert!(matches!(err, CdcError::InvalidSchema(_)));
    assert!(err.is_fatal());

    let err = store
        .process_sql("ALTER TABLE t ADD COLUMN (", Some("s1"), &Position::at("bin.000001", 20))
        .await
        .unwrap_err();
    assert!(matches!(err, CdcError::ParseError { .. }));
    assert_eq!(storage.schema_count(), 1);
}

#[tokio::test]
async fn test_concurrent_save_rereads_existing() {
    let storage = Arc::new(MemoryStorage::new());
    let position = Position::at("bin.000002", 300);
    let first = registry(&storage)
        .save(&SavedSchema::full(sample_schema(), position.clone(), 1), true)
        .await
        .unwrap();

    let late = Arc::new(LateWriterStorage {
        inner: storage.clone(),
        misses: AtomicUsize::new(1),
    });
    let second = SchemaRegistry::new(late.clone(), CaseSensitivity::CaseSensitive)
        .save(&SavedSchema::full(sample_schema(), position, 1), true)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(late.misses.load(Ordering::SeqCst), 0);
    assert_eq!(storage.schema_count(), 1);
}

#[tokio::test]
async fn test_restore_by_gtid_containment() {
    let storage = Arc::new(MemoryStorage::new());
    let mut store = SchemaStore::from_schema(registry(&storage), 1, sample_schema(), &gtid_position(4, 5))
        .await
        .unwrap();
    store
        .process_sql("ALTER TABLE t ADD COLUMN age INT", Some("s1"), &gtid_position(900, 7))
        .await
        .unwrap();

    let registry = registry(&storage);
    let has_age = |restored: &mysql_cdc::schema_store::RestoredSchema| {
        restored.saved.schema.find_table("s1", "t").unwrap().has_column("age")
    };

    // 1-6은 DDL 트랜잭션(7)을 포함하지 않는다. 오프셋은 보지 않는다
    let restored = registry.restore(1, &gtid_position(2000, 6)).await.unwrap().unwrap();
    assert!(!has_age(&restored));

    let restored = registry.restore(1, &gtid_position(10, 7)).await.unwrap().unwrap();
    assert!(has_age(&restored));
    assert_eq!(restored.saved.schema_id, store.schema_id());

    let restored = registry.restore(1, &gtid_position(10, 20)).await.unwrap().unwrap();
    assert!(has_age(&restored));

    let other_server = GtidSet::parse("9b1e5f6a-0000-11e1-9e33-c80aa9429562:1-100").unwrap();
    let target = Position::new(BinlogPosition::new("bin.000001", 10).with_gtid_set(other_server), 0);
    assert!(registry.restore(1, &target).await.unwrap().is_none());
}
