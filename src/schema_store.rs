//! 스키마 버전 저장과 복원
//!
//! DDL이 적용될 때마다 스키마 스냅샷을 저장한다. 대부분의 스냅샷은 이전 스냅샷
//! (`base_schema_id`)에 대한 델타(해석된 변경 목록)이고, 최초 캡처/복구/버전 보정
//! 직후에만 전체 스냅샷을 쓴다. 스냅샷은 `(server_id, position)` 지문으로 식별되며,
//! 같은 지문을 두 프로세스가 동시에 저장하면 유일성 제약으로 한 번만 남는다.

use crate::ddl::{self, ResolvedSchemaChange};
use crate::error::{CdcError, Result};
use crate::offset::{compare_files, Position};
use crate::schema::{CaseSensitivity, ColumnKind, Schema, SchemaCapture, Table};
use crate::storage::{InsertOutcome, SchemaRecord, SchemaStorage};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// 현재 저장 포맷 버전.
///
/// - 1: unsigned 정수 컬럼 캡처 수정, `mysql` 데이터베이스 포함
/// - 2: 컬럼명 대소문자 보존
/// - 3: datetime/time 소수 자릿수 저장
/// - 4: enum 값을 JSON 배열로 저장
pub const SCHEMA_STORE_VERSION: u32 = 4;

const FIX_UNSIGNED_BEFORE: u32 = 1;
const FIX_COLUMN_CASE_BEFORE: u32 = 2;
const FIX_COLUMN_LENGTH_BEFORE: u32 = 3;

/// 저장되었거나 저장될 스키마 한 버전
#[derive(Debug, Clone)]
pub struct SavedSchema {
    pub schema: Schema,
    pub position: Position,
    pub server_id: u64,
    /// 저장된 뒤에 채워진다
    pub schema_id: Option<u64>,
    /// 델타로 저장할 때의 기준 스냅샷
    pub base_schema_id: Option<u64>,
    pub deltas: Vec<ResolvedSchemaChange>,
    pub version: u32,
}

impl SavedSchema {
    /// 전체 스냅샷으로 저장될 스키마
    pub fn full(schema: Schema, position: Position, server_id: u64) -> Self {
        SavedSchema {
            schema,
            position,
            server_id,
            schema_id: None,
            base_schema_id: None,
            deltas: Vec::new(),
            version: SCHEMA_STORE_VERSION,
        }
    }

    /// `base`에 `deltas`를 적용한 결과로 저장될 스키마
    pub fn delta(
        schema: Schema,
        position: Position,
        server_id: u64,
        base_schema_id: u64,
        deltas: Vec<ResolvedSchemaChange>,
    ) -> Self {
        SavedSchema {
            schema,
            position,
            server_id,
            schema_id: None,
            base_schema_id: Some(base_schema_id),
            deltas,
            version: SCHEMA_STORE_VERSION,
        }
    }

    pub fn position_sha(&self) -> String {
        self.position.sha(self.server_id)
    }
}

/// 복원 결과. `should_snapshot_next`가 true면 다음 저장은 전체 스냅샷이어야 한다
#[derive(Debug, Clone)]
pub struct RestoredSchema {
    pub saved: SavedSchema,
    pub should_snapshot_next: bool,
}

pub struct SchemaRegistry {
    storage: Arc<dyn SchemaStorage>,
    sensitivity: CaseSensitivity,
    /// 버전 보정 시 현재 스키마를 다시 읽어 올 때 사용
    capture: Option<Arc<dyn SchemaCapture>>,
}

impl SchemaRegistry {
    pub fn new(storage: Arc<dyn SchemaStorage>, sensitivity: CaseSensitivity) -> Self {
        SchemaRegistry {
            storage,
            sensitivity,
            capture: None,
        }
    }

    pub fn with_capture(mut self, capture: Arc<dyn SchemaCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn storage(&self) -> &Arc<dyn SchemaStorage> {
        &self.storage
    }

    pub fn sensitivity(&self) -> CaseSensitivity {
        self.sensitivity
    }

    /// 스냅샷 저장. 같은 지문이 이미 있으면 그 id를 돌려준다.
    ///
    /// `force_full`이거나 기준 스냅샷이 없으면 전체 스냅샷으로 저장한다.
    pub async fn save(&self, saved: &SavedSchema, force_full: bool) -> Result<u64> {
        let sha = saved.position_sha();
        if let Some(id) = self.storage.find_schema_by_sha(&sha).await? {
            debug!("Schema @{} already stored as #{}", saved.position, id);
            return Ok(id);
        }

        let full = force_full || saved.base_schema_id.is_none();
        let record = SchemaRecord {
            id: 0,
            server_id: saved.server_id,
            position: saved.position.clone(),
            base_schema_id: if full { None } else { saved.base_schema_id },
            deltas: if full {
                None
            } else {
                Some(serde_json::to_string(&saved.deltas)?)
            },
            version: SCHEMA_STORE_VERSION,
            position_sha: sha.clone(),
            charset: saved.schema.charset.clone(),
            deleted: false,
        };

        let outcome = self
            .storage
            .insert_schema(&record, full.then_some(&saved.schema))
            .await?;
        match outcome {
            InsertOutcome::Inserted(id) => {
                if full {
                    info!("Stored full schema snapshot #{} @{}", id, saved.position);
                }
                Ok(id)
            }
            InsertOutcome::Duplicate => {
                // 다른 프로세스가 같은 지점을 먼저 저장함
                warn!(
                    "Schema @{} was stored concurrently, re-reading existing snapshot",
                    saved.position
                );
                self.storage.find_schema_by_sha(&sha).await?.ok_or_else(|| {
                    CdcError::SchemaStoreError(format!(
                        "duplicate schema sha {} but no snapshot found",
                        sha
                    ))
                })
            }
        }
    }

    /// `target` 시점에 유효한 스냅샷 선택
    pub async fn find_restorable(&self, server_id: u64, target: &Position) -> Result<Option<SchemaRecord>> {
        let records = self.storage.schema_records(server_id).await?;

        if let Some(target_gtid) = &target.binlog.gtid_set {
            // 가장 최근에 저장된 것부터, GTID 집합이 target에 포함되는 첫 스냅샷
            let found = records.into_iter().rev().find(|r| {
                r.position
                    .binlog
                    .gtid_set
                    .as_ref()
                    .is_some_and(|g| g.is_contained_within(target_gtid))
            });
            return Ok(found);
        }

        let best = records
            .into_iter()
            .filter(|r| r.position.last_heartbeat_read <= target.last_heartbeat_read)
            .filter(|r| {
                let file_order = compare_files(&r.position.binlog.file, &target.binlog.file);
                match file_order {
                    Ordering::Less => true,
                    // DDL 스냅샷은 그 DDL의 위치에 저장되므로 같은 위치면 이미 적용된 것
                    Ordering::Equal => r.position.binlog.offset <= target.binlog.offset,
                    Ordering::Greater => false,
                }
            })
            .max_by(|a, b| {
                a.position
                    .last_heartbeat_read
                    .cmp(&b.position.last_heartbeat_read)
                    .then_with(|| a.position.binlog.cmp_coordinates(&b.position.binlog))
            });
        Ok(best)
    }

    /// 스냅샷 id를 스키마로 해석한다: 전체 스냅샷까지 거슬러 올라간 뒤 델타를 순서대로 적용.
    /// 체인에서 가장 오래된 포맷 버전도 같이 돌려준다.
    pub async fn resolve(&self, schema_id: u64) -> Result<(Schema, u32)> {
        let mut chain = Vec::new();
        let mut next = Some(schema_id);

        while let Some(id) = next {
            let record = self.storage.schema_record(id).await?.ok_or_else(|| {
                CdcError::SchemaStoreError(format!("schema #{} referenced but missing", id))
            })?;
            if chain.iter().any(|r: &SchemaRecord| r.id == record.id) {
                return Err(CdcError::SchemaStoreError(format!(
                    "schema #{} has a cyclic delta chain",
                    schema_id
                )));
            }
            next = record.base_schema_id;
            chain.push(record);
        }

        let version = chain.iter().map(|r| r.version).min().unwrap_or(SCHEMA_STORE_VERSION);
        let Some(base) = chain.pop() else {
            return Err(CdcError::SchemaStoreError(format!("schema #{} not found", schema_id)));
        };

        let mut schema = self.storage.load_full_schema(base.id, self.sensitivity).await?;
        if chain.is_empty() {
            return Ok((schema, version));
        }

        info!("beginning to play deltas...");
        let started = Instant::now();
        let mut count = 0;
        for record in chain.iter().rev() {
            let changes: Vec<ResolvedSchemaChange> = match &record.deltas {
                Some(json) => serde_json::from_str(json)?,
                None => Vec::new(),
            };
            schema = ddl::apply_all(&schema, &changes)?;
            count += 1;
        }
        info!(
            "played {} deltas in {}ms",
            count,
            started.elapsed().as_millis()
        );
        Ok((schema, version))
    }

    /// `target` 시점의 스키마를 복원한다. 저장된 스냅샷이 없으면 None
    pub async fn restore(&self, server_id: u64, target: &Position) -> Result<Option<RestoredSchema>> {
        let Some(record) = self.find_restorable(server_id, target).await? else {
            info!("No stored schema for server {} before {}", server_id, target);
            return Ok(None);
        };

        info!("Restoring schema #{} @{}", record.id, record.position);
        let (mut schema, version) = self.resolve(record.id).await?;
        let mut should_snapshot_next = false;

        if version < FIX_COLUMN_LENGTH_BEFORE {
            should_snapshot_next = self.upgrade(&mut schema, version).await?;
        }

        Ok(Some(RestoredSchema {
            saved: SavedSchema {
                schema,
                position: record.position.clone(),
                server_id: record.server_id,
                schema_id: Some(record.id),
                base_schema_id: record.base_schema_id,
                deltas: Vec::new(),
                version,
            },
            should_snapshot_next,
        }))
    }

    /// 옛 포맷으로 저장된 스키마 보정. 고친 게 있으면 true
    async fn upgrade(&self, schema: &mut Schema, version: u32) -> Result<bool> {
        let Some(capture) = &self.capture else {
            warn!(
                "Schema format version {} is outdated but no live capture is available, skipping fixes",
                version
            );
            return Ok(false);
        };

        info!("Upgrading schema from format version {}", version);
        let recaptured = capture.capture().await?;
        let mut changed = false;

        if version < FIX_UNSIGNED_BEFORE {
            changed |= add_missing_mysql_database(schema, &recaptured);
            changed |= fix_unsigned_columns(schema, &recaptured);
        }
        if version < FIX_COLUMN_CASE_BEFORE {
            changed |= fix_column_cases(schema, &recaptured);
        }
        if version < FIX_COLUMN_LENGTH_BEFORE {
            changed |= fix_column_lengths(schema, &recaptured);
        }
        Ok(changed)
    }
}

/// 양쪽에 있는 테이블마다 `fix` 호출
fn fix_tables<F>(schema: &mut Schema, recaptured: &Schema, mut fix: F) -> bool
where
    F: FnMut(&mut Table, &Table) -> bool,
{
    let sensitivity = schema.sensitivity;
    let mut changed = false;

    for db in schema.databases.iter_mut() {
        let Some(captured_db) = recaptured.find_database(&db.name) else {
            continue;
        };
        let db = Arc::make_mut(db);
        for table in db.tables.iter_mut() {
            let Some(captured_table) = captured_db.find_table(&table.name, sensitivity) else {
                continue;
            };
            changed |= fix(Arc::make_mut(table), captured_table);
        }
    }
    changed
}

fn add_missing_mysql_database(schema: &mut Schema, recaptured: &Schema) -> bool {
    if schema.has_database("mysql") {
        return false;
    }
    match recaptured.find_database("mysql") {
        Some(mysql) => {
            info!("Could not find mysql db, adding it to schema");
            schema.add_database((**mysql).clone());
            true
        }
        None => false,
    }
}

fn fix_unsigned_columns(schema: &mut Schema, recaptured: &Schema) -> bool {
    fix_tables(schema, recaptured, |table, captured| {
        let full_name = table.full_name();
        let mut changed = false;
        for column in table.columns.iter_mut() {
            let Some(captured_column) = captured.find_column(&column.name) else {
                continue;
            };
            let integer = matches!(column.kind, ColumnKind::Int { .. } | ColumnKind::BigInt { .. });
            if integer && column.is_signed() && !captured_column.is_signed() {
                info!("fixing unsigned column {}.{}", full_name, column.name);
                column.set_signed(false);
                changed = true;
            }
        }
        changed
    })
}

fn fix_column_cases(schema: &mut Schema, recaptured: &Schema) -> bool {
    fix_tables(schema, recaptured, |table, captured| {
        let mut renames = Vec::new();
        for column in table.columns.iter_mut() {
            let Some(captured_column) = captured.find_column(&column.name) else {
                continue;
            };
            if column.name != captured_column.name {
                info!(
                    "correcting column case of `{}` to `{}` in {}",
                    column.name,
                    captured_column.name,
                    captured.full_name()
                );
                renames.push((column.name.clone(), captured_column.name.clone()));
                column.name = captured_column.name.clone();
            }
        }
        for (old, new) in &renames {
            table.rename_pk_column(old, new);
        }
        !renames.is_empty()
    })
}

fn fix_column_lengths(schema: &mut Schema, recaptured: &Schema) -> bool {
    fix_tables(schema, recaptured, |table, captured| {
        let full_name = table.full_name();
        let mut changed = false;
        for column in table.columns.iter_mut() {
            let Some(captured_column) = captured.find_column(&column.name) else {
                continue;
            };
            if captured_column.length().is_some() && column.length() != captured_column.length() {
                info!(
                    "correcting column length of {}.{} to {:?}",
                    full_name,
                    column.name,
                    captured_column.length()
                );
                column.set_length(captured_column.length());
                changed = true;
            }
        }
        changed
    })
}

/// 실행 중 유효한 스키마의 소유자.
///
/// 복제 스트림 순서대로만 호출된다. DDL이 스키마를 바꾸면 바로 델타 스냅샷을 저장한다.
pub struct SchemaStore {
    registry: SchemaRegistry,
    server_id: u64,
    schema: Schema,
    schema_id: Option<u64>,
    should_snapshot_next: bool,
}

impl SchemaStore {
    /// 복원 가능한 스냅샷이 있으면 복원하고, 없으면 라이브 캡처 후 전체 스냅샷 저장
    pub async fn initialize(
        registry: SchemaRegistry,
        server_id: u64,
        position: &Position,
    ) -> Result<Self> {
        if let Some(restored) = registry.restore(server_id, position).await? {
            return Ok(SchemaStore {
                server_id,
                schema_id: restored.saved.schema_id,
                schema: restored.saved.schema,
                should_snapshot_next: restored.should_snapshot_next,
                registry,
            });
        }

        let capture = registry.capture.clone().ok_or_else(|| {
            CdcError::SchemaStoreError("no stored schema and no live capture configured".to_string())
        })?;
        info!("Capturing initial schema @{}", position);
        let schema = capture.capture().await?;
        Self::from_schema(registry, server_id, schema, position).await
    }

    /// 주어진 스키마를 전체 스냅샷으로 저장하고 시작한다 (복구 직후 등)
    pub async fn from_schema(
        registry: SchemaRegistry,
        server_id: u64,
        schema: Schema,
        position: &Position,
    ) -> Result<Self> {
        let saved = SavedSchema::full(schema, position.clone(), server_id);
        let id = registry.save(&saved, true).await?;
        Ok(SchemaStore {
            registry,
            server_id,
            schema: saved.schema,
            schema_id: Some(id),
            should_snapshot_next: false,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn schema_id(&self) -> Option<u64> {
        self.schema_id
    }

    pub fn server_id(&self) -> u64 {
        self.server_id
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn find_table(&self, database: &str, table: &str) -> Option<&Arc<Table>> {
        self.schema.find_table(database, table)
    }

    /// DDL 한 문장을 적용한다. 스키마가 바뀌면 새 버전을 저장하고 해석된 변경을 돌려준다
    pub async fn process_sql(
        &mut self,
        sql: &str,
        current_database: Option<&str>,
        position: &Position,
    ) -> Result<Vec<ResolvedSchemaChange>> {
        let (next, resolved) = ddl::resolve_and_apply(sql, current_database, &self.schema)?;
        if resolved.is_empty() {
            return Ok(resolved);
        }

        info!("storing schema @{} after applying \"{}\"", position, sql.replace('\n', " "));
        self.store(next, resolved.clone(), position).await?;
        Ok(resolved)
    }

    /// 이미 해석된 변경 적용 (테스트, 외부 도구용)
    pub async fn apply_changes(
        &mut self,
        changes: Vec<ResolvedSchemaChange>,
        position: &Position,
    ) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let next = ddl::apply_all(&self.schema, &changes)?;
        self.store(next, changes, position).await
    }

    async fn store(
        &mut self,
        schema: Schema,
        changes: Vec<ResolvedSchemaChange>,
        position: &Position,
    ) -> Result<()> {
        let saved = match self.schema_id {
            Some(base) => SavedSchema::delta(schema, position.clone(), self.server_id, base, changes),
            None => SavedSchema::full(schema, position.clone(), self.server_id),
        };
        let id = self.registry.save(&saved, self.should_snapshot_next).await?;
        self.should_snapshot_next = false;
        self.schema = saved.schema;
        self.schema_id = Some(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, Database};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;

    struct FixedCapture(Schema);

    #[async_trait]
    impl SchemaCapture for FixedCapture {
        async fn capture(&self) -> Result<Schema> {
            Ok(self.0.clone())
        }
    }

    fn shop(id_signed: bool, name_col: &str, ts_length: Option<u64>) -> Schema {
        let mut schema = Schema::new("utf8mb4", CaseSensitivity::CaseSensitive);
        let mut db = Database::new("shop", "utf8mb4");
        db.add_table(Table::new(
            "shop",
            "orders",
            Some("utf8mb4".into()),
            vec![
                ColumnDef::build("id", "int", 0, None, id_signed, None, None).unwrap(),
                ColumnDef::build(name_col, "varchar", 1, Some("utf8mb4".into()), true, None, None).unwrap(),
                ColumnDef::build("created", "datetime", 2, None, true, None, ts_length).unwrap(),
            ],
            vec!["id".into(), name_col.to_string()],
        ));
        schema.add_database(db);
        schema
    }

    fn registry(storage: Arc<MemoryStorage>) -> SchemaRegistry {
        SchemaRegistry::new(storage, CaseSensitivity::CaseSensitive)
    }

    #[tokio::test]
    async fn test_restore_picks_newest_before_target() {
        let storage = Arc::new(MemoryStorage::new());
        let mut store = SchemaStore::from_schema(registry(storage.clone()), 1, shop(true, "name", None), &Position::at("bin.000001", 4))
            .await
            .unwrap();
        store
            .process_sql("ALTER TABLE orders ADD COLUMN note text", Some("shop"), &Position::at("bin.000001", 500))
            .await
            .unwrap();
        store
            .process_sql("ALTER TABLE orders DROP COLUMN note", Some("shop"), &Position::at("bin.000002", 100))
            .await
            .unwrap();

        let registry = registry(storage);
        let restored = registry
            .restore(1, &Position::at("bin.000001", 900))
            .await
            .unwrap()
            .unwrap();
        let orders = restored.saved.schema.find_table("shop", "orders").unwrap().clone();
        assert!(orders.has_column("note"));
        assert!(!restored.should_snapshot_next);

        // DDL 위치 그대로 복원하면 그 DDL까지 반영된 스키마
        let restored = registry
            .restore(1, &Position::at("bin.000001", 500))
            .await
            .unwrap()
            .unwrap();
        assert!(restored.saved.schema.find_table("shop", "orders").unwrap().has_column("note"));

        let restored = registry
            .restore(1, &Position::at("bin.000001", 499))
            .await
            .unwrap()
            .unwrap();
        assert!(!restored.saved.schema.find_table("shop", "orders").unwrap().has_column("note"));

        assert!(registry.restore(2, &Position::at("bin.000003", 4)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upgrade_fixes_old_snapshot() {
        let storage = Arc::new(MemoryStorage::new());
        let old = shop(true, "NAME", None);
        let mut record_schema = old.clone();
        // datetime 길이가 없던 시절의 스냅샷
        fix_tables(&mut record_schema, &old, |table, _| {
            table.columns[2].set_length(None);
            true
        });
        let position = Position::at("bin.000001", 4);
        let record = SchemaRecord {
            id: 0,
            server_id: 1,
            position: position.clone(),
            base_schema_id: None,
            deltas: None,
            version: 0,
            position_sha: position.sha(1),
            charset: "utf8mb4".into(),
            deleted: false,
        };
        storage.insert_schema(&record, Some(&record_schema)).await.unwrap();

        let live = shop(false, "name", Some(3));
        let registry = registry(storage.clone()).with_capture(Arc::new(FixedCapture(live.clone())));
        let restored = registry
            .restore(1, &Position::at("bin.000001", 100))
            .await
            .unwrap()
            .unwrap();

        assert!(restored.should_snapshot_next);
        let orders = restored.saved.schema.find_table("shop", "orders").unwrap().clone();
        assert!(!orders.columns[0].is_signed());
        assert_eq!(orders.columns[1].name, "name");
        assert_eq!(orders.pk, vec!["id".to_string(), "name".to_string()]);
        assert_eq!(orders.columns[2].length(), Some(3));

        // 보정 후 첫 저장은 전체 스냅샷
        let mut store = SchemaStore::initialize(registry, 1, &Position::at("bin.000001", 100))
            .await
            .unwrap();
        store
            .process_sql("ALTER TABLE orders ADD COLUMN x int", Some("shop"), &Position::at("bin.000001", 200))
            .await
            .unwrap();
        let id = store.schema_id().unwrap();
        assert!(storage.schema_record(id).await.unwrap().unwrap().is_full());
    }

    #[tokio::test]
    async fn test_non_schema_statement_stores_nothing() {
        let storage = Arc::new(MemoryStorage::new());
        let mut store = SchemaStore::from_schema(registry(storage.clone()), 1, shop(true, "name", None), &Position::at("bin.000001", 4))
            .await
            .unwrap();
        let resolved = store
            .process_sql("GRANT ALL ON *.* TO 'x'", None, &Position::at("bin.000001", 50))
            .await
            .unwrap();
        assert!(resolved.is_empty());
        assert_eq!(storage.schema_count(), 1);
    }
}
