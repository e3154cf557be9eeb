#![allow(dead_code)]

use mysql_cdc::config::CdcConfig;
use mysql_cdc::schema::{CaseSensitivity, ColumnDef, Database, Schema, Table};
use mysql_cdc::schema_store::SchemaRegistry;
use mysql_cdc::storage::MemoryStorage;
use std::sync::Arc;
use std::time::Duration;

pub const CLIENT_ID: &str = "maxwell";

/// s1.t(id, name)
pub fn sample_schema() -> Schema {
    let mut schema = Schema::new("utf8mb4", CaseSensitivity::CaseSensitive);
    let mut db = Database::new("s1", "utf8mb4");
    db.add_table(Table::new(
        "s1",
        "t",
        Some("utf8mb4".into()),
        vec![
            ColumnDef::build("id", "int", 0, None, true, None, None).unwrap(),
            ColumnDef::build("name", "varchar", 1, Some("utf8mb4".into()), true, None, None).unwrap(),
        ],
        vec!["id".into()],
    ));
    schema.add_database(db);
    schema
}

pub fn registry(storage: &Arc<MemoryStorage>) -> SchemaRegistry {
    SchemaRegistry::new(storage.clone(), CaseSensitivity::CaseSensitive)
}

/// 테스트용 짧은 주기 설정
pub fn test_config() -> CdcConfig {
    CdcConfig {
        position_flush_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(50),
        bootstrap_progress_interval: Duration::from_millis(10),
        bootstrap_poll_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(1),
        ..CdcConfig::default()
    }
}
