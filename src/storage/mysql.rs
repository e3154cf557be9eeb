//! MySQL 스키마 데이터베이스 저장소

use super::{
    scan_query, BootstrapStorage, InsertOutcome, PositionRecord, PositionStorage, SchemaRecord,
    SchemaStorage, TableScanner,
};
use crate::bootstrap::task::BootstrapTask;
use crate::connection::{quote_ident, MySqlConnection};
use crate::error::{CdcError, Result};
use crate::gtid::GtidSet;
use crate::offset::{BinlogPosition, Position};
use crate::schema::{CaseSensitivity, ColumnDef, Database, Schema, Table};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mysql_async::prelude::*;
use mysql_async::{params, Conn, Row, Transaction, TxOpts, Value};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

const ER_DUP_ENTRY: u16 = 1062;

const TASK_COLUMNS: &str = "id, database_name, table_name, where_clause, client_id, is_complete, \
    inserted_rows, total_rows, binlog_file, binlog_position, comment, \
    UNIX_TIMESTAMP(created_at) AS created_at, UNIX_TIMESTAMP(started_at) AS started_at, \
    UNIX_TIMESTAMP(completed_at) AS completed_at";

const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS `schemas` (
        id INT UNSIGNED AUTO_INCREMENT NOT NULL PRIMARY KEY,
        binlog_file VARCHAR(255),
        binlog_position INT UNSIGNED,
        last_heartbeat_read BIGINT NULL DEFAULT 0,
        gtid_set VARCHAR(4096),
        base_schema_id INT UNSIGNED NULL DEFAULT NULL,
        deltas MEDIUMTEXT CHARSET 'utf8mb4' NULL DEFAULT NULL,
        server_id INT UNSIGNED,
        position_sha CHAR(40) CHARSET 'latin1' DEFAULT NULL,
        charset VARCHAR(255),
        version SMALLINT UNSIGNED NOT NULL DEFAULT 0,
        deleted TINYINT(1) NOT NULL DEFAULT 0,
        UNIQUE KEY (position_sha)
    )",
    "CREATE TABLE IF NOT EXISTS `databases` (
        id INT UNSIGNED AUTO_INCREMENT NOT NULL PRIMARY KEY,
        schema_id INT UNSIGNED,
        name VARCHAR(255) CHARSET 'utf8mb4',
        charset VARCHAR(255),
        INDEX (schema_id)
    )",
    "CREATE TABLE IF NOT EXISTS `tables` (
        id INT UNSIGNED AUTO_INCREMENT NOT NULL PRIMARY KEY,
        schema_id INT UNSIGNED,
        database_id INT UNSIGNED,
        name VARCHAR(255) CHARSET 'utf8mb4',
        charset VARCHAR(255),
        pk VARCHAR(1024) CHARSET 'utf8mb4',
        INDEX (schema_id),
        INDEX (database_id)
    )",
    "CREATE TABLE IF NOT EXISTS `columns` (
        id INT UNSIGNED AUTO_INCREMENT NOT NULL PRIMARY KEY,
        schema_id INT UNSIGNED,
        table_id INT UNSIGNED,
        name VARCHAR(255) CHARSET 'utf8mb4',
        charset VARCHAR(255),
        coltype VARCHAR(255),
        is_signed TINYINT(1) UNSIGNED,
        enum_values TEXT CHARSET 'utf8mb4',
        column_length TINYINT UNSIGNED,
        INDEX (schema_id),
        INDEX (table_id)
    )",
    "CREATE TABLE IF NOT EXISTS `positions` (
        server_id INT UNSIGNED NOT NULL,
        binlog_file VARCHAR(255),
        binlog_position INT UNSIGNED,
        gtid_set VARCHAR(4096),
        client_id VARCHAR(255) CHARSET 'latin1' NOT NULL DEFAULT 'maxwell',
        last_heartbeat_read BIGINT NULL DEFAULT NULL,
        PRIMARY KEY (server_id, client_id)
    )",
    "CREATE TABLE IF NOT EXISTS `heartbeats` (
        server_id INT UNSIGNED NOT NULL,
        client_id VARCHAR(255) CHARSET 'latin1' NOT NULL DEFAULT 'maxwell',
        heartbeat BIGINT NOT NULL,
        PRIMARY KEY (server_id, client_id)
    )",
    "CREATE TABLE IF NOT EXISTS `bootstrap` (
        id INT UNSIGNED AUTO_INCREMENT NOT NULL PRIMARY KEY,
        database_name VARCHAR(255) CHARSET 'utf8mb4' NOT NULL,
        table_name VARCHAR(255) CHARSET 'utf8mb4' NOT NULL,
        where_clause TEXT,
        is_complete TINYINT(1) UNSIGNED NOT NULL DEFAULT 0,
        inserted_rows BIGINT UNSIGNED NOT NULL DEFAULT 0,
        total_rows BIGINT UNSIGNED NOT NULL DEFAULT 0,
        created_at DATETIME DEFAULT NULL,
        started_at DATETIME DEFAULT NULL,
        completed_at DATETIME DEFAULT NULL,
        binlog_file VARCHAR(255) DEFAULT NULL,
        binlog_position INT UNSIGNED DEFAULT 0,
        client_id VARCHAR(255) CHARSET 'latin1' NOT NULL DEFAULT 'maxwell',
        comment VARCHAR(255) CHARSET 'utf8mb4' DEFAULT NULL
    )",
];

/// 스키마 데이터베이스(`maxwell`)에 대한 저장소.
///
/// `store`는 상태 저장용 커넥션, `replica`는 부트스트랩 스캔 대상 서버 커넥션이다.
/// 둘이 같은 서버면 같은 풀을 넘겨도 된다.
pub struct MysqlStorage {
    store: MySqlConnection,
    replica: MySqlConnection,
    schema_database: String,
}

impl MysqlStorage {
    pub fn new(store: MySqlConnection, replica: MySqlConnection, schema_database: impl Into<String>) -> Self {
        MysqlStorage {
            store,
            replica,
            schema_database: schema_database.into(),
        }
    }

    pub fn schema_database(&self) -> &str {
        &self.schema_database
    }

    /// 스키마 데이터베이스와 테이블이 없으면 만든다
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut conn = self.store.get_conn().await?;
        conn.query_drop(format!(
            "CREATE DATABASE IF NOT EXISTS {}",
            quote_ident(&self.schema_database)
        ))
        .await
        .map_err(|e| CdcError::QueryError(format!("Failed to create schema database: {}", e)))?;

        conn.query_drop(format!("USE {}", quote_ident(&self.schema_database)))
            .await?;
        for ddl in CREATE_TABLES {
            conn.query_drop(*ddl).await?;
        }
        info!("Schema store ready in database {}", self.schema_database);
        Ok(())
    }

    async fn conn(&self) -> Result<Conn> {
        let mut conn = self.store.get_conn().await?;
        conn.query_drop(format!("USE {}", quote_ident(&self.schema_database)))
            .await?;
        Ok(conn)
    }

    pub async fn disconnect(self) -> Result<()> {
        self.store.disconnect().await?;
        self.replica.disconnect().await
    }

    async fn write_full_schema(conn: &mut Transaction<'_>, schema_id: u64, schema: &Schema) -> Result<()> {
        for db in &schema.databases {
            conn.exec_drop(
                "INSERT INTO `databases` SET schema_id = ?, name = ?, charset = ?",
                (schema_id, &db.name, &db.charset),
            )
            .await?;
            let database_id = inserted_id(conn.last_insert_id(), "databases")?;

            for table in &db.tables {
                conn.exec_drop(
                    "INSERT INTO `tables` SET schema_id = ?, database_id = ?, name = ?, charset = ?, pk = ?",
                    (schema_id, database_id, &table.name, &table.charset, table.pk.join(",")),
                )
                .await?;
                let table_id = inserted_id(conn.last_insert_id(), "tables")?;

                let rows: Vec<_> = table
                    .columns
                    .iter()
                    .map(|c| column_params(schema_id, table_id, c))
                    .collect::<Result<_>>()?;
                conn.exec_batch(
                    "INSERT INTO `columns` (schema_id, table_id, name, charset, coltype, is_signed, enum_values, column_length) \
                     VALUES (:schema_id, :table_id, :name, :charset, :coltype, :is_signed, :enum_values, :column_length)",
                    rows,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn delete_full_rows(conn: &mut Transaction<'_>, schema_id: u64) -> Result<()> {
        for table in ["columns", "tables", "databases"] {
            conn.exec_drop(format!("DELETE FROM `{}` WHERE schema_id = ?", table), (schema_id,))
                .await?;
        }
        Ok(())
    }
}

/// AUTO_INCREMENT 행을 넣은 직후의 id. 없으면 자식 행이 id 0에 붙으므로 에러
fn inserted_id(id: Option<u64>, table: &str) -> Result<u64> {
    match id {
        Some(id) if id > 0 => Ok(id),
        _ => Err(CdcError::SchemaStoreError(format!(
            "insert into `{}` returned no auto-increment id",
            table
        ))),
    }
}

fn column_params(schema_id: u64, table_id: u64, column: &ColumnDef) -> Result<mysql_async::Params> {
    let enum_values = match column.enum_values() {
        Some(values) => Some(serde_json::to_string(values)?),
        None => None,
    };
    Ok(params! {
        "schema_id" => schema_id,
        "table_id" => table_id,
        "name" => &column.name,
        "charset" => column.charset(),
        "coltype" => &column.col_type,
        "is_signed" => column.is_signed(),
        "enum_values" => enum_values,
        "column_length" => column.length(),
    })
}

fn schema_record_from_row(row: &Row) -> SchemaRecord {
    let gtid_set = row
        .get::<Option<String>, _>("gtid_set")
        .flatten()
        .filter(|s| !s.is_empty())
        .and_then(|s| GtidSet::parse(&s).ok());
    let mut binlog = BinlogPosition::new(
        row.get::<Option<String>, _>("binlog_file").flatten().unwrap_or_default(),
        row.get::<Option<u64>, _>("binlog_position").flatten().unwrap_or_default(),
    );
    binlog.gtid_set = gtid_set;

    SchemaRecord {
        id: row.get::<Option<u64>, _>("id").flatten().unwrap_or_default(),
        server_id: row.get::<Option<u64>, _>("server_id").flatten().unwrap_or_default(),
        position: Position::new(
            binlog,
            row.get::<Option<u64>, _>("last_heartbeat_read").flatten().unwrap_or_default(),
        ),
        base_schema_id: row.get::<Option<u64>, _>("base_schema_id").flatten(),
        deltas: row.get::<Option<String>, _>("deltas").flatten(),
        version: row.get::<Option<u32>, _>("version").flatten().unwrap_or_default(),
        position_sha: row.get::<Option<String>, _>("position_sha").flatten().unwrap_or_default(),
        charset: row.get::<Option<String>, _>("charset").flatten().unwrap_or_default(),
        deleted: row.get::<Option<bool>, _>("deleted").flatten().unwrap_or_default(),
    }
}

fn position_record_from_row(row: &Row) -> PositionRecord {
    let mut binlog = BinlogPosition::new(
        row.get::<Option<String>, _>("binlog_file").flatten().unwrap_or_default(),
        row.get::<Option<u64>, _>("binlog_position").flatten().unwrap_or_default(),
    );
    binlog.gtid_set = row
        .get::<Option<String>, _>("gtid_set")
        .flatten()
        .filter(|s| !s.is_empty())
        .and_then(|s| GtidSet::parse(&s).ok());

    PositionRecord {
        server_id: row.get::<Option<u64>, _>("server_id").flatten().unwrap_or_default(),
        client_id: row.get::<Option<String>, _>("client_id").flatten().unwrap_or_default(),
        binlog,
        last_heartbeat_read: row.get::<Option<u64>, _>("last_heartbeat_read").flatten(),
    }
}

/// `UNIX_TIMESTAMP(...)`로 읽은 컬럼
fn datetime(row: &Row, column: &str) -> Option<DateTime<Utc>> {
    row.get::<Option<i64>, _>(column)
        .flatten()
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
}

fn task_from_row(row: &Row) -> BootstrapTask {
    let binlog_file = row.get::<Option<String>, _>("binlog_file").flatten();
    let binlog_position = row.get::<Option<u64>, _>("binlog_position").flatten().unwrap_or_default();

    BootstrapTask {
        id: row.get::<Option<u64>, _>("id").flatten().unwrap_or_default(),
        database: row.get::<Option<String>, _>("database_name").flatten().unwrap_or_default(),
        table: row.get::<Option<String>, _>("table_name").flatten().unwrap_or_default(),
        where_clause: row.get::<Option<String>, _>("where_clause").flatten(),
        client_id: row.get::<Option<String>, _>("client_id").flatten().unwrap_or_default(),
        is_complete: row.get::<Option<bool>, _>("is_complete").flatten().unwrap_or_default(),
        inserted_rows: row.get::<Option<u64>, _>("inserted_rows").flatten().unwrap_or_default(),
        total_rows: row.get::<Option<u64>, _>("total_rows").flatten().unwrap_or_default(),
        start_position: binlog_file.map(|f| Position::at(f, binlog_position)),
        created_at: datetime(row, "created_at"),
        started_at: datetime(row, "started_at"),
        completed_at: datetime(row, "completed_at"),
        comment: row.get::<Option<String>, _>("comment").flatten(),
    }
}

fn gtid_string(position: &Position) -> Option<String> {
    position.binlog.gtid_set.as_ref().map(|g| g.to_string())
}

#[async_trait]
impl SchemaStorage for MysqlStorage {
    async fn find_schema_by_sha(&self, position_sha: &str) -> Result<Option<u64>> {
        let mut conn = self.conn().await?;
        let id: Option<u64> = conn
            .exec_first("SELECT id FROM `schemas` WHERE position_sha = ?", (position_sha,))
            .await?;
        Ok(id)
    }

    async fn insert_schema(&self, record: &SchemaRecord, full: Option<&Schema>) -> Result<InsertOutcome> {
        let mut conn = self.conn().await?;
        let mut tx = conn.start_transaction(TxOpts::default()).await?;

        let inserted = tx
            .exec_drop(
                "INSERT INTO `schemas` SET base_schema_id = :base_schema_id, deltas = :deltas, \
                 binlog_file = :binlog_file, binlog_position = :binlog_position, server_id = :server_id, \
                 charset = :charset, version = :version, position_sha = :position_sha, \
                 gtid_set = :gtid_set, last_heartbeat_read = :last_heartbeat_read",
                params! {
                    "base_schema_id" => record.base_schema_id,
                    "deltas" => &record.deltas,
                    "binlog_file" => &record.position.binlog.file,
                    "binlog_position" => record.position.binlog.offset,
                    "server_id" => record.server_id,
                    "charset" => &record.charset,
                    "version" => record.version,
                    "position_sha" => &record.position_sha,
                    "gtid_set" => gtid_string(&record.position),
                    "last_heartbeat_read" => record.position.last_heartbeat_read,
                },
            )
            .await;

        match inserted {
            Ok(()) => {}
            Err(mysql_async::Error::Server(e)) if e.code == ER_DUP_ENTRY => {
                debug!("Schema for sha {} already stored", record.position_sha);
                tx.rollback().await?;
                return Ok(InsertOutcome::Duplicate);
            }
            Err(e) => return Err(e.into()),
        }

        let id = inserted_id(tx.last_insert_id(), "schemas")?;
        if let Some(schema) = full {
            Self::write_full_schema(&mut tx, id, schema).await?;
        }
        tx.commit().await?;
        Ok(InsertOutcome::Inserted(id))
    }

    async fn schema_record(&self, id: u64) -> Result<Option<SchemaRecord>> {
        let mut conn = self.conn().await?;
        let row: Option<Row> = conn
            .exec_first("SELECT * FROM `schemas` WHERE id = ?", (id,))
            .await?;
        Ok(row.as_ref().map(schema_record_from_row))
    }

    async fn schema_records(&self, server_id: u64) -> Result<Vec<SchemaRecord>> {
        let mut conn = self.conn().await?;
        let rows: Vec<Row> = conn
            .exec(
                "SELECT * FROM `schemas` WHERE server_id = ? AND deleted = 0 ORDER BY id",
                (server_id,),
            )
            .await?;
        Ok(rows.iter().map(schema_record_from_row).collect())
    }

    async fn load_full_schema(&self, id: u64, sensitivity: CaseSensitivity) -> Result<Schema> {
        let mut conn = self.conn().await?;
        let charset: Option<Option<String>> = conn
            .exec_first("SELECT charset FROM `schemas` WHERE id = ?", (id,))
            .await?;
        let charset = charset
            .ok_or_else(|| CdcError::SchemaStoreError(format!("schema {} not found", id)))?
            .unwrap_or_default();

        let rows: Vec<Row> = conn
            .exec(
                "SELECT d.id AS db_id, d.name AS db_name, d.charset AS db_charset, \
                        t.id AS table_id, t.name AS table_name, t.charset AS table_charset, t.pk AS table_pk, \
                        c.name AS column_name, c.charset AS column_charset, c.coltype AS column_type, \
                        c.is_signed AS column_signed, c.enum_values AS column_enum_values, \
                        c.column_length AS column_length \
                 FROM `databases` d \
                 LEFT JOIN `tables` t ON d.id = t.database_id \
                 LEFT JOIN `columns` c ON c.table_id = t.id \
                 WHERE d.schema_id = ? \
                 ORDER BY d.id, t.id, c.id",
                (id,),
            )
            .await?;

        let mut databases: BTreeMap<u64, Database> = BTreeMap::new();
        let mut tables: BTreeMap<u64, (u64, Table)> = BTreeMap::new();

        for row in &rows {
            let db_id = row.get::<Option<u64>, _>("db_id").flatten().unwrap_or_default();
            databases.entry(db_id).or_insert_with(|| {
                Database::new(
                    row.get::<Option<String>, _>("db_name").flatten().unwrap_or_default(),
                    row.get::<Option<String>, _>("db_charset").flatten().unwrap_or_default(),
                )
            });

            let Some(table_id) = row.get::<Option<u64>, _>("table_id").flatten() else {
                continue;
            };
            let (_, table) = tables.entry(table_id).or_insert_with(|| {
                let pk = row
                    .get::<Option<String>, _>("table_pk")
                    .flatten()
                    .filter(|s| !s.is_empty())
                    .map(|s| s.split(',').map(str::to_string).collect())
                    .unwrap_or_default();
                let name: String = row.get::<Option<String>, _>("table_name").flatten().unwrap_or_default();
                let database = databases.get(&db_id).map(|d| d.name.clone()).unwrap_or_default();
                (
                    db_id,
                    Table::new(
                        database,
                        name,
                        row.get::<Option<String>, _>("table_charset").flatten(),
                        Vec::new(),
                        pk,
                    ),
                )
            });

            let Some(column_name) = row.get::<Option<String>, _>("column_name").flatten() else {
                continue;
            };
            let enum_values = row
                .get::<Option<String>, _>("column_enum_values")
                .flatten()
                .map(|s| parse_stored_enum_values(&s))
                .transpose()?;
            let column = ColumnDef::build(
                column_name,
                &row.get::<Option<String>, _>("column_type").flatten().unwrap_or_default(),
                table.columns.len(),
                row.get::<Option<String>, _>("column_charset").flatten(),
                row.get::<Option<bool>, _>("column_signed").flatten().unwrap_or(true),
                enum_values,
                row.get::<Option<u64>, _>("column_length").flatten(),
            )?;
            table.columns.push(column);
        }

        for (_, (db_id, table)) in tables {
            if let Some(db) = databases.get_mut(&db_id) {
                db.add_table(table);
            }
        }

        let mut schema = Schema::new(charset, sensitivity);
        for (_, db) in databases {
            schema.add_database(db);
        }
        Ok(schema)
    }

    async fn replace_with_full(&self, id: u64, schema: &Schema) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut tx = conn.start_transaction(TxOpts::default()).await?;
        Self::delete_full_rows(&mut tx, id).await?;
        Self::write_full_schema(&mut tx, id, schema).await?;
        tx.exec_drop(
            "UPDATE `schemas` SET base_schema_id = NULL, deltas = NULL WHERE id = ?",
            (id,),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn revert_to_delta(&self, id: u64, base_schema_id: u64, deltas: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut tx = conn.start_transaction(TxOpts::default()).await?;
        Self::delete_full_rows(&mut tx, id).await?;
        tx.exec_drop(
            "UPDATE `schemas` SET base_schema_id = ?, deltas = ? WHERE id = ?",
            (base_schema_id, deltas, id),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mark_deleted(&self, ids: &[u64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        conn.exec_batch(
            "UPDATE `schemas` SET deleted = 1 WHERE id = ?",
            ids.iter().map(|id| (*id,)),
        )
        .await?;
        Ok(())
    }

    async fn deleted_schema_ids(&self, limit: usize) -> Result<Vec<u64>> {
        let mut conn = self.conn().await?;
        let ids: Vec<u64> = conn
            .exec("SELECT id FROM `schemas` WHERE deleted = 1 ORDER BY id LIMIT ?", (limit as u64,))
            .await?;
        Ok(ids)
    }

    async fn purge_schema(&self, id: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut tx = conn.start_transaction(TxOpts::default()).await?;
        Self::delete_full_rows(&mut tx, id).await?;
        tx.exec_drop("DELETE FROM `schemas` WHERE id = ?", (id,)).await?;
        tx.commit().await?;
        Ok(())
    }
}

/// 버전 4부터는 JSON 배열, 그 이전은 쉼표 구분
fn parse_stored_enum_values(stored: &str) -> Result<Vec<String>> {
    if stored.trim_start().starts_with('[') {
        Ok(serde_json::from_str(stored)?)
    } else {
        Ok(stored.split(',').map(str::to_string).collect())
    }
}

#[async_trait]
impl PositionStorage for MysqlStorage {
    async fn set_position(&self, server_id: u64, client_id: &str, position: &Position) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.exec_drop(
            "INSERT INTO `positions` SET server_id = :server_id, client_id = :client_id, \
             binlog_file = :file, binlog_position = :offset, gtid_set = :gtid, \
             last_heartbeat_read = :heartbeat \
             ON DUPLICATE KEY UPDATE binlog_file = :file, binlog_position = :offset, \
             gtid_set = :gtid, last_heartbeat_read = :heartbeat",
            params! {
                "server_id" => server_id,
                "client_id" => client_id,
                "file" => &position.binlog.file,
                "offset" => position.binlog.offset,
                "gtid" => gtid_string(position),
                "heartbeat" => position.last_heartbeat_read,
            },
        )
        .await?;
        Ok(())
    }

    async fn get_position(&self, server_id: u64, client_id: &str) -> Result<Option<Position>> {
        let mut conn = self.conn().await?;
        let row: Option<Row> = conn
            .exec_first(
                "SELECT * FROM `positions` WHERE server_id = ? AND client_id = ?",
                (server_id, client_id),
            )
            .await?;
        Ok(row.as_ref().map(|r| position_record_from_row(r).position()))
    }

    async fn client_positions(&self, client_id: &str) -> Result<Vec<PositionRecord>> {
        let mut conn = self.conn().await?;
        let rows: Vec<Row> = conn
            .exec(
                "SELECT * FROM `positions` WHERE client_id = ? ORDER BY last_heartbeat_read DESC",
                (client_id,),
            )
            .await?;
        Ok(rows.iter().map(position_record_from_row).collect())
    }

    async fn server_positions(&self, server_id: u64) -> Result<Vec<PositionRecord>> {
        let mut conn = self.conn().await?;
        let rows: Vec<Row> = conn
            .exec("SELECT * FROM `positions` WHERE server_id = ?", (server_id,))
            .await?;
        Ok(rows.iter().map(position_record_from_row).collect())
    }

    async fn delete_other_positions(&self, client_id: &str, server_id: u64) -> Result<u64> {
        let mut conn = self.conn().await?;
        conn.exec_drop(
            "DELETE FROM `positions` WHERE server_id <> ? AND client_id = ?",
            (server_id, client_id),
        )
        .await?;
        Ok(conn.affected_rows())
    }

    async fn read_heartbeat(&self, server_id: u64, client_id: &str) -> Result<Option<u64>> {
        let mut conn = self.conn().await?;
        let value: Option<u64> = conn
            .exec_first(
                "SELECT heartbeat FROM `heartbeats` WHERE server_id = ? AND client_id = ?",
                (server_id, client_id),
            )
            .await?;
        Ok(value)
    }

    async fn insert_heartbeat(&self, server_id: u64, client_id: &str, value: u64) -> Result<bool> {
        let mut conn = self.conn().await?;
        let result = conn
            .exec_drop(
                "INSERT INTO `heartbeats` SET heartbeat = ?, server_id = ?, client_id = ?",
                (value, server_id, client_id),
            )
            .await;
        match result {
            Ok(()) => Ok(true),
            Err(mysql_async::Error::Server(e)) if e.code == ER_DUP_ENTRY => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_heartbeat(&self, server_id: u64, client_id: &str, expected: u64, value: u64) -> Result<u64> {
        let mut conn = self.conn().await?;
        conn.exec_drop(
            "UPDATE `heartbeats` SET heartbeat = ? WHERE server_id = ? AND client_id = ? AND heartbeat = ?",
            (value, server_id, client_id, expected),
        )
        .await?;
        Ok(conn.affected_rows())
    }
}

#[async_trait]
impl BootstrapStorage for MysqlStorage {
    async fn incomplete_tasks(&self, client_id: &str) -> Result<Vec<BootstrapTask>> {
        let mut conn = self.conn().await?;
        let rows: Vec<Row> = conn
            .exec(
                format!(
                    "SELECT {} FROM `bootstrap` WHERE is_complete = 0 AND client_id = ? \
                     ORDER BY ISNULL(started_at), started_at ASC, id ASC",
                    TASK_COLUMNS
                ),
                (client_id,),
            )
            .await?;
        Ok(rows.iter().map(task_from_row).collect())
    }

    async fn find_task(&self, id: u64) -> Result<Option<BootstrapTask>> {
        let mut conn = self.conn().await?;
        let row: Option<Row> = conn
            .exec_first(format!("SELECT {} FROM `bootstrap` WHERE id = ?", TASK_COLUMNS), (id,))
            .await?;
        Ok(row.as_ref().map(task_from_row))
    }

    async fn insert_task(&self, task: &BootstrapTask) -> Result<u64> {
        let mut conn = self.conn().await?;
        conn.exec_drop(
            "INSERT INTO `bootstrap` SET database_name = ?, table_name = ?, where_clause = ?, \
             client_id = ?, comment = ?, created_at = NOW()",
            (
                &task.database,
                &task.table,
                &task.where_clause,
                &task.client_id,
                &task.comment,
            ),
        )
        .await?;
        inserted_id(conn.last_insert_id(), "bootstrap")
    }

    async fn delete_task(&self, id: u64) -> Result<bool> {
        let mut conn = self.conn().await?;
        conn.exec_drop("DELETE FROM `bootstrap` WHERE id = ?", (id,)).await?;
        Ok(conn.affected_rows() > 0)
    }

    async fn mark_started(&self, id: u64, position: &Position, total_rows: u64) -> Result<u64> {
        let mut conn = self.conn().await?;
        conn.exec_drop(
            "UPDATE `bootstrap` SET started_at = NOW(), inserted_rows = 0, total_rows = ?, \
             binlog_file = ?, binlog_position = ? WHERE id = ?",
            (total_rows, &position.binlog.file, position.binlog.offset, id),
        )
        .await?;
        Ok(conn.affected_rows())
    }

    async fn update_progress(&self, id: u64, inserted_rows: u64) -> Result<u64> {
        let mut conn = self.conn().await?;
        // 값이 같으면 affected_rows가 0이 되므로 존재 여부는 따로 확인한다
        conn.exec_drop(
            "UPDATE `bootstrap` SET inserted_rows = ? WHERE id = ?",
            (inserted_rows, id),
        )
        .await?;
        if conn.affected_rows() > 0 {
            return Ok(1);
        }
        let exists: Option<u64> = conn
            .exec_first("SELECT id FROM `bootstrap` WHERE id = ?", (id,))
            .await?;
        Ok(exists.map_or(0, |_| 1))
    }

    async fn mark_complete(&self, id: u64, inserted_rows: u64) -> Result<u64> {
        let mut conn = self.conn().await?;
        conn.exec_drop(
            "UPDATE `bootstrap` SET is_complete = 1, completed_at = NOW(), inserted_rows = ? WHERE id = ?",
            (inserted_rows, id),
        )
        .await?;
        Ok(conn.affected_rows())
    }

    async fn reset_started(&self, id: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.exec_drop(
            "UPDATE `bootstrap` SET started_at = NULL, inserted_rows = 0 WHERE id = ?",
            (id,),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TableScanner for MysqlStorage {
    async fn count_rows(&self, table: &Table, where_clause: Option<&str>) -> Result<u64> {
        let mut conn = self.replica.get_conn().await?;
        let mut sql = format!(
            "SELECT COUNT(*) FROM {}.{}",
            quote_ident(&table.database),
            quote_ident(&table.name)
        );
        if let Some(w) = where_clause.filter(|w| !w.trim().is_empty()) {
            sql.push_str(&format!(" WHERE {}", w));
        }
        let count: Option<u64> = conn.query_first(sql).await?;
        Ok(count.unwrap_or_default())
    }

    async fn scan(&self, table: &Table, where_clause: Option<&str>, tx: mpsc::Sender<Vec<Value>>) -> Result<u64> {
        let mut conn = self.replica.get_conn().await?;
        let sql = scan_query(table, where_clause);
        debug!("Bootstrap scan: {}", sql);

        let mut result = conn.query_iter(sql).await?;
        let mut sent = 0;
        while let Some(row) = result.next().await? {
            if tx.send(Row::unwrap(row)).await.is_err() {
                break;
            }
            sent += 1;
        }
        // 남은 결과를 비워야 커넥션이 풀로 돌아간다
        result.drop_result().await?;
        Ok(sent)
    }
}
