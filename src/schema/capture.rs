//! 라이브 서버의 INFORMATION_SCHEMA로부터 스키마 캡처

use super::column::{unalias_type, ColumnDef};
use super::{CaseSensitivity, Database, Schema, Table};
use crate::connection::MySqlConnection;
use crate::error::{CdcError, Result};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::Row;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{debug, info};

const IGNORED_DATABASES: &[&str] = &["information_schema", "performance_schema"];

/// 현재 스키마를 얻는 방법. 버전 업그레이드 보정과 최초 기동 시 사용된다.
#[async_trait]
pub trait SchemaCapture: Send + Sync {
    async fn capture(&self) -> Result<Schema>;
}

pub struct SchemaCapturer {
    connection: MySqlConnection,
    sensitivity: CaseSensitivity,
    /// 지정하면 이 데이터베이스들만 캡처한다
    include_databases: Option<Vec<String>>,
}

impl SchemaCapturer {
    pub fn new(connection: MySqlConnection, sensitivity: CaseSensitivity) -> Self {
        SchemaCapturer {
            connection,
            sensitivity,
            include_databases: None,
        }
    }

    pub fn only_databases(mut self, databases: Vec<String>) -> Self {
        self.include_databases = Some(databases);
        self
    }

    fn wanted(&self, database: &str) -> bool {
        if IGNORED_DATABASES
            .iter()
            .any(|d| d.eq_ignore_ascii_case(database))
        {
            return false;
        }
        match &self.include_databases {
            Some(list) => list.iter().any(|d| self.sensitivity.matches(d, database)),
            None => true,
        }
    }

    async fn capture_schema(&self) -> Result<Schema> {
        let mut conn = self.connection.get_conn().await?;

        let server_charset: Option<String> = conn
            .query_first("SELECT @@character_set_server")
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query server charset: {}", e)))?;
        let mut schema = Schema::new(
            server_charset.unwrap_or_else(|| "utf8mb4".to_string()),
            self.sensitivity,
        );

        let db_rows: Vec<(String, String)> = conn
            .query("SELECT SCHEMA_NAME, DEFAULT_CHARACTER_SET_NAME FROM INFORMATION_SCHEMA.SCHEMATA")
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query schemata: {}", e)))?;

        let table_rows: Vec<Row> = conn
            .query(
                "SELECT t.TABLE_SCHEMA, t.TABLE_NAME, c.CHARACTER_SET_NAME \
                 FROM INFORMATION_SCHEMA.TABLES t \
                 JOIN INFORMATION_SCHEMA.COLLATION_CHARACTER_SET_APPLICABILITY c \
                   ON t.TABLE_COLLATION = c.COLLATION_NAME \
                 WHERE t.TABLE_TYPE = 'BASE TABLE' \
                 ORDER BY t.TABLE_SCHEMA, t.TABLE_NAME",
            )
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query tables: {}", e)))?;

        let column_rows: Vec<Row> = conn
            .query(
                "SELECT TABLE_SCHEMA, TABLE_NAME, COLUMN_NAME, DATA_TYPE, CHARACTER_SET_NAME, \
                        COLUMN_TYPE, DATETIME_PRECISION \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 ORDER BY TABLE_SCHEMA, TABLE_NAME, ORDINAL_POSITION",
            )
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query columns: {}", e)))?;

        let pk_rows: Vec<(String, String, String)> = conn
            .query(
                "SELECT TABLE_SCHEMA, TABLE_NAME, COLUMN_NAME \
                 FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE \
                 WHERE CONSTRAINT_NAME = 'PRIMARY' \
                 ORDER BY TABLE_SCHEMA, TABLE_NAME, ORDINAL_POSITION",
            )
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query primary keys: {}", e)))?;

        let mut columns: HashMap<(String, String), Vec<ColumnDef>> = HashMap::new();
        for row in column_rows {
            let db = text(&row, "TABLE_SCHEMA");
            if !self.wanted(&db) {
                continue;
            }
            let table = text(&row, "TABLE_NAME");
            let entry = columns.entry((db, table)).or_default();
            let column = captured_column(
                &text(&row, "COLUMN_NAME"),
                &text(&row, "DATA_TYPE"),
                &text(&row, "COLUMN_TYPE"),
                row.get::<Option<String>, _>("CHARACTER_SET_NAME").flatten(),
                row.get::<Option<u64>, _>("DATETIME_PRECISION").flatten(),
                entry.len(),
            )?;
            entry.push(column);
        }

        let mut pks: HashMap<(String, String), Vec<String>> = HashMap::new();
        for (db, table, column) in pk_rows {
            pks.entry((db, table)).or_default().push(column);
        }

        let mut databases: Vec<Database> = db_rows
            .into_iter()
            .filter(|(name, _)| self.wanted(name))
            .map(|(name, charset)| Database::new(name, charset))
            .collect();

        for row in table_rows {
            let db_name = text(&row, "TABLE_SCHEMA");
            let Some(db) = databases.iter_mut().find(|d| d.name == db_name) else {
                continue;
            };
            let table_name = text(&row, "TABLE_NAME");
            let key = (db_name.clone(), table_name.clone());
            db.add_table(Table::new(
                db_name,
                table_name,
                row.get::<Option<String>, _>("CHARACTER_SET_NAME").flatten(),
                columns.remove(&key).unwrap_or_default(),
                pks.remove(&key).unwrap_or_default(),
            ));
        }

        for db in databases {
            debug!("Captured database {} ({} tables)", db.name, db.tables.len());
            schema.add_database(db);
        }

        Ok(schema)
    }
}

#[async_trait]
impl SchemaCapture for SchemaCapturer {
    async fn capture(&self) -> Result<Schema> {
        info!("Capturing current schema");
        let schema = self.capture_schema().await?;
        info!(
            "Captured schema: {} databases, {} tables",
            schema.databases.len(),
            schema.table_count()
        );
        Ok(schema)
    }
}

fn text(row: &Row, column: &str) -> String {
    row.get::<Option<String>, _>(column).flatten().unwrap_or_default()
}

fn enum_value_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"'((?:[^']|'')*)'").ok()).as_ref()
}

/// `enum('a','b''c')` → ["a", "b'c"]
pub fn parse_enum_values(column_type: &str) -> Vec<String> {
    let (Some(start), Some(re)) = (column_type.find('('), enum_value_regex()) else {
        return Vec::new();
    };
    re.captures_iter(&column_type[start..])
        .map(|c| c[1].replace("''", "'"))
        .collect()
}

/// INFORMATION_SCHEMA.COLUMNS 한 행을 컬럼 정의로 변환
pub fn captured_column(
    name: &str,
    data_type: &str,
    column_type: &str,
    charset: Option<String>,
    datetime_precision: Option<u64>,
    pos: usize,
) -> Result<ColumnDef> {
    let data_type = unalias_type(data_type, false, None, false);
    let signed = !column_type.to_lowercase().contains("unsigned");
    let enum_values = match data_type.as_str() {
        "enum" | "set" => Some(parse_enum_values(column_type)),
        _ => None,
    };
    let length = match data_type.as_str() {
        "datetime" | "timestamp" | "time" => datetime_precision,
        _ => None,
    };
    ColumnDef::build(name, &data_type, pos, charset, signed, enum_values, length)
}
