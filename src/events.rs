//! 입력 이벤트(binlog 소스)와 출력 이벤트(producer로 보내는 행) 정의

use crate::offset::Position;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// 행 데이터: 컬럼명 → JSON 값
pub type RowData = Map<String, JsonValue>;

/// 출력 행 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RowType {
    Insert,
    Update,
    Delete,
    /// 부트스트랩 시작 마커
    BootstrapStart,
    /// 부트스트랩 스캔으로 만든 합성 INSERT
    BootstrapInsert,
    /// 부트스트랩 완료 마커
    BootstrapComplete,
    Ddl,
}

impl RowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowType::Insert => "insert",
            RowType::Update => "update",
            RowType::Delete => "delete",
            RowType::BootstrapStart => "bootstrap-start",
            RowType::BootstrapInsert => "bootstrap-insert",
            RowType::BootstrapComplete => "bootstrap-complete",
            RowType::Ddl => "ddl",
        }
    }

    pub fn is_bootstrap(&self) -> bool {
        matches!(
            self,
            RowType::BootstrapStart | RowType::BootstrapInsert | RowType::BootstrapComplete
        )
    }
}

/// binlog 소스가 순서대로 넘겨주는 이벤트
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SourceEvent {
    /// DML 한 행
    Row {
        database: String,
        table: String,
        #[serde(rename = "type")]
        row_type: RowType,
        data: RowData,
        /// UPDATE의 변경 전 값 (바뀐 컬럼만)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old: Option<RowData>,
        position: Position,
    },
    /// DDL 문장과 실행 당시의 기본 데이터베이스
    Ddl {
        #[serde(default)]
        database: Option<String>,
        sql: String,
        position: Position,
    },
    /// 트랜잭션 경계 (XID / COMMIT)
    TransactionCommit { position: Position },
    /// 하트비트 테이블 갱신이 복제되어 돌아온 것
    Heartbeat { value: u64, position: Position },
}

impl SourceEvent {
    pub fn position(&self) -> &Position {
        match self {
            SourceEvent::Row { position, .. }
            | SourceEvent::Ddl { position, .. }
            | SourceEvent::TransactionCommit { position }
            | SourceEvent::Heartbeat { position, .. } => position,
        }
    }

    pub fn position_mut(&mut self) -> &mut Position {
        match self {
            SourceEvent::Row { position, .. }
            | SourceEvent::Ddl { position, .. }
            | SourceEvent::TransactionCommit { position }
            | SourceEvent::Heartbeat { position, .. } => position,
        }
    }

    pub fn is_heartbeat(&self, value: u64) -> bool {
        matches!(self, SourceEvent::Heartbeat { value: v, .. } if *v == value)
    }
}

/// producer로 내보내는 변경 이벤트
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowMap {
    pub database: String,
    pub table: String,
    #[serde(rename = "type")]
    pub row_type: RowType,
    /// 이 행을 만들 때 유효했던 스키마 버전
    pub schema_id: Option<u64>,
    pub data: RowData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<RowData>,
    /// DDL 이벤트의 원본 문장
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub position: Position,
    pub timestamp: DateTime<Utc>,
}

impl RowMap {
    pub fn new(
        database: impl Into<String>,
        table: impl Into<String>,
        row_type: RowType,
        position: Position,
    ) -> Self {
        RowMap {
            database: database.into(),
            table: table.into(),
            row_type,
            schema_id: None,
            data: RowData::new(),
            old: None,
            sql: None,
            position,
            timestamp: Utc::now(),
        }
    }

    pub fn with_schema_id(mut self, schema_id: Option<u64>) -> Self {
        self.schema_id = schema_id;
        self
    }

    pub fn with_data(mut self, data: RowData) -> Self {
        self.data = data;
        self
    }

    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.data.get(column)
    }

    /// 기본 키 값들. 같은 키의 행 순서를 비교할 때 쓴다
    pub fn pk_values(&self, pk: &[String]) -> Vec<JsonValue> {
        pk.iter()
            .map(|c| self.data.get(c).cloned().unwrap_or(JsonValue::Null))
            .collect()
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
