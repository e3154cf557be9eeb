//! CDC 관련 에러 타입

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("GTID 처리 에러: {0}")]
    GtidError(String),

    #[error("설정 에러: {0}")]
    ConfigError(String),

    /// 해석할 수 없는 DDL 문장
    #[error("DDL 파싱 에러: {message} (SQL: {sql})")]
    ParseError { sql: String, message: String },

    /// DDL이 존재하지 않는 database/table/column을 참조함
    #[error("유효하지 않은 스키마: {0}")]
    InvalidSchema(String),

    /// 같은 (server_id, client_id)로 다른 프로세스가 동작 중
    #[error("중복 프로세스 감지: {0}")]
    DuplicateProcess(String),

    #[error("복구 후보가 모호합니다 (후보 {candidates}개)")]
    RecoveryAmbiguous { candidates: usize },

    #[error("부트스트랩 작업이 사라졌습니다: id={id}")]
    BootstrapTaskVanished { id: u64 },

    #[error("스키마 저장소 에러: {0}")]
    SchemaStoreError(String),

    #[error("Timeout 에러")]
    Timeout,

    #[error("채널이 닫혔습니다")]
    ChannelClosed,

    #[error("예상치 못한 에러: {0}")]
    Other(String),
}

impl CdcError {
    pub fn parse(sql: impl Into<String>, message: impl Into<String>) -> Self {
        CdcError::ParseError {
            sql: sql.into(),
            message: message.into(),
        }
    }

    /// 프로세스를 멈춰야 하는 에러인지 여부.
    ///
    /// 복구 후보 모호성은 다음 초기 위치 전략으로 넘어가고,
    /// 사라진 부트스트랩 작업은 해당 스캔만 취소한다.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            CdcError::RecoveryAmbiguous { .. } | CdcError::BootstrapTaskVanished { .. }
        )
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

impl From<mysql_async::Error> for CdcError {
    fn from(err: mysql_async::Error) -> Self {
        match err {
            mysql_async::Error::Driver(_) | mysql_async::Error::Io(_) => {
                CdcError::ConnectionError(err.to_string())
            }
            _ => CdcError::QueryError(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;
