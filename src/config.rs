//! CDC 데몬 설정
//!
//! 모든 값은 `CDC_` 접두사 환경 변수로 바꿀 수 있다.
//!
//! | 변수 | 기본값 |
//! |---|---|
//! | `CDC_HOST` / `CDC_PORT` | `localhost` / `3306` |
//! | `CDC_USER` / `CDC_PASSWORD` | `maxwell` / 빈 문자열 |
//! | `CDC_SCHEMA_DATABASE` | `maxwell` |
//! | `CDC_CLIENT_ID` | `maxwell` |
//! | `CDC_SERVER_ID` | 없음 (서버에서 `@@server_id` 조회) |
//! | `CDC_GTID_MODE` | `false` (켜면 GTID 집합으로 위치 비교·스키마 복원) |
//! | `CDC_BOOTSTRAP_MODE` | `async` (`sync` / `async`) |
//! | `CDC_POSITION_FLUSH_MS` | `1000` |
//! | `CDC_HEARTBEAT_INTERVAL_MS` / `CDC_HEARTBEAT_BYTES` | `10000` / `3000` |
//! | `CDC_BOOTSTRAP_PROGRESS_MS` / `CDC_BOOTSTRAP_POLL_MS` | `250` / `1000` |
//! | `CDC_BOOTSTRAP_BUFFER_ROWS` | `10000` (테이블별, 넘으면 임시 파일로) |
//! | `CDC_SHUTDOWN_TIMEOUT_MS` | `5000` |
//! | `CDC_MASTER_RECOVERY` | `false` |
//! | `CDC_MAX_SCHEMA_DELTAS` | 없음 (압축 안 함) |
//! | `CDC_COMPACTION_INTERVAL_MS` | `60000` |
//! | `CDC_OUTPUT_DDL` | `false` |
//! | `CDC_REPLAY_FILE` | 없음 |
//! | `CDC_INIT_POSITION` | 없음 (`file:offset[:heartbeat]`, 저장된 위치가 없을 때만) |

use crate::connection::ConnectionConfig;
use crate::error::{CdcError, Result};
use crate::offset::Position;
use crate::position_tracker::TrackerConfig;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// 부트스트랩 실행 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootstrapMode {
    /// 이벤트 루프 안에서 스캔이 끝날 때까지 기다린다
    Sync,
    /// 별도 워커에서 스캔하고 대상 테이블의 라이브 행은 버퍼링한다
    #[default]
    Async,
}

impl FromStr for BootstrapMode {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(BootstrapMode::Sync),
            "async" => Ok(BootstrapMode::Async),
            other => Err(CdcError::ConfigError(format!(
                "unknown bootstrap mode '{}' (expected sync or async)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CdcConfig {
    pub connection: ConnectionConfig,
    pub schema_database: String,
    pub client_id: String,
    /// 지정하면 서버 조회 대신 이 값을 쓴다
    pub server_id: Option<u64>,
    /// 위치에 GTID 집합을 유지할지. 끄면 소스가 준 GTID도 버린다
    pub gtid_mode: bool,
    pub bootstrap_mode: BootstrapMode,
    pub position_flush_interval: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_bytes: u64,
    pub bootstrap_progress_interval: Duration,
    pub bootstrap_poll_interval: Duration,
    /// 부트스트랩 중 테이블별로 메모리에 쌓아 둘 최대 라이브 행 수
    pub bootstrap_buffer_rows: usize,
    pub shutdown_timeout: Duration,
    pub master_recovery: bool,
    /// 스냅샷이 이 개수 이상이면 압축. None이면 압축하지 않는다
    pub max_schema_deltas: Option<usize>,
    pub compaction_interval: Duration,
    pub output_ddl: bool,
    pub replay_file: Option<PathBuf>,
    /// 저장된 위치가 없을 때 현재 마스터 위치 대신 쓸 시작 위치
    pub init_position: Option<Position>,
}

impl Default for CdcConfig {
    fn default() -> Self {
        CdcConfig {
            connection: ConnectionConfig::new("localhost", "maxwell"),
            schema_database: "maxwell".to_string(),
            client_id: "maxwell".to_string(),
            server_id: None,
            gtid_mode: false,
            bootstrap_mode: BootstrapMode::Async,
            position_flush_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_bytes: 3000,
            bootstrap_progress_interval: Duration::from_millis(250),
            bootstrap_poll_interval: Duration::from_secs(1),
            bootstrap_buffer_rows: crate::bootstrap::buffer::DEFAULT_MAX_IN_MEMORY,
            shutdown_timeout: Duration::from_secs(5),
            master_recovery: false,
            max_schema_deltas: None,
            compaction_interval: Duration::from_secs(60),
            output_ddl: false,
            replay_file: None,
            init_position: None,
        }
    }
}

impl CdcConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// 임의의 키-값 조회 함수로부터 설정을 만든다
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = CdcConfig::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("CDC_HOST") {
            config.connection.hostname = v;
        }
        if let Some(v) = get("CDC_PORT") {
            config.connection.port = parse("CDC_PORT", &v)?;
        }
        if let Some(v) = get("CDC_USER") {
            config.connection.username = v;
        }
        if let Some(v) = lookup("CDC_PASSWORD") {
            config.connection.password = v;
        }
        if let Some(v) = get("CDC_SCHEMA_DATABASE") {
            config.schema_database = v;
        }
        if let Some(v) = get("CDC_CLIENT_ID") {
            config.client_id = v;
        }
        if let Some(v) = get("CDC_SERVER_ID") {
            config.server_id = Some(parse("CDC_SERVER_ID", &v)?);
        }
        if let Some(v) = get("CDC_GTID_MODE") {
            config.gtid_mode = parse_bool("CDC_GTID_MODE", &v)?;
        }
        if let Some(v) = get("CDC_BOOTSTRAP_MODE") {
            config.bootstrap_mode = v.parse()?;
        }
        if let Some(v) = get("CDC_POSITION_FLUSH_MS") {
            config.position_flush_interval = millis("CDC_POSITION_FLUSH_MS", &v)?;
        }
        if let Some(v) = get("CDC_HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval = millis("CDC_HEARTBEAT_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("CDC_HEARTBEAT_BYTES") {
            config.heartbeat_bytes = parse("CDC_HEARTBEAT_BYTES", &v)?;
        }
        if let Some(v) = get("CDC_BOOTSTRAP_PROGRESS_MS") {
            config.bootstrap_progress_interval = millis("CDC_BOOTSTRAP_PROGRESS_MS", &v)?;
        }
        if let Some(v) = get("CDC_BOOTSTRAP_POLL_MS") {
            config.bootstrap_poll_interval = millis("CDC_BOOTSTRAP_POLL_MS", &v)?;
        }
        if let Some(v) = get("CDC_BOOTSTRAP_BUFFER_ROWS") {
            config.bootstrap_buffer_rows = parse("CDC_BOOTSTRAP_BUFFER_ROWS", &v)?;
        }
        if let Some(v) = get("CDC_SHUTDOWN_TIMEOUT_MS") {
            config.shutdown_timeout = millis("CDC_SHUTDOWN_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("CDC_MASTER_RECOVERY") {
            config.master_recovery = parse_bool("CDC_MASTER_RECOVERY", &v)?;
        }
        if let Some(v) = get("CDC_MAX_SCHEMA_DELTAS") {
            config.max_schema_deltas = Some(parse("CDC_MAX_SCHEMA_DELTAS", &v)?);
        }
        if let Some(v) = get("CDC_COMPACTION_INTERVAL_MS") {
            config.compaction_interval = millis("CDC_COMPACTION_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("CDC_OUTPUT_DDL") {
            config.output_ddl = parse_bool("CDC_OUTPUT_DDL", &v)?;
        }
        if let Some(v) = get("CDC_REPLAY_FILE") {
            config.replay_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("CDC_INIT_POSITION") {
            config.init_position = Some(parse_position("CDC_INIT_POSITION", &v)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.len() > 255 {
            return Err(CdcError::ConfigError("client id is longer than 255 characters".into()));
        }
        if self.position_flush_interval.is_zero() {
            return Err(CdcError::ConfigError("position flush interval must be positive".into()));
        }
        if self.bootstrap_poll_interval.is_zero() {
            return Err(CdcError::ConfigError("bootstrap poll interval must be positive".into()));
        }
        if self.bootstrap_buffer_rows == 0 {
            return Err(CdcError::ConfigError("bootstrap buffer rows must be at least 1".into()));
        }
        if self.max_schema_deltas == Some(0) {
            return Err(CdcError::ConfigError("max schema deltas must be at least 1".into()));
        }
        Ok(())
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            flush_interval: self.position_flush_interval,
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_bytes: self.heartbeat_bytes,
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CdcError::ConfigError(format!("invalid value for {}: '{}'", key, value)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CdcError::ConfigError(format!("invalid boolean for {}: '{}'", key, value))),
    }
}

/// `file:offset` 또는 `file:offset:heartbeat`
fn parse_position(key: &str, value: &str) -> Result<Position> {
    let parts: Vec<&str> = value.trim().split(':').collect();
    match parts.as_slice() {
        [file, offset] if !file.is_empty() => Ok(Position::at(*file, parse(key, offset)?)),
        [file, offset, heartbeat] if !file.is_empty() => {
            Ok(Position::at(*file, parse(key, offset)?).with_heartbeat(parse(key, heartbeat)?))
        }
        _ => Err(CdcError::ConfigError(format!(
            "invalid position for {}: '{}' (expected file:offset[:heartbeat])",
            key, value
        ))),
    }
}

fn millis(key: &str, value: &str) -> Result<Duration> {
    parse::<u64>(key, value).map(Duration::from_millis)
}
