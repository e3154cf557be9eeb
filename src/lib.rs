//! MySQL CDC (Change Data Capture) 데몬 코어
//!
//! binlog 이벤트를 받아 행 변경을 내보내는 데 필요한 상태 관리를 담당합니다.
//! 주요 기능:
//! - DDL 파싱과 메모리 스키마 모델 갱신
//! - 스키마 버전 저장 (전체 스냅샷 + 델타 체인, 압축)
//! - 복제 위치/하트비트 저장, 마스터 교체 후 위치 복구
//! - 테이블 부트스트랩과 라이브 행 버퍼링
//!
//! 복제 프로토콜 클라이언트와 출력 싱크는 `BinlogSource`, `Producer` 트레이트 뒤에 있습니다.

pub mod bootstrap;
pub mod cdc_engine;
pub mod compactor;
pub mod config;
pub mod connection;
pub mod context;
pub mod ddl;
pub mod error;
pub mod events;
pub mod gtid;
pub mod offset;
pub mod position_store;
pub mod position_tracker;
pub mod producer;
pub mod recovery;
pub mod schema;
pub mod schema_store;
pub mod source;
pub mod storage;

pub use bootstrap::{BootstrapController, BootstrapTask};
pub use cdc_engine::CdcEngine;
pub use config::{BootstrapMode, CdcConfig};
pub use connection::MySqlConnection;
pub use context::CdcContext;
pub use error::{CdcError, Result};
pub use events::{RowMap, RowType, SourceEvent};
pub use gtid::GtidSet;
pub use offset::{BinlogPosition, Position};
pub use schema::Schema;
pub use schema_store::{SchemaRegistry, SchemaStore};
