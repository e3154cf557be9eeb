//! 부트스트랩 작업 (`bootstrap` 테이블 한 행)

use crate::error::Result;
use crate::offset::Position;
use crate::schema::CaseSensitivity;
use crate::storage::BootstrapStorage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Started,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapTask {
    pub id: u64,
    pub database: String,
    pub table: String,
    pub where_clause: Option<String>,
    pub client_id: String,
    pub is_complete: bool,
    pub inserted_rows: u64,
    pub total_rows: u64,
    /// 스캔 시작 시점의 복제 위치. 부트스트랩 행에 이 위치가 찍힌다
    pub start_position: Option<Position>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub comment: Option<String>,
}

impl BootstrapTask {
    pub fn new(
        database: impl Into<String>,
        table: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        BootstrapTask {
            id: 0,
            database: database.into(),
            table: table.into(),
            where_clause: None,
            client_id: client_id.into(),
            is_complete: false,
            inserted_rows: 0,
            total_rows: 0,
            start_position: None,
            created_at: None,
            started_at: None,
            completed_at: None,
            comment: None,
        }
    }

    pub fn with_where(mut self, where_clause: impl Into<String>) -> Self {
        self.where_clause = Some(where_clause.into());
        self
    }

    pub fn status(&self) -> TaskStatus {
        if self.is_complete {
            TaskStatus::Complete
        } else if self.started_at.is_some() {
            TaskStatus::Started
        } else {
            TaskStatus::Pending
        }
    }

    /// 이 작업이 (database, table)을 대상으로 하는지
    pub fn matches(&self, database: &str, table: &str, sensitivity: CaseSensitivity) -> bool {
        let ci = match sensitivity {
            CaseSensitivity::CaseSensitive => CaseSensitivity::CaseSensitive,
            _ => CaseSensitivity::ConvertOnCompare,
        };
        ci.matches(&self.database, database) && ci.matches(&self.table, table)
    }

    /// 작업 요청: `bootstrap` 테이블에 행을 넣는다. 새 id를 돌려준다
    ///
    /// ```
    /// # tokio_test::block_on(async {
    /// use mysql_cdc::bootstrap::BootstrapTask;
    /// use mysql_cdc::storage::MemoryStorage;
    ///
    /// let storage = MemoryStorage::new();
    /// let task = BootstrapTask::new("shop", "orders", "maxwell").with_where("id > 100");
    /// let id = BootstrapTask::request(&storage, &task).await.unwrap();
    /// assert!(BootstrapTask::abort(&storage, id).await.unwrap());
    /// # });
    /// ```
    pub async fn request(storage: &dyn BootstrapStorage, task: &BootstrapTask) -> Result<u64> {
        storage.insert_task(task).await
    }

    /// 작업 취소: 행을 지운다. 진행 중인 스캔은 다음 진행률 갱신에서 멈춘다
    pub async fn abort(storage: &dyn BootstrapStorage, id: u64) -> Result<bool> {
        storage.delete_task(id).await
    }
}

impl fmt::Display for BootstrapTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}.{}", self.id, self.database, self.table)?;
        if let Some(w) = &self.where_clause {
            write!(f, " where {}", w)?;
        }
        Ok(())
    }
}
