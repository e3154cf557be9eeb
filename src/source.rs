//! binlog 이벤트 소스
//!
//! 복제 프로토콜 클라이언트는 이 크레이트 밖에 있다. 엔진과 복구 로직은
//! `BinlogSource`만 보고, 데몬과 테스트는 JSON lines 파일을 읽는 `ReplaySource`를 쓴다.

use crate::error::{CdcError, Result};
use crate::events::SourceEvent;
use crate::offset::{compare_files, BinlogPosition, Position};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

const CHANNEL_CAPACITY: usize = 1024;

#[async_trait]
pub trait BinlogSource: Send + Sync {
    /// 서버에 남아 있는 binlog 파일 (오래된 순)
    async fn binary_logs(&self) -> Result<Vec<String>>;

    /// `from` 이후의 이벤트 스트림. 받는 쪽을 닫으면 스트림도 멈춘다
    async fn open(&self, from: &BinlogPosition) -> Result<mpsc::Receiver<SourceEvent>>;

    /// 현재 마스터 위치
    async fn capture_position(&self) -> Result<Position>;
}

/// 미리 기록된 이벤트를 순서대로 내보내는 소스
#[derive(Clone)]
pub struct ReplaySource {
    events: Arc<Vec<SourceEvent>>,
}

impl ReplaySource {
    pub fn from_events(events: Vec<SourceEvent>) -> Self {
        ReplaySource {
            events: Arc::new(events),
        }
    }

    /// 한 줄에 이벤트 하나. 빈 줄과 `#` 주석은 건너뛴다
    pub fn parse(content: &str) -> Result<Self> {
        let mut events = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let event: SourceEvent = serde_json::from_str(line).map_err(|e| {
                CdcError::ConfigError(format!("invalid replay event on line {}: {}", line_no + 1, e))
            })?;
            events.push(event);
        }
        Ok(Self::from_events(events))
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        let source = Self::parse(&content)?;
        info!("Loaded {} replay events from {}", source.events.len(), path.display());
        Ok(source)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

fn at_or_after(position: &BinlogPosition, from: &BinlogPosition) -> bool {
    match compare_files(&position.file, &from.file) {
        Ordering::Greater => true,
        Ordering::Equal => position.offset >= from.offset,
        Ordering::Less => false,
    }
}

#[async_trait]
impl BinlogSource for ReplaySource {
    async fn binary_logs(&self) -> Result<Vec<String>> {
        let mut files: Vec<String> = Vec::new();
        for event in self.events.iter() {
            let file = &event.position().binlog.file;
            if !files.contains(file) {
                files.push(file.clone());
            }
        }
        files.sort_by(|a, b| compare_files(a, b));
        Ok(files)
    }

    async fn open(&self, from: &BinlogPosition) -> Result<mpsc::Receiver<SourceEvent>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let events = self.events.clone();
        let from = from.clone();
        debug!("Opening replay stream at {}", from);

        tokio::spawn(async move {
            for event in events.iter() {
                if !at_or_after(&event.position().binlog, &from) {
                    continue;
                }
                if tx.send(event.clone()).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn capture_position(&self) -> Result<Position> {
        let last = self
            .events
            .iter()
            .map(|e| e.position())
            .max_by(|a, b| a.binlog.cmp_coordinates(&b.binlog))
            .ok_or_else(|| CdcError::ConfigError("replay source has no events".to_string()))?;
        Ok(Position::new(last.binlog.clone(), 0))
    }
}
