//! 출력 싱크
//!
//! 실제 싱크(Kafka, 파일 등)는 크레이트 밖에 있다. 코어는 `push`만 호출하고
//! 재시도는 싱크에 맡긴다.

use crate::error::{CdcError, Result};
use crate::events::RowMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

#[async_trait]
pub trait Producer: Send + Sync {
    async fn push(&self, row: RowMap) -> Result<()>;
}

/// mpsc 채널로 내보내는 producer
pub struct ChannelProducer {
    tx: mpsc::Sender<RowMap>,
}

impl ChannelProducer {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RowMap>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ChannelProducer { tx }, rx)
    }
}

#[async_trait]
impl Producer for ChannelProducer {
    async fn push(&self, row: RowMap) -> Result<()> {
        self.tx.send(row).await.map_err(|_| CdcError::ChannelClosed)
    }
}

/// 표준 출력에 JSON 한 줄씩
#[derive(Default)]
pub struct StdoutProducer;

#[async_trait]
impl Producer for StdoutProducer {
    async fn push(&self, row: RowMap) -> Result<()> {
        let mut line = row.to_json()?;
        line.push('\n');
        let mut stdout = tokio::io::stdout();
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}

/// 받은 행을 메모리에 모아 둔다
#[derive(Default)]
pub struct MemoryProducer {
    rows: Mutex<Vec<RowMap>>,
}

impl MemoryProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<RowMap> {
        self.rows.lock().clone()
    }
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn push(&self, row: RowMap) -> Result<()> {
        self.rows.lock().push(row);
        Ok(())
    }
}

/// 이벤트 루프와 부트스트랩 워커가 같은 싱크를 쓸 때 push를 직렬화한다
pub struct SerializedProducer {
    inner: Arc<dyn Producer>,
    lock: tokio::sync::Mutex<()>,
}

impl SerializedProducer {
    pub fn new(inner: Arc<dyn Producer>) -> Self {
        SerializedProducer {
            inner,
            lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl Producer for SerializedProducer {
    async fn push(&self, row: RowMap) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.inner.push(row).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RowType;
    use crate::offset::Position;

    #[tokio::test]
    async fn test_channel_producer() {
        let (producer, mut rx) = ChannelProducer::new(4);
        producer
            .push(RowMap::new("shop", "orders", RowType::Insert, Position::at("bin.1", 4)))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().table, "orders");

        drop(rx);
        let err = producer
            .push(RowMap::new("shop", "orders", RowType::Insert, Position::at("bin.1", 4)))
            .await
            .unwrap_err();
        assert!(matches!(err, CdcError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_serialized_producer_keeps_order() {
        let memory = Arc::new(MemoryProducer::new());
        let producer = Arc::new(SerializedProducer::new(memory.clone()));

        let mut handles = Vec::new();
        for i in 0..10u64 {
            let producer = producer.clone();
            handles.push(tokio::spawn(async move {
                producer
                    .push(RowMap::new("shop", "orders", RowType::Insert, Position::at("bin.1", i)))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(memory.rows().len(), 10);
    }
}
