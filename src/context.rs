//! 데몬 한 개가 공유하는 설정과 저장소 묶음

use crate::config::CdcConfig;
use crate::position_store::PositionStore;
use crate::schema::CaseSensitivity;
use crate::schema_store::SchemaRegistry;
use crate::storage::{BootstrapStorage, PositionStorage, SchemaStorage, TableScanner};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct CdcContext {
    pub config: CdcConfig,
    pub server_id: u64,
    pub sensitivity: CaseSensitivity,
    pub schemas: Arc<dyn SchemaStorage>,
    pub positions: Arc<dyn PositionStorage>,
    pub tasks: Arc<dyn BootstrapStorage>,
    pub scanner: Arc<dyn TableScanner>,
    shutdown: watch::Sender<bool>,
}

impl CdcContext {
    /// 모든 저장소 역할을 하나의 구현이 맡는 경우
    pub fn new<S>(config: CdcConfig, server_id: u64, sensitivity: CaseSensitivity, storage: Arc<S>) -> Self
    where
        S: SchemaStorage + PositionStorage + BootstrapStorage + TableScanner + 'static,
    {
        let (shutdown, _) = watch::channel(false);
        CdcContext {
            config,
            server_id,
            sensitivity,
            schemas: storage.clone(),
            positions: storage.clone(),
            tasks: storage.clone(),
            scanner: storage,
            shutdown,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn position_store(&self) -> PositionStore {
        PositionStore::new(self.positions.clone(), self.server_id, self.config.client_id.clone())
    }

    pub fn schema_registry(&self) -> SchemaRegistry {
        SchemaRegistry::new(self.schemas.clone(), self.sensitivity)
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// 모든 백그라운드 태스크에 종료 알림
    pub fn terminate(&self) {
        self.shutdown.send_replace(true);
    }
}
