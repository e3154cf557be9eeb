/// MySQL CDC 데몬
///
/// 스키마/위치/부트스트랩 상태는 MySQL(`CDC_SCHEMA_DATABASE`)에 저장하고,
/// binlog 이벤트는 `CDC_REPLAY_FILE`의 JSON lines에서 읽어 표준 출력으로 내보냅니다.
use mysql_cdc::connection::MySqlConnection;
use mysql_cdc::producer::{Producer, SerializedProducer, StdoutProducer};
use mysql_cdc::schema::{SchemaCapture, SchemaCapturer};
use mysql_cdc::source::{BinlogSource, ReplaySource};
use mysql_cdc::storage::MysqlStorage;
use mysql_cdc::{CdcConfig, CdcContext, CdcEngine, CdcError};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mysql_cdc=info")),
        )
        .init();

    let config = CdcConfig::from_env()?;
    info!("Starting MySQL CDC daemon");
    info!(
        "Connecting to {}:{}",
        config.connection.hostname, config.connection.port
    );

    let replay_file = config.replay_file.clone().ok_or_else(|| {
        CdcError::ConfigError("CDC_REPLAY_FILE is required (path to a JSON lines event file)".to_string())
    })?;
    let source: Arc<dyn BinlogSource> = Arc::new(ReplaySource::from_file(&replay_file).await?);

    let replica = MySqlConnection::connect(config.connection.clone())?;
    let mut store_config = config.connection.clone();
    store_config.database = None;
    let store = MySqlConnection::connect(store_config)?;

    let server_id = match config.server_id {
        Some(id) => id,
        None => replica.get_server_id().await?,
    };
    let sensitivity = replica.get_case_sensitivity().await?;
    if config.gtid_mode && !replica.is_gtid_mode_enabled().await? {
        return Err(CdcError::ConfigError(
            "CDC_GTID_MODE is set but the server has gtid_mode=OFF".to_string(),
        )
        .into());
    }
    info!("Connected to MySQL server {} ({:?})", server_id, sensitivity);

    let storage = Arc::new(MysqlStorage::new(
        store,
        replica.clone(),
        config.schema_database.clone(),
    ));
    storage.ensure_schema().await?;

    let capture: Arc<dyn SchemaCapture> = Arc::new(SchemaCapturer::new(replica, sensitivity));
    let producer: Arc<dyn Producer> = Arc::new(SerializedProducer::new(Arc::new(StdoutProducer)));

    let context = CdcContext::new(config, server_id, sensitivity, storage.clone());
    let mut engine = CdcEngine::new(context, source, producer, Some(capture));
    engine.start().await?;

    let result = tokio::select! {
        result = engine.stream_binlog() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };
    if let Err(e) = &result {
        error!("CDC Engine failed: {}", e);
    }

    engine.stop().await?;
    drop(engine);

    // 커넥션 풀은 모든 작업이 끝난 뒤에 반환한다
    match Arc::try_unwrap(storage) {
        Ok(storage) => storage.disconnect().await?,
        Err(_) => warn!("Storage still in use by a background task, skipping pool disconnect"),
    }
    result.map_err(Into::into)
}
