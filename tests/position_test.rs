mod common;

use common::CLIENT_ID;
use mysql_cdc::position_store::PositionStore;
use mysql_cdc::position_tracker::{PositionTracker, TrackerConfig};
use mysql_cdc::storage::{MemoryStorage, PositionStorage};
use mysql_cdc::{CdcError, Position};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test]
async fn test_latest_position_wins() {
    let storage = Arc::new(MemoryStorage::new());
    let store = PositionStore::new(storage.clone(), 7, CLIENT_ID);

    store.set(&Position::at("bin.3", 500)).await.unwrap();
    store.set(&Position::at("bin.3", 800)).await.unwrap();
    assert_eq!(store.get().await.unwrap(), Some(Position::at("bin.3", 800)));

    // 다른 클라이언트는 영향 없음
    let other = PositionStore::new(storage, 7, "other");
    assert_eq!(other.get().await.unwrap(), None);
}

#[tokio::test]
async fn test_racing_heartbeats_detect_duplicate() {
    let storage = Arc::new(MemoryStorage::new());
    let first = PositionStore::new(storage.clone(), 1, CLIENT_ID);
    let second = PositionStore::new(storage.clone(), 1, CLIENT_ID);

    first.heartbeat(None, 1000).await.unwrap();
    second.heartbeat(None, 2000).await.unwrap();

    // first는 자기가 쓴 1000을 기대하지만 second가 바꿨다
    let err = first.heartbeat(Some(1000), 3000).await.unwrap_err();
    assert!(matches!(err, CdcError::DuplicateProcess(_)));
    assert!(err.is_fatal());

    tokio_test::assert_ok!(second.heartbeat(Some(2000), 4000).await);
    assert_eq!(storage.read_heartbeat(1, CLIENT_ID).await.unwrap(), Some(4000));
}

#[tokio::test]
async fn test_tracker_stops_on_duplicate_process() {
    let storage = Arc::new(MemoryStorage::new());
    let config = TrackerConfig {
        flush_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(10),
        heartbeat_bytes: 3000,
    };
    let tracker = Arc::new(PositionTracker::new(
        PositionStore::new(storage.clone(), 1, CLIENT_ID),
        config,
    ));
    tracker.initialize(Position::at("bin.000001", 4), None);
    tracker.work().await.unwrap();
    let written = tracker.last_heartbeat().unwrap();

    // 다른 프로세스가 하트비트를 가로챔
    storage
        .update_heartbeat(1, CLIENT_ID, written, written + 1_000_000)
        .await
        .unwrap();

    let (_tx, rx) = watch::channel(false);
    tokio::time::timeout(Duration::from_secs(5), tracker.clone().run(rx))
        .await
        .expect("tracker should stop by itself");
    assert!(matches!(tracker.check_fatal(), Err(CdcError::DuplicateProcess(_))));
}

#[tokio::test]
async fn test_recovery_refuses_multiple_servers() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .set_position(1, CLIENT_ID, &Position::at("bin.000010", 400).with_heartbeat(100))
        .await
        .unwrap();
    storage
        .set_position(2, CLIENT_ID, &Position::at("mysql.000002", 900).with_heartbeat(200))
        .await
        .unwrap();

    let store = PositionStore::new(storage.clone(), 3, CLIENT_ID);
    let err = store.get_recovery_info().await.unwrap_err();
    assert!(matches!(err, CdcError::RecoveryAmbiguous { candidates: 2 }));
    assert!(!err.is_fatal());

    // 한 서버만 남으면 후보가 된다
    storage.delete_other_positions(CLIENT_ID, 1).await.unwrap();
    let info = store.get_recovery_info().await.unwrap();
    assert_eq!(info.server_id, 1);
    assert_eq!(info.heartbeat(), 100);
}

#[tokio::test]
async fn test_final_position_flush() {
    let storage = Arc::new(MemoryStorage::new());
    let tracker = PositionTracker::new(
        PositionStore::new(storage.clone(), 1, CLIENT_ID),
        TrackerConfig::default(),
    );
    let start = Position::at("bin.000001", 4);
    tracker.initialize(start.clone(), Some(start));
    tracker.set_position(&Position::at("bin.000001", 4000));
    // 역행하는 위치는 무시
    tracker.set_position(&Position::at("bin.000001", 100));

    tracker.store_final_position(Duration::from_secs(1)).await.unwrap();
    assert_eq!(
        storage.get_position(1, CLIENT_ID).await.unwrap(),
        Some(Position::at("bin.000001", 4000))
    );
}
