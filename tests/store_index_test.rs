//! 主存储、二级索引与日志服务的集成测试

use memlog_server::mlcommon::{category, AppError, IndexSpec, LogRecord, MonotonicClock, StorageConfig, Timestamp};
use memlog_server::mlstore::index::composite_key;
use memlog_server::mlstore::{LogIndex, LogService, LogStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn temp_dir(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("memlog_it_{}_{}_{}", tag, std::process::id(), nanos))
}

fn storage(dir: &PathBuf) -> StorageConfig {
    StorageConfig {
        data_dir: dir.clone(),
        pool_size: 4,
        queue_size: 64,
        batch_size: 16,
    }
}

fn indices() -> Vec<IndexSpec> {
    vec![
        IndexSpec { name: "actor".to_string(), key: "actor".to_string() },
        IndexSpec { name: "category".to_string(), key: "category".to_string() },
    ]
}

fn record(clock: &MonotonicClock, actor: &str, category: &str, message: &str) -> LogRecord {
    LogRecord {
        timestamp: clock.now(),
        collector: "it".to_string(),
        host: "localhost".to_string(),
        pid: 100,
        application: "game".to_string(),
        domain: String::new(),
        user: "tester".to_string(),
        actor: actor.to_string(),
        category: category.to_string(),
        message: message.to_string(),
        raw_payload: None,
    }
}

/// 索引内容必须恰好等于主存储经键函数投影后的结果
fn assert_index_matches_store(index: &LogIndex, store: &LogStore) {
    let mut expected: Vec<(String, Timestamp)> = store
        .scan()
        .map(|r| r.unwrap())
        .filter_map(|r| index.key_of(&r).map(|key| (composite_key(&key, r.timestamp), r.timestamp)))
        .collect();
    expected.sort();
    assert_eq!(index.entries().unwrap(), expected);
}

#[tokio::test]
async fn test_service_store_load_and_query() {
    let dir = temp_dir("service");
    let _cleanup = scopeguard::guard(dir.clone(), |d| {
        let _ = std::fs::remove_dir_all(d);
    });

    let service = LogService::open(&storage(&dir), "xiv", &indices()).unwrap();
    let clock = MonotonicClock::new();

    let alice = record(&clock, "Alice", "say", "hello");
    let bob = record(&clock, "Bob", "tell", "hi");
    service.store(alice.clone()).await.unwrap();
    service.store(bob.clone()).await.unwrap();

    assert_eq!(service.load(alice.timestamp).await.unwrap(), Some(alice.clone()));
    assert_eq!(service.query("actor", "Al").await.unwrap(), vec![alice.clone()]);
    assert_eq!(service.query("category", "tell").await.unwrap(), vec![bob.clone()]);
    assert!(matches!(service.query("nope", "").await, Err(AppError::IndexNotFound(_))));

    let latest = service.latest(1).await.unwrap();
    assert_eq!(latest, vec![bob]);

    let report = service.shutdown().await.unwrap();
    assert_eq!(report.records_written, 2);
    assert!(!report.failed);
    println!("✅ 服务写入与查询测试通过");
}

#[tokio::test]
async fn test_ingest_channel_batches_and_drains_on_shutdown() {
    let dir = temp_dir("ingest");
    let _cleanup = scopeguard::guard(dir.clone(), |d| {
        let _ = std::fs::remove_dir_all(d);
    });

    let service = LogService::open(&storage(&dir), "xiv", &indices()).unwrap();
    let clock = MonotonicClock::new();
    let tx = service.ingest_sender();

    let mut expected = Vec::new();
    for i in 0..500 {
        let r = record(&clock, if i % 2 == 0 { "Alice" } else { "Bob" }, "say", &format!("m{}", i));
        expected.push(r.timestamp);
        tx.send(r).await.unwrap();
    }
    drop(tx);

    let store = service.store_handle();
    let report = service.shutdown().await.unwrap();
    assert_eq!(report.records_written, 500);
    // 批量合并后事务数少于记录数
    assert!(report.batches_committed <= 500);

    let stored: Vec<Timestamp> = store.scan().map(|r| r.unwrap().timestamp).collect();
    assert_eq!(stored, expected);
    println!("✅ 通道写入排空测试通过");
}

#[tokio::test]
async fn test_rebuild_restores_lost_index() {
    let dir = temp_dir("rebuild");
    let _cleanup = scopeguard::guard(dir.clone(), |d| {
        let _ = std::fs::remove_dir_all(d);
    });

    let cfg = storage(&dir);
    let clock = MonotonicClock::new();
    {
        let service = LogService::open(&cfg, "xiv", &indices()).unwrap();
        for i in 0..100 {
            let actor = ["Alice", "Bob", "Carol"][i % 3];
            service.store(record(&clock, actor, "say", "x")).await.unwrap();
        }
        service.shutdown().await.unwrap();
    }

    // 删除索引文件，模拟索引丢失
    std::fs::remove_dir_all(cfg.source_dir("xiv").join("index")).unwrap();

    let service = LogService::open(&cfg, "xiv", &indices()).unwrap();
    assert!(service.query_timestamps("actor", "").await.unwrap().is_empty());

    let rebuilt = service.rebuild_all().await.unwrap();
    assert_eq!(rebuilt.len(), 2);
    assert!(rebuilt.iter().all(|(_, count)| *count == 100));

    assert_eq!(service.query_timestamps("actor", "Bob").await.unwrap().len(), 33);
    assert_eq!(service.query_timestamps("actor", "Alice").await.unwrap().len(), 34);
    service.shutdown().await.unwrap();
    println!("✅ 索引重建测试通过");
}

#[tokio::test]
async fn test_duplicate_timestamp_stops_writer() {
    let dir = temp_dir("dup");
    let _cleanup = scopeguard::guard(dir.clone(), |d| {
        let _ = std::fs::remove_dir_all(d);
    });

    let service = LogService::open(&storage(&dir), "xiv", &indices()).unwrap();
    let clock = MonotonicClock::new();

    let first = record(&clock, "Alice", "say", "first");
    let mut second = record(&clock, "Bob", "say", "second");
    second.timestamp = first.timestamp;

    service.store(first.clone()).await.unwrap();
    let err = service.store(second).await.unwrap_err();
    assert!(err.is_fatal());

    // 写入任务停止后，后续写入明确失败
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while service.is_writer_running() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!service.is_writer_running());

    let third = record(&clock, "Carol", "say", "third");
    assert!(matches!(service.store(third).await, Err(AppError::ChannelError(_))));
    assert!(service.ingest_sender().send(record(&clock, "D", "say", "x")).await.is_err());

    let store = service.store_handle();
    let report = service.shutdown().await.unwrap();
    assert!(report.failed);
    assert_eq!(store.len().unwrap(), 1);
    assert_eq!(store.load(first.timestamp).unwrap(), Some(first));
    println!("✅ 重复时间戳停止写入测试通过");
}

#[test]
fn test_index_rebuild_concurrent_with_reads() {
    let dir = temp_dir("concurrent");
    let _cleanup = scopeguard::guard(dir.clone(), |d| {
        let _ = std::fs::remove_dir_all(d);
    });

    let store = Arc::new(LogStore::open(&dir, 4).unwrap());
    let index = Arc::new(LogIndex::open_builtin(&dir, "category", "category", 4).unwrap());
    let clock = MonotonicClock::new();
    let records: Vec<_> = (0..2000)
        .map(|i| record(&clock, "a", if i % 4 == 0 { category::UNPARSED } else { "say" }, "x"))
        .collect();
    store.store_batch(&records).unwrap();

    let reader = {
        let index = index.clone();
        std::thread::spawn(move || {
            for _ in 0..20 {
                // 读取要么看到重建前的空索引，要么看到完整结果
                let n = index.query(category::UNPARSED).unwrap().len();
                assert!(n == 0 || n == 500, "partial index visible: {}", n);
                std::thread::sleep(Duration::from_millis(1));
            }
        })
    };

    assert_eq!(index.rebuild(&store).unwrap(), 2000);
    reader.join().unwrap();
    assert_eq!(index.query(category::UNPARSED).unwrap().len(), 500);
}

#[test]
fn test_index_rebuild_concurrent_with_index_writes() {
    let dir = temp_dir("rebuild_writes");
    let _cleanup = scopeguard::guard(dir.clone(), |d| {
        let _ = std::fs::remove_dir_all(d);
    });

    let store = Arc::new(LogStore::open(&dir, 4).unwrap());
    let index = Arc::new(LogIndex::open_builtin(&dir, "actor", "actor", 4).unwrap());
    let clock = Arc::new(MonotonicClock::new());

    let writer = {
        let (store, index, clock) = (store.clone(), index.clone(), clock.clone());
        std::thread::spawn(move || {
            for _ in 0..40 {
                let batch: Vec<_> = (0..25)
                    .map(|i| record(&clock, ["Alice", "Bob", ""][i % 3], "say", "x"))
                    .collect();
                store.store_batch(&batch).unwrap();
                index.store_batch(&batch).unwrap();
            }
        })
    };

    let rebuilder = {
        let (store, index) = (store.clone(), index.clone());
        std::thread::spawn(move || {
            for _ in 0..10 {
                index.rebuild(&store).unwrap();
                std::thread::sleep(Duration::from_millis(2));
            }
        })
    };

    writer.join().unwrap();
    rebuilder.join().unwrap();

    assert_eq!(store.len().unwrap(), 1000);
    assert_index_matches_store(&index, &store);
    println!("✅ 重建与索引写入并发测试通过");
}

#[tokio::test]
async fn test_rebuild_while_writer_feeds_index() {
    let dir = temp_dir("rebuild_service");
    let _cleanup = scopeguard::guard(dir.clone(), |d| {
        let _ = std::fs::remove_dir_all(d);
    });

    let service = LogService::open(&storage(&dir), "xiv", &indices()).unwrap();
    let index = service.index("actor").unwrap();
    let store = service.store_handle();

    let tx = service.ingest_sender();
    let feeder = tokio::spawn(async move {
        let clock = MonotonicClock::new();
        for i in 0..600 {
            tx.send(record(&clock, ["Alice", "Bob", ""][i % 3], "say", "x")).await.unwrap();
            if i % 50 == 0 {
                tokio::task::yield_now().await;
            }
        }
    });

    for _ in 0..5 {
        service.rebuild_index("actor").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    feeder.await.unwrap();

    let report = service.shutdown().await.unwrap();
    assert_eq!(report.records_written, 600);
    assert_eq!(report.index_failures, 0);
    assert_index_matches_store(&index, &store);
    println!("✅ 写入任务运行中重建索引测试通过");
}
