//! 主存储：以单调时间戳为主键的 SQLite 日志表
//!
//! 写入路径由 `LogService` 的单一写入任务串行化；读取通过连接池并发进行（WAL 模式）。

use crate::mlcommon::error::{AppError, Result};
use crate::mlcommon::models::{LogRecord, Timestamp};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, instrument, warn};

// 数据库连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;

/// 主存储文件名
pub const RECORDS_FILE: &str = "records.db";

/// 全表扫描时每页读取的记录数
const SCAN_PAGE_SIZE: usize = 512;

const SELECT_COLUMNS: &str =
    "ts, collector, host, pid, application, domain, user_name, actor, category, message, raw";

/// 创建带 WAL 与性能参数的连接池，主存储和索引共用
pub(crate) fn open_pool(db_path: &Path, pool_size: u32) -> Result<DbPool> {
    // 确保父目录存在，重复创建是幂等的
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch("
            PRAGMA journal_mode = WAL;          -- 读写并发
            PRAGMA synchronous = FULL;          -- 日志记录要求提交即落盘
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        ")
    });

    let pool = Pool::builder()
        .max_size(pool_size.max(1))
        .build(manager)?;
    Ok(pool)
}

/// 把插入错误映射为领域错误：主键冲突即重复时间戳
fn map_insert_error(e: rusqlite::Error, ts: i64) -> AppError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation => {
            AppError::DuplicateKey(ts)
        }
        _ => AppError::SqliteError(e),
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<LogRecord> {
    Ok(LogRecord {
        timestamp: Timestamp(row.get(0)?),
        collector: row.get(1)?,
        host: row.get(2)?,
        pid: row.get(3)?,
        application: row.get(4)?,
        domain: row.get(5)?,
        user: row.get(6)?,
        actor: row.get(7)?,
        category: row.get(8)?,
        message: row.get(9)?,
        raw_payload: row.get(10)?,
    })
}

fn insert_record(conn: &rusqlite::Connection, record: &LogRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO records (
            ts, collector, host, pid, application, domain, user_name, actor, category, message, raw
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            record.timestamp.0,
            record.collector,
            record.host,
            record.pid,
            record.application,
            record.domain,
            record.user,
            record.actor,
            record.category,
            record.message,
            record.raw_payload,
        ],
    )
    .map_err(|e| map_insert_error(e, record.timestamp.0))?;
    Ok(())
}

/// 主日志存储
#[derive(Debug)]
pub struct LogStore {
    pool: DbPool,
    path: PathBuf,
    disposed: AtomicBool,
}

impl LogStore {
    /// 在数据源目录下打开（或创建）主存储
    #[instrument(skip(dir), fields(dir = %dir.as_ref().display()), err)]
    pub fn open<P: AsRef<Path>>(dir: P, pool_size: u32) -> Result<Self> {
        let path = dir.as_ref().join(RECORDS_FILE);
        let pool = open_pool(&path, pool_size)?;

        let store = Self {
            pool,
            path,
            disposed: AtomicBool::new(false),
        };
        store.init_db()?;

        info!(target: "store", log_type = "module", db_path = %store.path.display(), "日志主存储已打开");
        Ok(store)
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                ts INTEGER PRIMARY KEY,
                collector TEXT NOT NULL,
                host TEXT NOT NULL,
                pid INTEGER NOT NULL,
                application TEXT NOT NULL,
                domain TEXT NOT NULL,
                user_name TEXT NOT NULL,
                actor TEXT NOT NULL,
                category TEXT NOT NULL,
                message TEXT NOT NULL,
                raw BLOB
            )",
            [],
        )?;
        debug!(decision = "records_table_ready", "主存储表创建或确认存在");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn pool(&self) -> &DbPool {
        &self.pool
    }

    fn ensure_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(AppError::StoreDisposed(self.path.display().to_string()));
        }
        Ok(())
    }

    /// 写入一条记录；时间戳已存在时返回 `DuplicateKey`，存储保持不变
    pub fn store(&self, record: &LogRecord) -> Result<()> {
        self.ensure_open()?;
        let conn = self.pool.get()?;
        insert_record(&conn, record)
    }

    /// 在一个事务中写入一批记录，任一失败则整批回滚
    #[instrument(skip_all, fields(record_count = records.len()), err)]
    pub fn store_batch(&self, records: &[LogRecord]) -> Result<usize> {
        self.ensure_open()?;
        if records.is_empty() {
            return Ok(0);
        }

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        for record in records {
            if let Err(e) = insert_record(&tx, record) {
                // tx 析构时自动回滚
                warn!(
                    target: "store",
                    timestamp = record.timestamp.0,
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "批量写入失败，事务回滚"
                );
                return Err(e);
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// 按时间戳读取
    pub fn load(&self, ts: Timestamp) -> Result<Option<LogRecord>> {
        let conn = self.pool.get()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM records WHERE ts = ?1", SELECT_COLUMNS),
                params![ts.0],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// 按时间戳升序扫描全部记录，分页读取，不长期占用连接
    pub fn scan(&self) -> ScanIter {
        ScanIter::new(self.pool.clone(), i64::MIN)
    }

    /// 从指定时间戳（含）开始扫描
    pub fn scan_from(&self, from: Timestamp) -> ScanIter {
        ScanIter::new(self.pool.clone(), from.0)
    }

    pub fn len(&self) -> Result<u64> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// 已存储的最大时间戳，用于重启后为单调时钟定起点
    pub fn last_timestamp(&self) -> Result<Option<Timestamp>> {
        let conn = self.pool.get()?;
        let ts: Option<i64> = conn.query_row("SELECT MAX(ts) FROM records", [], |row| row.get(0))?;
        Ok(ts.map(Timestamp))
    }

    /// 最新的 n 条记录，按时间戳升序返回
    pub fn latest(&self, n: usize) -> Result<Vec<LogRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM records ORDER BY ts DESC LIMIT ?1",
            SELECT_COLUMNS
        ))?;
        let mut records = stmt
            .query_map(params![n as i64], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        records.reverse();
        Ok(records)
    }

    /// 刷新 WAL 并拒绝后续写入
    #[instrument(skip(self), fields(db_path = %self.path.display()), err)]
    pub fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let conn = self.pool.get()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        info!(target: "store", log_type = "module", "日志主存储已关闭");
        Ok(())
    }
}

/// 有限、可重启的升序扫描迭代器
pub struct ScanIter {
    pool: DbPool,
    next_ts: Option<i64>,
    page: VecDeque<LogRecord>,
}

impl ScanIter {
    fn new(pool: DbPool, start: i64) -> Self {
        Self {
            pool,
            next_ts: Some(start),
            page: VecDeque::new(),
        }
    }

    fn fetch_page(&mut self, start: i64) -> Result<()> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM records WHERE ts >= ?1 ORDER BY ts LIMIT ?2",
            SELECT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![start, SCAN_PAGE_SIZE as i64], row_to_record)?;
        for row in rows {
            self.page.push_back(row?);
        }

        self.next_ts = if self.page.len() < SCAN_PAGE_SIZE {
            None
        } else {
            self.page.back().and_then(|r| r.timestamp.0.checked_add(1))
        };
        Ok(())
    }
}

impl Iterator for ScanIter {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() {
            let start = self.next_ts?;
            if let Err(e) = self.fetch_page(start) {
                self.next_ts = None;
                self.page.clear();
                return Some(Err(e));
            }
        }
        self.page.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mlcommon::models::category;

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("memlog_store_{}_{}_{}", tag, std::process::id(), nanos))
    }

    fn record(ts: i64, actor: &str, message: &str) -> LogRecord {
        LogRecord {
            timestamp: Timestamp(ts),
            collector: "test".to_string(),
            host: "localhost".to_string(),
            pid: 42,
            application: "app".to_string(),
            domain: String::new(),
            user: "tester".to_string(),
            actor: actor.to_string(),
            category: category::TEXT.to_string(),
            message: message.to_string(),
            raw_payload: Some(message.as_bytes().to_vec()),
        }
    }

    #[test]
    fn test_store_and_load() {
        let dir = temp_dir("load");
        let _cleanup = scopeguard::guard(dir.clone(), |d| {
            let _ = std::fs::remove_dir_all(d);
        });
        let store = LogStore::open(&dir, 2).unwrap();

        let r = record(1_000, "alice", "hello");
        store.store(&r).unwrap();

        assert_eq!(store.load(Timestamp(1_000)).unwrap(), Some(r));
        assert_eq!(store.load(Timestamp(1_001)).unwrap(), None);
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.last_timestamp().unwrap(), Some(Timestamp(1_000)));
    }

    #[test]
    fn test_duplicate_timestamp_rejected() {
        let dir = temp_dir("dup");
        let _cleanup = scopeguard::guard(dir.clone(), |d| {
            let _ = std::fs::remove_dir_all(d);
        });
        let store = LogStore::open(&dir, 2).unwrap();

        let first = record(5, "alice", "first");
        store.store(&first).unwrap();
        let err = store.store(&record(5, "bob", "second")).unwrap_err();
        assert!(matches!(err, AppError::DuplicateKey(5)));
        assert!(err.is_fatal());

        // 存储保持不变
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.load(Timestamp(5)).unwrap(), Some(first));
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let dir = temp_dir("batch");
        let _cleanup = scopeguard::guard(dir.clone(), |d| {
            let _ = std::fs::remove_dir_all(d);
        });
        let store = LogStore::open(&dir, 2).unwrap();
        store.store(&record(3, "a", "existing")).unwrap();

        let batch = vec![record(1, "a", "x"), record(2, "a", "y"), record(3, "a", "dup")];
        assert!(matches!(store.store_batch(&batch), Err(AppError::DuplicateKey(3))));
        assert_eq!(store.len().unwrap(), 1);

        assert_eq!(store.store_batch(&batch[..2]).unwrap(), 2);
        assert_eq!(store.len().unwrap(), 3);
    }

    #[test]
    fn test_scan_spans_multiple_pages_in_order() {
        let dir = temp_dir("scan");
        let _cleanup = scopeguard::guard(dir.clone(), |d| {
            let _ = std::fs::remove_dir_all(d);
        });
        let store = LogStore::open(&dir, 2).unwrap();

        let total = SCAN_PAGE_SIZE * 2 + 7;
        // 逆序写入，扫描仍需升序
        let records: Vec<_> = (0..total as i64).rev().map(|i| record(i * 10, "a", "m")).collect();
        store.store_batch(&records).unwrap();

        let scanned: Vec<_> = store.scan().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(scanned.len(), total);
        assert!(scanned.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

        // 可重启：再次扫描得到相同结果
        let again: Vec<_> = store.scan().map(|r| r.unwrap().timestamp).collect();
        assert_eq!(again, scanned.iter().map(|r| r.timestamp).collect::<Vec<_>>());

        let tail: Vec<_> = store.scan_from(Timestamp(((total as i64) - 3) * 10)).map(|r| r.unwrap()).collect();
        assert_eq!(tail.len(), 3);

        let latest = store.latest(2).unwrap();
        assert_eq!(latest.len(), 2);
        assert!(latest[0].timestamp < latest[1].timestamp);
        assert_eq!(latest[1].timestamp, Timestamp((total as i64 - 1) * 10));
    }

    #[test]
    fn test_dispose_rejects_writes() {
        let dir = temp_dir("dispose");
        let _cleanup = scopeguard::guard(dir.clone(), |d| {
            let _ = std::fs::remove_dir_all(d);
        });
        let store = LogStore::open(&dir, 2).unwrap();
        store.store(&record(1, "a", "before")).unwrap();
        store.dispose().unwrap();
        store.dispose().unwrap();

        assert!(matches!(store.store(&record(2, "a", "after")), Err(AppError::StoreDisposed(_))));
        // 读取不受影响
        assert!(store.load(Timestamp(1)).unwrap().is_some());
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = temp_dir("reopen");
        let _cleanup = scopeguard::guard(dir.clone(), |d| {
            let _ = std::fs::remove_dir_all(d);
        });
        {
            let store = LogStore::open(&dir, 2).unwrap();
            store.store(&record(7, "a", "persisted")).unwrap();
            store.dispose().unwrap();
        }
        let store = LogStore::open(&dir, 2).unwrap();
        assert_eq!(store.load(Timestamp(7)).unwrap().map(|r| r.message), Some("persisted".to_string()));
    }
}
