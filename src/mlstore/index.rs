//! 二级索引：由键函数从记录派生的 (键, 时间戳) 投影
//!
//! 复合键为 `键 + U+001F + 16 位十六进制时间戳`，按字节序即按 (键, 时间戳) 排序，
//! 因此前缀查询就是一次范围扫描。索引可以随时从主存储完整重建。

use crate::mlcommon::error::{AppError, Result};
use crate::mlcommon::models::{LogRecord, Timestamp};
use crate::mlstore::store::{open_pool, DbPool, LogStore};
use rusqlite::params;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, instrument, warn};

/// 键函数：返回 None 表示该记录不进入索引
pub type KeyFn = Arc<dyn Fn(&LogRecord) -> Option<String> + Send + Sync>;

/// 复合键中分隔键与时间戳的字符
pub const KEY_SEPARATOR: char = '\u{1F}';

/// 重建时每次批量插入的记录数
const REBUILD_CHUNK: usize = 512;

/// 索引文件所在的子目录
pub const INDEX_DIR: &str = "index";

/// 非空字段才产生索引键
fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// 按名称取内置键函数
pub fn key_of_by_name(name: &str) -> Option<KeyFn> {
    let key_of: KeyFn = match name {
        "actor" => Arc::new(|r: &LogRecord| non_empty(&r.actor)),
        "category" => Arc::new(|r: &LogRecord| non_empty(&r.category)),
        "application" => Arc::new(|r: &LogRecord| non_empty(&r.application)),
        "user" => Arc::new(|r: &LogRecord| non_empty(&r.user)),
        "host" => Arc::new(|r: &LogRecord| non_empty(&r.host)),
        "collector" => Arc::new(|r: &LogRecord| non_empty(&r.collector)),
        "domain" => Arc::new(|r: &LogRecord| non_empty(&r.domain)),
        _ => return None,
    };
    Some(key_of)
}

/// 键中出现的分隔符替换为空格，保证复合键可以无歧义地切分
fn sanitize_key(key: &str) -> String {
    key.replace(KEY_SEPARATOR, " ")
}

/// 时间戳编码：翻转符号位后按大端十六进制输出，字典序与数值序一致
fn encode_timestamp(ts: Timestamp) -> String {
    format!("{:016x}", (ts.0 as u64) ^ (1u64 << 63))
}

fn decode_timestamp(hex: &str) -> Option<Timestamp> {
    let raw = u64::from_str_radix(hex, 16).ok()?;
    Some(Timestamp((raw ^ (1u64 << 63)) as i64))
}

/// 生成复合键
pub fn composite_key(key: &str, ts: Timestamp) -> String {
    format!("{}{}{}", sanitize_key(key), KEY_SEPARATOR, encode_timestamp(ts))
}

/// 拆分复合键
pub fn split_composite_key(ikey: &str) -> Option<(&str, Timestamp)> {
    let (key, ts) = ikey.rsplit_once(KEY_SEPARATOR)?;
    Some((key, decode_timestamp(ts)?))
}

/// 单个二级索引
pub struct LogIndex {
    name: String,
    key_of: KeyFn,
    pool: DbPool,
    path: PathBuf,
    // 写入与重建互斥，重建期间不会交错写入
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for LogIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogIndex")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

impl LogIndex {
    /// 在数据源目录的 `index/` 下打开（或创建）索引文件
    #[instrument(skip(source_dir, key_of), fields(dir = %source_dir.as_ref().display()), err)]
    pub fn open<P: AsRef<Path>>(source_dir: P, name: &str, key_of: KeyFn, pool_size: u32) -> Result<Self> {
        let path = source_dir.as_ref().join(INDEX_DIR).join(format!("{}.db", name));
        let pool = open_pool(&path, pool_size)?;

        {
            let conn = pool.get()?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS entries (
                    ikey TEXT PRIMARY KEY,
                    ts INTEGER NOT NULL
                ) WITHOUT ROWID",
                [],
            )?;
        }

        info!(target: "index", log_type = "module", index = name, db_path = %path.display(), "二级索引已打开");
        Ok(Self {
            name: name.to_string(),
            key_of,
            pool,
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// 按内置键函数名打开
    pub fn open_builtin<P: AsRef<Path>>(source_dir: P, name: &str, key: &str, pool_size: u32) -> Result<Self> {
        let key_of = key_of_by_name(key)
            .ok_or_else(|| AppError::ConfigError(format!("未知的键函数: {}", key)))?;
        Self::open(source_dir, name, key_of, pool_size)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key_of(&self, record: &LogRecord) -> Option<String> {
        (self.key_of)(record)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| AppError::DatabaseError(format!("索引 {} 的写锁已中毒", self.name)))
    }

    /// 写入一条记录的索引项；键函数返回 None 时不写入，返回是否写入
    ///
    /// 使用 INSERT OR REPLACE，同一记录重复写入是幂等的。
    pub fn store(&self, record: &LogRecord) -> Result<bool> {
        let Some(key) = self.key_of(record) else {
            return Ok(false);
        };
        let _guard = self.lock()?;
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO entries (ikey, ts) VALUES (?1, ?2)",
            params![composite_key(&key, record.timestamp), record.timestamp.0],
        )?;
        Ok(true)
    }

    /// 在一个事务中写入一批记录的索引项
    pub fn store_batch(&self, records: &[LogRecord]) -> Result<usize> {
        let _guard = self.lock()?;
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let written = Self::insert_all(&tx, &self.key_of, records.iter())?;
        tx.commit()?;
        Ok(written)
    }

    fn insert_all<'a>(
        conn: &rusqlite::Connection,
        key_of: &KeyFn,
        records: impl Iterator<Item = &'a LogRecord>,
    ) -> Result<usize> {
        let mut stmt = conn.prepare_cached("INSERT OR REPLACE INTO entries (ikey, ts) VALUES (?1, ?2)")?;
        let mut written = 0;
        for record in records {
            if let Some(key) = key_of(record) {
                stmt.execute(params![composite_key(&key, record.timestamp), record.timestamp.0])?;
                written += 1;
            }
        }
        Ok(written)
    }

    /// 前缀查询：返回键以 `prefix` 开头的全部时间戳，按 (键, 时间戳) 升序
    ///
    /// 空前缀返回全部索引项。
    pub fn query(&self, prefix: &str) -> Result<Vec<Timestamp>> {
        self.query_range(sanitize_key(prefix))
    }

    fn query_range(&self, lower: String) -> Result<Vec<Timestamp>> {
        let mut upper = lower.clone();
        upper.push(char::MAX);

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare_cached(
            "SELECT ts FROM entries WHERE ikey >= ?1 AND ikey < ?2 ORDER BY ikey",
        )?;
        let timestamps = stmt
            .query_map(params![lower, upper], |row| row.get::<_, i64>(0))?
            .map(|r| r.map(Timestamp))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(timestamps)
    }

    /// 精确键查询
    pub fn query_exact(&self, key: &str) -> Result<Vec<Timestamp>> {
        let mut prefix = sanitize_key(key);
        prefix.push(KEY_SEPARATOR);
        self.query_range(prefix)
    }

    /// 前缀查询并回表读取记录；主存储中不存在的时间戳被跳过
    pub fn query_records(&self, store: &LogStore, prefix: &str) -> Result<Vec<LogRecord>> {
        let mut records = Vec::new();
        for ts in self.query(prefix)? {
            match store.load(ts)? {
                Some(record) => records.push(record),
                None => warn!(
                    target: "index",
                    index = %self.name,
                    timestamp = ts.0,
                    "索引项在主存储中不存在，建议重建索引"
                ),
            }
        }
        Ok(records)
    }

    /// 全部索引项，按复合键升序
    pub fn entries(&self) -> Result<Vec<(String, Timestamp)>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT ikey, ts FROM entries ORDER BY ikey")?;
        let entries = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, Timestamp(row.get(1)?))))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn len(&self) -> Result<u64> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// 清空索引后按主存储全量重建，整个过程在一个事务内完成
    #[instrument(skip(self, store), fields(index = %self.name), ret, err)]
    pub fn rebuild(&self, store: &LogStore) -> Result<usize> {
        let _guard = self.lock()?;
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM entries", [])?;

        let mut written = 0;
        let mut chunk = Vec::with_capacity(REBUILD_CHUNK);
        for record in store.scan() {
            chunk.push(record?);
            if chunk.len() >= REBUILD_CHUNK {
                written += Self::insert_all(&tx, &self.key_of, chunk.iter())?;
                chunk.clear();
            }
        }
        written += Self::insert_all(&tx, &self.key_of, chunk.iter())?;
        tx.commit()?;

        info!(target: "index", log_type = "module", index = %self.name, entries = written, "索引重建完成");
        Ok(written)
    }
}
