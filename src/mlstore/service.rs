//! 日志服务：单一写入任务串行化主存储与全部二级索引的写入
//!
//! 采集器通过 `ingest_sender()` 取得的通道投递记录；写入任务把通道里已到达的记录
//! 合并为一个事务提交，再更新各索引。主存储写入失败时写入任务停止并关闭通道，
//! 上游采集器随之退出，不会在存储不可用时继续静默丢弃数据。

use crate::mlcommon::config::{IndexSpec, StorageConfig};
use crate::mlcommon::error::{AppError, Result};
use crate::mlcommon::models::{LogRecord, Timestamp};
use crate::mlstore::index::LogIndex;
use crate::mlstore::store::LogStore;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, instrument, warn, Instrument};

/// 写入统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterReport {
    pub records_written: u64,
    pub batches_committed: u64,
    pub index_failures: u64,
    /// 主存储写入失败时随事务回滚、未能落盘的通道记录数
    pub records_dropped: u64,
    /// 写入任务因主存储失败而停止
    pub failed: bool,
}

#[derive(Debug, Default)]
struct WriterStats {
    records_written: AtomicU64,
    batches_committed: AtomicU64,
    index_failures: AtomicU64,
    records_dropped: AtomicU64,
    failed: AtomicBool,
}

impl WriterStats {
    fn snapshot(&self) -> WriterReport {
        WriterReport {
            records_written: self.records_written.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            index_failures: self.index_failures.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// 需要确认结果的写入命令
#[derive(Debug)]
enum WriteCommand {
    Store {
        record: LogRecord,
        ack: oneshot::Sender<Result<()>>,
    },
}

/// 在阻塞线程池中执行存储操作，并保留当前 span 上下文
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let parent_span = tracing::Span::current();
    task::spawn_blocking(move || parent_span.in_scope(f))
        .await
        .map_err(|join_error| AppError::DatabaseError(format!("存储任务 panic: {:?}", join_error)))?
}

/// 写入队列处理器
struct LogWriteProcessor {
    records: mpsc::Receiver<LogRecord>,
    commands: mpsc::Receiver<WriteCommand>,
    store: Arc<LogStore>,
    indices: Arc<Vec<Arc<LogIndex>>>,
    batch_size: usize,
    stats: Arc<WriterStats>,
}

impl LogWriteProcessor {
    async fn run(mut self) -> WriterReport {
        info!(target: "service", log_type = "module", batch_size = self.batch_size, "日志写入任务已启动 (串行模式)");

        let mut records_open = true;
        let mut commands_open = true;
        let mut failed = false;

        while records_open || commands_open {
            tokio::select! {
                biased;

                command = self.commands.recv(), if commands_open => match command {
                    Some(WriteCommand::Store { record, ack }) => {
                        let result = self.write(vec![record]).await.map(|_| ());
                        let stop = result.is_err();
                        let _ = ack.send(result);
                        if stop {
                            failed = true;
                            break;
                        }
                    }
                    None => commands_open = false,
                },

                record = self.records.recv(), if records_open => match record {
                    Some(first) => {
                        // 合并通道中已经到达的记录
                        let mut batch = vec![first];
                        while batch.len() < self.batch_size {
                            match self.records.try_recv() {
                                Ok(record) => batch.push(record),
                                Err(_) => break,
                            }
                        }
                        let batch_len = batch.len();
                        let first_timestamp = batch.first().map(|r| r.timestamp.0);
                        let last_timestamp = batch.last().map(|r| r.timestamp.0);
                        if let Err(e) = self.write(batch).await {
                            // 整批回滚，记下范围以便事后从其他来源补齐
                            self.stats.records_dropped.fetch_add(batch_len as u64, Ordering::Relaxed);
                            error!(
                                target: "service",
                                log_type = "module",
                                dropped_records = batch_len,
                                first_timestamp,
                                last_timestamp,
                                error.summary = e.get_error_type_summary(),
                                error.details = %e,
                                "主存储写入失败，本批记录未落盘，写入任务停止"
                            );
                            failed = true;
                            break;
                        }
                    }
                    None => records_open = false,
                },
            }
        }

        // 关闭接收端，上游的 send 随即失败
        self.records.close();
        self.commands.close();

        let store = self.store.clone();
        if let Err(e) = run_blocking(move || store.dispose()).await {
            warn!(
                target: "service",
                { error.summary = e.get_error_type_summary(), error.details = %e },
                "关闭主存储失败"
            );
        }

        self.stats.failed.store(failed, Ordering::Relaxed);
        let report = self.stats.snapshot();
        info!(
            target: "service",
            log_type = "module",
            records_written = report.records_written,
            batches_committed = report.batches_committed,
            index_failures = report.index_failures,
            records_dropped = report.records_dropped,
            failed,
            "日志写入任务已停止"
        );
        report
    }

    #[instrument(name = "log_write_batch", skip_all, fields(record_count = batch.len()))]
    async fn write(&self, batch: Vec<LogRecord>) -> Result<usize> {
        let store = self.store.clone();
        let indices = self.indices.clone();
        let stats = self.stats.clone();
        run_blocking(move || Self::write_blocking(&store, &indices, &stats, &batch)).await
    }

    fn write_blocking(
        store: &LogStore,
        indices: &[Arc<LogIndex>],
        stats: &WriterStats,
        batch: &[LogRecord],
    ) -> Result<usize> {
        let written = store.store_batch(batch)?;
        stats.records_written.fetch_add(written as u64, Ordering::Relaxed);
        stats.batches_committed.fetch_add(1, Ordering::Relaxed);

        // 索引只是投影，失败不影响主存储，可通过重建恢复
        for index in indices {
            if let Err(e) = index.store_batch(batch) {
                stats.index_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "service",
                    index = index.name(),
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "索引写入失败，需要重建"
                );
            }
        }

        debug!(decision = "batch_committed", record_count = written, "批量写入完成");
        Ok(written)
    }
}

/// 日志服务
pub struct LogService {
    source_name: String,
    store: Arc<LogStore>,
    indices: Arc<Vec<Arc<LogIndex>>>,
    record_tx: mpsc::Sender<LogRecord>,
    command_tx: mpsc::Sender<WriteCommand>,
    writer: JoinHandle<WriterReport>,
    stats: Arc<WriterStats>,
}

impl LogService {
    /// 打开数据源的主存储与配置中的全部索引，并启动写入任务
    pub fn open(storage: &StorageConfig, source_name: &str, index_specs: &[IndexSpec]) -> Result<Self> {
        let dir = storage.source_dir(source_name);
        let store = LogStore::open(&dir, storage.pool_size)?;

        let mut indices = Vec::with_capacity(index_specs.len());
        for spec in index_specs {
            indices.push(LogIndex::open_builtin(&dir, &spec.name, &spec.key, storage.pool_size)?);
        }

        Ok(Self::start(source_name, store, indices, storage.queue_size, storage.batch_size))
    }

    /// 用已打开的存储启动写入任务，需要在 tokio 运行时中调用
    pub fn start(
        source_name: &str,
        store: LogStore,
        indices: Vec<LogIndex>,
        queue_size: usize,
        batch_size: usize,
    ) -> Self {
        let store = Arc::new(store);
        let indices = Arc::new(indices.into_iter().map(Arc::new).collect::<Vec<_>>());
        let stats = Arc::new(WriterStats::default());

        let (record_tx, records) = mpsc::channel(queue_size.max(1));
        let (command_tx, commands) = mpsc::channel(queue_size.max(1));

        let processor = LogWriteProcessor {
            records,
            commands,
            store: store.clone(),
            indices: indices.clone(),
            batch_size: batch_size.max(1),
            stats: stats.clone(),
        };
        let span = tracing::info_span!("log_writer", source = %source_name);
        let writer = tokio::spawn(processor.run().instrument(span));

        Self {
            source_name: source_name.to_string(),
            store,
            indices,
            record_tx,
            command_tx,
            writer,
            stats,
        }
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// 采集器使用的记录通道
    pub fn ingest_sender(&self) -> mpsc::Sender<LogRecord> {
        self.record_tx.clone()
    }

    pub fn store_handle(&self) -> Arc<LogStore> {
        self.store.clone()
    }

    pub fn index(&self, name: &str) -> Option<Arc<LogIndex>> {
        self.indices.iter().find(|index| index.name() == name).cloned()
    }

    pub fn index_names(&self) -> Vec<String> {
        self.indices.iter().map(|index| index.name().to_string()).collect()
    }

    pub fn stats(&self) -> WriterReport {
        self.stats.snapshot()
    }

    pub fn is_writer_running(&self) -> bool {
        !self.writer.is_finished()
    }

    /// 写入一条记录并等待落盘结果
    pub async fn store(&self, record: LogRecord) -> Result<()> {
        let (ack, result) = oneshot::channel();
        self.command_tx
            .send(WriteCommand::Store { record, ack })
            .await
            .map_err(|_| AppError::ChannelError("日志写入任务已停止".to_string()))?;
        result
            .await
            .map_err(|_| AppError::ChannelError("日志写入任务未返回结果".to_string()))?
    }

    pub async fn load(&self, ts: Timestamp) -> Result<Option<LogRecord>> {
        let store = self.store.clone();
        run_blocking(move || store.load(ts)).await
    }

    pub async fn latest(&self, n: usize) -> Result<Vec<LogRecord>> {
        let store = self.store.clone();
        run_blocking(move || store.latest(n)).await
    }

    fn require_index(&self, name: &str) -> Result<Arc<LogIndex>> {
        self.index(name).ok_or_else(|| AppError::IndexNotFound(name.to_string()))
    }

    /// 索引前缀查询，只返回时间戳
    pub async fn query_timestamps(&self, index: &str, prefix: &str) -> Result<Vec<Timestamp>> {
        let index = self.require_index(index)?;
        let prefix = prefix.to_string();
        run_blocking(move || index.query(&prefix)).await
    }

    /// 索引前缀查询并回表
    pub async fn query(&self, index: &str, prefix: &str) -> Result<Vec<LogRecord>> {
        let index = self.require_index(index)?;
        let store = self.store.clone();
        let prefix = prefix.to_string();
        run_blocking(move || index.query_records(&store, &prefix)).await
    }

    /// 从主存储重建单个索引
    #[instrument(skip(self), err)]
    pub async fn rebuild_index(&self, name: &str) -> Result<usize> {
        let index = self.require_index(name)?;
        let store = self.store.clone();
        run_blocking(move || index.rebuild(&store)).await
    }

    /// 并行重建全部索引
    pub async fn rebuild_all(&self) -> Result<Vec<(String, usize)>> {
        let tasks = self.indices.iter().map(|index| {
            let index = index.clone();
            let store = self.store.clone();
            async move {
                let name = index.name().to_string();
                let count = run_blocking(move || index.rebuild(&store)).await?;
                Ok::<_, AppError>((name, count))
            }
        });
        futures::future::try_join_all(tasks).await
    }

    /// 关闭服务：等待所有发送端释放、队列排空、主存储刷新后返回统计
    ///
    /// 采集器持有的发送端需要先行停止，否则这里会一直等待。
    pub async fn shutdown(self) -> Result<WriterReport> {
        let Self { record_tx, command_tx, writer, .. } = self;
        drop(record_tx);
        drop(command_tx);
        writer
            .await
            .map_err(|e| AppError::ChannelError(format!("日志写入任务异常退出: {}", e)))
    }
}
