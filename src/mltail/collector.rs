//! 采集循环
//!
//! 状态机：定位进程 → 扫描缓冲区 → 尾随读取；进程退出或读取失败回到定位，
//! 任何阶段收到取消信号都在一个等待间隔内进入 Stopped。

use crate::mlcommon::clock::MonotonicClock;
use crate::mlcommon::config::{constants::DEFAULT_CHANNEL_CAPACITY, AnalyzerKind, CollectorConfig};
use crate::mlcommon::error::Result;
use crate::mlcommon::models::LogRecord;
use crate::mltail::analyzer::{Analyzer, ChannelCodeAnalyzer, PlainAnalyzer};
use crate::mltail::cursor::TailCursor;
use crate::mltail::factory::{RecordFactory, SourceContext};
use crate::mltail::framing::DelimitedFramer;
use crate::mltail::locator::{LocateOutcome, ProcessLocator};
use crate::mltail::scanner::{RegionHandle, RegionScanner, ScanOutcome};
use crate::mltail::source::{ProcessFinder, RegionProbe};
use crate::mltail::tailer::{PollOutcome, RingTailer};
use crate::mltail::{run_blocking, wait_or_cancel};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    LocatingProcess,
    ScanningRegion,
    Tailing,
    Stopped,
}

/// 采集循环退出时的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorReport {
    pub records_emitted: u64,
    pub sessions: u64,
    pub resets: u64,
    pub data_loss_events: u64,
    pub lost_bytes: u64,
}

enum TailExit {
    /// 进程退出或区域失效，重新定位
    Relocate,
    Stopped,
}

pub struct CollectorLoop {
    name: String,
    locator: ProcessLocator,
    scanner: RegionScanner,
    tailer: RingTailer,
    factory: RecordFactory,
    poll_interval: Duration,
    channel_capacity: usize,
    state_tx: watch::Sender<CollectorState>,
    report: CollectorReport,
}

impl CollectorLoop {
    pub fn new(
        name: &str,
        locator: ProcessLocator,
        scanner: RegionScanner,
        tailer: RingTailer,
        factory: RecordFactory,
        poll_interval: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(CollectorState::LocatingProcess);
        Self {
            name: name.to_string(),
            locator,
            scanner,
            tailer,
            factory,
            poll_interval,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            state_tx,
            report: CollectorReport::default(),
        }
    }

    /// 采集器自身输出队列的容量，写入任务跟不上时采集器在此处等待
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// 按配置组装，进程查找与内存访问由调用方注入
    pub fn from_config(
        config: &CollectorConfig,
        finder: Arc<dyn ProcessFinder>,
        probe: Arc<dyn RegionProbe>,
        clock: Arc<MonotonicClock>,
    ) -> Self {
        let analyzer: Arc<dyn Analyzer> = match config.analyzer {
            AnalyzerKind::Plain => Arc::new(PlainAnalyzer),
            AnalyzerKind::ChannelCode => Arc::new(ChannelCodeAnalyzer),
        };
        let framer = Arc::new(DelimitedFramer::new(config.delimiter, config.max_entry_bytes));

        Self::new(
            &config.source_name,
            ProcessLocator::new(finder, config.locate_backoff()),
            RegionScanner::new(probe, config.region_retry_limit, config.region_backoff()),
            RingTailer::new(framer),
            RecordFactory::new(clock, analyzer, SourceContext::from_config(config)),
            config.poll_interval(),
        )
        .with_channel_capacity(config.channel_capacity)
    }

    pub fn subscribe(&self) -> watch::Receiver<CollectorState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: CollectorState) {
        self.state_tx.send_replace(state);
        debug!(decision = "collector_state", state = ?state, "采集器状态切换");
    }

    /// 在当前 tokio 运行时中启动
    ///
    /// 记录先进入容量为 `channel_capacity` 的专属队列，再由转发任务送入 `out`。
    pub fn spawn(self, out: mpsc::Sender<LogRecord>) -> CollectorHandle {
        let cancel = CancellationToken::new();
        let state_rx = self.subscribe();
        let channel_capacity = self.channel_capacity;
        let (queue, queue_rx) = mpsc::channel(channel_capacity);

        let span = tracing::info_span!("collector", name = %self.name);
        let forwarder = tokio::spawn(forward_records(queue_rx, out).instrument(span.clone()));
        let join = tokio::spawn(self.run(cancel.clone(), queue.clone()).instrument(span));

        CollectorHandle {
            cancel,
            state_rx,
            join,
            queue,
            channel_capacity,
            forwarder,
        }
    }

    /// 运行到被取消或下游通道关闭
    pub async fn run(mut self, cancel: CancellationToken, out: mpsc::Sender<LogRecord>) -> CollectorReport {
        let context = self.factory.context();
        info!(
            target: "collector",
            log_type = "module",
            name = %self.name,
            application = %context.application,
            host = %context.host,
            "采集器已启动"
        );

        loop {
            if out.is_closed() {
                warn!(target: "collector", name = %self.name, "日志写入通道已关闭，采集器停止");
                break;
            }
            self.set_state(CollectorState::LocatingProcess);
            let process = match self.locator.locate(&cancel).await {
                LocateOutcome::Found(process) => process,
                LocateOutcome::Stopped => break,
            };
            self.factory.set_pid(process.pid);

            self.set_state(CollectorState::ScanningRegion);
            let region = match self.scanner.scan(&process, &cancel).await {
                ScanOutcome::Found(region) => region,
                ScanOutcome::NotFound => continue,
                ScanOutcome::Stopped => break,
            };

            self.set_state(CollectorState::Tailing);
            match self.tail(&region, &cancel, &out).await {
                TailExit::Relocate => continue,
                TailExit::Stopped => break,
            }
        }

        self.set_state(CollectorState::Stopped);
        info!(
            target: "collector",
            log_type = "module",
            name = %self.name,
            records_emitted = self.report.records_emitted,
            sessions = self.report.sessions,
            data_loss_events = self.report.data_loss_events,
            "采集器已停止"
        );
        self.report
    }

    async fn tail(&mut self, region: &RegionHandle, cancel: &CancellationToken, out: &mpsc::Sender<LogRecord>) -> TailExit {
        let mut cursor = TailCursor::new(region.entry_pointer);
        self.report.sessions += 1;

        loop {
            if cancel.is_cancelled() {
                return TailExit::Stopped;
            }
            if out.is_closed() {
                warn!(target: "collector", name = %self.name, "日志写入通道已关闭，采集器停止");
                return TailExit::Stopped;
            }

            let (polled, returned) = match self.poll_blocking(region, cursor).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(
                        target: "collector",
                        pid = region.process.pid,
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                        "读取任务异常，重新定位"
                    );
                    return TailExit::Relocate;
                }
            };
            cursor = returned;

            match polled {
                Ok(PollOutcome::Idle) => {
                    if wait_or_cancel(cancel, self.poll_interval).await {
                        return TailExit::Stopped;
                    }
                }
                Ok(PollOutcome::Batch(batch)) => {
                    if batch.reset {
                        self.report.resets += 1;
                        info!(target: "collector", pid = region.process.pid, "缓冲区已重置，从起点重新读取");
                    }
                    if batch.lost > 0 {
                        self.report.data_loss_events += 1;
                        self.report.lost_bytes += batch.lost;
                        warn!(target: "collector", pid = region.process.pid, lost_bytes = batch.lost, "环形缓冲区被覆盖，存在数据丢失");
                        let record = self.factory.data_loss(batch.lost, batch.start);
                        if !self.emit(out, record).await {
                            return TailExit::Stopped;
                        }
                    }
                    // 已读取的一批全部投递完再响应取消，避免丢弃已消费的数据
                    for entry in &batch.entries {
                        let record = self.factory.build(entry);
                        if !self.emit(out, record).await {
                            return TailExit::Stopped;
                        }
                    }
                }
                Ok(PollOutcome::ProcessExited) => {
                    info!(target: "collector", pid = region.process.pid, "目标进程已退出，重新定位");
                    return TailExit::Relocate;
                }
                Err(e) => {
                    warn!(
                        target: "collector",
                        pid = region.process.pid,
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                        "读取进程内存失败，重新定位"
                    );
                    return TailExit::Relocate;
                }
            }
        }
    }

    /// 在阻塞线程池中执行一次轮询，游标随结果一起交还
    async fn poll_blocking(&self, region: &RegionHandle, mut cursor: TailCursor) -> Result<(Result<PollOutcome>, TailCursor)> {
        let tailer = self.tailer.clone();
        let region = region.clone();
        run_blocking(move || {
            let polled = tailer.poll(&region, &mut cursor);
            Ok((polled, cursor))
        })
        .await
    }

    async fn emit(&mut self, out: &mpsc::Sender<LogRecord>, record: LogRecord) -> bool {
        match out.send(record).await {
            Ok(()) => {
                self.report.records_emitted += 1;
                true
            }
            Err(_) => {
                warn!(target: "collector", name = %self.name, "日志写入通道已关闭，采集器停止");
                false
            }
        }
    }
}

/// 把采集器队列中的记录转发给写入任务；写入端关闭时立即退出，采集器随之停止
async fn forward_records(mut queue_rx: mpsc::Receiver<LogRecord>, out: mpsc::Sender<LogRecord>) {
    loop {
        tokio::select! {
            record = queue_rx.recv() => match record {
                Some(record) => {
                    if out.send(record).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = out.closed() => break,
        }
    }
    debug!(decision = "forwarder_exit", "采集队列转发结束");
}

/// 运行中的采集器
pub struct CollectorHandle {
    cancel: CancellationToken,
    state_rx: watch::Receiver<CollectorState>,
    join: JoinHandle<CollectorReport>,
    queue: mpsc::Sender<LogRecord>,
    channel_capacity: usize,
    forwarder: JoinHandle<()>,
}

impl CollectorHandle {
    pub fn state(&self) -> CollectorState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CollectorState> {
        self.state_rx.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// 采集器队列中等待转发的记录数
    pub fn backlog(&self) -> usize {
        self.channel_capacity - self.queue.capacity()
    }

    /// 等待进入指定状态，超时返回 false
    pub async fn wait_for_state(&self, target: CollectorState, timeout: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        let wait = async move {
            loop {
                if *rx.borrow_and_update() == target {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return *rx.borrow() == target;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 取消并等待退出
    pub async fn stop(self) -> CollectorReport {
        self.cancel.cancel();
        self.join().await
    }

    /// 等待采集任务结束，再等转发任务排空队列，返回后不再持有写入端
    pub async fn join(self) -> CollectorReport {
        let Self { join, queue, forwarder, .. } = self;
        let report = match join.await {
            Ok(report) => report,
            Err(e) => {
                warn!(target: "collector", { error.details = %e }, "采集任务异常退出");
                CollectorReport::default()
            }
        };

        drop(queue);
        if let Err(e) = forwarder.await {
            warn!(target: "collector", { error.details = %e }, "转发任务异常退出");
        }
        report
    }
}
