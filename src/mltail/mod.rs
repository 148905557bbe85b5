// 采集层：定位进程、扫描缓冲区、尾随读取并生成记录
pub mod analyzer;
pub mod collector;
pub mod cursor;
pub mod factory;
pub mod framing;
pub mod locator;
#[cfg(target_os = "linux")]
pub mod procfs;
pub mod scanner;
pub mod sim;
pub mod source;
pub mod tailer;

pub use analyzer::{Analysis, Analyzer, ChannelCodeAnalyzer, PlainAnalyzer};
pub use collector::{CollectorHandle, CollectorLoop, CollectorReport, CollectorState};
pub use cursor::{CursorStep, TailCursor, TailPlan};
pub use factory::{RecordFactory, SourceContext};
pub use framing::{DelimitedFramer, EntryFramer, Framed};
pub use locator::{LocateOutcome, ProcessLocator};
pub use scanner::{RegionHandle, RegionScanner, ScanOutcome};
pub use source::{MemorySource, ProcessFinder, ProcessHandle, RegionProbe};
pub use tailer::{PollOutcome, RingTailer, TailBatch};

use crate::mlcommon::error::{AppError, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 等待指定时间；期间被取消返回 true
pub(crate) async fn wait_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// 在阻塞线程池中访问目标进程，保留当前 span 上下文
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let parent_span = tracing::Span::current();
    tokio::task::spawn_blocking(move || parent_span.in_scope(f))
        .await
        .map_err(|join_error| AppError::ProcessError(format!("进程访问任务 panic: {:?}", join_error)))?
}

/// 同 `run_blocking`，取消时立即返回 None，不等待阻塞操作结束
pub(crate) async fn run_blocking_or_cancel<T, F>(cancel: &CancellationToken, f: F) -> Option<Result<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::select! {
        _ = cancel.cancelled() => None,
        result = run_blocking(f) => Some(result),
    }
}
