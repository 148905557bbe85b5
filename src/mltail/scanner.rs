//! 区域扫描：在已定位进程中寻找日志缓冲区，尝试次数有上限

use crate::mltail::source::{MemorySource, ProcessHandle, RegionProbe};
use crate::mltail::{run_blocking_or_cancel, wait_or_cancel};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 已找到的日志缓冲区
#[derive(Clone)]
pub struct RegionHandle {
    pub process: ProcessHandle,
    pub entry_pointer: u64,
    pub capacity: u64,
    source: Arc<dyn MemorySource>,
}

impl std::fmt::Debug for RegionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionHandle")
            .field("process", &self.process)
            .field("entry_pointer", &format_args!("{:#x}", self.entry_pointer))
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl RegionHandle {
    pub fn new(process: ProcessHandle, source: Arc<dyn MemorySource>) -> Self {
        Self {
            process,
            entry_pointer: source.entry_pointer(),
            capacity: source.capacity(),
            source,
        }
    }

    pub fn source(&self) -> &dyn MemorySource {
        self.source.as_ref()
    }
}

#[derive(Debug)]
pub enum ScanOutcome {
    Found(RegionHandle),
    /// 尝试次数用尽，调用方应重新定位进程
    NotFound,
    Stopped,
}

pub struct RegionScanner {
    probe: Arc<dyn RegionProbe>,
    retry_limit: u32,
    backoff: Duration,
}

impl RegionScanner {
    pub fn new(probe: Arc<dyn RegionProbe>, retry_limit: u32, backoff: Duration) -> Self {
        Self {
            probe,
            retry_limit: retry_limit.max(1),
            backoff,
        }
    }

    pub async fn scan(&self, process: &ProcessHandle, cancel: &CancellationToken) -> ScanOutcome {
        for attempt in 1..=self.retry_limit {
            if cancel.is_cancelled() {
                return ScanOutcome::Stopped;
            }

            // 扫描整个地址空间可能很慢，放到阻塞线程池中并随时响应取消
            let probe = self.probe.clone();
            let target = process.clone();
            let probed = match run_blocking_or_cancel(cancel, move || probe.probe(&target)).await {
                Some(probed) => probed,
                None => return ScanOutcome::Stopped,
            };

            match probed {
                Ok(Some(source)) => {
                    let region = RegionHandle::new(process.clone(), source);
                    info!(
                        target: "collector",
                        pid = process.pid,
                        entry_pointer = region.entry_pointer,
                        capacity = region.capacity,
                        attempt,
                        "已找到日志缓冲区"
                    );
                    return ScanOutcome::Found(region);
                }
                Ok(None) => {
                    debug!(decision = "region_not_found", pid = process.pid, attempt, "日志缓冲区尚未出现");
                }
                Err(e) => {
                    warn!(
                        target: "collector",
                        pid = process.pid,
                        attempt,
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                        "扫描进程内存失败"
                    );
                }
            }

            // 最后一次失败后不再等待
            if attempt < self.retry_limit && wait_or_cancel(cancel, self.backoff).await {
                return ScanOutcome::Stopped;
            }
        }

        warn!(target: "collector", pid = process.pid, retry_limit = self.retry_limit, "多次扫描未找到日志缓冲区，重新定位进程");
        ScanOutcome::NotFound
    }
}
