//! 进程定位：按固定间隔重试，直到找到目标进程或被取消

use crate::mltail::source::{ProcessFinder, ProcessHandle};
use crate::mltail::{run_blocking_or_cancel, wait_or_cancel};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocateOutcome {
    Found(ProcessHandle),
    Stopped,
}

pub struct ProcessLocator {
    finder: Arc<dyn ProcessFinder>,
    backoff: Duration,
}

impl ProcessLocator {
    pub fn new(finder: Arc<dyn ProcessFinder>, backoff: Duration) -> Self {
        Self { finder, backoff }
    }

    pub async fn locate(&self, cancel: &CancellationToken) -> LocateOutcome {
        let mut attempts: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return LocateOutcome::Stopped;
            }
            attempts += 1;

            let finder = self.finder.clone();
            let found = match run_blocking_or_cancel(cancel, move || finder.find()).await {
                Some(found) => found,
                None => return LocateOutcome::Stopped,
            };

            match found {
                Ok(Some(process)) => {
                    info!(target: "collector", pid = process.pid, process = %process.name, attempts, "已定位目标进程");
                    return LocateOutcome::Found(process);
                }
                Ok(None) => {
                    debug!(decision = "process_not_found", attempts, "目标进程不存在，等待后重试");
                }
                Err(e) => {
                    warn!(
                        target: "collector",
                        attempts,
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                        "查找目标进程失败，等待后重试"
                    );
                }
            }

            if wait_or_cancel(cancel, self.backoff).await {
                return LocateOutcome::Stopped;
            }
        }
    }
}
