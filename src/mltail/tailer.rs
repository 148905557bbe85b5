//! 环形缓冲区尾随读取

use crate::mlcommon::error::{AppError, Result};
use crate::mlcommon::models::RawEntry;
use crate::mltail::cursor::{CursorStep, TailCursor};
use crate::mltail::framing::EntryFramer;
use crate::mltail::scanner::RegionHandle;
use crate::mltail::source::MemorySource;
use std::sync::Arc;
use tracing::debug;

/// 一次轮询读取到的条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailBatch {
    pub entries: Vec<RawEntry>,
    pub start: u64,
    pub end: u64,
    pub reset: bool,
    pub lost: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Idle,
    Batch(TailBatch),
    ProcessExited,
}

/// 读取逻辑区间 `[start, end)`，跨越缓冲区末尾时拆成两段
pub fn read_logical(source: &dyn MemorySource, entry: u64, capacity: u64, start: u64, end: u64) -> Result<Vec<u8>> {
    if start >= end {
        return Ok(Vec::new());
    }
    if capacity == 0 {
        return source.read_range(start, end);
    }

    let len = end - start;
    if len > capacity {
        return Err(AppError::MemoryReadError(format!(
            "读取长度 {} 超过缓冲区容量 {}", len, capacity
        )));
    }

    let offset = (start - entry) % capacity;
    let head_len = len.min(capacity - offset);
    let mut bytes = source.read_range(entry + offset, entry + offset + head_len)?;
    if head_len < len {
        bytes.extend(source.read_range(entry, entry + (len - head_len))?);
    }

    if bytes.len() as u64 != len {
        return Err(AppError::MemoryReadError(format!(
            "读取不完整: 期望 {} 字节，实际 {} 字节", len, bytes.len()
        )));
    }
    Ok(bytes)
}

#[derive(Clone)]
pub struct RingTailer {
    framer: Arc<dyn EntryFramer>,
}

impl RingTailer {
    pub fn new(framer: Arc<dyn EntryFramer>) -> Self {
        Self { framer }
    }

    /// 读取自上次以来的新条目；只在读取成功后推进游标
    pub fn poll(&self, region: &RegionHandle, cursor: &mut TailCursor) -> Result<PollOutcome> {
        let source = region.source();
        if !source.is_process_alive() {
            return Ok(PollOutcome::ProcessExited);
        }

        let terminal = source.terminal_pointer()?;
        let plan = match cursor.plan(region.entry_pointer, region.capacity, terminal) {
            CursorStep::Idle => return Ok(PollOutcome::Idle),
            CursorStep::OutOfRange { terminal } => {
                return Err(AppError::MemoryReadError(format!(
                    "终止指针 {:#x} 位于缓冲区起点 {:#x} 之前", terminal, region.entry_pointer
                )));
            }
            CursorStep::Read(plan) => plan,
        };

        let mut bytes = read_logical(source, region.entry_pointer, region.capacity, plan.start, plan.end)?;
        let mut base = plan.start;
        if plan.lost > 0 {
            let skip = self.framer.resync(&bytes);
            bytes.drain(..skip);
            base += skip as u64;
        } else if !plan.reset && !cursor.pending().is_empty() {
            // 接上次未写完的条目；重置或覆盖后残留部分已失效
            let mut joined = cursor.pending().to_vec();
            base -= joined.len() as u64;
            joined.extend_from_slice(&bytes);
            bytes = joined;
        }

        let framed = self.framer.frame(base, &bytes);
        let pending = bytes.split_off(framed.consumed);
        let entries = framed.entries;
        cursor.commit(&plan, pending);

        debug!(
            decision = "tail_read",
            start = plan.start,
            end = plan.end,
            reset = plan.reset,
            lost = plan.lost,
            entry_count = entries.len(),
            pending_bytes = cursor.pending().len(),
            "读取新条目"
        );

        Ok(PollOutcome::Batch(TailBatch {
            entries,
            start: plan.start,
            end: plan.end,
            reset: plan.reset,
            lost: plan.lost,
        }))
    }
}
