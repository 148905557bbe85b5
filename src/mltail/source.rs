//! 外部进程与其内存的抽象
//!
//! 进程查找、区域探测、内存读取都通过 trait 注入，Linux 上由 procfs 实现，
//! 测试与演示使用 `sim` 中的模拟环形缓冲区。

use crate::mlcommon::error::Result;
use std::sync::Arc;

/// 已定位的目标进程
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    pub name: String,
}

/// 目标进程查找
pub trait ProcessFinder: Send + Sync {
    /// 返回当前匹配的进程；不存在时返回 `Ok(None)`
    fn find(&self) -> Result<Option<ProcessHandle>>;
}

/// 目标进程中的一块日志缓冲区
///
/// 位置都是逻辑偏移：`entry_pointer()` 是缓冲区起点，终止指针只增不减，
/// 直到缓冲区被重新初始化（此时回到起点附近）。`capacity()` 为 0 表示线性缓冲区，
/// 逻辑偏移直接就是可读取的地址。
pub trait MemorySource: Send + Sync {
    fn entry_pointer(&self) -> u64;

    fn capacity(&self) -> u64;

    /// 当前已写入位置（不含）
    fn terminal_pointer(&self) -> Result<u64>;

    /// 读取物理区间 `[from, to)`，调用方保证不跨越缓冲区末尾
    fn read_range(&self, from: u64, to: u64) -> Result<Vec<u8>>;

    fn is_process_alive(&self) -> bool;
}

/// 在进程地址空间中寻找日志缓冲区
pub trait RegionProbe: Send + Sync {
    /// 找到时返回可读取的内存源；暂未出现时返回 `Ok(None)`
    fn probe(&self, process: &ProcessHandle) -> Result<Option<Arc<dyn MemorySource>>>;
}
