//! 模拟的目标进程与环形缓冲区，用于测试和演示模式
//!
//! 写入方按逻辑偏移追加数据，物理位置为 `entry + (逻辑偏移 - entry) % capacity`，
//! 与真实进程中的缓冲区布局一致。

use crate::mlcommon::error::{AppError, Result};
use crate::mltail::source::{MemorySource, ProcessFinder, ProcessHandle, RegionProbe};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug)]
struct SimState {
    name: String,
    pid: u32,
    running: bool,
    region_visible: bool,
    entry: u64,
    data: Vec<u8>,
    terminal: u64,
    // 每次 read_range 的物理区间
    reads: Vec<(u64, u64)>,
}

/// 模拟进程，克隆共享同一状态
#[derive(Debug, Clone)]
pub struct SimulatedRing {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedRing {
    pub fn new(name: &str, pid: u32, entry: u64, capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                name: name.to_string(),
                pid,
                running: true,
                region_visible: true,
                entry,
                data: vec![0; capacity],
                terminal: entry,
                reads: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 在当前终止指针处追加数据并推进
    pub fn append(&self, bytes: &[u8]) {
        let mut state = self.lock();
        let capacity = state.data.len() as u64;
        for byte in bytes {
            let physical = ((state.terminal - state.entry) % capacity) as usize;
            state.data[physical] = *byte;
            state.terminal += 1;
        }
    }

    /// 追加一行，自动补上换行
    pub fn append_line(&self, line: &str) {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        self.append(&bytes);
    }

    /// 缓冲区被重新初始化：清零并把终止指针拨回起点
    pub fn reset_buffer(&self) {
        let mut state = self.lock();
        state.data.iter_mut().for_each(|b| *b = 0);
        state.terminal = state.entry;
    }

    /// 直接设置终止指针
    pub fn set_terminal(&self, terminal: u64) {
        self.lock().terminal = terminal;
    }

    pub fn terminal(&self) -> u64 {
        self.lock().terminal
    }

    pub fn pid(&self) -> u32 {
        self.lock().pid
    }

    pub fn kill(&self) {
        self.lock().running = false;
    }

    /// 以新 pid 重新启动，缓冲区从头开始
    pub fn restart(&self, pid: u32) {
        let mut state = self.lock();
        state.pid = pid;
        state.running = true;
        state.data.iter_mut().for_each(|b| *b = 0);
        state.terminal = state.entry;
    }

    pub fn set_region_visible(&self, visible: bool) {
        self.lock().region_visible = visible;
    }

    /// 已发生的物理读取区间
    pub fn reads(&self) -> Vec<(u64, u64)> {
        self.lock().reads.clone()
    }

    pub fn finder(&self) -> Arc<dyn ProcessFinder> {
        Arc::new(SimFinder { ring: self.clone() })
    }

    pub fn probe(&self) -> Arc<dyn RegionProbe> {
        Arc::new(SimProbe { ring: self.clone() })
    }
}

struct SimFinder {
    ring: SimulatedRing,
}

impl ProcessFinder for SimFinder {
    fn find(&self) -> Result<Option<ProcessHandle>> {
        let state = self.ring.lock();
        Ok(state.running.then(|| ProcessHandle {
            pid: state.pid,
            name: state.name.clone(),
        }))
    }
}

struct SimProbe {
    ring: SimulatedRing,
}

impl RegionProbe for SimProbe {
    fn probe(&self, process: &ProcessHandle) -> Result<Option<Arc<dyn MemorySource>>> {
        let state = self.ring.lock();
        if !state.running || state.pid != process.pid {
            return Err(AppError::ProcessError(format!("进程 {} 不存在", process.pid)));
        }
        if !state.region_visible {
            return Ok(None);
        }
        Ok(Some(Arc::new(SimSource {
            ring: self.ring.clone(),
            pid: process.pid,
            entry: state.entry,
            capacity: state.data.len() as u64,
        })))
    }
}

/// 绑定到某个 pid 的内存视图；进程重启后旧视图即失效
struct SimSource {
    ring: SimulatedRing,
    pid: u32,
    entry: u64,
    capacity: u64,
}

impl SimSource {
    fn live_state(&self) -> Result<MutexGuard<'_, SimState>> {
        let state = self.ring.lock();
        if !state.running || state.pid != self.pid {
            return Err(AppError::MemoryReadError(format!("进程 {} 已退出", self.pid)));
        }
        Ok(state)
    }
}

impl MemorySource for SimSource {
    fn entry_pointer(&self) -> u64 {
        self.entry
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn terminal_pointer(&self) -> Result<u64> {
        Ok(self.live_state()?.terminal)
    }

    fn read_range(&self, from: u64, to: u64) -> Result<Vec<u8>> {
        let mut state = self.live_state()?;
        if from < self.entry || to > self.entry + self.capacity || from > to {
            return Err(AppError::MemoryReadError(format!(
                "读取区间 [{:#x}, {:#x}) 越界", from, to
            )));
        }
        state.reads.push((from, to));
        let start = (from - self.entry) as usize;
        let end = (to - self.entry) as usize;
        Ok(state.data[start..end].to_vec())
    }

    fn is_process_alive(&self) -> bool {
        let state = self.ring.lock();
        state.running && state.pid == self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_wraps_around() {
        let ring = SimulatedRing::new("game", 1, 0x1000, 8);
        ring.append(b"abcdefghij");
        assert_eq!(ring.terminal(), 0x1000 + 10);

        let process = ring.finder().find().unwrap().unwrap();
        let source = ring.probe().probe(&process).unwrap().unwrap();
        // "ij" 覆盖了开头
        assert_eq!(source.read_range(0x1000, 0x1008).unwrap(), b"ijcdefgh");
    }

    #[test]
    fn test_restart_invalidates_old_view() {
        let ring = SimulatedRing::new("game", 1, 0, 16);
        let process = ring.finder().find().unwrap().unwrap();
        let source = ring.probe().probe(&process).unwrap().unwrap();
        assert!(source.is_process_alive());

        ring.restart(2);
        assert!(!source.is_process_alive());
        assert!(source.terminal_pointer().is_err());
        assert_eq!(ring.finder().find().unwrap().map(|p| p.pid), Some(2));
    }
}
