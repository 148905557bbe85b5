//! Linux procfs 后端
//!
//! - 进程查找：遍历 `/proc/<pid>/comm`
//! - 区域探测：按 64 KiB 分块扫描 `/proc/<pid>/maps` 中可读写的映射，寻找缓冲区描述符
//! - 内存读取：`/proc/<pid>/mem` 定位读取
//!
//! 描述符由目标进程写在自己的内存里，32 字节、8 字节对齐：
//!
//! | 偏移 | 内容 |
//! |------|------|
//! | 0    | 8 字节标记 |
//! | 8    | 数据区地址 (u64 LE) |
//! | 16   | 数据区容量 (u64 LE) |
//! | 24   | 自初始化以来写入的总字节数 (u64 LE) |

use crate::mlcommon::error::{AppError, Result};
use crate::mltail::source::{MemorySource, ProcessFinder, ProcessHandle, RegionProbe};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// 扫描时每次读取的块大小
pub const READ_BLOCK_SIZE: usize = 0x10000;

/// 描述符长度
pub const DESCRIPTOR_LEN: usize = 32;

/// 容量上限，超过视为误匹配
const MAX_CAPACITY: u64 = 1 << 30;

/// 内核保存的进程名最多 15 字节
const COMM_LEN: usize = 15;

const DEFAULT_PROC_ROOT: &str = "/proc";

fn comm_name(name: &str) -> &[u8] {
    let bytes = name.as_bytes();
    &bytes[..bytes.len().min(COMM_LEN)]
}

fn read_comm(proc_root: &Path, pid: u32) -> Option<String> {
    std::fs::read_to_string(proc_root.join(pid.to_string()).join("comm"))
        .ok()
        .map(|s| s.trim_end_matches('\n').to_string())
}

/// 按进程名查找
#[derive(Debug, Clone)]
pub struct ProcfsFinder {
    name: String,
    proc_root: PathBuf,
}

impl ProcfsFinder {
    pub fn new(name: &str) -> Self {
        Self::with_root(name, DEFAULT_PROC_ROOT)
    }

    pub fn with_root<P: Into<PathBuf>>(name: &str, proc_root: P) -> Self {
        Self {
            name: name.to_string(),
            proc_root: proc_root.into(),
        }
    }
}

impl ProcessFinder for ProcfsFinder {
    fn find(&self) -> Result<Option<ProcessHandle>> {
        let wanted = comm_name(&self.name);
        let mut pids: Vec<u32> = std::fs::read_dir(&self.proc_root)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(|s| s.parse().ok()))
            .collect();
        // 多个同名进程时取最早启动的
        pids.sort_unstable();

        for pid in pids {
            // 进程可能在遍历期间退出
            if let Some(comm) = read_comm(&self.proc_root, pid) {
                if comm.as_bytes() == wanted {
                    return Ok(Some(ProcessHandle { pid, name: self.name.clone() }));
                }
            }
        }
        Ok(None)
    }
}

/// `/proc/<pid>/maps` 中的一行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRegion {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
}

impl MapRegion {
    pub fn contains_range(&self, from: u64, to: u64) -> bool {
        self.start <= from && to <= self.end
    }
}

pub fn parse_maps_line(line: &str) -> Option<MapRegion> {
    let mut fields = line.split_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let perms = fields.next()?.as_bytes();
    if perms.len() < 2 {
        return None;
    }
    Some(MapRegion {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        readable: perms[0] == b'r',
        writable: perms[1] == b'w',
    })
}

pub fn read_maps(proc_root: &Path, pid: u32) -> Result<Vec<MapRegion>> {
    let content = std::fs::read_to_string(proc_root.join(pid.to_string()).join("maps"))
        .map_err(|e| AppError::ProcessError(format!("读取进程 {} 的内存映射失败: {}", pid, e)))?;
    Ok(content.lines().filter_map(parse_maps_line).collect())
}

/// 缓冲区描述符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingDescriptor {
    pub data_addr: u64,
    pub capacity: u64,
    pub write_offset: u64,
}

impl RingDescriptor {
    pub fn encode(&self, magic: [u8; 8]) -> [u8; DESCRIPTOR_LEN] {
        let mut bytes = [0u8; DESCRIPTOR_LEN];
        bytes[0..8].copy_from_slice(&magic);
        bytes[8..16].copy_from_slice(&self.data_addr.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.capacity.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.write_offset.to_le_bytes());
        bytes
    }

    /// 标记不符时返回 None
    pub fn decode(bytes: &[u8], magic: [u8; 8]) -> Option<Self> {
        if bytes.len() < DESCRIPTOR_LEN || bytes[0..8] != magic {
            return None;
        }
        let word = |i: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[i..i + 8]);
            u64::from_le_bytes(buf)
        };
        Some(Self {
            data_addr: word(8),
            capacity: word(16),
            write_offset: word(24),
        })
    }

    fn is_plausible(&self, regions: &[MapRegion]) -> bool {
        if self.data_addr == 0 || self.capacity == 0 || self.capacity > MAX_CAPACITY {
            return false;
        }
        let Some(data_end) = self.data_addr.checked_add(self.capacity) else {
            return false;
        };
        regions
            .iter()
            .any(|r| r.readable && r.contains_range(self.data_addr, data_end))
    }
}

fn open_mem(proc_root: &Path, pid: u32) -> Result<File> {
    File::open(proc_root.join(pid.to_string()).join("mem"))
        .map_err(|e| AppError::ProcessError(format!("打开进程 {} 的内存失败: {}", pid, e)))
}

/// 扫描进程内存寻找描述符
#[derive(Debug, Clone)]
pub struct DescriptorProbe {
    magic: [u8; 8],
    proc_root: PathBuf,
}

impl DescriptorProbe {
    pub fn new(magic: [u8; 8]) -> Self {
        Self {
            magic,
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
        }
    }

    /// 返回描述符地址与内容
    fn find_descriptor(&self, mem: &File, regions: &[MapRegion]) -> Option<(u64, RingDescriptor)> {
        let mut block = vec![0u8; READ_BLOCK_SIZE];

        for region in regions.iter().filter(|r| r.readable && r.writable) {
            let mut addr = region.start;
            while addr < region.end {
                let len = ((region.end - addr) as usize).min(READ_BLOCK_SIZE);
                let buf = &mut block[..len];
                if mem.read_exact_at(buf, addr).is_err() {
                    // 不可读的块直接跳过
                    trace!(addr, len, "跳过不可读的内存块");
                    addr += len as u64;
                    continue;
                }

                for pos in (0..len.saturating_sub(DESCRIPTOR_LEN - 1)).step_by(8) {
                    if let Some(desc) = RingDescriptor::decode(&buf[pos..pos + DESCRIPTOR_LEN], self.magic) {
                        if desc.is_plausible(regions) {
                            return Some((addr + pos as u64, desc));
                        }
                    }
                }

                if len < READ_BLOCK_SIZE {
                    break;
                }
                // 相邻块重叠，跨块的描述符不会被漏掉
                addr += (READ_BLOCK_SIZE - DESCRIPTOR_LEN) as u64;
            }
        }
        None
    }
}

impl RegionProbe for DescriptorProbe {
    fn probe(&self, process: &ProcessHandle) -> Result<Option<Arc<dyn MemorySource>>> {
        let regions = read_maps(&self.proc_root, process.pid)?;
        let mem = open_mem(&self.proc_root, process.pid)?;

        match self.find_descriptor(&mem, &regions) {
            Some((descriptor_addr, desc)) => {
                debug!(
                    decision = "descriptor_found",
                    pid = process.pid,
                    descriptor_addr,
                    data_addr = desc.data_addr,
                    capacity = desc.capacity,
                    "找到缓冲区描述符"
                );
                let source = ProcMemSource::open_at(&self.proc_root, process, descriptor_addr, self.magic)?;
                Ok(Some(Arc::new(source)))
            }
            None => Ok(None),
        }
    }
}

/// 通过 `/proc/<pid>/mem` 读取的缓冲区
#[derive(Debug)]
pub struct ProcMemSource {
    pid: u32,
    name: String,
    proc_root: PathBuf,
    mem: File,
    magic: [u8; 8],
    descriptor_addr: u64,
    descriptor: RingDescriptor,
}

impl ProcMemSource {
    /// 按已知的描述符地址打开，并重新校验描述符
    pub(crate) fn open_at(proc_root: &Path, process: &ProcessHandle, descriptor_addr: u64, magic: [u8; 8]) -> Result<Self> {
        let proc_root = proc_root.to_path_buf();
        let mem = open_mem(&proc_root, process.pid)?;
        let mut bytes = [0u8; DESCRIPTOR_LEN];
        mem.read_exact_at(&mut bytes, descriptor_addr)
            .map_err(|e| AppError::MemoryReadError(format!("读取描述符失败: {}", e)))?;
        let descriptor = RingDescriptor::decode(&bytes, magic)
            .ok_or_else(|| AppError::MemoryReadError(format!("地址 {:#x} 处没有描述符", descriptor_addr)))?;

        Ok(Self {
            pid: process.pid,
            name: process.name.clone(),
            proc_root,
            mem,
            magic,
            descriptor_addr,
            descriptor,
        })
    }

    fn read_descriptor(&self) -> Result<RingDescriptor> {
        let mut bytes = [0u8; DESCRIPTOR_LEN];
        self.mem
            .read_exact_at(&mut bytes, self.descriptor_addr)
            .map_err(|e| AppError::MemoryReadError(format!("读取描述符失败: {}", e)))?;
        let current = RingDescriptor::decode(&bytes, self.magic)
            .ok_or_else(|| AppError::MemoryReadError("描述符已被覆盖".to_string()))?;
        if current.data_addr != self.descriptor.data_addr || current.capacity != self.descriptor.capacity {
            return Err(AppError::MemoryReadError("缓冲区已迁移".to_string()));
        }
        Ok(current)
    }
}

impl MemorySource for ProcMemSource {
    fn entry_pointer(&self) -> u64 {
        self.descriptor.data_addr
    }

    fn capacity(&self) -> u64 {
        self.descriptor.capacity
    }

    fn terminal_pointer(&self) -> Result<u64> {
        let current = self.read_descriptor()?;
        current
            .data_addr
            .checked_add(current.write_offset)
            .ok_or_else(|| AppError::MemoryReadError("写入位置溢出".to_string()))
    }

    fn read_range(&self, from: u64, to: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; to.saturating_sub(from) as usize];
        self.mem
            .read_exact_at(&mut buf, from)
            .map_err(|e| AppError::MemoryReadError(format!("读取 [{:#x}, {:#x}) 失败: {}", from, to, e)))?;
        Ok(buf)
    }

    fn is_process_alive(&self) -> bool {
        // 同一 pid 被其他程序复用时进程名不同
        read_comm(&self.proc_root, self.pid).is_some_and(|comm| comm.as_bytes() == comm_name(&self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn own_process() -> ProcessHandle {
        let pid = std::process::id();
        let name = read_comm(Path::new(DEFAULT_PROC_ROOT), pid).unwrap();
        ProcessHandle { pid, name }
    }

    /// 以 u64 数组承载描述符，保证 8 字节对齐
    fn descriptor_words(magic: [u8; 8], desc: RingDescriptor) -> Box<[u64; 4]> {
        Box::new([
            u64::from_le_bytes(magic),
            desc.data_addr.to_le(),
            desc.capacity.to_le(),
            desc.write_offset.to_le(),
        ])
    }

    #[test]
    fn test_parse_maps_line() {
        let region = parse_maps_line("7f12a000-7f12c000 rw-p 00000000 00:00 0          [heap]").unwrap();
        assert_eq!(region.start, 0x7f12a000);
        assert_eq!(region.end, 0x7f12c000);
        assert!(region.readable && region.writable);

        let code = parse_maps_line("55d0c000-55d0e000 r-xp 00001000 08:01 1234 /usr/bin/game").unwrap();
        assert!(!code.writable);
        assert!(parse_maps_line("garbage").is_none());
    }

    #[test]
    fn test_descriptor_encode_decode() {
        let magic = *b"MLTEST00";
        let desc = RingDescriptor { data_addr: 0x1000, capacity: 4096, write_offset: 12 };
        let bytes = desc.encode(magic);
        assert_eq!(RingDescriptor::decode(&bytes, magic), Some(desc));
        assert_eq!(RingDescriptor::decode(&bytes, *b"OTHERMAG"), None);
    }

    #[test]
    fn test_finder_finds_own_process() {
        let me = own_process();
        let found = ProcfsFinder::new(&me.name).find().unwrap().unwrap();
        assert_eq!(found.name, me.name);
        assert!(ProcfsFinder::new("no-such-process-xyz").find().unwrap().is_none());
    }

    #[test]
    fn test_mem_source_reads_live_descriptor() {
        let magic = *b"MLTEST01";
        let data = b"hello\nworld\n".to_vec();
        let mut words = descriptor_words(
            magic,
            RingDescriptor { data_addr: data.as_ptr() as u64, capacity: data.len() as u64, write_offset: 6 },
        );
        let descriptor_addr = words.as_ptr() as u64;

        let source = ProcMemSource::open_at(Path::new(DEFAULT_PROC_ROOT), &own_process(), descriptor_addr, magic).unwrap();
        assert!(source.is_process_alive());
        assert_eq!(source.entry_pointer(), data.as_ptr() as u64);
        assert_eq!(source.terminal_pointer().unwrap(), data.as_ptr() as u64 + 6);

        unsafe { std::ptr::write_volatile(&mut words[3], 12u64.to_le()) };
        assert_eq!(source.terminal_pointer().unwrap(), data.as_ptr() as u64 + 12);

        let start = source.entry_pointer();
        assert_eq!(source.read_range(start + 6, start + 12).unwrap(), b"world\n");
    }

    #[test]
    fn test_probe_scans_own_memory() {
        let magic = *b"MLTEST02";
        let data = vec![0u8; 256];
        let words = descriptor_words(
            magic,
            RingDescriptor { data_addr: data.as_ptr() as u64, capacity: 256, write_offset: 0 },
        );

        let source = DescriptorProbe::new(magic).probe(&own_process()).unwrap().unwrap();
        assert_eq!(source.entry_pointer(), data.as_ptr() as u64);
        assert_eq!(source.capacity(), 256);
        drop(words);
    }
}
