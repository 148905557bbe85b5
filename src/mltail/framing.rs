//! 条目切分：把一次读取到的字节流切成独立的原始条目

use crate::mlcommon::models::RawEntry;

/// 一次切分的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framed {
    pub entries: Vec<RawEntry>,
    /// 已消费的字节数；其后是写入方尚未写完的条目
    pub consumed: usize,
}

pub trait EntryFramer: Send + Sync {
    /// 切分 `bytes`，`base` 为其首字节的逻辑偏移
    fn frame(&self, base: u64, bytes: &[u8]) -> Framed;

    /// 从数据中间开始读取时，需要跳过的不完整前导字节数
    fn resync(&self, bytes: &[u8]) -> usize;
}

/// 以单个分隔字节切分，去掉 NUL 填充与行尾 `\r`
#[derive(Debug, Clone)]
pub struct DelimitedFramer {
    delimiter: u8,
    max_entry_bytes: usize,
}

impl DelimitedFramer {
    pub fn new(delimiter: u8, max_entry_bytes: usize) -> Self {
        Self {
            delimiter,
            max_entry_bytes: max_entry_bytes.max(1),
        }
    }

    fn push_segment(&self, entries: &mut Vec<RawEntry>, offset: u64, segment: &[u8]) {
        let mut cleaned: Vec<u8> = segment.iter().copied().filter(|b| *b != 0).collect();
        if cleaned.last() == Some(&b'\r') {
            cleaned.pop();
        }
        if cleaned.is_empty() {
            return;
        }

        let truncated = cleaned.len() > self.max_entry_bytes;
        cleaned.truncate(self.max_entry_bytes);
        entries.push(RawEntry { offset, bytes: cleaned, truncated });
    }
}

impl EntryFramer for DelimitedFramer {
    fn frame(&self, base: u64, bytes: &[u8]) -> Framed {
        let mut entries = Vec::new();
        let complete = bytes
            .iter()
            .rposition(|b| *b == self.delimiter)
            .map(|pos| pos + 1)
            .unwrap_or(0);

        let mut offset = base;
        if complete > 0 {
            for segment in bytes[..complete - 1].split(|b| *b == self.delimiter) {
                self.push_segment(&mut entries, offset, segment);
                offset += segment.len() as u64 + 1;
            }
        }

        // 末尾没有分隔符的部分留到下次读取；纯 NUL 填充直接消费，超长的按截断条目输出
        let tail = &bytes[complete..];
        let consumed = if tail.iter().all(|b| *b == 0) {
            bytes.len()
        } else if tail.len() > self.max_entry_bytes {
            self.push_segment(&mut entries, base + complete as u64, tail);
            bytes.len()
        } else {
            complete
        };

        Framed { entries, consumed }
    }

    fn resync(&self, bytes: &[u8]) -> usize {
        bytes
            .iter()
            .position(|b| *b == self.delimiter)
            .map(|pos| pos + 1)
            .unwrap_or(bytes.len())
    }
}
