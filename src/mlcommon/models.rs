//! 日志采集与存储共享的数据模型

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 内部诊断记录使用的分类
pub mod category {
    /// 解析器无法识别的条目
    pub const UNPARSED: &str = "unparsed";
    /// 单条目处理时的内部错误（解析器 panic、条目过长等）
    pub const INTERNAL_ERROR: &str = "internal error";
    /// 环形缓冲区被覆盖，存在未读取即丢失的数据
    pub const DATA_LOSS: &str = "data loss";
    /// 纯文本解析器的默认分类
    pub const TEXT: &str = "text";
}

/// 主键时间戳：自 Unix 纪元起的 UTC 微秒数，最小单位 1µs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Timestamp(dt.timestamp_micros())
    }

    pub fn as_micros(&self) -> i64 {
        self.0
    }

    /// 下一个最小单位
    pub fn next(&self) -> Self {
        Timestamp(self.0 + 1)
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339_opts(SecondsFormat::Micros, true)),
            None => write!(f, "{}us", self.0),
        }
    }
}

/// 结构化日志记录，写入存储后不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: Timestamp,
    pub collector: String,
    pub host: String,
    pub pid: u32,
    pub application: String,
    pub domain: String,
    pub user: String,
    pub actor: String,
    pub category: String,
    pub message: String,
    /// 原始字节，保留以便日后重新解析
    pub raw_payload: Option<Vec<u8>>,
}

impl LogRecord {
    pub fn is_diagnostic(&self) -> bool {
        self.category == category::INTERNAL_ERROR || self.category == category::DATA_LOSS
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.actor.is_empty() {
            write!(f, "{} [{}] {}", self.timestamp, self.category, self.message)
        } else {
            write!(f, "{} [{}] {} : {}", self.timestamp, self.category, self.actor, self.message)
        }
    }
}

/// 从环形缓冲区切分出的一条原始条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    /// 条目起始的逻辑偏移
    pub offset: u64,
    pub bytes: Vec<u8>,
    /// 条目超过长度上限被截断
    pub truncated: bool,
}
