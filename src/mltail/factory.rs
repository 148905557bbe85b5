//! 记录工厂：为原始条目盖时间戳并填充来源上下文
//!
//! 单条条目的解析失败或 panic 都不会向上传播，而是变成诊断记录写入存储。

use crate::mlcommon::clock::MonotonicClock;
use crate::mlcommon::config::CollectorConfig;
use crate::mlcommon::models::{category, LogRecord, RawEntry};
use crate::mltail::analyzer::Analyzer;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// 记录的来源字段
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceContext {
    pub collector: String,
    pub host: String,
    pub pid: u32,
    pub application: String,
    pub domain: String,
    pub user: String,
}

impl SourceContext {
    pub fn from_config(config: &CollectorConfig) -> Self {
        Self {
            collector: config.source_name.clone(),
            host: config.host.clone(),
            pid: 0,
            application: if config.application.is_empty() {
                config.process_name.clone()
            } else {
                config.application.clone()
            },
            domain: config.domain.clone(),
            user: config.user.clone(),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct RecordFactory {
    clock: Arc<MonotonicClock>,
    analyzer: Arc<dyn Analyzer>,
    context: SourceContext,
}

impl RecordFactory {
    pub fn new(clock: Arc<MonotonicClock>, analyzer: Arc<dyn Analyzer>, context: SourceContext) -> Self {
        Self { clock, analyzer, context }
    }

    pub fn context(&self) -> &SourceContext {
        &self.context
    }

    /// 定位到新进程后更新
    pub fn set_pid(&mut self, pid: u32) {
        self.context.pid = pid;
    }

    fn record(&self, actor: String, category: &str, message: String, raw_payload: Option<Vec<u8>>) -> LogRecord {
        LogRecord {
            timestamp: self.clock.now(),
            collector: self.context.collector.clone(),
            host: self.context.host.clone(),
            pid: self.context.pid,
            application: self.context.application.clone(),
            domain: self.context.domain.clone(),
            user: self.context.user.clone(),
            actor,
            category: category.to_string(),
            message,
            raw_payload,
        }
    }

    /// 把一条原始条目转为记录，总是返回恰好一条记录
    pub fn build(&self, entry: &RawEntry) -> LogRecord {
        if entry.truncated {
            return self.internal_error(
                format!("条目超过长度上限，已截断为 {} 字节", entry.bytes.len()),
                Some(entry.bytes.clone()),
            );
        }

        match catch_unwind(AssertUnwindSafe(|| self.analyzer.analyze(&entry.bytes))) {
            Ok(Ok(analysis)) => self.record(
                analysis.actor,
                &analysis.category,
                analysis.message,
                Some(entry.bytes.clone()),
            ),
            Ok(Err(_)) => self.record(
                String::new(),
                category::UNPARSED,
                String::from_utf8_lossy(&entry.bytes).into_owned(),
                Some(entry.bytes.clone()),
            ),
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                warn!(
                    target: "collector",
                    analyzer = self.analyzer.name(),
                    offset = entry.offset,
                    reason = %reason,
                    "解析器 panic，条目转为诊断记录"
                );
                self.internal_error(
                    format!("解析器 {} panic: {}", self.analyzer.name(), reason),
                    Some(entry.bytes.clone()),
                )
            }
        }
    }

    pub fn internal_error(&self, message: impl Into<String>, raw_payload: Option<Vec<u8>>) -> LogRecord {
        self.record(String::new(), category::INTERNAL_ERROR, message.into(), raw_payload)
    }

    /// 环形缓冲区被覆盖时的诊断记录
    pub fn data_loss(&self, lost_bytes: u64, resumed_at: u64) -> LogRecord {
        self.record(
            String::new(),
            category::DATA_LOSS,
            format!("写入方超前一整圈，{} 字节未读即被覆盖，从偏移 {:#x} 继续读取", lost_bytes, resumed_at),
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mlcommon::error::{AppError, Result};
    use crate::mltail::analyzer::{Analysis, ChannelCodeAnalyzer};

    struct PanickyAnalyzer;

    impl Analyzer for PanickyAnalyzer {
        fn name(&self) -> &'static str {
            "panicky"
        }

        fn analyze(&self, bytes: &[u8]) -> Result<Analysis> {
            if bytes.starts_with(b"boom") {
                panic!("analyzer exploded");
            }
            Err(AppError::ParseError("never parses".to_string()))
        }
    }

    fn entry(bytes: &[u8]) -> RawEntry {
        RawEntry { offset: 0, bytes: bytes.to_vec(), truncated: false }
    }

    fn context() -> SourceContext {
        SourceContext {
            collector: "xiv".to_string(),
            host: "box".to_string(),
            pid: 7,
            application: "game".to_string(),
            domain: "test".to_string(),
            user: "me".to_string(),
        }
    }

    #[test]
    fn test_parsed_entry_carries_context() {
        let factory = RecordFactory::new(Arc::new(MonotonicClock::new()), Arc::new(ChannelCodeAnalyzer), context());
        let record = factory.build(&entry(b"0001:Alice:hello"));
        assert_eq!(record.actor, "Alice");
        assert_eq!(record.category, "say");
        assert_eq!(record.message, "hello");
        assert_eq!(record.collector, "xiv");
        assert_eq!(record.pid, 7);
        assert_eq!(record.raw_payload.as_deref(), Some(&b"0001:Alice:hello"[..]));
    }

    #[test]
    fn test_unparsed_and_panic_become_records() {
        let factory = RecordFactory::new(Arc::new(MonotonicClock::new()), Arc::new(PanickyAnalyzer), context());

        let unparsed = factory.build(&entry(b"whatever"));
        assert_eq!(unparsed.category, category::UNPARSED);
        assert_eq!(unparsed.message, "whatever");

        let crashed = factory.build(&entry(b"boom!"));
        assert_eq!(crashed.category, category::INTERNAL_ERROR);
        assert!(crashed.message.contains("analyzer exploded"));
        assert!(crashed.timestamp > unparsed.timestamp);
    }

    #[test]
    fn test_truncated_entry_is_internal_error() {
        let factory = RecordFactory::new(Arc::new(MonotonicClock::new()), Arc::new(ChannelCodeAnalyzer), context());
        let record = factory.build(&RawEntry { offset: 0, bytes: b"0001:a:".to_vec(), truncated: true });
        assert_eq!(record.category, category::INTERNAL_ERROR);
        assert!(record.raw_payload.is_some());
    }

    #[test]
    fn test_data_loss_record() {
        let mut factory = RecordFactory::new(Arc::new(MonotonicClock::new()), Arc::new(ChannelCodeAnalyzer), context());
        factory.set_pid(99);
        let record = factory.data_loss(128, 0x400);
        assert_eq!(record.category, category::DATA_LOSS);
        assert_eq!(record.pid, 99);
        assert!(record.is_diagnostic());
    }
}
