// 导出共享模块
pub mod clock;
pub mod config;
pub mod error;
pub mod logging_setup;
pub mod models;

// 重新导出常用类型，方便使用
pub use clock::MonotonicClock;
pub use config::{AnalyzerKind, CollectorConfig, IndexSpec, LoggingConfig, MemlogConfig, StorageConfig};
pub use error::{AppError, Result};
pub use models::{category, LogRecord, RawEntry, Timestamp};
