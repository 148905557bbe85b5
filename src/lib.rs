// 导出模块
pub mod mlcommon;
pub mod mlstore;
pub mod mltail;

// Re-export error types
pub use mlcommon::error::{AppError, Result};
