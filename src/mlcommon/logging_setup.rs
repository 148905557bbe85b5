//! 统一日志系统初始化模块
//!
//! 提供跨二进制文件的日志系统初始化功能，避免代码重复。
//! 文件层输出 JSON 格式的 tracing 日志，控制台层用于调试。

use crate::mlcommon::{config::LoggingConfig, AppError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// 组装业务日志过滤器字符串，压低依赖库的噪音
pub fn business_filter(log_level: &str) -> String {
    format!("{},rusqlite=warn,r2d2=warn", log_level)
}

/// 初始化日志系统
///
/// 返回的 guard 必须由 main 函数持有到退出，否则非阻塞写入器中尚未落盘的日志会丢失。
pub fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "memlog.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(business_filter(&config.log_level)));

    let file_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(file_writer);

    // Option<Layer> 为 None 时是无操作的
    let console_layer = config.enable_console_output.then(|| {
        fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
    });

    Registry::default()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("日志系统初始化失败: {}", e)))?;

    tracing::info!(
        target: "logging",
        log_type = "module",
        log_dir = %config.log_dir.display(),
        log_level = %config.log_level,
        "统一日志系统初始化完成"
    );

    Ok(guard)
}
