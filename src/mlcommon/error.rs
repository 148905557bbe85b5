use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Config parse error: {0}")]
    ConfigParseError(#[from] toml::de::Error),

    #[error("Database error: {0}")]
    DatabaseError(String),

    /// 主键冲突：同一存储中出现了重复时间戳，说明上游单调时钟被破坏
    #[error("Duplicate key: timestamp {0} already stored")]
    DuplicateKey(i64),

    #[error("Store disposed: {0}")]
    StoreDisposed(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Memory read error: {0}")]
    MemoryReadError(String),

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),
}

impl AppError {
    /// 获取错误类型的简洁摘要，用于结构化日志中的 `error.summary` 字段
    pub fn get_error_type_summary(&self) -> &'static str {
        match self {
            // 持久化相关
            AppError::SqliteError(_) => "log_storage_operation_failed",
            AppError::PoolError(_) => "log_storage_connection_failed",
            AppError::DatabaseError(_) => "log_persistence_failed",
            AppError::DuplicateKey(_) => "log_timestamp_duplicated",
            AppError::StoreDisposed(_) => "log_store_closed",
            AppError::IndexNotFound(_) => "log_index_missing",

            // 采集相关
            AppError::MemoryReadError(_) => "ring_buffer_read_failed",
            AppError::ProcessError(_) => "target_process_access_failed",
            AppError::ParseError(_) => "log_entry_format_invalid",

            // 系统资源
            AppError::IoError(_) => "log_file_operation_failed",
            AppError::ChannelError(_) => "log_pipeline_failed",

            AppError::ConfigError(_) => "memlog_configuration_invalid",
            AppError::ConfigParseError(_) => "memlog_configuration_unparsable",
        }
    }

    /// 检查错误是否为可重试类型
    pub fn is_retryable(&self) -> bool {
        match self {
            // 进程内存读取失败：进程可能正在退出或重启，重新定位即可
            AppError::MemoryReadError(_) |
            AppError::ProcessError(_) => true,

            AppError::PoolError(_) => true,

            AppError::DatabaseError(msg) => {
                msg.contains("locked") || msg.contains("busy") || msg.contains("timeout")
            },

            // 持久化失败不做静默重试，否则可能破坏"无重复、无丢失"保证
            AppError::SqliteError(_) |
            AppError::IoError(_) |
            AppError::DuplicateKey(_) |
            AppError::StoreDisposed(_) => false,

            AppError::ParseError(_) |
            AppError::ConfigError(_) |
            AppError::ConfigParseError(_) |
            AppError::IndexNotFound(_) |
            AppError::ChannelError(_) => false,
        }
    }

    /// 致命错误：程序级不变量被破坏，出现后对应的存储或采集器必须停止
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::DuplicateKey(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
