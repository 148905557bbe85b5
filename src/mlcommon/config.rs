//! 内存日志采集系统配置模块

use serde::{Deserialize, Serialize};
use crate::mlcommon::{AppError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 系统配置常量
pub mod constants {
    /// 默认配置文件路径
    pub const DEFAULT_CONFIG_PATH: &str = "config/MemlogConfig.toml";

    /// 进程定位失败后的等待时间（毫秒）
    pub const DEFAULT_LOCATE_BACKOFF_MS: u64 = 5000;

    /// 区域扫描的最大尝试次数
    pub const DEFAULT_REGION_RETRY_LIMIT: u32 = 10;

    /// 区域扫描失败后的等待时间（毫秒）
    pub const DEFAULT_REGION_BACKOFF_MS: u64 = 1000;

    /// 无新数据时的轮询间隔（毫秒）
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

    /// 采集器到写入器的通道容量
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 5000;

    /// 单条日志的最大字节数
    pub const DEFAULT_MAX_ENTRY_BYTES: usize = 64 * 1024;

    /// 环形缓冲区描述符的 8 字节标记
    pub const DEFAULT_DESCRIPTOR_MAGIC: &str = "MEMLOG01";
}

use constants::*;

fn default_source_name() -> String {
    "default".to_string()
}

fn default_host() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

fn default_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}

fn default_indices() -> Vec<IndexSpec> {
    vec![
        IndexSpec { name: "actor".to_string(), key: "actor".to_string() },
        IndexSpec { name: "category".to_string(), key: "category".to_string() },
    ]
}

/// 内存日志采集系统配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemlogConfig {
    /// 存储配置
    #[serde(default)]
    pub storage: StorageConfig,

    /// 采集器配置
    #[serde(default)]
    pub collector: CollectorConfig,

    /// 二级索引列表
    #[serde(default = "default_indices")]
    pub indices: Vec<IndexSpec>,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 数据根目录，每个数据源在其下拥有独立子目录
    pub data_dir: PathBuf,

    /// 连接池大小
    pub pool_size: u32,

    /// 写入队列大小
    pub queue_size: usize,

    /// 单个事务最多合并的记录数
    pub batch_size: usize,
}

/// 采集器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// 数据源名称，同时作为数据子目录名和记录的 collector 字段
    #[serde(default = "default_source_name")]
    pub source_name: String,

    /// 目标进程名
    pub process_name: String,

    /// 进程定位失败后的等待时间（毫秒）
    pub locate_backoff_ms: u64,

    /// 区域扫描最大尝试次数
    pub region_retry_limit: u32,

    /// 区域扫描失败后的等待时间（毫秒）
    pub region_backoff_ms: u64,

    /// 无新数据时的轮询间隔（毫秒）
    pub poll_interval_ms: u64,

    /// 采集器输出通道容量
    pub channel_capacity: usize,

    /// 单条日志最大字节数，超出部分截断
    pub max_entry_bytes: usize,

    /// 条目解析器
    #[serde(default)]
    pub analyzer: AnalyzerKind,

    /// 条目分隔字节
    #[serde(default = "default_delimiter")]
    pub delimiter: u8,

    /// procfs 后端扫描描述符时使用的标记，必须是 8 个 ASCII 字节
    #[serde(default = "default_descriptor_magic")]
    pub descriptor_magic: String,

    #[serde(default)]
    pub application: String,

    #[serde(default)]
    pub domain: String,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_delimiter() -> u8 {
    b'\n'
}

fn default_descriptor_magic() -> String {
    DEFAULT_DESCRIPTOR_MAGIC.to_string()
}

/// 解析器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerKind {
    /// 整条文本作为消息
    #[default]
    Plain,
    /// `HHHH:发言者:内容` 格式的频道日志
    ChannelCode,
}

/// 二级索引定义
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// 索引名，决定索引文件名
    pub name: String,
    /// 内置键函数名，见 `mlstore::index::key_of_by_name`
    pub key: String,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别 (trace, debug, info, warn, error)
    pub log_level: String,

    /// 日志文件目录
    pub log_dir: PathBuf,

    /// 是否启用控制台输出
    pub enable_console_output: bool,
}

impl Default for MemlogConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            collector: CollectorConfig::default(),
            indices: default_indices(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            pool_size: 4,
            queue_size: 5000,
            batch_size: 256,
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            source_name: default_source_name(),
            process_name: String::new(),
            locate_backoff_ms: DEFAULT_LOCATE_BACKOFF_MS,
            region_retry_limit: DEFAULT_REGION_RETRY_LIMIT,
            region_backoff_ms: DEFAULT_REGION_BACKOFF_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
            analyzer: AnalyzerKind::default(),
            delimiter: default_delimiter(),
            descriptor_magic: default_descriptor_magic(),
            application: String::new(),
            domain: String::new(),
            user: default_user(),
            host: default_host(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: PathBuf::from("logs"),
            enable_console_output: true,
        }
    }
}

impl CollectorConfig {
    pub fn locate_backoff(&self) -> Duration {
        Duration::from_millis(self.locate_backoff_ms)
    }

    pub fn region_backoff(&self) -> Duration {
        Duration::from_millis(self.region_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// 描述符标记的字节形式，长度不符时返回 None
    pub fn descriptor_magic_bytes(&self) -> Option<[u8; 8]> {
        self.descriptor_magic.as_bytes().try_into().ok()
    }
}

impl StorageConfig {
    /// 某个数据源的数据目录
    pub fn source_dir(&self, source_name: &str) -> PathBuf {
        self.data_dir.join(source_name)
    }
}

impl MemlogConfig {
    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;

        let config: Self = toml::from_str(&content)?;

        config.validate()?;
        Ok(config)
    }

    /// 按 `CONFIG_PATH` 环境变量或默认路径加载；文件不存在时使用默认配置
    pub fn load_default() -> Result<Self> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        if Path::new(&config_path).exists() {
            Self::from_file(&config_path)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::ConfigError(format!("序列化配置失败: {}", e)))?;

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.storage.pool_size == 0 {
            return Err(AppError::ConfigError("数据库连接池大小必须大于0".to_string()));
        }

        if self.storage.queue_size == 0 {
            return Err(AppError::ConfigError("写入队列大小必须大于0".to_string()));
        }

        if self.storage.batch_size == 0 {
            return Err(AppError::ConfigError("批量写入大小必须大于0".to_string()));
        }

        if self.collector.source_name.is_empty()
            || self.collector.source_name.contains(['/', '\\'])
        {
            return Err(AppError::ConfigError(format!(
                "无效的数据源名称: {:?}", self.collector.source_name
            )));
        }

        if self.collector.region_retry_limit == 0 {
            return Err(AppError::ConfigError("区域扫描最大尝试次数必须大于0".to_string()));
        }

        if self.collector.poll_interval_ms == 0 {
            return Err(AppError::ConfigError("轮询间隔必须大于0".to_string()));
        }

        if self.collector.channel_capacity == 0 {
            return Err(AppError::ConfigError("采集通道容量必须大于0".to_string()));
        }

        if self.collector.max_entry_bytes == 0 {
            return Err(AppError::ConfigError("单条日志最大字节数必须大于0".to_string()));
        }

        if self.collector.descriptor_magic.len() != 8 || !self.collector.descriptor_magic.is_ascii() {
            return Err(AppError::ConfigError(format!(
                "描述符标记必须是 8 个 ASCII 字符: {:?}", self.collector.descriptor_magic
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for spec in &self.indices {
            if spec.name.is_empty() || !spec.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                return Err(AppError::ConfigError(format!("无效的索引名: {:?}", spec.name)));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(AppError::ConfigError(format!("索引名重复: {}", spec.name)));
            }
            if crate::mlstore::index::key_of_by_name(&spec.key).is_none() {
                return Err(AppError::ConfigError(format!(
                    "索引 {} 使用了未知的键函数: {}", spec.name, spec.key
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MemlogConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.collector.region_retry_limit, 10);
        assert_eq!(config.collector.locate_backoff(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_partial_toml() {
        let content = r#"
            [storage]
            data_dir = "/var/lib/memlog"
            pool_size = 2
            queue_size = 100
            batch_size = 10

            [[indices]]
            name = "by_actor"
            key = "actor"
        "#;
        let config: MemlogConfig = toml::from_str(content).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/memlog"));
        assert_eq!(config.indices.len(), 1);
        assert_eq!(config.collector.analyzer, AnalyzerKind::Plain);
        assert_eq!(config.storage.source_dir("xiv"), PathBuf::from("/var/lib/memlog/xiv"));
    }

    #[test]
    fn test_analyzer_kind_snake_case() {
        let content = r#"
            [collector]
            process_name = "game"
            locate_backoff_ms = 10
            region_retry_limit = 3
            region_backoff_ms = 10
            poll_interval_ms = 10
            channel_capacity = 16
            max_entry_bytes = 1024
            analyzer = "channel_code"
        "#;
        let config: MemlogConfig = toml::from_str(content).unwrap();
        assert_eq!(config.collector.analyzer, AnalyzerKind::ChannelCode);
        assert_eq!(config.collector.delimiter, b'\n');
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let path = std::env::temp_dir().join(format!("memlog_bad_config_{}.toml", std::process::id()));
        let _cleanup = scopeguard::guard(path.clone(), |p| {
            let _ = std::fs::remove_file(p);
        });
        std::fs::write(&path, "[storage\npool_size = ").unwrap();

        let err = MemlogConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, AppError::ConfigParseError(_)));
        assert_eq!(err.get_error_type_summary(), "memlog_configuration_unparsable");
    }

    #[test]
    fn test_validate_rejects_unknown_key_function() {
        let mut config = MemlogConfig::default();
        config.indices.push(IndexSpec { name: "weird".to_string(), key: "no_such_key".to_string() });
        assert!(matches!(config.validate(), Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_index_name() {
        let mut config = MemlogConfig::default();
        config.indices.push(IndexSpec { name: "actor".to_string(), key: "user".to_string() });
        assert!(config.validate().is_err());
    }
}
