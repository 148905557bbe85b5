// 日志存储查询工具
use anyhow::Context;
use clap::{Parser, Subcommand};
use memlog_server::mlcommon::{MemlogConfig, Timestamp};
use memlog_server::mlstore::index::split_composite_key;
use memlog_server::mlstore::{LogIndex, LogStore};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect a memlog store offline.", long_about = None)]
struct Args {
    /// Path to the TOML config file (defaults to $CONFIG_PATH or config/MemlogConfig.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data source name; defaults to collector.source_name from the config.
    #[arg(short, long)]
    source: Option<String>,

    /// Print records as JSON lines.
    #[arg(long, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the most recent records.
    Latest {
        #[arg(short, default_value_t = 20)]
        n: usize,
    },
    /// Load one record by its timestamp (microseconds since the epoch).
    Load { timestamp: i64 },
    /// Prefix query against a secondary index.
    Query {
        index: String,
        #[arg(default_value = "")]
        prefix: String,
    },
    /// List raw index entries as key and timestamp.
    Keys { index: String },
    /// Rebuild one index, or all configured indices.
    Rebuild { index: Option<String> },
    /// Print store statistics.
    Stats,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => MemlogConfig::from_file(path),
        None => MemlogConfig::load_default(),
    }
    .context("加载配置失败")?;

    let source = args.source.clone().unwrap_or_else(|| config.collector.source_name.clone());
    let dir = config.storage.source_dir(&source);
    let store = LogStore::open(&dir, config.storage.pool_size)
        .with_context(|| format!("打开 {} 失败", dir.display()))?;

    let open_index = |name: &str| -> anyhow::Result<LogIndex> {
        let spec = config
            .indices
            .iter()
            .find(|spec| spec.name == name)
            .with_context(|| format!("配置中没有索引 {}", name))?;
        Ok(LogIndex::open_builtin(&dir, &spec.name, &spec.key, config.storage.pool_size)?)
    };

    let print = |record: &memlog_server::mlcommon::LogRecord| -> anyhow::Result<()> {
        if args.json {
            println!("{}", serde_json::to_string(record)?);
        } else {
            println!("{}", record);
        }
        Ok(())
    };

    match &args.command {
        Command::Latest { n } => {
            for record in store.latest(*n)? {
                print(&record)?;
            }
        }
        Command::Load { timestamp } => match store.load(Timestamp(*timestamp))? {
            Some(record) => print(&record)?,
            None => println!("❌ 未找到时间戳 {}", timestamp),
        },
        Command::Query { index, prefix } => {
            let index = open_index(index)?;
            let records = index.query_records(&store, prefix)?;
            for record in &records {
                print(record)?;
            }
            eprintln!("共 {} 条", records.len());
        }
        Command::Keys { index } => {
            let index = open_index(index)?;
            for (ikey, ts) in index.entries()? {
                match split_composite_key(&ikey) {
                    Some((key, _)) => println!("{}\t{}", key, ts.0),
                    None => println!("❌ 无法解析的索引项: {:?}", ikey),
                }
            }
        }
        Command::Rebuild { index } => {
            let names: Vec<String> = match index {
                Some(name) => vec![name.clone()],
                None => config.indices.iter().map(|spec| spec.name.clone()).collect(),
            };
            for name in names {
                let count = open_index(&name)?.rebuild(&store)?;
                println!("✅ 索引 {} 重建完成，{} 项", name, count);
            }
        }
        Command::Stats => {
            println!("数据源: {}", source);
            println!("记录数: {}", store.len()?);
            if let Some(last) = store.last_timestamp()? {
                println!("最新时间戳: {} ({})", last, last.0);
            }
            for spec in &config.indices {
                let index = open_index(&spec.name)?;
                println!("索引 {} ({}): {} 项", spec.name, spec.key, index.len()?);
            }
        }
    }

    Ok(())
}
