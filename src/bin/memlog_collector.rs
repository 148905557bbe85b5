// 内存日志采集服务主程序
use anyhow::{bail, Context};
use clap::Parser;
use memlog_server::mlcommon::{logging_setup, MemlogConfig, MonotonicClock};
use memlog_server::mlstore::LogService;
use memlog_server::mltail::sim::SimulatedRing;
use memlog_server::mltail::{CollectorLoop, ProcessFinder, RegionProbe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Tail a log ring buffer inside another process into a durable indexed store.", long_about = None)]
struct Args {
    /// Path to the TOML config file (defaults to $CONFIG_PATH or config/MemlogConfig.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tail an in-process simulated ring buffer instead of a real process.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Rebuild all secondary indices from the primary store before collecting.
    #[arg(long, default_value_t = false)]
    rebuild_index: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => MemlogConfig::from_file(path),
        None => MemlogConfig::load_default(),
    }
    .context("加载配置失败")?;

    // 持有 guard，直到 main 函数结束，确保日志文件被完整写入
    let _log_guard = logging_setup::init_logging(&config.logging).context("初始化日志系统失败")?;

    run_app(args, config).await
}

/// 应用程序的核心业务逻辑
async fn run_app(args: Args, config: MemlogConfig) -> anyhow::Result<()> {
    let source_name = config.collector.source_name.clone();
    let service = LogService::open(&config.storage, &source_name, &config.indices)
        .with_context(|| format!("打开数据源 {} 的存储失败", source_name))?;

    if args.rebuild_index {
        for (name, count) in service.rebuild_all().await? {
            info!(log_type = "low_freq", index = %name, entries = count, "索引重建完成");
        }
    }

    // 以已持久化的最大时间戳为起点，重启后主键仍然递增
    let clock = match service.store_handle().last_timestamp()? {
        Some(last) => Arc::new(MonotonicClock::starting_after(last)),
        None => Arc::new(MonotonicClock::new()),
    };

    let demo_cancel = CancellationToken::new();
    let (finder, probe): (Arc<dyn ProcessFinder>, Arc<dyn RegionProbe>) = if args.simulate {
        let ring = SimulatedRing::new("memlog-demo", std::process::id(), 0x10000, 64 * 1024);
        tokio::spawn(run_demo_writer(ring.clone(), demo_cancel.clone()));
        (ring.finder(), ring.probe())
    } else {
        real_backend(&config)?
    };

    let collector = CollectorLoop::from_config(&config.collector, finder, probe, clock);
    let handle = collector.spawn(service.ingest_sender());
    info!(log_type = "low_freq", source = %source_name, simulate = args.simulate, "采集服务已启动，Ctrl+C 退出");

    let mut writer_check = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error.details = %e, "监听退出信号失败");
                }
                info!(log_type = "low_freq", "收到退出信号，开始关闭");
                break;
            }
            _ = writer_check.tick() => {
                if handle.is_finished() || !service.is_writer_running() {
                    warn!(log_type = "low_freq", "采集器或写入任务已停止，开始关闭");
                    break;
                }
            }
        }
    }

    // 先停采集器释放发送端，写入任务才能排空并退出
    demo_cancel.cancel();
    let collector_report = handle.stop().await;
    let writer_report = service.shutdown().await?;

    info!(
        log_type = "low_freq",
        records_emitted = collector_report.records_emitted,
        sessions = collector_report.sessions,
        data_loss_events = collector_report.data_loss_events,
        records_written = writer_report.records_written,
        index_failures = writer_report.index_failures,
        "采集服务已退出"
    );

    if writer_report.failed {
        bail!("主存储写入失败，采集服务异常退出");
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn real_backend(config: &MemlogConfig) -> anyhow::Result<(Arc<dyn ProcessFinder>, Arc<dyn RegionProbe>)> {
    use memlog_server::mltail::procfs::{DescriptorProbe, ProcfsFinder};

    if config.collector.process_name.is_empty() {
        bail!("未配置目标进程名 (collector.process_name)");
    }
    let magic = config
        .collector
        .descriptor_magic_bytes()
        .context("描述符标记必须是 8 个 ASCII 字符")?;
    Ok((
        Arc::new(ProcfsFinder::new(&config.collector.process_name)),
        Arc::new(DescriptorProbe::new(magic)),
    ))
}

#[cfg(not(target_os = "linux"))]
fn real_backend(_config: &MemlogConfig) -> anyhow::Result<(Arc<dyn ProcessFinder>, Arc<dyn RegionProbe>)> {
    bail!("当前平台没有进程内存后端，请使用 --simulate")
}

/// 演示模式下的写入方：周期性写入频道格式的日志
async fn run_demo_writer(ring: SimulatedRing, cancel: CancellationToken) {
    const LINES: &[&str] = &[
        "0001:Alice:hello there",
        "0003:Bob:are you coming?",
        "001D::The server will restart soon.",
        "0004:Carol:ready",
        "0042::You gain 120 experience points.",
    ];

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut n = 0usize;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                ring.append_line(LINES[n % LINES.len()]);
                n += 1;
            }
        }
    }
}
