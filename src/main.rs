use anyhow::Context;
use clap::Parser;
use peersync_lib::dirs;
use peersync_lib::logging::{LogConfig, SizeRotatingWriter};
use peersync_lib::{Controller, ModeKind, SyncSettings};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing_subscriber::prelude::*;

/// 局域网目录同步
#[derive(Debug, Parser)]
#[command(name = "peersync", version, about)]
struct Cli {
    /// 运行模式
    #[arg(long, value_enum)]
    mode: ModeKind,

    /// 同步根目录（可重复，顺序即 rootIndex）
    #[arg(long = "root")]
    roots: Vec<PathBuf>,

    #[arg(long)]
    control_port: Option<u16>,

    #[arg(long)]
    discovery_port: Option<u16>,

    #[arg(long)]
    notify_port: Option<u16>,

    /// 发现广播地址
    #[arg(long)]
    broadcast: Option<IpAddr>,

    /// 关闭系统文件通知，只使用定时扫描
    #[arg(long)]
    no_watch: bool,

    /// 数据目录（config.json 与日志）
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// 把合并后的配置写回 config.json
    #[arg(long)]
    save: bool,
}

impl Cli {
    /// 命令行参数覆盖配置文件
    fn apply(&self, settings: &mut SyncSettings) {
        if !self.roots.is_empty() {
            settings.roots = self.roots.clone();
        }
        if let Some(port) = self.control_port {
            settings.control_port = port;
        }
        if let Some(port) = self.discovery_port {
            settings.discovery_port = port;
        }
        if let Some(port) = self.notify_port {
            settings.notify_port = port;
        }
        if let Some(addr) = self.broadcast {
            settings.broadcast_addr = addr;
        }
        if self.no_watch {
            settings.live_watch = false;
        }
    }
}

/// 初始化日志系统
fn init_logging(log_dir: &Path) {
    let config = LogConfig::load(log_dir);

    if !config.enabled {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return;
    }

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(config.tracing_level().into());

    match SizeRotatingWriter::new(log_dir, config.max_size_mb) {
        Ok(file_writer) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(false);

            // debug 构建同时输出到控制台
            #[cfg(debug_assertions)]
            {
                let console_layer = tracing_subscriber::fmt::layer().with_target(false);
                let subscriber = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer)
                    .with(console_layer);
                let _ = tracing::subscriber::set_global_default(subscriber);
            }

            #[cfg(not(debug_assertions))]
            {
                let subscriber = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer);
                let _ = tracing::subscriber::set_global_default(subscriber);
            }
        }
        Err(e) => {
            eprintln!("无法创建日志文件 {}: {}", log_dir.display(), e);
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = dirs::data_dir(cli.config_dir.as_deref());
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("无法创建数据目录 {}", data_dir.display()))?;
    init_logging(&data_dir);

    let mut settings = SyncSettings::load(&data_dir);
    cli.apply(&mut settings);
    if cli.save {
        settings
            .save(&data_dir)
            .with_context(|| format!("无法保存配置到 {}", data_dir.display()))?;
    }

    let mut controller = Controller::new(settings);
    controller.switch_to(cli.mode).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("收到退出信号"),
        result = controller.wait() => {
            if let Err(e) = result {
                tracing::error!("运行结束: {:#}", e);
            }
        }
    }

    controller.teardown().await;
    Ok(())
}
