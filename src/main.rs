//! 应用程序入口 (Application Entrypoint)
//!
//! 负责 CLI 指令解析、遥测层初始化、依赖注入及系统生命周期管理。

mod actors;
mod core;
mod engine;
mod interfaces;
mod network;
mod ui;
mod utils;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::actors::TunnelCoordinator;
use crate::core::config::AppConfig;
use crate::core::form::FormInput;
use crate::core::model::{Configuration, ConfigurationId, ProtocolType};
use crate::core::selection::ActiveSelection;
use crate::core::store::ConfigurationStore;
use crate::engine::ConfigurationListManager;
use crate::interfaces::TunnelTransport;
use crate::network::HttpFetcher;
use crate::ui::{LogNotifier, Ui};
use crate::utils::format::{self, PayloadFormat};
use crate::utils::singbox::SingBoxTunnel;

/// 命令行界面脚手架 (CLI Scaffolding)
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// 配置文件路径 (默认读取工作目录下的 mango.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 列出全部配置
    List,
    /// 显示配置详情
    Show { id: String },
    /// 由表单文件手动创建配置
    Create {
        /// 协议类型 (vless / vmess / trojan / shadowsocks)
        #[arg(short, long)]
        protocol: ProtocolType,
        /// 表单文件 (TOML / JSON / YAML)
        #[arg(short, long)]
        form: PathBuf,
    },
    /// 从订阅地址或本地文件导入
    Import { source: String },
    /// 重新拉取远程订阅
    Update { id: String },
    /// 重命名
    Rename { id: String, name: String },
    /// 删除配置
    Delete { id: String },
    /// 选中配置并启动隧道，前台运行直到 Ctrl-C
    Connect {
        id: String,
        /// 定时刷新订阅的间隔 (秒)
        #[arg(long)]
        refresh: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 遥测层初始化 (Telemetry Layer Initialization)
    if std::env::var("RUST_LOG").is_err() {
        unsafe {
            std::env::set_var("RUST_LOG", "info");
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_ansi(true)
        .init();

    let cli = Cli::parse();

    // 依赖项初始化与注入 (Dependency Injection)
    let config = Arc::new(AppConfig::load(cli.config.as_deref())?);
    let store = Arc::new(
        ConfigurationStore::open(config.store_dir())
            .with_context(|| format!("Failed to open store at {}", config.store_dir().display()))?,
    );
    let fetcher = Arc::new(HttpFetcher::new(&config.subscription)?);
    let manager = Arc::new(
        ConfigurationListManager::new(store.clone(), fetcher).with_notifier(Arc::new(LogNotifier)),
    );

    // 信号处理与优雅退出 (Signal Handling)
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    match cli.command {
        Commands::List => {
            if manager.store().is_empty() {
                println!("No configurations yet, use `import` or `create` to add one");
            }
            for (index, configuration) in manager.list().iter().enumerate() {
                println!("{:>3}. {}", index + 1, summary(configuration));
            }
            tracing::debug!("{} configuration(s) listed", manager.store().len());
        }
        Commands::Show { id } => {
            let configuration = manager.get(&ConfigurationId::from(id))?;
            println!("{}", serde_json::to_string_pretty(&configuration)?);
        }
        Commands::Create { protocol, form } => {
            let form = read_form(&form)?;
            let configuration = manager.create(protocol, &form)?;
            println!("{}", summary(&configuration));
        }
        Commands::Import { source } => {
            let configuration = match Url::parse(&source) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {
                    manager.import_remote(url, &shutdown).await?
                }
                _ => manager.import_local(PathBuf::from(source), &shutdown).await?,
            };
            println!("{}", summary(&configuration));
        }
        Commands::Update { id } => {
            let configuration = manager
                .update(&ConfigurationId::from(id), &shutdown)
                .await?;
            println!("{}", summary(&configuration));
        }
        Commands::Rename { id, name } => {
            let configuration = manager.rename(&ConfigurationId::from(id), &name)?;
            println!("{}", summary(&configuration));
        }
        Commands::Delete { id } => {
            let configuration = manager.delete(&ConfigurationId::from(id))?;
            println!("Deleted {}", summary(&configuration));
        }
        Commands::Connect { id, refresh } => {
            connect(&config, manager, ConfigurationId::from(id), refresh, shutdown).await?;
        }
    }

    Ok(())
}

/// 前台运行隧道：事件驱动的协调器 + 可选的定时刷新
async fn connect(
    config: &AppConfig,
    manager: Arc<ConfigurationListManager>,
    id: ConfigurationId,
    refresh: Option<u64>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let transport: Arc<dyn TunnelTransport> =
        Arc::new(SingBoxTunnel::new(&config.singbox, &config.runtime_dir())?);
    let coordinator = Arc::new(
        TunnelCoordinator::new(
            transport.clone(),
            ActiveSelection::default(),
            manager.store().clone(),
            config.tunnel.quiescence_timeout(),
        )
        .with_notifier(Arc::new(LogNotifier)),
    );

    let ui_handle = Ui::run(manager.subscribe(), manager.store().clone());
    let status_handle = Ui::watch_status(transport.subscribe_status());
    let coordinator_handle = coordinator.clone().spawn(manager.subscribe());

    let configuration = coordinator.select(&id)?;
    coordinator.connect().await?;
    tracing::info!(
        "Serving \"{}\" on {}:{}, tunnel {} (Ctrl-C to stop)",
        configuration.alias,
        config.singbox.listen,
        config.singbox.proxy_port,
        coordinator.status()
    );

    match refresh.filter(|secs| *secs > 0) {
        Some(secs) => {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if manager.is_downloading(&id) {
                            continue;
                        }
                        // 失败已由管理器记录并通知
                        let _ = manager.update(&id, &shutdown).await;
                    }
                }
            }
        }
        None => shutdown.cancelled().await,
    }

    coordinator.disconnect().await;

    // 释放事件发送端后等待后台任务退出
    drop(coordinator);
    drop(manager);
    let _ = coordinator_handle.await;
    let _ = ui_handle.await;
    status_handle.abort();
    Ok(())
}

fn read_form(path: &std::path::Path) -> anyhow::Result<FormInput> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read form {}", path.display()))?;
    let format = PayloadFormat::from_path(path).unwrap_or_else(|| PayloadFormat::detect(&content));
    if format == PayloadFormat::ShareLink {
        bail!("Form must be a TOML, JSON or YAML document");
    }
    let value = format::parse_document(&content, format)?;
    Ok(serde_json::from_value(value)?)
}

fn summary(configuration: &Configuration) -> String {
    format!(
        "{} \"{}\" [{}] {}:{} ({}, updated {})",
        configuration.id,
        configuration.alias,
        configuration.body.protocol_type(),
        configuration.body.protocol.address(),
        configuration.body.protocol.port(),
        configuration.source,
        configuration.least_updated.format("%Y-%m-%d %H:%M:%S")
    )
}
