//! Kriya 守护进程入口
//!
//! 初始化日志与配置，装配阶段引擎，安装信号处理器，按配置启动 IPC 观察面，
//! 然后运行主循环直到收到关闭请求。

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use kriya::{config::load_config, llm::validate_budget, observability, EngineBuilder};

/// 引擎退出后等待 IPC 关闭的上限
const IPC_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "kriya", version, about = "Autonomous maintenance daemon")]
struct Cli {
    /// 配置文件路径（叠加在 config/default.toml 之上）
    #[arg(long, env = "KRIYA_CONFIG")]
    config: Option<PathBuf>,

    /// 只校验配置后退出
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!(error = %format!("{:#}", e), "kriya exited with a fatal error");
        eprintln!("kriya: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Err(e) = observability::init() {
        eprintln!("kriya: {}", e);
    }

    let config = load_config(cli.config).context("Failed to load configuration")?;
    validate_budget(&config.router).context("Invalid router configuration")?;
    if cli.check {
        println!("configuration OK");
        return Ok(());
    }

    let ipc_config = config.ipc.clone();
    let mut engine = EngineBuilder::new(config)
        .build()
        .context("Failed to assemble phase engine")?;

    let shutdown = engine.shutdown_manager();
    shutdown.install_signal_handlers();

    let ipc_task = spawn_ipc(&ipc_config, &engine);

    engine.run().await.context("Phase engine failed")?;

    if let Some(task) = ipc_task {
        // 引擎退出时 token 已取消，IPC 随之优雅关闭
        match tokio::time::timeout(IPC_STOP_GRACE, task).await {
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "IPC server stopped with error"),
            Ok(Err(e)) => tracing::warn!(error = %e, "IPC task panicked"),
            Ok(Ok(Ok(()))) => {}
            Err(_) => tracing::warn!(
                grace_secs = IPC_STOP_GRACE.as_secs(),
                "IPC server did not stop in time, exiting anyway"
            ),
        }
    }
    Ok(())
}

#[cfg(feature = "ipc")]
fn spawn_ipc(
    cfg: &kriya::config::IpcSection,
    engine: &kriya::PhaseEngine,
) -> Option<tokio::task::JoinHandle<anyhow::Result<()>>> {
    use kriya::ipc::{serve, IpcState};

    if !cfg.enabled {
        tracing::info!("IPC disabled");
        return None;
    }
    let shutdown = engine.shutdown_manager();
    let token = shutdown.token();
    let state = IpcState::new(
        engine.reader(),
        engine.events(),
        shutdown,
        Duration::from_secs(cfg.keepalive_secs.max(1)),
    );
    let cfg = cfg.clone();
    Some(tokio::spawn(async move {
        let result = serve(&cfg, state, token).await;
        if let Err(e) = &result {
            // IPC 只是观察面，失败不影响控制循环
            tracing::error!(error = %e, "IPC server unavailable");
        }
        result
    }))
}

#[cfg(not(feature = "ipc"))]
fn spawn_ipc(
    _cfg: &kriya::config::IpcSection,
    _engine: &kriya::PhaseEngine,
) -> Option<tokio::task::JoinHandle<anyhow::Result<()>>> {
    None
}
