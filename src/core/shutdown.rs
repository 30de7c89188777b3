//! 优雅关闭：单一协作式关闭标志
//!
//! 信号处理器与 IPC 命令只置位 CancellationToken，不直接改写 IterationState；
//! PhaseEngine 在迭代边界观察该标志并执行干净退出：
//! - 正在进行的迭代跑完全部阶段
//! - 后台资源（遥测队列、记忆 worker、沙箱容器）按序清理，每项有超时

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    /// 关闭原因广播
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM（通常来自 systemd stop）
    Signal,
    /// IPC `shutdown` 命令
    Command,
    /// 致命错误
    FatalError(String),
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Interrupt => f.write_str("interrupt"),
            ShutdownReason::Signal => f.write_str("signal"),
            ShutdownReason::Command => f.write_str("command"),
            ShutdownReason::FatalError(e) => write!(f, "fatal error: {}", e),
        }
    }
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(4);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 获取关闭 token（用于等待关闭的后台任务）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// 请求关闭；重复调用只记录第一次的原因，返回是否为首次
    pub fn shutdown(&self, reason: ShutdownReason) -> bool {
        if self.shutdown_token.is_cancelled() {
            tracing::debug!(reason = %reason, "shutdown already requested");
            return false;
        }
        tracing::info!(reason = %reason, "shutdown requested");
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)：只置位标志
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, finishing current iteration before exit");
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, finishing current iteration before exit");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：引擎退出时按注册顺序清理后台资源，每项单独限时
pub struct ShutdownCoordinator {
    tasks: Vec<Arc<dyn ShutdownCleanup>>,
    per_task: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            per_task: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.per_task = Duration::from_secs(secs);
        self
    }

    pub fn register(&mut self, task: Arc<dyn ShutdownCleanup>) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// 依次执行清理；失败或超时的任务只记日志，不影响后续任务。返回干净完成的数量
    pub async fn run_cleanup(&self) -> usize {
        let mut clean = 0;
        for task in &self.tasks {
            let task_name = task.name();
            match tokio::time::timeout(self.per_task, task.cleanup()).await {
                Ok(Ok(())) => {
                    clean += 1;
                    tracing::debug!(task = task_name, "cleanup finished");
                }
                Ok(Err(e)) => tracing::warn!(task = task_name, error = %e, "cleanup failed"),
                Err(_) => tracing::warn!(
                    task = task_name,
                    timeout_secs = self.per_task.as_secs(),
                    "cleanup timed out, abandoning"
                ),
            }
        }
        tracing::info!(clean, total = self.tasks.len(), "background resources released");
        clean
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// 记忆存储清理：关闭 SQLite worker
pub struct MemoryCleanup {
    store: Arc<dyn crate::memory::VectorMemory>,
}

impl MemoryCleanup {
    pub fn new(store: Arc<dyn crate::memory::VectorMemory>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for MemoryCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.store.close().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "VectorMemory"
    }
}

/// 沙箱清理：移除残留容器
pub struct SandboxCleanup {
    sandbox: Arc<dyn crate::sandbox::Sandbox>,
}

impl SandboxCleanup {
    pub fn new(sandbox: Arc<dyn crate::sandbox::Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SandboxCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.sandbox.cleanup().await
    }

    fn name(&self) -> &'static str {
        "Sandbox"
    }
}

/// 遥测队列清理：关闭发送端并等待队列中剩余负载发完
pub struct TelemetryDrain {
    emitter: crate::cloud::TelemetryEmitter,
}

impl TelemetryDrain {
    pub fn new(emitter: crate::cloud::TelemetryEmitter) -> Self {
        Self { emitter }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for TelemetryDrain {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.emitter.drain().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "TelemetryEmitter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_shutdown_is_set_once() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        let mut rx = manager.subscribe();
        assert!(!manager.is_shutdown());

        assert!(manager.shutdown(ShutdownReason::Command));
        assert!(!manager.shutdown(ShutdownReason::Signal));
        assert!(manager.is_shutdown());
        assert!(token.is_cancelled());
        assert_eq!(rx.try_recv().unwrap(), ShutdownReason::Command);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(ShutdownReason::Signal.to_string(), "signal");
        assert_eq!(
            ShutdownReason::FatalError("disk gone".into()).to_string(),
            "fatal error: disk gone"
        );
    }

    /// 按调用顺序记录名字；`hang` 为 true 时永不返回，`fail` 为 true 时返回错误
    struct Step {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        hang: bool,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for Step {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.label);
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.fail {
                anyhow::bail!("{} refused to stop", self.label);
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            self.label
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_runs_in_order_past_failures_and_hangs() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let step = |label, hang, fail| {
            Arc::new(Step {
                label,
                log: log.clone(),
                hang,
                fail,
            })
        };
        let mut coordinator = ShutdownCoordinator::new().with_timeout(1);
        coordinator.register(step("telemetry", false, false));
        coordinator.register(step("sandbox", true, false));
        coordinator.register(step("memory", false, true));
        coordinator.register(step("ipc", false, false));
        assert_eq!(coordinator.len(), 4);

        let started = tokio::time::Instant::now();
        let clean = coordinator.run_cleanup().await;

        assert_eq!(clean, 2);
        assert_eq!(*log.lock().unwrap(), ["telemetry", "sandbox", "memory", "ipc"]);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
