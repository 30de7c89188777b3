//! 阶段引擎：单写者迭代循环
//!
//! 每轮迭代按固定顺序执行 SENSE → REASON → ACT → REMEMBER → TELEMETRY_EMIT → PATCH。
//! 每个阶段返回（成功、已处理的失败或前置条件不满足的 no-op）后：
//! 1. ping 存活监控（唯一的报活路径）
//! 2. 发布一份状态快照供外部读者读取
//!
//! 阶段错误在边界被捕获并写入 `last_error`，不会终止循环；关闭标志只在迭代边界检查。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::AppConfig;
use crate::core::error::PhaseError;
use crate::core::liveness::{LivenessMonitor, LivenessStats, Notifier};
use crate::core::shutdown::{ShutdownCleanup, ShutdownCoordinator, ShutdownManager};
use crate::core::snapshot::{state_channel, StatePublisher, StateReader};
use crate::core::state::{EngineStatus, IterationState, Phase};

/// 日志级别（日志尾与事件流共用）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// 推送给事件流订阅者的日志事件
#[derive(Clone, Debug, Serialize)]
pub struct LogEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub level: LogLevel,
    pub phase: Phase,
    pub iteration: u64,
    pub message: String,
}

/// 日志事件总线：有界广播，慢订阅者丢最旧事件，发送永不阻塞
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<LogEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: LogEvent) {
        // 没有订阅者时 send 返回 Err，忽略即可
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.tx.subscribe()
    }
}

/// 写一条运维日志：tracing + 日志尾 + 事件流
fn record(state: &mut IterationState, events: &EventBus, level: LogLevel, message: String) {
    match level {
        LogLevel::Info => tracing::info!(phase = %state.phase, iteration = state.iteration, "{}", message),
        LogLevel::Warn => tracing::warn!(phase = %state.phase, iteration = state.iteration, "{}", message),
        LogLevel::Error => tracing::error!(phase = %state.phase, iteration = state.iteration, "{}", message),
    }
    let now = chrono::Utc::now();
    state.log_tail.push(format!(
        "{} [{}] [{}] {}",
        now.format("%H:%M:%S"),
        level.as_str(),
        state.phase,
        message
    ));
    events.publish(LogEvent {
        timestamp: now,
        level,
        phase: state.phase,
        iteration: state.iteration,
        message,
    });
}

/// 阶段执行上下文：对 IterationState 的独占可变借用，仅在阶段执行期间有效
pub struct PhaseContext<'a> {
    pub state: &'a mut IterationState,
    events: &'a EventBus,
}

impl<'a> PhaseContext<'a> {
    pub fn new(state: &'a mut IterationState, events: &'a EventBus) -> Self {
        Self { state, events }
    }

    pub fn info(&mut self, message: impl Into<String>) {
        record(self.state, self.events, LogLevel::Info, message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        record(self.state, self.events, LogLevel::Warn, message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        record(self.state, self.events, LogLevel::Error, message.into());
    }
}

/// 阶段处理器：引擎只负责顺序、边界与报活，阶段的具体工作由实现者完成
#[async_trait]
pub trait PhaseHandler: Send {
    /// 首轮迭代前调用一次（预检外部协作者）；失败只记录，不阻止启动
    async fn boot(&mut self, _ctx: &mut PhaseContext<'_>) -> Result<(), PhaseError> {
        Ok(())
    }

    /// 执行单个阶段；`phase` 不会是 Idle
    async fn run(&mut self, phase: Phase, ctx: &mut PhaseContext<'_>) -> Result<(), PhaseError>;

    /// 引擎退出前调用
    async fn shutdown(&mut self) {}
}

/// 单个阶段的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PhaseOutcome {
    Completed,
    Failed,
    /// 前置阶段失败，以 no-op 执行
    Skipped,
}

/// 引擎运行参数
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// 两次迭代开始之间的目标间隔
    pub interval: Duration,
    pub log_tail_capacity: usize,
    pub supervisor_deadline: Duration,
    pub expected_worst_phase: Duration,
    pub event_capacity: usize,
    pub cleanup_timeout_secs: u64,
}

impl EngineSettings {
    /// 从配置生成；WATCHDOG_USEC 存在时以其为监管截止时间
    pub fn from_config(cfg: &AppConfig, watchdog_deadline: Option<Duration>) -> Self {
        Self {
            interval: cfg.daemon.loop_interval(),
            log_tail_capacity: cfg.daemon.log_tail_capacity,
            supervisor_deadline: watchdog_deadline
                .unwrap_or_else(|| Duration::from_secs(cfg.watchdog.deadline_secs)),
            expected_worst_phase: Duration::from_secs(cfg.watchdog.expected_worst_phase_secs),
            event_capacity: cfg.ipc.event_capacity,
            cleanup_timeout_secs: cfg.daemon.cleanup_timeout_secs,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default(), None)
    }
}

/// 阶段引擎：IterationState 的唯一所有者与写者
pub struct PhaseEngine {
    state: IterationState,
    handler: Box<dyn PhaseHandler>,
    publisher: StatePublisher,
    liveness: LivenessMonitor,
    shutdown: Arc<ShutdownManager>,
    cleanup: ShutdownCoordinator,
    events: EventBus,
    settings: EngineSettings,
}

impl PhaseEngine {
    pub fn new(
        handler: Box<dyn PhaseHandler>,
        settings: EngineSettings,
        notifier: Arc<dyn Notifier>,
        shutdown: Arc<ShutdownManager>,
    ) -> Self {
        let state = IterationState::new(settings.log_tail_capacity);
        let (publisher, _) = state_channel(&state);
        Self {
            state,
            handler,
            publisher,
            liveness: LivenessMonitor::new(notifier, settings.supervisor_deadline),
            shutdown,
            cleanup: ShutdownCoordinator::new().with_timeout(settings.cleanup_timeout_secs),
            events: EventBus::new(settings.event_capacity),
            settings,
        }
    }

    /// 注册退出时执行的后台资源清理
    pub fn register_cleanup(&mut self, task: Arc<dyn ShutdownCleanup>) {
        self.cleanup.register(task);
    }

    /// 外部只读视图（快照副本）
    pub fn reader(&self) -> StateReader {
        self.publisher.reader()
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn shutdown_manager(&self) -> Arc<ShutdownManager> {
        Arc::clone(&self.shutdown)
    }

    pub fn liveness_stats(&self) -> Arc<LivenessStats> {
        self.liveness.stats()
    }

    pub fn state(&self) -> &IterationState {
        &self.state
    }

    /// 主循环：直到在迭代边界观察到关闭标志
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.boot().await;

        loop {
            if self.observe_shutdown() {
                break;
            }
            let started = Instant::now();
            self.run_iteration().await;
            self.cadence_sleep(started).await;
        }

        self.finish().await;
        Ok(())
    }

    async fn boot(&mut self) {
        self.publisher.publish(&self.state);
        self.liveness
            .check_margin(self.settings.expected_worst_phase);

        let result = {
            let mut ctx = PhaseContext::new(&mut self.state, &self.events);
            ctx.info("Kriya daemon booting");
            self.handler.boot(&mut ctx).await
        };
        if let Err(e) = result {
            let message = format!("boot check failed: {}", e);
            record(&mut self.state, &self.events, LogLevel::Warn, message.clone());
            self.state.last_error = Some(message);
        }

        self.state.status = EngineStatus::Active;
        self.liveness.notify_state("READY=1");
        self.liveness.notify_state(&format!(
            "STATUS=active, interval {}s",
            self.settings.interval.as_secs()
        ));
        record(
            &mut self.state,
            &self.events,
            LogLevel::Info,
            "Kriya daemon active".to_string(),
        );
        self.publisher.publish(&self.state);
    }

    /// 把外部关闭请求同步到状态标志；返回当前标志
    fn observe_shutdown(&mut self) -> bool {
        if self.shutdown.is_shutdown() && self.state.request_shutdown() {
            record(
                &mut self.state,
                &self.events,
                LogLevel::Info,
                "shutdown requested, exiting after current iteration".to_string(),
            );
        }
        self.state.shutdown_requested()
    }

    async fn run_iteration(&mut self) {
        self.state.iteration += 1;
        let mut outcomes: Vec<(Phase, PhaseOutcome)> = Vec::with_capacity(Phase::SEQUENCE.len());

        for phase in Phase::SEQUENCE {
            self.state.phase = phase;
            match phase {
                Phase::Reason => self.state.pending_actions.clear(),
                Phase::Act => self.state.last_action_results.clear(),
                _ => {}
            }
            self.publisher.publish(&self.state);

            let dependency_failed = phase.depends_on().is_some_and(|dep| {
                !outcomes
                    .iter()
                    .any(|(p, o)| *p == dep && *o == PhaseOutcome::Completed)
            });

            let outcome = if dependency_failed {
                let reason = PhaseError::Precondition(phase.depends_on().unwrap_or(phase));
                record(
                    &mut self.state,
                    &self.events,
                    LogLevel::Warn,
                    format!("{} skipped: {}", phase, reason),
                );
                PhaseOutcome::Skipped
            } else {
                self.execute_phase(phase).await
            };
            outcomes.push((phase, outcome));

            self.complete_phase();
        }

        let failed = outcomes
            .iter()
            .filter(|(_, o)| *o != PhaseOutcome::Completed)
            .count();
        if failed == 0 {
            self.state.last_error = None;
            self.state.status = EngineStatus::Active;
        } else {
            self.state.status = EngineStatus::Error;
        }
        self.state.phase = Phase::Idle;
        self.publisher.publish(&self.state);
        tracing::debug!(
            iteration = self.state.iteration,
            failed_phases = failed,
            "iteration finished"
        );
    }

    async fn execute_phase(&mut self, phase: Phase) -> PhaseOutcome {
        let started = Instant::now();
        let result = {
            let mut ctx = PhaseContext::new(&mut self.state, &self.events);
            self.handler.run(phase, &mut ctx).await
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                tracing::debug!(phase = %phase, elapsed_ms, "phase completed");
                PhaseOutcome::Completed
            }
            Err(e) => {
                let message = format!("{} failed: {}", phase, e);
                record(&mut self.state, &self.events, LogLevel::Error, message.clone());
                self.state.last_error = Some(message);
                PhaseOutcome::Failed
            }
        }
    }

    /// 阶段完成回调：报活与发布快照都只发生在这里
    fn complete_phase(&mut self) {
        if self.shutdown.is_shutdown() {
            self.state.request_shutdown();
        }
        self.liveness.ping(Instant::now());
        self.liveness
            .notify_state(&format!("STATUS=Phase: {}", self.state.phase));
        self.publisher.publish(&self.state);
    }

    /// 节奏控制：睡眠 max(0, interval - elapsed)，不补偿落后的 tick；关闭时提前结束
    async fn cadence_sleep(&mut self, started: Instant) {
        let remaining = self.settings.interval.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            tracing::warn!(
                iteration = self.state.iteration,
                interval_secs = self.settings.interval.as_secs_f64(),
                "iteration overran the interval, starting next one immediately"
            );
            return;
        }
        let token = self.shutdown.token();
        tokio::select! {
            _ = tokio::time::sleep(remaining) => {}
            _ = token.cancelled() => {}
        }
    }

    async fn finish(&mut self) {
        self.state.phase = Phase::Idle;
        self.state.status = EngineStatus::Offline;
        let message = format!("Kriya daemon offline after {} iterations", self.state.iteration);
        record(&mut self.state, &self.events, LogLevel::Info, message);
        self.publisher.publish(&self.state);
        self.liveness.notify_state("STOPPING=1");

        self.handler.shutdown().await;
        self.cleanup.run_cleanup().await;
    }
}
