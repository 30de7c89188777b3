//! 阶段引擎行为测试：阶段顺序、报活、错误隔离、日志尾、关闭、快照一致性

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kriya::core::{
    EngineSettings, EngineStatus, LogTail, Notifier, NoopNotifier, Phase, PhaseContext,
    PhaseEngine, PhaseError, PhaseHandler, ShutdownManager, ShutdownReason,
};
use tokio::time::Instant;

type Trace = Arc<Mutex<Vec<(u64, Phase)>>>;

/// 可配置的阶段处理器：记录轨迹，按需失败、耗时或在指定位置请求关闭
struct Scripted {
    trace: Trace,
    shutdown: Arc<ShutdownManager>,
    /// 在 (迭代, 阶段) 请求关闭
    stop_at: (u64, Phase),
    fail_at: Option<(u64, Phase)>,
    phase_cost: Duration,
    iteration_starts: Arc<Mutex<Vec<Instant>>>,
}

impl Scripted {
    fn new(shutdown: Arc<ShutdownManager>, stop_at: (u64, Phase)) -> Self {
        Self {
            trace: Arc::new(Mutex::new(Vec::new())),
            shutdown,
            stop_at,
            fail_at: None,
            phase_cost: Duration::ZERO,
            iteration_starts: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl PhaseHandler for Scripted {
    async fn run(&mut self, phase: Phase, ctx: &mut PhaseContext<'_>) -> Result<(), PhaseError> {
        let iteration = ctx.state.iteration;
        if phase == Phase::Sense {
            self.iteration_starts.lock().unwrap().push(Instant::now());
        }
        self.trace.lock().unwrap().push((iteration, phase));
        if !self.phase_cost.is_zero() {
            tokio::time::sleep(self.phase_cost).await;
        }
        if (iteration, phase) == self.stop_at {
            self.shutdown.shutdown(ShutdownReason::Command);
        }
        if self.fail_at == Some((iteration, phase)) {
            return Err(PhaseError::Other(format!("injected failure in {}", phase)));
        }
        ctx.info(format!("{} done", phase));
        Ok(())
    }
}

fn settings(interval: Duration) -> EngineSettings {
    EngineSettings {
        interval,
        supervisor_deadline: Duration::from_secs(30),
        ..EngineSettings::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_each_iteration_runs_all_phases_in_order() {
    let shutdown = Arc::new(ShutdownManager::new());
    let handler = Scripted::new(shutdown.clone(), (3, Phase::Patch));
    let trace = handler.trace.clone();
    let mut engine = PhaseEngine::new(
        Box::new(handler),
        settings(Duration::from_secs(1)),
        Arc::new(NoopNotifier),
        shutdown,
    );

    engine.run().await.unwrap();

    let expected: Vec<(u64, Phase)> = (1..=3)
        .flat_map(|i| Phase::SEQUENCE.iter().map(move |p| (i, *p)))
        .collect();
    assert_eq!(*trace.lock().unwrap(), expected);
    assert_eq!(engine.state().iteration, 3);
    assert_eq!(engine.state().status, EngineStatus::Offline);
}

/// 统计 WATCHDOG=1 的发送次数
struct CountingNotifier {
    watchdog: AtomicU64,
}

impl Notifier for CountingNotifier {
    fn notify(&self, state: &str) -> std::io::Result<()> {
        if state == "WATCHDOG=1" {
            self.watchdog.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// 每个阶段开始时核对：报活次数不超过此前完成的阶段数
struct PingAuditor {
    notifier: Arc<CountingNotifier>,
    completed: u64,
    violations: Arc<AtomicU64>,
    shutdown: Arc<ShutdownManager>,
}

#[async_trait]
impl PhaseHandler for PingAuditor {
    async fn run(&mut self, phase: Phase, ctx: &mut PhaseContext<'_>) -> Result<(), PhaseError> {
        if self.notifier.watchdog.load(Ordering::SeqCst) > self.completed {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        // 阶段耗时超过 deadline/2，使每次完成都会真正发出报活
        tokio::time::sleep(Duration::from_secs(3)).await;
        if self.notifier.watchdog.load(Ordering::SeqCst) > self.completed {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.completed += 1;
        if phase == Phase::Patch && ctx.state.iteration == 2 {
            self.shutdown.shutdown(ShutdownReason::Command);
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_liveness_pings_never_exceed_phase_completions() {
    let shutdown = Arc::new(ShutdownManager::new());
    let notifier = Arc::new(CountingNotifier {
        watchdog: AtomicU64::new(0),
    });
    let violations = Arc::new(AtomicU64::new(0));
    let handler = PingAuditor {
        notifier: notifier.clone(),
        completed: 0,
        violations: violations.clone(),
        shutdown: shutdown.clone(),
    };
    let settings = EngineSettings {
        interval: Duration::from_secs(1),
        supervisor_deadline: Duration::from_secs(4),
        ..EngineSettings::default()
    };
    let mut engine = PhaseEngine::new(Box::new(handler), settings, notifier.clone(), shutdown);
    let stats = engine.liveness_stats();

    engine.run().await.unwrap();

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    let completions = 2 * Phase::SEQUENCE.len() as u64;
    assert_eq!(stats.requested(), completions);
    assert_eq!(stats.sent(), notifier.watchdog.load(Ordering::SeqCst));
    assert!(stats.sent() <= completions);
    // 每个阶段 3s > deadline/2，所以每次完成都发出
    assert_eq!(stats.sent(), completions);
}

#[tokio::test(start_paused = true)]
async fn test_liveness_is_rate_limited_for_fast_phases() {
    let shutdown = Arc::new(ShutdownManager::new());
    let notifier = Arc::new(CountingNotifier {
        watchdog: AtomicU64::new(0),
    });
    let handler = Scripted::new(shutdown.clone(), (4, Phase::Patch));
    let mut engine = PhaseEngine::new(
        Box::new(handler),
        settings(Duration::from_secs(1)),
        notifier.clone(),
        shutdown,
    );
    let stats = engine.liveness_stats();

    engine.run().await.unwrap();

    assert_eq!(stats.requested(), 4 * Phase::SEQUENCE.len() as u64);
    // 3 秒的运行时间、15 秒的限频间隔：只有首次完成会真正报活
    assert_eq!(notifier.watchdog.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failing_phase_does_not_delay_next_iteration() {
    let interval = Duration::from_secs(5);
    let shutdown = Arc::new(ShutdownManager::new());
    let mut handler = Scripted::new(shutdown.clone(), (3, Phase::Patch));
    handler.fail_at = Some((2, Phase::Sense));
    handler.phase_cost = Duration::from_millis(100);
    let starts = handler.iteration_starts.clone();
    let trace = handler.trace.clone();
    let mut engine = PhaseEngine::new(Box::new(handler), settings(interval), Arc::new(NoopNotifier), shutdown);
    let mut events = engine.events().subscribe();

    let result = engine.run().await;
    assert!(result.is_ok());

    let starts = starts.lock().unwrap().clone();
    assert_eq!(starts.len(), 3);
    let epsilon = Duration::from_millis(50);
    assert!(starts[2] - starts[1] <= interval + epsilon, "{:?}", starts[2] - starts[1]);
    assert!(starts[2] - starts[1] >= interval);

    // 失败那轮其余阶段照常执行
    let second: Vec<Phase> = trace
        .lock()
        .unwrap()
        .iter()
        .filter(|(i, _)| *i == 2)
        .map(|(_, p)| *p)
        .collect();
    assert_eq!(second, Phase::SEQUENCE.to_vec());

    let mut saw_failure = false;
    while let Ok(ev) = events.try_recv() {
        if ev.message.contains("SENSE failed: injected failure") {
            saw_failure = true;
            assert_eq!(ev.iteration, 2);
        }
    }
    assert!(saw_failure);
    // 第 3 轮全部成功，last_error 被清除
    assert!(engine.state().last_error.is_none());
}

#[test]
fn test_log_tail_keeps_most_recent_entries_in_order() {
    let mut tail = LogTail::new(100);
    for i in 0..1000 {
        tail.push(format!("entry {}", i));
    }
    assert_eq!(tail.len(), 100);
    let kept: Vec<String> = tail.iter().cloned().collect();
    let expected: Vec<String> = (900..1000).map(|i| format!("entry {}", i)).collect();
    assert_eq!(kept, expected);
}

#[tokio::test(start_paused = true)]
async fn test_engine_log_tail_stays_bounded() {
    let shutdown = Arc::new(ShutdownManager::new());
    let handler = Scripted::new(shutdown.clone(), (30, Phase::Patch));
    let settings = EngineSettings {
        log_tail_capacity: 20,
        ..settings(Duration::from_millis(100))
    };
    let mut engine = PhaseEngine::new(Box::new(handler), settings, Arc::new(NoopNotifier), shutdown);
    engine.run().await.unwrap();

    let tail: Vec<String> = engine.state().log_tail.iter().cloned().collect();
    assert_eq!(tail.len(), 20);
    assert!(tail.last().unwrap().contains("offline after 30 iterations"));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_act_finishes_current_iteration_only() {
    let shutdown = Arc::new(ShutdownManager::new());
    let handler = Scripted::new(shutdown.clone(), (2, Phase::Act));
    let trace = handler.trace.clone();
    let mut engine = PhaseEngine::new(
        Box::new(handler),
        settings(Duration::from_secs(1)),
        Arc::new(NoopNotifier),
        shutdown,
    );
    let reader = engine.reader();

    engine.run().await.unwrap();

    let trace = trace.lock().unwrap().clone();
    let last_iteration: Vec<Phase> = trace.iter().filter(|(i, _)| *i == 2).map(|(_, p)| *p).collect();
    assert_eq!(last_iteration, Phase::SEQUENCE.to_vec());
    assert!(trace.iter().all(|(i, _)| *i <= 2));
    assert_eq!(engine.state().iteration, 2);

    let snap = reader.snapshot();
    assert!(snap.shutdown_requested);
    assert_eq!(snap.status, EngineStatus::Offline);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_before_first_iteration_runs_nothing() {
    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.shutdown(ShutdownReason::Signal);
    let handler = Scripted::new(shutdown.clone(), (1, Phase::Patch));
    let trace = handler.trace.clone();
    let mut engine = PhaseEngine::new(
        Box::new(handler),
        settings(Duration::from_secs(1)),
        Arc::new(NoopNotifier),
        shutdown,
    );
    engine.run().await.unwrap();
    assert!(trace.lock().unwrap().is_empty());
    assert_eq!(engine.state().iteration, 0);
}

/// 在同一阶段内先后改写两个相关字段，中间让出执行权
struct PairWriter {
    shutdown: Arc<ShutdownManager>,
    iterations: u64,
}

#[async_trait]
impl PhaseHandler for PairWriter {
    async fn run(&mut self, phase: Phase, ctx: &mut PhaseContext<'_>) -> Result<(), PhaseError> {
        if phase == Phase::Sense {
            let k = ctx.state.iteration;
            ctx.state.telemetry.sampled_iteration = k;
            tokio::time::sleep(Duration::from_millis(1)).await;
            ctx.state.telemetry.memory_records = Some(k as usize);
        }
        if phase == Phase::Patch && ctx.state.iteration >= self.iterations {
            self.shutdown.shutdown(ShutdownReason::Command);
        }
        Ok(())
    }
}

fn consistent(state_iteration: u64, memory_records: Option<usize>) -> bool {
    state_iteration == memory_records.unwrap_or(0) as u64
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_snapshots_never_mix_iterations() {
    let shutdown = Arc::new(ShutdownManager::new());
    let handler = PairWriter {
        shutdown: shutdown.clone(),
        iterations: 25,
    };
    let mut engine = PhaseEngine::new(
        Box::new(handler),
        settings(Duration::from_millis(2)),
        Arc::new(NoopNotifier),
        shutdown.clone(),
    );
    let reader = engine.reader();

    let token = shutdown.token();
    let observer = tokio::spawn(async move {
        let mut checked = 0u64;
        let mut torn = 0u64;
        loop {
            let snap = reader.snapshot();
            if !consistent(snap.telemetry.sampled_iteration, snap.telemetry.memory_records) {
                torn += 1;
            }
            checked += 1;
            if token.is_cancelled() && snap.status == EngineStatus::Offline {
                break;
            }
            tokio::task::yield_now().await;
        }
        (checked, torn)
    });

    engine.run().await.unwrap();
    let (checked, torn) = observer.await.unwrap();
    assert!(checked > 0);
    assert_eq!(torn, 0);
    assert_eq!(engine.state().telemetry.sampled_iteration, 25);
}
