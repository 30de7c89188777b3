//! 存活监控：只在阶段完成时向外部监管者报活
//!
//! 报活与前进进度绑定，不存在独立定时器。任何阶段卡死后不再有 ping，监管者截止时间到期后
//! 由其重启进程。ping 按 `deadline / 2` 限频，只降低底层调用次数，不压制存活信号。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

/// 监管者通知后端（systemd sd_notify 或空实现）
pub trait Notifier: Send + Sync {
    /// 发送一行状态，如 `WATCHDOG=1`、`READY=1`、`STATUS=...`
    fn notify(&self, state: &str) -> std::io::Result<()>;

    /// 是否连接到真实监管者
    fn enabled(&self) -> bool {
        true
    }
}

/// 空实现：没有 NOTIFY_SOCKET 时使用
#[derive(Debug, Default, Clone)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _state: &str) -> std::io::Result<()> {
        Ok(())
    }

    fn enabled(&self) -> bool {
        false
    }
}

/// systemd 通知：向 NOTIFY_SOCKET 发送数据报（`@` 开头为抽象命名空间）
#[derive(Debug, Clone)]
pub struct SystemdNotifier {
    socket: String,
}

impl SystemdNotifier {
    pub fn new(socket: impl Into<String>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    /// 根据环境变量选择后端：有 NOTIFY_SOCKET 用 systemd，否则空实现
    pub fn from_env() -> Arc<dyn Notifier> {
        match std::env::var("NOTIFY_SOCKET") {
            Ok(socket) if !socket.is_empty() => {
                tracing::info!(socket = %socket, "systemd notify socket detected");
                Arc::new(SystemdNotifier::new(socket))
            }
            _ => {
                tracing::warn!("NOTIFY_SOCKET not set, running without supervisor integration");
                Arc::new(NoopNotifier)
            }
        }
    }
}

impl Notifier for SystemdNotifier {
    #[cfg(unix)]
    fn notify(&self, state: &str) -> std::io::Result<()> {
        use std::os::unix::net::UnixDatagram;

        let sock = UnixDatagram::unbound()?;
        if let Some(name) = self.socket.strip_prefix('@') {
            #[cfg(target_os = "linux")]
            {
                use std::os::linux::net::SocketAddrExt;
                let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
                sock.send_to_addr(state.as_bytes(), &addr)?;
                return Ok(());
            }
            #[cfg(not(target_os = "linux"))]
            {
                let _ = name;
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "abstract notify socket requires linux",
                ));
            }
        }
        sock.send_to(state.as_bytes(), &self.socket)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn notify(&self, _state: &str) -> std::io::Result<()> {
        Ok(())
    }
}

/// 从 WATCHDOG_USEC 读取监管截止时间（若 WATCHDOG_PID 指向其他进程则忽略）
pub fn watchdog_deadline_from_env() -> Option<Duration> {
    if let Ok(pid) = std::env::var("WATCHDOG_PID") {
        if pid.trim().parse::<u32>().ok() != Some(std::process::id()) {
            return None;
        }
    }
    let usec = std::env::var("WATCHDOG_USEC").ok()?;
    let usec: u64 = usec.trim().parse().ok()?;
    (usec > 0).then(|| Duration::from_micros(usec))
}

/// 存活统计（供测试与遥测读取）
#[derive(Debug, Default)]
pub struct LivenessStats {
    requested: AtomicU64,
    sent: AtomicU64,
}

impl LivenessStats {
    /// 阶段完成时调用 ping 的次数
    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::Relaxed)
    }

    /// 实际发给监管者的次数
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

/// 存活监控器，由 PhaseEngine 在阶段完成回调中调用
pub struct LivenessMonitor {
    notifier: Arc<dyn Notifier>,
    supervisor_deadline: Duration,
    last_ping: Option<Instant>,
    stats: Arc<LivenessStats>,
}

impl LivenessMonitor {
    pub fn new(notifier: Arc<dyn Notifier>, supervisor_deadline: Duration) -> Self {
        Self {
            notifier,
            supervisor_deadline,
            last_ping: None,
            stats: Arc::new(LivenessStats::default()),
        }
    }

    pub fn supervisor_deadline(&self) -> Duration {
        self.supervisor_deadline
    }

    pub fn stats(&self) -> Arc<LivenessStats> {
        Arc::clone(&self.stats)
    }

    /// 余量检查：截止时间应至少是最坏单阶段耗时的两倍
    pub fn check_margin(&self, expected_worst_phase: Duration) -> bool {
        let ok = self.supervisor_deadline >= expected_worst_phase * 2;
        if !ok {
            tracing::warn!(
                deadline_secs = self.supervisor_deadline.as_secs_f64(),
                worst_phase_secs = expected_worst_phase.as_secs_f64(),
                "supervisor deadline is below 2x the expected worst-case phase; spurious restarts likely"
            );
        }
        ok
    }

    /// 阶段完成后调用：距上次发送不少于 deadline/2 才真正发送 WATCHDOG=1
    pub fn ping(&mut self, now: Instant) -> bool {
        self.stats.requested.fetch_add(1, Ordering::Relaxed);
        let due = match self.last_ping {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.supervisor_deadline / 2,
        };
        if !due {
            return false;
        }
        if let Err(e) = self.notifier.notify("WATCHDOG=1") {
            tracing::debug!(error = %e, "watchdog notify failed");
        }
        self.last_ping = Some(now);
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// 非存活类通知（READY / STATUS / STOPPING），失败只记日志
    pub fn notify_state(&self, state: &str) {
        if let Err(e) = self.notifier.notify(state) {
            tracing::debug!(error = %e, state, "supervisor notify failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        lines: Mutex<Vec<String>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, state: &str) -> std::io::Result<()> {
            self.lines.lock().unwrap().push(state.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_first_ping_always_sent() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut monitor = LivenessMonitor::new(notifier.clone(), Duration::from_secs(30));
        assert!(monitor.ping(Instant::now()));
        assert_eq!(notifier.lines.lock().unwrap().as_slice(), ["WATCHDOG=1"]);
    }

    #[test]
    fn test_ping_rate_limited_to_half_deadline() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut monitor = LivenessMonitor::new(notifier.clone(), Duration::from_secs(30));
        let t0 = Instant::now();
        assert!(monitor.ping(t0));
        assert!(!monitor.ping(t0 + Duration::from_secs(5)));
        assert!(!monitor.ping(t0 + Duration::from_secs(14)));
        assert!(monitor.ping(t0 + Duration::from_secs(15)));
        assert!(!monitor.ping(t0 + Duration::from_secs(20)));

        let stats = monitor.stats();
        assert_eq!(stats.requested(), 5);
        assert_eq!(stats.sent(), 2);
        assert!(stats.sent() <= stats.requested());
        assert_eq!(notifier.lines.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_check_margin() {
        let monitor = LivenessMonitor::new(Arc::new(NoopNotifier), Duration::from_secs(60));
        assert!(monitor.check_margin(Duration::from_secs(30)));
        assert!(!monitor.check_margin(Duration::from_secs(31)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_systemd_notifier_sends_datagram() {
        use std::os::unix::net::UnixDatagram;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("notify.sock");
        let server = UnixDatagram::bind(&path).unwrap();

        let notifier = SystemdNotifier::new(path.to_string_lossy().to_string());
        notifier.notify("READY=1").unwrap();

        let mut buf = [0u8; 64];
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1");
    }
}
