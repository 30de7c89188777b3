//! Docker CLI 沙箱
//!
//! 每个脚本在一次性容器中运行：无网络、只读根文件系统、丢弃全部 capability、禁止提权、
//! 限制内存、CPU 与进程数，/tmp 为小容量 tmpfs。超时后强制移除容器。
//! stdout/stderr 各自最多保留 1 MiB，超出部分读出后丢弃。

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::Instant;

use super::{ExecOutcome, Sandbox, SandboxResult, SandboxStatus};
use crate::config::SandboxSection;

const CONTAINER_LABEL: &str = "kriya.sandbox=1";
const MEMORY_LIMIT: &str = "512m";
const CPU_QUOTA: &str = "50000";
const PIDS_LIMIT: &str = "64";
const TMPFS: &str = "/tmp:size=64m,noexec,nosuid";
/// 外层超时在脚本超时之上的余量（容器启动、强制移除）
const OUTER_GRACE: Duration = Duration::from_secs(10);
/// 运行时探测命令的超时
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// 每个输出流保留的字节上限
const MAX_OUTPUT_BYTES: u64 = 1 << 20;
const TRUNCATED_MARKER: &str = "\n[output truncated]";

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn into_text(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATED_MARKER);
        }
        text
    }
}

/// 读取至多 limit 字节，其余内容排空以免子进程阻塞在管道上
async fn read_capped<R: AsyncRead + Unpin>(reader: R, limit: u64) -> std::io::Result<Captured> {
    let mut bytes = Vec::new();
    let mut limited = reader.take(limit);
    limited.read_to_end(&mut bytes).await?;
    let extra = tokio::io::copy(&mut limited.into_inner(), &mut tokio::io::sink()).await?;
    Ok(Captured {
        bytes,
        truncated: extra > 0,
    })
}

async fn capture<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Captured> {
    match pipe {
        Some(reader) => read_capped(reader, MAX_OUTPUT_BYTES).await,
        None => Ok(Captured::default()),
    }
}

pub struct DockerSandbox {
    docker_bin: PathBuf,
    image: String,
    status: Mutex<SandboxStatus>,
}

impl DockerSandbox {
    pub fn new(cfg: &SandboxSection) -> Self {
        Self {
            docker_bin: cfg.docker_bin.clone(),
            image: cfg.image.clone(),
            status: Mutex::new(SandboxStatus::Unavailable),
        }
    }

    fn docker(&self) -> Command {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.kill_on_drop(true).stdin(Stdio::null());
        cmd
    }

    fn set_status(&self, status: SandboxStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// `docker run` 参数：加固选项固定，不接受调用方覆盖
    pub fn run_args(&self, container_name: &str, script: &str) -> Vec<String> {
        [
            "run",
            "--rm",
            "--name",
            container_name,
            "--label",
            CONTAINER_LABEL,
            "--network",
            "none",
            "--memory",
            MEMORY_LIMIT,
            "--cpu-quota",
            CPU_QUOTA,
            "--pids-limit",
            PIDS_LIMIT,
            "--read-only",
            "--cap-drop",
            "ALL",
            "--security-opt",
            "no-new-privileges:true",
            "--tmpfs",
            TMPFS,
            "--stop-signal",
            "SIGKILL",
            self.image.as_str(),
            "/bin/sh",
            "-c",
            script,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// 运行一条 docker 管理命令，返回是否成功；二进制缺失时返回 Err(NotFound)
    async fn probe(&self, args: &[&str]) -> std::io::Result<bool> {
        let mut cmd = self.docker();
        cmd.args(args).stdout(Stdio::null()).stderr(Stdio::null());
        match tokio::time::timeout(PROBE_TIMEOUT, cmd.status()).await {
            Ok(Ok(status)) => Ok(status.success()),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(false),
        }
    }

    async fn force_remove(&self, container_name: &str) {
        match self.probe(&["rm", "-f", container_name]).await {
            Ok(true) => tracing::info!(container = container_name, "timed-out container removed"),
            _ => tracing::warn!(container = container_name, "failed to remove timed-out container"),
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn status(&self) -> SandboxStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn initialize(&self) -> SandboxStatus {
        let status = match self.probe(&["version", "--format", "{{.Server.Version}}"]).await {
            Ok(true) => SandboxStatus::Healthy,
            Ok(false) => {
                tracing::error!("docker daemon not responding, sandbox DEGRADED");
                SandboxStatus::Degraded
            }
            Err(e) => {
                tracing::error!(error = %e, bin = %self.docker_bin.display(), "docker CLI unavailable, sandbox UNAVAILABLE");
                SandboxStatus::Unavailable
            }
        };
        self.set_status(status);
        if status != SandboxStatus::Healthy {
            return status;
        }

        if !matches!(self.probe(&["image", "inspect", self.image.as_str()]).await, Ok(true)) {
            tracing::info!(image = %self.image, "pulling sandbox base image");
            if !matches!(self.probe(&["pull", self.image.as_str()]).await, Ok(true)) {
                tracing::warn!(image = %self.image, "image pull failed, will retry at execution time");
            }
        }
        if let Err(e) = self.cleanup().await {
            tracing::warn!(error = %e, "stale container prune failed");
        }
        tracing::info!(image = %self.image, "sandbox HEALTHY");
        status
    }

    async fn health_check(&self) -> bool {
        let previous = self.status();
        if previous == SandboxStatus::Unavailable {
            return false;
        }
        let ok = matches!(self.probe(&["version", "--format", "{{.Server.Version}}"]).await, Ok(true));
        match (previous, ok) {
            (SandboxStatus::Healthy, false) => {
                tracing::warn!("docker connectivity lost, sandbox DEGRADED");
                self.set_status(SandboxStatus::Degraded);
            }
            (SandboxStatus::Degraded, true) => {
                tracing::info!("docker connectivity restored, sandbox HEALTHY");
                self.set_status(SandboxStatus::Healthy);
            }
            _ => {}
        }
        ok
    }

    async fn execute(&self, script: &str, timeout: Duration) -> SandboxResult {
        if !self.is_operational() {
            return SandboxResult::error(format!("sandbox {}", self.status().as_str()));
        }

        let name = format!("kriya-{}", uuid::Uuid::new_v4().simple());
        let mut cmd = self.docker();
        cmd.args(self.run_args(&name, script))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        tracing::info!(container = %name, image = %self.image, timeout_secs = timeout.as_secs(), "sandbox execute");

        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return SandboxResult::error(format!("docker spawn failed: {}", e)),
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let collect = async {
            let (out, err, status) = tokio::join!(capture(stdout), capture(stderr), child.wait());
            Ok::<_, std::io::Error>((out?, err?, status?))
        };
        let run = tokio::time::timeout(timeout, collect);
        let (out, err, status) = match tokio::time::timeout(timeout + OUTER_GRACE, run).await {
            Ok(Ok(Ok(output))) => output,
            Ok(Ok(Err(e))) => return SandboxResult::error(format!("docker wait failed: {}", e)),
            Ok(Err(_)) | Err(_) => {
                tracing::warn!(container = %name, timeout_secs = timeout.as_secs(), "sandbox execution timed out");
                self.force_remove(&name).await;
                return SandboxResult {
                    outcome: ExecOutcome::Timeout,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: started.elapsed(),
                    error: Some(format!("execution exceeded {}s deadline", timeout.as_secs())),
                };
            }
        };

        if out.truncated || err.truncated {
            tracing::warn!(container = %name, limit_bytes = MAX_OUTPUT_BYTES, "sandbox output truncated");
        }
        let exit_code = status.code();
        // 125 为 docker 自身错误（如镜像缺失），不是脚本的退出码
        let outcome = match exit_code {
            Some(0) => ExecOutcome::Success,
            Some(125) => ExecOutcome::SandboxError,
            _ => ExecOutcome::Failure,
        };
        let result = SandboxResult {
            outcome,
            exit_code,
            stdout: out.into_text(),
            stderr: err.into_text(),
            duration: started.elapsed(),
            error: None,
        };
        tracing::info!(
            container = %name,
            exit_code = ?exit_code,
            elapsed_ms = result.duration.as_millis() as u64,
            "sandbox execution finished"
        );
        result
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        if self.status() == SandboxStatus::Unavailable {
            return Ok(());
        }
        let filter = format!("label={}", CONTAINER_LABEL);
        match self.probe(&["container", "prune", "-f", "--filter", &filter]).await {
            Ok(true) => Ok(()),
            Ok(false) => anyhow::bail!("docker container prune failed"),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_are_hardened() {
        let sandbox = DockerSandbox::new(&SandboxSection::default());
        let args = sandbox.run_args("kriya-test", "echo hi");
        let joined = args.join(" ");
        for flag in [
            "--network none",
            "--memory 512m",
            "--cpu-quota 50000",
            "--pids-limit 64",
            "--read-only",
            "--cap-drop ALL",
            "--security-opt no-new-privileges:true",
            "--tmpfs /tmp:size=64m,noexec,nosuid",
        ] {
            assert!(joined.contains(flag), "missing {flag}");
        }
        // 脚本作为单个参数传给 sh -c，不经过宿主 shell
        assert_eq!(args[args.len() - 3..], ["/bin/sh", "-c", "echo hi"]);
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let noisy = vec![b'x'; 40];
        let captured = read_capped(noisy.as_slice(), 16).await.unwrap();
        assert_eq!(captured.bytes.len(), 16);
        assert!(captured.truncated);
        let text = captured.into_text();
        assert!(text.starts_with(&"x".repeat(16)));
        assert!(text.ends_with("[output truncated]"));

        let quiet = read_capped(&b"done\n"[..], 16).await.unwrap();
        assert!(!quiet.truncated);
        assert_eq!(quiet.into_text(), "done\n");

        // 恰好等于上限不算截断
        let exact = read_capped(&b"0123456789abcdef"[..], 16).await.unwrap();
        assert!(!exact.truncated);
    }

    #[tokio::test]
    async fn test_missing_docker_is_unavailable() {
        let sandbox = DockerSandbox::new(&SandboxSection {
            docker_bin: PathBuf::from("/nonexistent/docker"),
            ..SandboxSection::default()
        });
        assert_eq!(sandbox.initialize().await, SandboxStatus::Unavailable);
        assert!(!sandbox.is_operational());
        let result = sandbox.execute("echo hi", Duration::from_secs(1)).await;
        assert_eq!(result.outcome, ExecOutcome::SandboxError);
        assert!(!sandbox.health_check().await);
    }
}
