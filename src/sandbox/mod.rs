//! 沙箱执行：在隔离容器中运行 ACT 阶段的脚本
//!
//! 调用方先检查 `is_operational`；沙箱不可用时只记录意图，绝不退化为在宿主机上直接执行。

mod docker;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

pub use docker::DockerSandbox;

/// 沙箱子系统状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxStatus {
    Healthy,
    /// 容器运行时暂时不可达，只观察不执行
    Degraded,
    /// 未安装或被禁用
    Unavailable,
}

impl SandboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxStatus::Healthy => "HEALTHY",
            SandboxStatus::Degraded => "DEGRADED",
            SandboxStatus::Unavailable => "UNAVAILABLE",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecOutcome {
    Success,
    Failure,
    Timeout,
    /// 运行时错误（镜像缺失、API 失败、沙箱不可用）
    SandboxError,
}

/// 一次隔离执行的结果
#[derive(Clone, Debug, Serialize)]
pub struct SandboxResult {
    pub outcome: ExecOutcome,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub error: Option<String>,
}

impl SandboxResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            outcome: ExecOutcome::SandboxError,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
            error: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn status(&self) -> SandboxStatus;

    fn is_operational(&self) -> bool {
        self.status() == SandboxStatus::Healthy
    }

    /// 启动预检
    async fn initialize(&self) -> SandboxStatus;

    /// 周期性复查（SENSE 阶段调用），用于发现运行时重启或崩溃
    async fn health_check(&self) -> bool;

    async fn execute(&self, script: &str, timeout: Duration) -> SandboxResult;

    /// 清理残留容器
    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 空实现：沙箱被禁用或运行时缺失
#[derive(Debug, Default, Clone)]
pub struct UnavailableSandbox;

#[async_trait]
impl Sandbox for UnavailableSandbox {
    fn status(&self) -> SandboxStatus {
        SandboxStatus::Unavailable
    }

    async fn initialize(&self) -> SandboxStatus {
        SandboxStatus::Unavailable
    }

    async fn health_check(&self) -> bool {
        false
    }

    async fn execute(&self, _script: &str, _timeout: Duration) -> SandboxResult {
        SandboxResult::error("sandbox unavailable")
    }
}
