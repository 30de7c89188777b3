//! 阶段错误与引擎错误
//!
//! PhaseError 一律在阶段边界被捕获并写入 `last_error`，不会逃出 `PhaseEngine::run`；
//! EngineError 只出现在构建与启动阶段，由二进制入口转为非零退出码。

use thiserror::Error;

use crate::core::state::Phase;
use crate::llm::RouterError;

/// 单个阶段内的可恢复错误
#[derive(Error, Debug)]
pub enum PhaseError {
    /// 整条回退链耗尽或超出总时限
    #[error("inference failed: {0}")]
    Inference(#[from] RouterError),

    /// 外部协作者（沙箱、记忆、云端、快照）降级或不可用
    #[error("{collaborator} unavailable: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    #[error("parse error: {0}")]
    Parse(String),

    /// 前置阶段本轮未成功，当前阶段以 no-op 执行
    #[error("precondition unmet: {0} did not succeed")]
    Precondition(Phase),

    #[error("{0}")]
    Other(String),
}

impl PhaseError {
    pub fn collaborator(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator,
            message: message.into(),
        }
    }
}

/// 构建 / 启动阶段的致命错误
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("initialization failed: {0}")]
    Init(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_error_display() {
        let e = PhaseError::collaborator("sandbox", "docker not found");
        assert_eq!(e.to_string(), "sandbox unavailable: docker not found");
        let e = PhaseError::Precondition(Phase::Reason);
        assert_eq!(e.to_string(), "precondition unmet: REASON did not succeed");
    }

    #[test]
    fn test_router_error_converts() {
        let e: PhaseError = RouterError::DeadlineExceeded { timeout_ms: 45_000 }.into();
        assert!(matches!(e, PhaseError::Inference(_)));
    }
}
