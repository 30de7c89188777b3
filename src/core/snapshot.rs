//! 状态快照：写者在阶段边界发布副本，读者只拿副本
//!
//! 与 UI 投影同理：控制任务通过 watch 通道推送完整值拷贝；读者 `borrow` 后立即克隆，
//! 既不会看到阶段中途的半更新状态，也不会阻塞写者。

use serde::Serialize;
use tokio::sync::watch;

use crate::core::state::{
    ActionIntent, ActionResult, EngineStatus, IterationState, Phase, Telemetry,
};

/// IterationState 的不可变副本
#[derive(Clone, Debug, Serialize)]
pub struct StateSnapshot {
    pub phase: Phase,
    pub status: EngineStatus,
    pub iteration: u64,
    pub pending_actions: Vec<ActionIntent>,
    pub last_action_results: Vec<ActionResult>,
    pub unresolved_items: Vec<String>,
    pub log_tail: Vec<String>,
    pub telemetry: Telemetry,
    pub last_error: Option<String>,
    pub shutdown_requested: bool,
    /// 快照生成时间（UTC）
    pub taken_at: chrono::DateTime<chrono::Utc>,
}

impl StateSnapshot {
    pub fn capture(state: &IterationState) -> Self {
        Self {
            phase: state.phase,
            status: state.status,
            iteration: state.iteration,
            pending_actions: state.pending_actions.clone(),
            last_action_results: state.last_action_results.clone(),
            unresolved_items: state.unresolved_items.clone(),
            log_tail: state.log_tail.iter().cloned().collect(),
            telemetry: state.telemetry.clone(),
            last_error: state.last_error.clone(),
            shutdown_requested: state.shutdown_requested(),
            taken_at: chrono::Utc::now(),
        }
    }
}

/// 写者端：仅 PhaseEngine 持有
#[derive(Debug)]
pub struct StatePublisher {
    tx: watch::Sender<StateSnapshot>,
}

/// 读者端：可任意克隆，读取永不阻塞写者
#[derive(Clone, Debug)]
pub struct StateReader {
    rx: watch::Receiver<StateSnapshot>,
}

/// 以初始状态建立发布 / 读取通道
pub fn state_channel(initial: &IterationState) -> (StatePublisher, StateReader) {
    let (tx, rx) = watch::channel(StateSnapshot::capture(initial));
    (StatePublisher { tx }, StateReader { rx })
}

impl StatePublisher {
    /// 在阶段边界发布一份副本；没有读者时同样成功
    pub fn publish(&self, state: &IterationState) {
        self.tx.send_replace(StateSnapshot::capture(state));
    }

    pub fn reader(&self) -> StateReader {
        StateReader {
            rx: self.tx.subscribe(),
        }
    }
}

impl StateReader {
    /// 最近一次阶段边界的副本
    pub fn snapshot(&self) -> StateSnapshot {
        self.rx.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.rx.borrow().phase
    }

    /// 等待下一次发布；写者已丢弃时返回 false
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
