//! 状态定义：IterationState 与阶段枚举
//!
//! IterationState 只由 PhaseEngine 的控制任务持有并原地修改；外部读者只能拿到
//! [`StateSnapshot`](crate::core::StateSnapshot) 副本。

use std::collections::VecDeque;

use serde::Serialize;

/// 单次迭代内的阶段（固定顺序，不可重排）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Sense,
    Reason,
    Act,
    Remember,
    TelemetryEmit,
    Patch,
    Idle,
}

impl Phase {
    /// 每次迭代依次执行的工作阶段
    pub const SEQUENCE: [Phase; 6] = [
        Phase::Sense,
        Phase::Reason,
        Phase::Act,
        Phase::Remember,
        Phase::TelemetryEmit,
        Phase::Patch,
    ];

    /// 线性状态机中的下一个阶段（Patch 之后回到 Idle，Idle 之后开始新一轮 Sense）
    pub fn next(self) -> Phase {
        match self {
            Phase::Sense => Phase::Reason,
            Phase::Reason => Phase::Act,
            Phase::Act => Phase::Remember,
            Phase::Remember => Phase::TelemetryEmit,
            Phase::TelemetryEmit => Phase::Patch,
            Phase::Patch => Phase::Idle,
            Phase::Idle => Phase::Sense,
        }
    }

    /// 前置阶段：本轮该阶段失败时，当前阶段以 no-op 执行
    pub fn depends_on(self) -> Option<Phase> {
        match self {
            Phase::Act => Some(Phase::Reason),
            Phase::Remember => Some(Phase::Act),
            Phase::Sense | Phase::Reason | Phase::TelemetryEmit | Phase::Patch | Phase::Idle => {
                None
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Sense => "SENSE",
            Phase::Reason => "REASON",
            Phase::Act => "ACT",
            Phase::Remember => "REMEMBER",
            Phase::TelemetryEmit => "TELEMETRY_EMIT",
            Phase::Patch => "PATCH",
            Phase::Idle => "IDLE",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 守护进程生命周期状态；Offline 为终态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineStatus {
    Booting,
    Active,
    /// 最近一轮有阶段失败
    Error,
    Offline,
}

impl EngineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineStatus::Booting => "BOOTING",
            EngineStatus::Active => "ACTIVE",
            EngineStatus::Error => "ERROR",
            EngineStatus::Offline => "OFFLINE",
        }
    }
}

/// 有界日志尾：满后 push 淘汰最旧条目
#[derive(Clone, Debug, Serialize)]
#[serde(transparent)]
pub struct LogTail {
    #[serde(skip)]
    capacity: usize,
    entries: VecDeque<String>,
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(line.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.entries.iter()
    }

    /// 最近 n 条，按写入顺序
    pub fn last_n(&self, n: usize) -> Vec<String> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }
}

/// 动作类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// 在沙箱中执行脚本
    Shell,
    /// 仅记录，不执行
    Note,
}

/// REASON 产出、ACT 消费的动作意图
#[derive(Clone, Debug, Serialize)]
pub struct ActionIntent {
    pub id: String,
    pub kind: ActionKind,
    pub description: String,
    pub script: Option<String>,
    /// 破坏性动作执行前必须先成功创建快照
    pub destructive: bool,
}

impl ActionIntent {
    pub fn shell(description: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: ActionKind::Shell,
            description: description.into(),
            script: Some(script.into()),
            destructive: false,
        }
    }

    pub fn note(description: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: ActionKind::Note,
            description: description.into(),
            script: None,
            destructive: false,
        }
    }

    pub fn destructive(mut self, destructive: bool) -> Self {
        self.destructive = destructive;
        self
    }
}

/// 动作结果
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    Failure,
    Timeout,
    /// 沙箱不可用，仅记录意图
    Skipped,
    /// 快照守卫未通过
    Rejected,
}

impl ActionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionOutcome::Success => "success",
            ActionOutcome::Failure => "failure",
            ActionOutcome::Timeout => "timeout",
            ActionOutcome::Skipped => "skipped",
            ActionOutcome::Rejected => "rejected",
        }
    }
}

/// ACT 产出、REMEMBER 消费的结果记录
#[derive(Clone, Debug, Serialize)]
pub struct ActionResult {
    pub intent_id: String,
    pub description: String,
    pub script: Option<String>,
    pub outcome: ActionOutcome,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub note: Option<String>,
}

impl ActionResult {
    /// 未执行的结果（跳过 / 拒绝）
    pub fn not_run(intent: &ActionIntent, outcome: ActionOutcome, note: impl Into<String>) -> Self {
        Self {
            intent_id: intent.id.clone(),
            description: intent.description.clone(),
            script: intent.script.clone(),
            outcome,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            note: Some(note.into()),
        }
    }
}

/// SENSE 阶段采集的遥测字段
#[derive(Clone, Debug, Default, Serialize)]
pub struct Telemetry {
    pub cpu_pct: f64,
    pub ram_pct: f64,
    pub vram_used_gb: f64,
    pub vram_total_gb: f64,
    pub gpu_util_pct: f64,
    pub disk_free_gb: f64,
    pub active_model: Option<String>,
    pub inference_routing: Option<String>,
    pub sandbox_status: Option<String>,
    pub memory_records: Option<usize>,
    /// 采样所属迭代
    pub sampled_iteration: u64,
}

/// 每轮迭代的可变记录，由 PhaseEngine 独占
#[derive(Clone, Debug)]
pub struct IterationState {
    pub phase: Phase,
    pub status: EngineStatus,
    pub iteration: u64,
    pub pending_actions: Vec<ActionIntent>,
    pub last_action_results: Vec<ActionResult>,
    pub unresolved_items: Vec<String>,
    pub log_tail: LogTail,
    pub telemetry: Telemetry,
    pub last_error: Option<String>,
    shutdown_requested: bool,
}

impl IterationState {
    pub fn new(log_tail_capacity: usize) -> Self {
        Self {
            phase: Phase::Idle,
            status: EngineStatus::Booting,
            iteration: 0,
            pending_actions: Vec::new(),
            last_action_results: Vec::new(),
            unresolved_items: Vec::new(),
            log_tail: LogTail::new(log_tail_capacity),
            telemetry: Telemetry::default(),
            last_error: None,
            shutdown_requested: false,
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// 置位关闭标志；只会置位一次，不会清除
    pub(crate) fn request_shutdown(&mut self) -> bool {
        let first = !self.shutdown_requested;
        self.shutdown_requested = true;
        first
    }
}
