//! 生产用阶段处理器
//!
//! KriyaPhases 把各协作者（资源探测、推理路由、沙箱、记忆、云端、快照守卫）接到
//! PhaseEngine 的六个阶段上。协作者都以 trait 对象注入，未启用的用空实现替代。

pub mod plan;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::time::Instant;

use crate::btrfs::SnapshotGuard;
use crate::cloud::{CloudBridge, TelemetryEmitter};
use crate::config::AppConfig;
use crate::core::engine::{PhaseContext, PhaseHandler};
use crate::core::error::PhaseError;
use crate::core::state::{ActionIntent, ActionKind, ActionOutcome, ActionResult, Phase};
use crate::hardware::HardwareProbe;
use crate::llm::{ChatMessage, HybridRouter, ResourceState};
use crate::memory::{ExecutionRecord, VectorMemory};
use crate::sandbox::{ExecOutcome, Sandbox};

pub use plan::{parse_plan, Plan, DEFAULT_SYSTEM_PROMPT};

/// 注入的协作者
#[derive(Clone)]
pub struct Collaborators {
    pub probe: Arc<dyn HardwareProbe>,
    pub router: Arc<HybridRouter>,
    pub sandbox: Arc<dyn Sandbox>,
    pub memory: Arc<dyn VectorMemory>,
    pub cloud: Arc<dyn CloudBridge>,
    pub telemetry: TelemetryEmitter,
    pub snapshots: Arc<dyn SnapshotGuard>,
}

/// 阶段行为参数
#[derive(Debug, Clone)]
pub struct PhaseSettings {
    pub system_prompt: String,
    /// 单个沙箱动作的超时
    pub action_timeout: Duration,
    pub disk_free_alert_gb: f64,
    pub recall_top_k: usize,
    /// 放进 REASON 提示词的日志行数
    pub prompt_log_lines: usize,
    pub max_unresolved: usize,
    /// PATCH 阶段所有技能查询共享的时间预算
    pub patch_budget: Duration,
    pub patch_concurrency: usize,
}

impl Default for PhaseSettings {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            action_timeout: Duration::from_secs(30),
            disk_free_alert_gb: 5.0,
            recall_top_k: 5,
            prompt_log_lines: 20,
            max_unresolved: 32,
            patch_budget: Duration::from_secs(30),
            patch_concurrency: 8,
        }
    }
}

impl PhaseSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let system_prompt = match &cfg.daemon.system_prompt_path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(text) if !text.trim().is_empty() => text,
                Ok(_) => DEFAULT_SYSTEM_PROMPT.to_string(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "system prompt not readable, using built-in prompt");
                    DEFAULT_SYSTEM_PROMPT.to_string()
                }
            },
            None => DEFAULT_SYSTEM_PROMPT.to_string(),
        };
        Self {
            system_prompt,
            action_timeout: Duration::from_secs(cfg.sandbox.timeout_secs),
            disk_free_alert_gb: cfg.hardware.disk_free_alert_gb,
            recall_top_k: cfg.memory.top_k,
            max_unresolved: cfg.daemon.max_unresolved_items.max(1),
            patch_budget: Duration::from_secs(cfg.cloud.patch_budget_secs),
            patch_concurrency: cfg.cloud.patch_concurrency.max(1),
            ..Self::default()
        }
    }
}

pub struct KriyaPhases {
    c: Collaborators,
    settings: PhaseSettings,
}

impl KriyaPhases {
    pub fn new(collaborators: Collaborators, settings: PhaseSettings) -> Self {
        Self {
            c: collaborators,
            settings,
        }
    }

    fn routing_label(&self, group: &str) -> &'static str {
        if group == self.c.router.config().local_group {
            "LOCAL"
        } else {
            "CLOUD"
        }
    }

    async fn sense(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), PhaseError> {
        let sample = self.c.probe.sample().await;
        self.c.sandbox.health_check().await;
        let sandbox_status = self.c.sandbox.status();
        let memory_records = self.c.memory.count().await;

        let primary = self.c.router.select_primary(&sample.routing_state());
        let routing = self.routing_label(&primary);
        let active_model = self.c.router.status().active_model.unwrap_or(primary);

        let iteration = ctx.state.iteration;
        let t = &mut ctx.state.telemetry;
        t.cpu_pct = sample.cpu_pct;
        t.ram_pct = sample.ram_pct;
        t.vram_total_gb = sample.vram_total_gb;
        t.vram_used_gb = sample.vram_used_gb;
        t.gpu_util_pct = sample.gpu_util_pct;
        t.disk_free_gb = sample.disk_free_gb;
        t.active_model = Some(active_model);
        t.inference_routing = Some(routing.to_string());
        t.sandbox_status = Some(sandbox_status.as_str().to_string());
        t.memory_records = memory_records;
        t.sampled_iteration = iteration;

        ctx.info(format!(
            "CPU {:.1}% | RAM {:.1}% | VRAM {:.1}/{:.1} GB | disk free {:.1} GB | sandbox {}",
            sample.cpu_pct,
            sample.ram_pct,
            sample.vram_used_gb,
            sample.vram_total_gb,
            sample.disk_free_gb,
            sandbox_status.as_str()
        ));
        Ok(())
    }

    async fn reason(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), PhaseError> {
        if let Some(intent) = plan::disk_pressure_intent(ctx.state.telemetry.disk_free_gb, self.settings.disk_free_alert_gb) {
            ctx.warn(format!("disk pressure: {}", intent.description));
            ctx.state.pending_actions.push(intent);
        }

        let recall_key = format!(
            "disk free {:.0} GB ram {:.0}% cpu {:.0}% {}",
            ctx.state.telemetry.disk_free_gb,
            ctx.state.telemetry.ram_pct,
            ctx.state.telemetry.cpu_pct,
            ctx.state.unresolved_items.join(" ")
        );
        let recalled = self
            .c
            .memory
            .query(&recall_key, self.settings.recall_top_k, None)
            .await;
        if !recalled.is_empty() {
            ctx.info(format!("recalled {} similar past executions", recalled.len()));
        }

        let observation = plan::build_observation(
            &ctx.state.telemetry,
            &ctx.state.log_tail.last_n(self.settings.prompt_log_lines),
            &recalled,
        );
        let request = self.c.router.request(vec![
            ChatMessage::system(self.settings.system_prompt.clone()),
            ChatMessage::user(observation),
        ]);
        let resource = ResourceState {
            vram_total_gb: ctx.state.telemetry.vram_total_gb,
            vram_used_gb: ctx.state.telemetry.vram_used_gb,
        };

        let completion = self.c.router.complete_for(&request, &resource).await?;
        ctx.state.telemetry.active_model = Some(completion.candidate.clone());
        ctx.state.telemetry.inference_routing = Some(self.routing_label(&completion.group).to_string());

        let (intents, unresolved) = parse_plan(&completion.text)?.into_intents();
        ctx.info(format!(
            "plan from {} after {} attempt(s): {} action(s), {} unresolved",
            completion.candidate,
            completion.attempts,
            intents.len(),
            unresolved.len()
        ));
        ctx.state.pending_actions.extend(intents);
        for item in unresolved {
            if !ctx.state.unresolved_items.contains(&item) {
                ctx.state.unresolved_items.push(item);
            }
        }
        let excess = ctx
            .state
            .unresolved_items
            .len()
            .saturating_sub(self.settings.max_unresolved);
        if excess > 0 {
            ctx.state.unresolved_items.drain(..excess);
            ctx.warn(format!("dropped {} oldest unresolved item(s), keeping {}", excess, self.settings.max_unresolved));
        }
        Ok(())
    }

    async fn act(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), PhaseError> {
        let intents = ctx.state.pending_actions.clone();
        if intents.is_empty() {
            ctx.info("no actions planned");
            return Ok(());
        }
        for (index, intent) in intents.iter().enumerate() {
            let result = self.act_one(index, intent, ctx).await;
            ctx.info(format!("{} -> {}", intent.description, result.outcome.as_str()));
            ctx.state.last_action_results.push(result);
        }
        Ok(())
    }

    async fn act_one(&self, index: usize, intent: &ActionIntent, ctx: &mut PhaseContext<'_>) -> ActionResult {
        let script = match (intent.kind, intent.script.as_deref()) {
            (ActionKind::Shell, Some(script)) => script,
            _ => return ActionResult::not_run(intent, ActionOutcome::Skipped, "note only"),
        };

        if !self.c.sandbox.is_operational() {
            ctx.warn(format!(
                "sandbox {}, intended action not executed: {}",
                self.c.sandbox.status().as_str(),
                script
            ));
            return ActionResult::not_run(intent, ActionOutcome::Skipped, "sandbox not operational");
        }

        if intent.destructive {
            let label = format!("act_{}_{}", ctx.state.iteration, index);
            match self.c.snapshots.create(&label).await {
                Ok(snapshot) => ctx.info(format!("snapshot {} taken before destructive action", snapshot.name)),
                Err(e) => {
                    ctx.warn(format!("destructive action rejected, snapshot failed: {}", e));
                    return ActionResult::not_run(intent, ActionOutcome::Rejected, format!("snapshot failed: {}", e));
                }
            }
        }

        let exec = self.c.sandbox.execute(script, self.settings.action_timeout).await;
        let outcome = match exec.outcome {
            ExecOutcome::Success => ActionOutcome::Success,
            ExecOutcome::Timeout => ActionOutcome::Timeout,
            ExecOutcome::Failure | ExecOutcome::SandboxError => ActionOutcome::Failure,
        };
        ActionResult {
            intent_id: intent.id.clone(),
            description: intent.description.clone(),
            script: intent.script.clone(),
            outcome,
            exit_code: exec.exit_code,
            stdout: exec.stdout,
            stderr: exec.stderr,
            duration_ms: exec.duration.as_millis() as u64,
            note: exec.error,
        }
    }

    async fn remember(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), PhaseError> {
        let iteration = ctx.state.iteration;
        let records: Vec<ExecutionRecord> = ctx
            .state
            .last_action_results
            .iter()
            .filter(|r| r.script.is_some())
            .map(|r| ExecutionRecord::from_result(r, iteration))
            .collect();
        if records.is_empty() {
            return Ok(());
        }
        let mut stored = 0usize;
        for record in &records {
            if self.c.memory.store(record).await.is_some() {
                stored += 1;
            }
        }
        if stored < records.len() && self.c.memory.enabled() {
            ctx.warn(format!("stored {}/{} execution records", stored, records.len()));
        } else if stored > 0 {
            ctx.info(format!("stored {} execution record(s)", stored));
        }
        Ok(())
    }

    async fn emit_telemetry(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), PhaseError> {
        if !self.c.cloud.enabled() {
            tracing::debug!("cloud disabled, telemetry not emitted");
            return Ok(());
        }
        let payload = telemetry::build_payload(&*ctx.state, &self.c.router.status());
        if !self.c.telemetry.emit(payload) {
            ctx.warn("telemetry payload dropped");
        }
        Ok(())
    }

    async fn patch(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), PhaseError> {
        if ctx.state.unresolved_items.is_empty() {
            return Ok(());
        }
        if !self.c.cloud.enabled() {
            tracing::debug!(
                unresolved = ctx.state.unresolved_items.len(),
                "cloud disabled, unresolved items kept"
            );
            return Ok(());
        }

        let items = ctx.state.unresolved_items.clone();
        let total = items.len();
        let cloud = self.c.cloud.clone();
        let mut lookups = stream::iter(items)
            .map(|item| {
                let cloud = cloud.clone();
                async move {
                    let skills = cloud.fetch_skill(&item).await;
                    (item, skills)
                }
            })
            .buffer_unordered(self.settings.patch_concurrency);

        let deadline = Instant::now() + self.settings.patch_budget;
        let mut answered = 0usize;
        let mut resolved = Vec::new();
        while let Ok(Some((item, skills))) = tokio::time::timeout_at(deadline, lookups.next()).await {
            answered += 1;
            if let Some(best) = skills.first() {
                ctx.info(format!("'{}' resolved by skill {} (score {:.2})", item, best.name, best.score));
                resolved.push(item);
            }
        }
        if answered < total {
            ctx.warn(format!(
                "skill lookup budget of {}s spent, {} item(s) left for next iteration",
                self.settings.patch_budget.as_secs(),
                total - answered
            ));
        }
        ctx.state.unresolved_items.retain(|i| !resolved.contains(i));
        Ok(())
    }
}

#[async_trait]
impl PhaseHandler for KriyaPhases {
    async fn boot(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), PhaseError> {
        let status = self.c.sandbox.initialize().await;
        ctx.info(format!("sandbox {}", status.as_str()));
        ctx.state.telemetry.sandbox_status = Some(status.as_str().to_string());

        let cfg = self.c.router.config();
        ctx.info(format!(
            "router local={} cloud={} fallbacks=[{}]",
            cfg.local_group,
            cfg.cloud_group,
            cfg.fallbacks.join(", ")
        ));

        if self.c.memory.enabled() {
            match self.c.memory.count().await {
                Some(n) => ctx.info(format!("memory ready, {} stored executions", n)),
                None => ctx.warn("memory store not responding"),
            }
        }
        if !self.c.snapshots.enabled() {
            ctx.info("snapshots disabled, destructive actions will be rejected");
        }
        Ok(())
    }

    async fn run(&mut self, phase: Phase, ctx: &mut PhaseContext<'_>) -> Result<(), PhaseError> {
        match phase {
            Phase::Sense => self.sense(ctx).await,
            Phase::Reason => self.reason(ctx).await,
            Phase::Act => self.act(ctx).await,
            Phase::Remember => self.remember(ctx).await,
            Phase::TelemetryEmit => self.emit_telemetry(ctx).await,
            Phase::Patch => self.patch(ctx).await,
            Phase::Idle => Ok(()),
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("phase handler stopping");
    }
}
