//! REASON 阶段的提示词与计划解析
//!
//! 模型回复应包含 `{"actions": [...], "unresolved": [...]}`；parse_plan 从文本（可能带 ```json 代码块）
//! 中提取 JSON 并转换为 ActionIntent 列表。

use serde::Deserialize;

use crate::core::error::PhaseError;
use crate::core::state::{ActionIntent, Telemetry};
use crate::memory::MemoryMatch;

/// 内置系统提示词；可由 daemon.system_prompt_path 覆盖
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are Kriya, an autonomous maintenance daemon for a single Linux host.
Each iteration you receive current telemetry, recent log lines and similar past executions.
Propose at most three corrective actions. Every script runs inside an isolated container with no network.
Mark any action that deletes data, changes packages or modifies system configuration as destructive.
If you need a capability you do not have, list it under \"unresolved\".
Reply with JSON only:
{\"actions\": [{\"description\": \"...\", \"script\": \"...\", \"destructive\": false}], \"unresolved\": [\"...\"]}";

/// 单条动作（模型输出格式）
#[derive(Debug, Clone, Deserialize)]
pub struct PlannedAction {
    pub description: String,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub destructive: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub actions: Vec<PlannedAction>,
    #[serde(default)]
    pub unresolved: Vec<String>,
}

impl Plan {
    pub fn into_intents(self) -> (Vec<ActionIntent>, Vec<String>) {
        let intents = self
            .actions
            .into_iter()
            .filter(|a| !a.description.trim().is_empty())
            .map(|a| match a.script {
                Some(script) if !script.trim().is_empty() => {
                    ActionIntent::shell(a.description, script).destructive(a.destructive)
                }
                _ => ActionIntent::note(a.description),
            })
            .collect();
        let unresolved = self
            .unresolved
            .into_iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();
        (intents, unresolved)
    }
}

/// 从模型回复中提取计划 JSON
pub fn parse_plan(output: &str) -> Result<Plan, PhaseError> {
    let trimmed = output.trim();
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end < start {
            return Err(PhaseError::Parse(format!("no JSON object in reply: {}", preview(trimmed))));
        }
        &trimmed[start..=end]
    } else {
        return Err(PhaseError::Parse(format!("no JSON object in reply: {}", preview(trimmed))));
    };

    serde_json::from_str(json_str).map_err(|e| PhaseError::Parse(format!("{}: {}", e, preview(json_str))))
}

fn preview(s: &str) -> String {
    let mut p: String = s.chars().take(120).collect();
    if s.chars().count() > 120 {
        p.push_str("...");
    }
    p
}

/// REASON 的用户消息：遥测、日志尾、召回的历史执行
pub fn build_observation(telemetry: &Telemetry, log_tail: &[String], recalled: &[MemoryMatch]) -> String {
    let mut out = String::new();
    out.push_str("## Telemetry\n");
    out.push_str(&format!(
        "cpu {:.1}% | ram {:.1}% | vram {:.1}/{:.1} GB | gpu {:.0}% | disk free {:.1} GB\n",
        telemetry.cpu_pct,
        telemetry.ram_pct,
        telemetry.vram_used_gb,
        telemetry.vram_total_gb,
        telemetry.gpu_util_pct,
        telemetry.disk_free_gb,
    ));
    if let Some(status) = &telemetry.sandbox_status {
        out.push_str(&format!("sandbox: {}\n", status));
    }

    if !log_tail.is_empty() {
        out.push_str("\n## Recent log\n");
        for line in log_tail {
            out.push_str(line);
            out.push('\n');
        }
    }

    if !recalled.is_empty() {
        out.push_str("\n## Similar past executions\n");
        for m in recalled {
            out.push_str(&format!("- ({:.2}) {}\n", m.similarity, m.document));
        }
    }
    out
}

/// 磁盘压力规则：可用空间低于阈值时，不经模型直接生成清理动作
pub fn disk_pressure_intent(disk_free_gb: f64, alert_gb: f64) -> Option<ActionIntent> {
    if disk_free_gb <= 0.0 || disk_free_gb >= alert_gb {
        return None;
    }
    Some(ActionIntent::shell(
        format!("disk free {:.1} GB below {:.1} GB, clear package and journal caches", disk_free_gb, alert_gb),
        "du -sh /var/cache/pacman/pkg /var/log/journal 2>/dev/null; echo cleanup-planned",
    ))
}
