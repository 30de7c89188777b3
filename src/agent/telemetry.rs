//! TELEMETRY_EMIT 阶段的负载构造

use serde_json::{json, Value};

use crate::cloud::TELEMETRY_SCHEMA;
use crate::core::state::IterationState;
use crate::llm::RouterStatus;

/// 负载中携带的日志行数
pub const PAYLOAD_LOG_LINES: usize = 10;

pub fn build_payload(state: &IterationState, router: &RouterStatus) -> Value {
    let t = &state.telemetry;
    json!({
        "$schema": TELEMETRY_SCHEMA,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "daemon_status": state.status.as_str(),
        "active_model": t.active_model.as_deref().unwrap_or("none"),
        "inference_routing": t.inference_routing.as_deref().unwrap_or("CLOUD"),
        "cpu_pct": t.cpu_pct,
        "ram_pct": t.ram_pct,
        "vram_usage": {
            "used_gb": t.vram_used_gb,
            "total_gb": t.vram_total_gb,
        },
        "gpu_util_pct": t.gpu_util_pct,
        "disk_free_gb": t.disk_free_gb,
        "sandbox_status": t.sandbox_status,
        "memory_records": t.memory_records,
        "current_cycle": {
            "phase": state.phase.as_str(),
            "iteration": state.iteration,
            "pending_actions": state.pending_actions.len(),
            "action_results": state.last_action_results.len(),
            "unresolved": state.unresolved_items,
            "log_tail": state.log_tail.last_n(PAYLOAD_LOG_LINES),
        },
        "cooling_backends": router.cooling,
        "last_error": state.last_error,
    })
}
