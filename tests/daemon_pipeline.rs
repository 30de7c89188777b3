//! 装配完整守护进程（替身协作者），跑两轮迭代并核对各阶段的外部效果

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kriya::btrfs::DisabledSnapshots;
use kriya::cloud::{CloudBridge, SkillMatch};
use kriya::config::AppConfig;
use kriya::core::{ActionOutcome, EngineBuilder, EngineStatus, NoopNotifier, Phase, ShutdownManager, ShutdownReason};
use kriya::hardware::{ResourceSample, StaticProbe};
use kriya::llm::{MockFactory, MockLlmClient, Secrets};
use kriya::memory::MemoryHandle;
use kriya::sandbox::{ExecOutcome, Sandbox, SandboxResult, SandboxStatus};

const PLAN: &str = r#"Here is the plan:
```json
{
  "actions": [
    {"description": "rotate journal", "script": "journalctl --vacuum-size=200M"},
    {"description": "wipe scratch volume", "script": "rm -rf /srv/scratch/*", "destructive": true}
  ],
  "unresolved": ["stale apt lock", "fan curve drift"]
}
```"#;

#[derive(Default)]
struct RecordingSandbox {
    scripts: Mutex<Vec<String>>,
}

#[async_trait]
impl Sandbox for RecordingSandbox {
    fn status(&self) -> SandboxStatus {
        SandboxStatus::Healthy
    }

    async fn initialize(&self) -> SandboxStatus {
        SandboxStatus::Healthy
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn execute(&self, script: &str, _timeout: Duration) -> SandboxResult {
        self.scripts.lock().unwrap().push(script.to_string());
        SandboxResult {
            outcome: ExecOutcome::Success,
            exit_code: Some(0),
            stdout: "Vacuuming done".into(),
            stderr: String::new(),
            duration: Duration::from_millis(40),
            error: None,
        }
    }
}

#[derive(Default)]
struct RecordingCloud {
    payloads: Mutex<Vec<serde_json::Value>>,
    queries: Mutex<Vec<String>>,
}

#[async_trait]
impl CloudBridge for RecordingCloud {
    async fn emit(&self, payload: &serde_json::Value) -> bool {
        self.payloads.lock().unwrap().push(payload.clone());
        true
    }

    async fn fetch_skill(&self, query: &str) -> Vec<SkillMatch> {
        self.queries.lock().unwrap().push(query.to_string());
        if query.contains("apt") {
            vec![SkillMatch {
                id: "skill-apt-unlock".into(),
                name: "apt-unlock".into(),
                score: 0.82,
                ..SkillMatch::default()
            }]
        } else {
            Vec::new()
        }
    }
}

// 记忆 worker 是真实线程，这里不能用虚拟时钟
#[tokio::test]
async fn test_two_iterations_through_every_collaborator() {
    let mut config = AppConfig::default();
    config.router.retries = 0;
    config.daemon.loop_interval_secs = 1;

    // 无显存：首选组为云端 gemini/flash
    let factory = MockFactory::new().with("gemini/flash", MockLlmClient::replying(PLAN));
    let sandbox = Arc::new(RecordingSandbox::default());
    let cloud = Arc::new(RecordingCloud::default());
    let memory = Arc::new(MemoryHandle::in_memory(Duration::from_secs(2), 0.2).unwrap());
    let shutdown = Arc::new(ShutdownManager::new());

    let mut engine = EngineBuilder::new(config)
        .with_notifier(Arc::new(NoopNotifier))
        .with_watchdog_deadline(Duration::from_secs(120))
        .with_shutdown(shutdown.clone())
        .with_client_factory(Arc::new(factory))
        .with_probe(Arc::new(StaticProbe(ResourceSample {
            cpu_pct: 12.0,
            ram_pct: 40.0,
            disk_free_gb: 120.0,
            ..ResourceSample::default()
        })))
        .with_sandbox(sandbox.clone())
        .with_memory(memory)
        .with_cloud(cloud.clone())
        .with_secrets(Secrets::parse("GEMINI_API_KEY=test-key\n"))
        .with_snapshots(Arc::new(DisabledSnapshots))
        .build()
        .unwrap();

    let mut reader = engine.reader();
    let stopper = tokio::spawn(async move {
        while reader.changed().await {
            if reader.snapshot().iteration >= 2 {
                shutdown.shutdown(ShutdownReason::Command);
                break;
            }
        }
    });
    let observer = engine.reader();

    engine.run().await.unwrap();
    stopper.await.unwrap();

    // ACT：非破坏性动作两轮各执行一次；破坏性动作因快照不可用被拒绝
    assert_eq!(
        sandbox.scripts.lock().unwrap().as_slice(),
        ["journalctl --vacuum-size=200M", "journalctl --vacuum-size=200M"]
    );
    let snap = observer.snapshot();
    assert_eq!(snap.iteration, 2);
    assert_eq!(snap.status, EngineStatus::Offline);
    assert_eq!(snap.phase, Phase::Idle);
    let outcomes: Vec<ActionOutcome> = snap.last_action_results.iter().map(|r| r.outcome).collect();
    assert_eq!(outcomes, vec![ActionOutcome::Success, ActionOutcome::Rejected]);

    // REMEMBER：两条带脚本的结果各一条记录，第二轮重复写入按 id 去重
    assert_eq!(snap.telemetry.memory_records, Some(2));
    assert_eq!(snap.telemetry.inference_routing.as_deref(), Some("CLOUD"));

    // PATCH：apt 问题被技能解决，另一项保留
    assert_eq!(snap.unresolved_items, vec!["fan curve drift".to_string()]);
    assert!(cloud.queries.lock().unwrap().iter().any(|q| q == "stale apt lock"));

    // TELEMETRY_EMIT：关闭时队列已排空
    let payloads = cloud.payloads.lock().unwrap();
    assert_eq!(payloads.len(), 2);
    assert_eq!(payloads[1]["$schema"], "kriya/telemetry/v1");
    assert_eq!(payloads[1]["current_cycle"]["iteration"], 2);
    assert_eq!(payloads[1]["current_cycle"]["phase"], "TELEMETRY_EMIT");
    assert!(snap.last_error.is_none(), "{:?}", snap.last_error);
}

#[tokio::test(start_paused = true)]
async fn test_inference_outage_keeps_the_loop_alive() {
    let mut config = AppConfig::default();
    config.router.secrets_path = None;
    config.router.retries = 0;
    config.router.cooldown_secs = 0;
    config.daemon.loop_interval_secs = 5;

    let factory = MockFactory::new()
        .with("gemini/flash", MockLlmClient::failing_after(Duration::from_millis(200)))
        .with("anthropic/haiku", MockLlmClient::hanging());
    let sandbox = Arc::new(RecordingSandbox::default());
    let shutdown = Arc::new(ShutdownManager::new());

    let mut engine = EngineBuilder::new(config)
        .with_notifier(Arc::new(NoopNotifier))
        .with_watchdog_deadline(Duration::from_secs(120))
        .with_shutdown(shutdown.clone())
        .with_client_factory(Arc::new(factory))
        .with_probe(Arc::new(StaticProbe::default()))
        .with_sandbox(sandbox.clone())
        .with_memory(Arc::new(kriya::memory::NoopMemory))
        .build()
        .unwrap();
    let stats = engine.liveness_stats();
    let reader = engine.reader();

    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        shutdown.shutdown(ShutdownReason::Signal);
    });
    engine.run().await.unwrap();
    stopper.await.unwrap();

    let snap = reader.snapshot();
    assert!(snap.iteration >= 2, "iterations: {}", snap.iteration);
    assert!(sandbox.scripts.lock().unwrap().is_empty());
    assert!(snap.last_error.as_deref().unwrap_or_default().contains("REASON failed"));
    assert!(snap.log_tail.iter().any(|l| l.contains("ACT skipped")));
    // 失败的阶段同样完成并报活
    assert_eq!(stats.requested(), snap.iteration * Phase::SEQUENCE.len() as u64);
}
