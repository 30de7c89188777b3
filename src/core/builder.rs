//! 引擎构建器：按配置装配协作者
//!
//! 可选后端在启动时一次性选定：未启用或初始化失败的协作者换成空实现，
//! 之后控制循环不再判断它们是否存在。测试可通过 with_* 注入替身。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::agent::{Collaborators, KriyaPhases, PhaseSettings};
use crate::btrfs::{BtrfsSnapshots, DisabledSnapshots, SnapshotGuard};
use crate::cloud::{CloudBridge, HttpCloudBridge, OfflineCloud, TelemetryEmitter};
use crate::config::AppConfig;
use crate::core::engine::{EngineSettings, PhaseEngine};
use crate::core::liveness::{watchdog_deadline_from_env, Notifier, SystemdNotifier};
use crate::core::shutdown::{MemoryCleanup, SandboxCleanup, ShutdownManager, TelemetryDrain};
use crate::hardware::{HardwareProbe, SystemProbe};
use crate::llm::{load_secrets, validate_budget, ClientFactory, HybridRouter, OpenAiFactory, Secrets};
use crate::memory::{MemoryHandle, NoopMemory, VectorMemory};
use crate::sandbox::{DockerSandbox, Sandbox, UnavailableSandbox};

pub struct EngineBuilder {
    config: AppConfig,
    notifier: Option<Arc<dyn Notifier>>,
    watchdog_deadline: Option<Duration>,
    shutdown: Option<Arc<ShutdownManager>>,
    factory: Option<Arc<dyn ClientFactory>>,
    secrets: Option<Secrets>,
    probe: Option<Arc<dyn HardwareProbe>>,
    sandbox: Option<Arc<dyn Sandbox>>,
    memory: Option<Arc<dyn VectorMemory>>,
    cloud: Option<Arc<dyn CloudBridge>>,
    snapshots: Option<Arc<dyn SnapshotGuard>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            notifier: None,
            watchdog_deadline: None,
            shutdown: None,
            factory: None,
            secrets: None,
            probe: None,
            sandbox: None,
            memory: None,
            cloud: None,
            snapshots: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_watchdog_deadline(mut self, deadline: Duration) -> Self {
        self.watchdog_deadline = Some(deadline);
        self
    }

    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownManager>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn with_client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_secrets(mut self, secrets: Secrets) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn HardwareProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn VectorMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_cloud(mut self, cloud: Arc<dyn CloudBridge>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotGuard>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    fn build_secrets(&self) -> Secrets {
        let Some(path) = &self.config.router.secrets_path else {
            return Secrets::empty();
        };
        match load_secrets(path) {
            Ok(secrets) => {
                tracing::info!(path = %path.display(), keys = secrets.len(), "secrets loaded");
                secrets
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "secrets file rejected, falling back to environment");
                Secrets::empty()
            }
        }
    }

    fn build_sandbox(&self) -> Arc<dyn Sandbox> {
        if self.config.sandbox.enabled {
            Arc::new(DockerSandbox::new(&self.config.sandbox))
        } else {
            tracing::info!("sandbox disabled, actions will be logged only");
            Arc::new(UnavailableSandbox)
        }
    }

    fn build_memory(&self) -> Arc<dyn VectorMemory> {
        if !self.config.memory.enabled {
            return Arc::new(NoopMemory);
        }
        match MemoryHandle::open(&self.config.memory) {
            Ok(handle) => {
                tracing::info!(path = %self.config.memory.path.display(), "memory store opened");
                Arc::new(handle)
            }
            Err(e) => {
                tracing::warn!(error = %e, "memory store unavailable, continuing without recall");
                Arc::new(NoopMemory)
            }
        }
    }

    fn build_cloud(&self) -> Arc<dyn CloudBridge> {
        if !self.config.cloud.enabled {
            return Arc::new(OfflineCloud);
        }
        match HttpCloudBridge::new(&self.config.cloud) {
            Ok(bridge) => Arc::new(bridge),
            Err(e) => {
                tracing::warn!(error = %e, "cloud bridge init failed, running offline");
                Arc::new(OfflineCloud)
            }
        }
    }

    fn build_snapshots(&self) -> Arc<dyn SnapshotGuard> {
        if self.config.btrfs.enabled {
            Arc::new(BtrfsSnapshots::new(&self.config.btrfs))
        } else {
            Arc::new(DisabledSnapshots)
        }
    }

    /// 装配引擎（需在 tokio 运行时内调用：遥测发送任务在此启动）
    pub fn build(self) -> anyhow::Result<PhaseEngine> {
        validate_budget(&self.config.router).context("router fallback chain does not fit its time budget")?;
        let secrets = match &self.secrets {
            Some(s) => s.clone(),
            None => self.build_secrets(),
        };
        let factory: Arc<dyn ClientFactory> = self
            .factory
            .clone()
            .unwrap_or_else(|| Arc::new(OpenAiFactory));
        let router = Arc::new(HybridRouter::new(self.config.router.clone(), secrets, factory));

        let probe = self
            .probe
            .clone()
            .unwrap_or_else(|| Arc::new(SystemProbe::new(&self.config.hardware)));
        let sandbox = self.sandbox.clone().unwrap_or_else(|| self.build_sandbox());
        let memory = self.memory.clone().unwrap_or_else(|| self.build_memory());
        let cloud = self.cloud.clone().unwrap_or_else(|| self.build_cloud());
        let snapshots = self.snapshots.clone().unwrap_or_else(|| self.build_snapshots());
        let telemetry = TelemetryEmitter::spawn(cloud.clone(), self.config.cloud.queue_capacity);

        let collaborators = Collaborators {
            probe,
            router,
            sandbox: sandbox.clone(),
            memory: memory.clone(),
            cloud,
            telemetry: telemetry.clone(),
            snapshots,
        };
        let handler = KriyaPhases::new(collaborators, PhaseSettings::from_config(&self.config));

        let watchdog = self.watchdog_deadline.or_else(watchdog_deadline_from_env);
        let settings = EngineSettings::from_config(&self.config, watchdog);
        let notifier = self.notifier.unwrap_or_else(SystemdNotifier::from_env);
        let shutdown = self.shutdown.unwrap_or_else(|| Arc::new(ShutdownManager::new()));

        let mut engine = PhaseEngine::new(Box::new(handler), settings, notifier, shutdown);
        engine.register_cleanup(Arc::new(TelemetryDrain::new(telemetry)));
        engine.register_cleanup(Arc::new(SandboxCleanup::new(sandbox)));
        engine.register_cleanup(Arc::new(MemoryCleanup::new(memory)));
        Ok(engine)
    }
}
