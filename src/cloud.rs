//! 云端桥接：遥测上报与技能检索
//!
//! 两个调用都是尽力而为：emit 返回 bool，fetch_skill 失败返回空列表，永不向控制循环抛错。
//! 遥测经 [`TelemetryEmitter`] 的有界队列异步发送，队列满时直接丢弃新负载。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::CloudSection;

/// 遥测负载的 schema 标识
pub const TELEMETRY_SCHEMA: &str = "kriya/telemetry/v1";

const RETRY_BACKOFF_BASE: f64 = 1.5;

/// 技能检索结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillMatch {
    pub id: String,
    pub name: String,
    pub description: String,
    pub score: f64,
    /// 其余字段原样保留
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SkillSearchResponse {
    results: Vec<SkillMatch>,
}

#[async_trait]
pub trait CloudBridge: Send + Sync {
    /// 上报一份遥测；被接受返回 true
    async fn emit(&self, payload: &Value) -> bool;

    /// 检索能解决某个未决项的技能，按相关度降序
    async fn fetch_skill(&self, query: &str) -> Vec<SkillMatch>;

    fn enabled(&self) -> bool {
        true
    }
}

/// 未配置云端时使用
#[derive(Debug, Clone, Default)]
pub struct OfflineCloud;

#[async_trait]
impl CloudBridge for OfflineCloud {
    async fn emit(&self, _payload: &Value) -> bool {
        false
    }

    async fn fetch_skill(&self, _query: &str) -> Vec<SkillMatch> {
        Vec::new()
    }

    fn enabled(&self) -> bool {
        false
    }
}

/// HTTP 实现：每次请求带超时，失败按 1.5^n 秒退避重试
pub struct HttpCloudBridge {
    client: Client,
    base_url: String,
    max_retries: u32,
}

impl HttpCloudBridge {
    pub fn new(cfg: &CloudSection) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .user_agent(concat!("kriya/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            max_retries: cfg.max_retries.max(1),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json(&self, url: &str, payload: &Value) -> reqwest::Result<()> {
        self.client
            .post(url)
            .json(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn get_skills(&self, url: &str, query: &str) -> reqwest::Result<Vec<SkillMatch>> {
        let resp: SkillSearchResponse = self
            .client
            .get(url)
            .query(&[("query", query)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.results)
    }
}

/// 第 attempt 次失败后的等待时间
pub fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_secs_f64(RETRY_BACKOFF_BASE.powi(attempt as i32))
}

#[async_trait]
impl CloudBridge for HttpCloudBridge {
    async fn emit(&self, payload: &Value) -> bool {
        let url = self.url("/api/telemetry/ingest");
        for attempt in 1..=self.max_retries {
            match self.post_json(&url, payload).await {
                Ok(()) => return true,
                Err(e) if attempt < self.max_retries => {
                    let wait = retry_backoff(attempt);
                    tracing::warn!(attempt, error = %e, wait_ms = wait.as_millis() as u64, "telemetry post failed, retrying");
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "telemetry emission failed (non-critical)");
                }
            }
        }
        false
    }

    async fn fetch_skill(&self, query: &str) -> Vec<SkillMatch> {
        let url = self.url("/api/skills/search");
        tracing::info!(query = %truncate(query, 60), "fetching skill from cloud");
        for attempt in 1..=self.max_retries {
            match self.get_skills(&url, query).await {
                Ok(mut results) => {
                    results.sort_by(|a, b| b.score.total_cmp(&a.score));
                    tracing::info!(matches = results.len(), "cloud skill lookup finished");
                    return results;
                }
                Err(e) if attempt < self.max_retries => {
                    let wait = retry_backoff(attempt);
                    tracing::warn!(attempt, error = %e, wait_ms = wait.as_millis() as u64, "skill lookup failed, retrying");
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "cloud skill fetch failed");
                }
            }
        }
        Vec::new()
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut t: String = s.chars().take(max).collect();
        t.push_str("...");
        t
    }
}

#[derive(Default)]
struct EmitterStats {
    queued: AtomicU64,
    dropped: AtomicU64,
}

/// 后台遥测发送器；可克隆，所有克隆共享同一队列
#[derive(Clone)]
pub struct TelemetryEmitter {
    tx: Arc<Mutex<Option<mpsc::Sender<Value>>>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    stats: Arc<EmitterStats>,
}

impl TelemetryEmitter {
    /// 启动发送任务（需在 tokio 运行时内调用）
    pub fn spawn(bridge: Arc<dyn CloudBridge>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Value>(capacity.max(1));
        let task = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if !bridge.emit(&payload).await {
                    tracing::debug!("telemetry payload not accepted");
                }
            }
        });
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            task: Arc::new(Mutex::new(Some(task))),
            stats: Arc::new(EmitterStats::default()),
        }
    }

    /// 入队；队列满或已关闭时丢弃并返回 false，不会阻塞
    pub fn emit(&self, payload: Value) -> bool {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match tx.try_send(payload) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("telemetry queue full, payload dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn queued(&self) -> u64 {
        self.stats.queued.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    /// 关闭队列并等待已入队的负载发送完
    pub async fn drain(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "telemetry task ended abnormally");
            }
        }
    }
}
