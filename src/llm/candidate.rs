//! 候选后端与回退链
//!
//! BackendCandidate 是一个可独立寻址的推理端点；FallbackChain 是按顺序尝试的候选列表，
//! 每次请求根据实时资源状态与静态配置重新计算，不做持久化。链永不为空。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::CandidateConfig;
use crate::llm::openai::OpenAiClient;
use crate::llm::providers::emergency_candidate;
use crate::llm::secrets::Secrets;
use crate::llm::traits::LlmClient;

/// 端点参数（OpenAI 兼容协议）
#[derive(Clone, PartialEq, Eq)]
pub struct EndpointParams {
    pub model: String,
    pub api_base: Option<String>,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for EndpointParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointParams")
            .field("model", &self.model)
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BackendCandidate {
    pub name: String,
    /// 所属模型组
    pub group: String,
    pub endpoint: EndpointParams,
    pub per_attempt_timeout: Duration,
    /// 失败后的冷却截止时间；之前不参与选择
    pub cooldown_until: Option<Instant>,
}

impl BackendCandidate {
    pub fn new(name: impl Into<String>, group: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            endpoint: EndpointParams {
                model: model.into(),
                api_base: None,
                api_key: None,
            },
            per_attempt_timeout: Duration::from_secs(10),
            cooldown_until: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_attempt_timeout = timeout;
        self
    }

    /// 由配置条目构造；api_key 先查密钥文件再查环境变量
    pub fn from_config(group: &str, cfg: &CandidateConfig, secrets: &Secrets) -> Self {
        Self {
            name: cfg.name.clone(),
            group: group.to_string(),
            endpoint: EndpointParams {
                model: cfg.model.clone(),
                api_base: cfg.api_base.clone(),
                api_key: cfg.api_key_env.as_deref().and_then(|k| secrets.get(k)),
            },
            per_attempt_timeout: Duration::from_secs(cfg.timeout_secs),
            cooldown_until: None,
        }
    }

    pub fn is_cooling(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

/// 有序回退链：首选组在前，配置的回退组依次在后
#[derive(Debug, Clone)]
pub struct FallbackChain {
    pub primary_group: String,
    candidates: Vec<BackendCandidate>,
}

impl FallbackChain {
    /// 构造回退链；候选为空时补入兜底候选（key 与其他候选一样先查密钥文件）
    pub fn new(primary_group: impl Into<String>, mut candidates: Vec<BackendCandidate>, secrets: &Secrets) -> Self {
        let primary_group = primary_group.into();
        if candidates.is_empty() {
            let emergency = emergency_candidate();
            tracing::warn!(
                primary = %primary_group,
                fallback = %emergency.name,
                "fallback chain resolved to zero candidates, using emergency candidate"
            );
            candidates.push(BackendCandidate::from_config(
                &emergency.name,
                &emergency,
                secrets,
            ));
        }
        Self {
            primary_group,
            candidates,
        }
    }

    pub fn candidates(&self) -> &[BackendCandidate] {
        &self.candidates
    }

    pub(crate) fn candidates_mut(&mut self) -> &mut [BackendCandidate] {
        &mut self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.candidates.iter().map(|c| c.name.as_str()).collect()
    }

    /// 最坏情况下整条链的耗时：每个候选 (retries+1) 次超时加 retries 次退避
    pub fn worst_case_duration(&self, retries: u32, backoff: Duration) -> Duration {
        self.candidates
            .iter()
            .map(|c| c.per_attempt_timeout * (retries + 1) + backoff * retries)
            .sum()
    }
}

/// 按候选构造客户端（生产用 OpenAI 兼容客户端，测试用脚本化 Mock）
pub trait ClientFactory: Send + Sync {
    fn build(&self, candidate: &BackendCandidate) -> Arc<dyn LlmClient>;
}

/// OpenAI 兼容客户端工厂
#[derive(Debug, Default, Clone)]
pub struct OpenAiFactory;

impl ClientFactory for OpenAiFactory {
    fn build(&self, candidate: &BackendCandidate) -> Arc<dyn LlmClient> {
        Arc::new(OpenAiClient::new(
            candidate.endpoint.api_base.as_deref(),
            &candidate.endpoint.model,
            candidate.endpoint.api_key.as_deref(),
        ))
    }
}
