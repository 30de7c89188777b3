//! 混合推理路由器
//!
//! 根据资源状态选出首选模型组，再按固定顺序穷举回退链：
//! - 每次尝试包在单次超时里，整条链再包一层总超时，任何候选异常都不会让调用超过上限
//! - 候选失败后可按固定退避重试若干次，仍失败则进入冷却窗口（粗粒度熔断）
//! - 流式调用一旦已向调用方输出 token，后续出错直接上报，不再切换后端
//!
//! 选择在每次请求时重新计算，不保留会话粘性。

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{stream, Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{CandidateConfig, RouterSection};
use crate::llm::candidate::{BackendCandidate, ClientFactory, FallbackChain};
use crate::llm::providers::preset_group;
use crate::llm::secrets::Secrets;
use crate::llm::traits::{ChatMessage, CompletionRequest, LlmClient, LlmError, TokenStream};

/// 路由层错误：交给调用阶段作为可恢复错误处理
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("fallback chain exhausted after {attempts} attempts; last error: {last}")]
    Exhausted { attempts: u32, last: LlmError },

    #[error("fallback chain exceeded overall timeout of {timeout_ms}ms")]
    DeadlineExceeded { timeout_ms: u64 },

    #[error("stream from {candidate} interrupted after output started: {reason}")]
    StreamInterrupted { candidate: String, reason: String },

    #[error(
        "worst case for chain starting at {primary} is {worst_case_ms}ms, over the overall timeout of {overall_ms}ms"
    )]
    OverBudget {
        primary: String,
        worst_case_ms: u64,
        overall_ms: u64,
    },
}

/// 路由决策所需的资源状态（GB）
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceState {
    pub vram_total_gb: f64,
    pub vram_used_gb: f64,
}

impl ResourceState {
    pub fn vram_available_gb(&self) -> f64 {
        (self.vram_total_gb - self.vram_used_gb).max(0.0)
    }
}

/// 成功的补全及其来源
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub candidate: String,
    pub group: String,
    pub attempts: u32,
}

/// 路由器运行状态（供遥测读取）
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterStatus {
    pub active_model: Option<String>,
    pub routing_group: Option<String>,
    pub last_error: Option<String>,
    pub cooling: Vec<String>,
}

/// 流式补全：首个 token 之后的错误以 StreamInterrupted 上报
pub type RoutedStream = Pin<Box<dyn Stream<Item = Result<String, RouterError>> + Send>>;

/// 首选组选择：显存总量与可用量都达到阈值时走本地，否则走云端；纯函数
pub fn select_primary(config: &RouterSection, resource: &ResourceState) -> String {
    if resource.vram_total_gb >= config.local_min_total_vram_gb
        && resource.vram_available_gb() >= config.local_min_available_vram_gb
    {
        config.local_group.clone()
    } else {
        config.cloud_group.clone()
    }
}

/// 首选组 + 回退组（去重）
fn chain_groups<'a>(config: &'a RouterSection, primary: &'a str) -> Vec<&'a str> {
    let mut groups = vec![primary];
    for g in &config.fallbacks {
        if !groups.contains(&g.as_str()) {
            groups.push(g.as_str());
        }
    }
    groups
}

/// 组内候选：显式声明的组优先，否则用内置预设
fn group_candidates(config: &RouterSection, group: &str) -> Vec<CandidateConfig> {
    match config.groups.iter().find(|g| g.name == group) {
        Some(g) => g.candidates.clone(),
        None => {
            let preset = preset_group(group);
            if preset.is_empty() {
                tracing::warn!(group, "unknown model group, skipping");
            }
            preset
        }
    }
}

/// 不带冷却状态展开回退链
fn expand_chain(config: &RouterSection, secrets: &Secrets, primary: &str) -> FallbackChain {
    let candidates = chain_groups(config, primary)
        .into_iter()
        .flat_map(|group| {
            group_candidates(config, group)
                .into_iter()
                .map(move |cfg| BackendCandidate::from_config(group, &cfg, secrets))
        })
        .collect();
    FallbackChain::new(primary, candidates, secrets)
}

/// 本地与云端两种首选下，整条链的最坏耗时（含重试与退避）都必须落在总超时之内
pub fn validate_budget(config: &RouterSection) -> Result<(), RouterError> {
    let overall = config.overall_timeout();
    let backoff = Duration::from_millis(config.retry_backoff_ms);
    for primary in [&config.cloud_group, &config.local_group] {
        let chain = expand_chain(config, &Secrets::empty(), primary);
        let worst = chain.worst_case_duration(config.retries, backoff);
        if worst > overall {
            return Err(RouterError::OverBudget {
                primary: primary.clone(),
                worst_case_ms: worst.as_millis() as u64,
                overall_ms: overall.as_millis() as u64,
            });
        }
    }
    Ok(())
}

pub struct HybridRouter {
    config: RouterSection,
    secrets: Secrets,
    factory: Arc<dyn ClientFactory>,
    clients: Mutex<HashMap<String, Arc<dyn LlmClient>>>,
    /// 候选名 -> 冷却截止时间；只由路由器在失败后写入
    cooldowns: Mutex<HashMap<String, Instant>>,
    status: Mutex<RouterStatus>,
}

impl HybridRouter {
    pub fn new(config: RouterSection, secrets: Secrets, factory: Arc<dyn ClientFactory>) -> Self {
        let router = Self {
            config,
            secrets,
            factory,
            clients: Mutex::new(HashMap::new()),
            cooldowns: Mutex::new(HashMap::new()),
            status: Mutex::new(RouterStatus::default()),
        };
        if let Err(e) = validate_budget(&router.config) {
            tracing::warn!(error = %e, "later candidates may never be tried");
        }
        router
    }

    pub fn config(&self) -> &RouterSection {
        &self.config
    }

    pub fn select_primary(&self, resource: &ResourceState) -> String {
        select_primary(&self.config, resource)
    }

    /// 按当前配置构造请求（温度、最大 token 取自配置）
    pub fn request(&self, messages: Vec<ChatMessage>) -> CompletionRequest {
        CompletionRequest::new(messages)
            .with_temperature(self.config.temperature)
            .with_max_tokens(self.config.max_tokens)
    }

    /// 展开回退链，并带上各候选当前的冷却时间
    pub fn resolve_chain(&self, resource: &ResourceState) -> FallbackChain {
        let primary = self.select_primary(resource);
        let mut chain = expand_chain(&self.config, &self.secrets, &primary);

        let cooldowns = self.cooldowns.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        for candidate in chain.candidates_mut() {
            candidate.cooldown_until = cooldowns.get(&candidate.name).copied().filter(|t| *t > now);
        }
        chain
    }

    /// 解析回退链并在配置的总超时内完成
    pub async fn complete_for(
        &self,
        request: &CompletionRequest,
        resource: &ResourceState,
    ) -> Result<Completion, RouterError> {
        let chain = self.resolve_chain(resource);
        self.complete(request, &chain, self.config.overall_timeout()).await
    }

    /// 按链顺序尝试，首个成功即返回；整条调用不会超过 overall_timeout
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        chain: &FallbackChain,
        overall_timeout: Duration,
    ) -> Result<Completion, RouterError> {
        let result = match tokio::time::timeout(overall_timeout, self.attempt_chain(request, chain, overall_timeout)).await {
            Ok(r) => r,
            Err(_) => Err(RouterError::DeadlineExceeded {
                timeout_ms: overall_timeout.as_millis() as u64,
            }),
        };
        if let Err(e) = &result {
            tracing::error!(primary = %chain.primary_group, error = %e, "inference failed");
            self.set_error(e.to_string());
        }
        result
    }

    async fn attempt_chain(
        &self,
        request: &CompletionRequest,
        chain: &FallbackChain,
        overall_timeout: Duration,
    ) -> Result<Completion, RouterError> {
        let deadline = Instant::now() + overall_timeout;
        let mut attempts = 0u32;
        let mut last: Option<LlmError> = None;

        for candidate in self.eligible(chain) {
            let client = self.client_for(candidate);
            for retry in 0..=self.config.retries {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(deadline_error(chain, overall_timeout));
                }
                let budget = candidate.per_attempt_timeout.min(remaining);
                attempts += 1;

                match tokio::time::timeout(budget, client.complete(request)).await {
                    Ok(Ok(text)) => {
                        self.record_success(candidate);
                        tracing::info!(
                            candidate = %candidate.name,
                            group = %candidate.group,
                            attempts,
                            "inference completed"
                        );
                        return Ok(Completion {
                            text,
                            candidate: candidate.name.clone(),
                            group: candidate.group.clone(),
                            attempts,
                        });
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(candidate = %candidate.name, retry, error = %e, "attempt failed");
                        last = Some(e);
                    }
                    Err(_) => {
                        let e = LlmError::Timeout(budget.as_millis() as u64);
                        tracing::warn!(candidate = %candidate.name, retry, error = %e, "attempt timed out");
                        last = Some(e);
                    }
                }

                if retry < self.config.retries {
                    self.backoff(deadline).await;
                }
            }
            self.start_cooldown(candidate);
        }

        Err(RouterError::Exhausted {
            attempts,
            last: last.unwrap_or(LlmError::EmptyResponse),
        })
    }

    /// 流式补全：首个 token 到达前失败会回退到下一个候选，之后的错误直接上报
    pub async fn complete_stream(
        &self,
        request: &CompletionRequest,
        chain: &FallbackChain,
        overall_timeout: Duration,
    ) -> Result<RoutedStream, RouterError> {
        let deadline = Instant::now() + overall_timeout;
        let opened = match tokio::time::timeout(overall_timeout, self.open_stream(request, chain, overall_timeout)).await {
            Ok(r) => r,
            Err(_) => Err(RouterError::DeadlineExceeded {
                timeout_ms: overall_timeout.as_millis() as u64,
            }),
        };

        let (candidate, first, inner) = match opened {
            Ok(o) => o,
            Err(e) => {
                tracing::error!(primary = %chain.primary_group, error = %e, "streaming inference failed");
                self.set_error(e.to_string());
                return Err(e);
            }
        };

        let state = StreamState {
            inner,
            first: Some(first),
            deadline,
            candidate,
            done: false,
        };
        Ok(Box::pin(stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            if let Some(token) = st.first.take() {
                return Some((Ok(token), st));
            }
            match tokio::time::timeout_at(st.deadline, st.inner.next()).await {
                Ok(Some(Ok(token))) => Some((Ok(token), st)),
                Ok(Some(Err(e))) => {
                    st.done = true;
                    tracing::warn!(candidate = %st.candidate, error = %e, "stream interrupted, not falling back");
                    let err = RouterError::StreamInterrupted {
                        candidate: st.candidate.clone(),
                        reason: e.to_string(),
                    };
                    Some((Err(err), st))
                }
                Ok(None) => None,
                Err(_) => {
                    st.done = true;
                    let err = RouterError::StreamInterrupted {
                        candidate: st.candidate.clone(),
                        reason: "overall deadline exceeded".to_string(),
                    };
                    Some((Err(err), st))
                }
            }
        })))
    }

    async fn open_stream(
        &self,
        request: &CompletionRequest,
        chain: &FallbackChain,
        overall_timeout: Duration,
    ) -> Result<(String, String, TokenStream), RouterError> {
        let deadline = Instant::now() + overall_timeout;
        let mut attempts = 0u32;
        let mut last: Option<LlmError> = None;

        for candidate in self.eligible(chain) {
            let client = self.client_for(candidate);
            for retry in 0..=self.config.retries {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(deadline_error(chain, overall_timeout));
                }
                let budget = candidate.per_attempt_timeout.min(remaining);
                attempts += 1;

                match tokio::time::timeout(budget, first_token(client.as_ref(), request)).await {
                    Ok(Ok((first, inner))) => {
                        self.record_success(candidate);
                        tracing::info!(candidate = %candidate.name, attempts, "stream started");
                        return Ok((candidate.name.clone(), first, inner));
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(candidate = %candidate.name, retry, error = %e, "stream attempt failed before output");
                        last = Some(e);
                    }
                    Err(_) => {
                        let e = LlmError::Timeout(budget.as_millis() as u64);
                        tracing::warn!(candidate = %candidate.name, retry, error = %e, "stream attempt timed out before output");
                        last = Some(e);
                    }
                }

                if retry < self.config.retries {
                    self.backoff(deadline).await;
                }
            }
            self.start_cooldown(candidate);
        }

        Err(RouterError::Exhausted {
            attempts,
            last: last.unwrap_or(LlmError::EmptyResponse),
        })
    }

    /// 当前状态快照
    pub fn status(&self) -> RouterStatus {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let now = Instant::now();
        let cooldowns = self.cooldowns.lock().unwrap_or_else(|e| e.into_inner());
        let mut cooling: Vec<String> = cooldowns
            .iter()
            .filter(|(_, until)| **until > now)
            .map(|(name, _)| name.clone())
            .collect();
        cooling.sort();
        status.cooling = cooling;
        status
    }

    /// 跳过冷却中的候选；全部冷却时忽略冷却按原顺序尝试
    fn eligible<'c>(&self, chain: &'c FallbackChain) -> Vec<&'c BackendCandidate> {
        let now = Instant::now();
        let eligible: Vec<&BackendCandidate> = chain
            .candidates()
            .iter()
            .filter(|c| !c.is_cooling(now))
            .collect();
        if eligible.is_empty() {
            tracing::warn!(
                primary = %chain.primary_group,
                "every candidate is cooling down, trying the full chain anyway"
            );
            return chain.candidates().iter().collect();
        }
        eligible
    }

    fn client_for(&self, candidate: &BackendCandidate) -> Arc<dyn LlmClient> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients
            .entry(candidate.name.clone())
            .or_insert_with(|| self.factory.build(candidate))
            .clone()
    }

    fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.config.retry_backoff_ms)
    }

    async fn backoff(&self, deadline: Instant) {
        let wait = self
            .retry_backoff()
            .min(deadline.saturating_duration_since(Instant::now()));
        tokio::time::sleep(wait).await;
    }

    fn start_cooldown(&self, candidate: &BackendCandidate) {
        let cooldown = Duration::from_secs(self.config.cooldown_secs);
        if cooldown.is_zero() {
            return;
        }
        tracing::warn!(
            candidate = %candidate.name,
            cooldown_secs = cooldown.as_secs(),
            "candidate failed, entering cooldown"
        );
        self.cooldowns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(candidate.name.clone(), Instant::now() + cooldown);
    }

    fn record_success(&self, candidate: &BackendCandidate) {
        self.cooldowns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&candidate.name);
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.active_model = Some(candidate.endpoint.model.clone());
        status.routing_group = Some(candidate.group.clone());
        status.last_error = None;
    }

    fn set_error(&self, error: String) {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).last_error = Some(error);
    }

}

fn deadline_error(chain: &FallbackChain, overall_timeout: Duration) -> RouterError {
    tracing::warn!(primary = %chain.primary_group, "overall deadline reached between attempts");
    RouterError::DeadlineExceeded {
        timeout_ms: overall_timeout.as_millis() as u64,
    }
}

struct StreamState {
    inner: TokenStream,
    first: Option<String>,
    deadline: Instant,
    candidate: String,
    done: bool,
}

/// 打开流并等待首个非空 token；流在输出前结束视为失败
async fn first_token(
    client: &dyn LlmClient,
    request: &CompletionRequest,
) -> Result<(String, TokenStream), LlmError> {
    let mut inner = client.complete_stream(request).await?;
    loop {
        match inner.next().await {
            Some(Ok(token)) if token.is_empty() => continue,
            Some(Ok(token)) => return Ok((token, inner)),
            Some(Err(e)) => return Err(e),
            None => return Err(LlmError::EmptyResponse),
        }
    }
}
