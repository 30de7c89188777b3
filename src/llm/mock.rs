//! Mock LLM 客户端（用于测试与离线运行，无需 API）
//!
//! 每个 Mock 持有一段脚本：按调用顺序取步骤，脚本用完后重复最后一步。步骤可以是延迟后成功、
//! 延迟后失败、永不返回，或流式输出（可在若干 token 后中断）。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::candidate::{BackendCandidate, ClientFactory};
use crate::llm::traits::{CompletionRequest, LlmClient, LlmError, TokenStream};

/// 离线运行时的默认回复：不产生任何动作
pub const IDLE_PLAN: &str = r#"{"actions": [], "unresolved": []}"#;

#[derive(Debug, Clone)]
pub enum MockStep {
    Reply { delay: Duration, text: String },
    Fail { delay: Duration, message: String },
    /// 永不返回（用于超时测试）
    Hang,
    /// 逐个输出 token；`fail_after` 为 Some(n) 时输出 n 个后报错
    Stream {
        tokens: Vec<String>,
        delay: Duration,
        fail_after: Option<usize>,
    },
}

/// 脚本化 Mock 客户端
#[derive(Debug)]
pub struct MockLlmClient {
    script: Mutex<Vec<MockStep>>,
    calls: AtomicUsize,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::replying(IDLE_PLAN)
    }
}

impl MockLlmClient {
    pub fn new(script: Vec<MockStep>) -> Self {
        Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn replying(text: impl Into<String>) -> Self {
        Self::new(vec![MockStep::Reply {
            delay: Duration::ZERO,
            text: text.into(),
        }])
    }

    pub fn failing_after(delay: Duration) -> Self {
        Self::new(vec![MockStep::Fail {
            delay,
            message: "mock backend failure".into(),
        }])
    }

    pub fn succeeding_after(delay: Duration, text: impl Into<String>) -> Self {
        Self::new(vec![MockStep::Reply {
            delay,
            text: text.into(),
        }])
    }

    pub fn hanging() -> Self {
        Self::new(vec![MockStep::Hang])
    }

    pub fn streaming(tokens: &[&str], fail_after: Option<usize>) -> Self {
        Self::new(vec![MockStep::Stream {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            delay: Duration::from_millis(10),
            fail_after,
        }])
    }

    /// 已被调用的次数（complete 与 complete_stream 合计）
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> MockStep {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        script
            .get(n)
            .or_else(|| script.last())
            .cloned()
            .unwrap_or(MockStep::Reply {
                delay: Duration::ZERO,
                text: IDLE_PLAN.to_string(),
            })
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _request: &CompletionRequest) -> Result<String, LlmError> {
        match self.next_step() {
            MockStep::Reply { delay, text } => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
            MockStep::Fail { delay, message } => {
                tokio::time::sleep(delay).await;
                Err(LlmError::Backend(message))
            }
            MockStep::Hang => {
                std::future::pending::<()>().await;
                Err(LlmError::EmptyResponse)
            }
            MockStep::Stream { tokens, delay, .. } => {
                tokio::time::sleep(delay).await;
                Ok(tokens.concat())
            }
        }
    }

    async fn complete_stream(&self, _request: &CompletionRequest) -> Result<TokenStream, LlmError> {
        match self.next_step() {
            MockStep::Reply { delay, text } => {
                tokio::time::sleep(delay).await;
                Ok(Box::pin(stream::iter(vec![Ok(text)])))
            }
            MockStep::Fail { delay, message } => {
                tokio::time::sleep(delay).await;
                Err(LlmError::Backend(message))
            }
            MockStep::Hang => Ok(Box::pin(stream::pending())),
            MockStep::Stream {
                tokens,
                delay,
                fail_after,
            } => {
                let s = stream::unfold(0usize, move |i| {
                    let tokens = tokens.clone();
                    async move {
                        tokio::time::sleep(delay).await;
                        if fail_after == Some(i) {
                            return Some((Err(LlmError::Stream("connection reset".into())), usize::MAX));
                        }
                        tokens.get(i).cloned().map(|t| (Ok(t), i + 1))
                    }
                });
                Ok(Box::pin(s))
            }
        }
    }
}

/// 按候选名分发 Mock 客户端；未登记的候选使用默认 Mock
#[derive(Default)]
pub struct MockFactory {
    clients: HashMap<String, Arc<MockLlmClient>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, candidate: &str, client: MockLlmClient) -> Self {
        self.clients.insert(candidate.to_string(), Arc::new(client));
        self
    }

    pub fn client(&self, candidate: &str) -> Option<Arc<MockLlmClient>> {
        self.clients.get(candidate).cloned()
    }
}

impl ClientFactory for MockFactory {
    fn build(&self, candidate: &BackendCandidate) -> Arc<dyn LlmClient> {
        match self.clients.get(&candidate.name) {
            Some(c) => c.clone(),
            None => Arc::new(MockLlmClient::default()),
        }
    }
}
