//! 执行记忆：记录过往动作的结果，供 REASON 阶段按相似度召回
//!
//! 存储是可选协作者。控制循环只通过 [`VectorMemory`] 访问它，任何失败或超时都退化为
//! “没有匹配”，不会让阶段报错。

mod handle;
mod store;

pub use handle::MemoryHandle;
pub use store::{similarity, tokenize, SqliteStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::state::{ActionOutcome, ActionResult};

/// 一条执行记录（REMEMBER 阶段写入）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub action_type: String,
    pub outcome: String,
    pub command_sequence: Vec<String>,
    pub iteration: u64,
    pub timestamp: DateTime<Utc>,
    pub tags: Vec<String>,
}

impl ExecutionRecord {
    pub fn new(action_type: impl Into<String>, outcome: ActionOutcome, iteration: u64) -> Self {
        Self {
            action_type: action_type.into(),
            outcome: outcome.as_str().to_string(),
            command_sequence: Vec::new(),
            iteration,
            timestamp: Utc::now(),
            tags: Vec::new(),
        }
    }

    pub fn with_commands(mut self, commands: Vec<String>) -> Self {
        self.command_sequence = commands;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// 由 ACT 结果生成记录
    pub fn from_result(result: &ActionResult, iteration: u64) -> Self {
        let commands = result.script.iter().cloned().collect();
        let mut tags = vec![result.outcome.as_str().to_string()];
        if let Some(code) = result.exit_code {
            tags.push(format!("exit_{}", code));
        }
        Self::new(result.description.clone(), result.outcome, iteration)
            .with_commands(commands)
            .with_tags(tags)
    }

    /// 稳定 id：同一动作 + 命令序列总是落到同一行（upsert）
    pub fn record_id(&self) -> String {
        let key = format!("{}:{}", self.action_type, self.command_sequence.join(":"));
        let digest = Sha256::digest(key.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        hex[..16].to_string()
    }

    /// 参与相似度计算的文本
    pub fn to_document(&self) -> String {
        let commands = if self.command_sequence.is_empty() {
            "none".to_string()
        } else {
            self.command_sequence.join(" → ")
        };
        let tags = if self.tags.is_empty() {
            "none".to_string()
        } else {
            self.tags.join(", ")
        };
        format!(
            "Action: {}. Outcome: {}. Commands: {}. Tags: {}.",
            self.action_type, self.outcome, commands, tags
        )
    }

    pub fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "action_type": self.action_type,
            "outcome": self.outcome,
            "iteration": self.iteration,
            "timestamp": self.timestamp.to_rfc3339(),
            "command_count": self.command_sequence.len(),
        })
    }
}

/// 一条召回结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryMatch {
    pub id: String,
    pub document: String,
    pub metadata: serde_json::Value,
    pub similarity: f64,
}

/// 向量记忆接口；实现必须吞掉自身错误
#[async_trait]
pub trait VectorMemory: Send + Sync {
    /// 写入（同 id 覆盖），返回记录 id；失败返回 None
    async fn store(&self, record: &ExecutionRecord) -> Option<String>;

    /// 按文本相似度召回，`outcome` 非空时只返回该结果类型
    async fn query(&self, text: &str, top_k: usize, outcome: Option<ActionOutcome>) -> Vec<MemoryMatch>;

    /// 记录总数；不可用时为 None
    async fn count(&self) -> Option<usize>;

    async fn close(&self) {}

    fn enabled(&self) -> bool {
        true
    }
}

/// 未启用记忆时使用
#[derive(Debug, Clone, Default)]
pub struct NoopMemory;

#[async_trait]
impl VectorMemory for NoopMemory {
    async fn store(&self, _record: &ExecutionRecord) -> Option<String> {
        None
    }

    async fn query(&self, _text: &str, _top_k: usize, _outcome: Option<ActionOutcome>) -> Vec<MemoryMatch> {
        Vec::new()
    }

    async fn count(&self) -> Option<usize> {
        None
    }

    fn enabled(&self) -> bool {
        false
    }
}
