//! 记忆工作线程句柄
//!
//! rusqlite::Connection 不是 Sync，且调用会阻塞；因此由一个专用 OS 线程持有连接，
//! 控制循环经通道发送请求，用 oneshot 等待结果，每次等待不超过预算。

use std::sync::mpsc;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::store::SqliteStore;
use super::{ExecutionRecord, MemoryMatch, VectorMemory};
use crate::config::MemorySection;
use crate::core::state::ActionOutcome;

enum Request {
    Store {
        record: ExecutionRecord,
        reply: oneshot::Sender<rusqlite::Result<String>>,
    },
    Query {
        text: String,
        top_k: usize,
        outcome: Option<ActionOutcome>,
        reply: oneshot::Sender<rusqlite::Result<Vec<MemoryMatch>>>,
    },
    Count {
        reply: oneshot::Sender<rusqlite::Result<usize>>,
    },
}

pub struct MemoryHandle {
    tx: Mutex<Option<mpsc::Sender<Request>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    budget: Duration,
}

impl MemoryHandle {
    /// 打开存储并启动工作线程；打开失败时返回错误，由调用方降级为 NoopMemory
    pub fn open(cfg: &MemorySection) -> anyhow::Result<Self> {
        let path = cfg.path.clone();
        let threshold = cfg.similarity_threshold;
        Self::spawn(cfg.budget(), move || SqliteStore::open(&path, threshold))
    }

    pub fn in_memory(budget: Duration, threshold: f64) -> anyhow::Result<Self> {
        Self::spawn(budget, move || SqliteStore::open_in_memory(threshold))
    }

    fn spawn<F>(budget: Duration, open: F) -> anyhow::Result<Self>
    where
        F: FnOnce() -> rusqlite::Result<SqliteStore> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Request>();
        let (ready_tx, ready_rx) = mpsc::channel::<rusqlite::Result<()>>();

        let worker = std::thread::Builder::new()
            .name("kriya-memory".into())
            .spawn(move || {
                let store = match open() {
                    Ok(s) => {
                        let _ = ready_tx.send(Ok(()));
                        s
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // 发送端全部关闭后 recv 返回 Err，线程退出并关闭连接
                while let Ok(req) = rx.recv() {
                    serve(&store, req);
                }
                tracing::debug!("memory worker stopped");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(anyhow::anyhow!("memory store open failed: {}", e));
            }
            Err(_) => {
                let _ = worker.join();
                anyhow::bail!("memory worker exited during startup");
            }
        }

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            budget,
        })
    }

    fn send(&self, req: Request) -> bool {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(req).is_ok(),
            None => false,
        }
    }

    /// 等待工作线程回复，超出预算或失败都返回 None
    async fn await_reply<T>(&self, op: &'static str, rx: oneshot::Receiver<rusqlite::Result<T>>) -> Option<T> {
        match tokio::time::timeout(self.budget, rx).await {
            Ok(Ok(Ok(v))) => Some(v),
            Ok(Ok(Err(e))) => {
                tracing::warn!(op, error = %e, "memory operation failed");
                None
            }
            Ok(Err(_)) => {
                tracing::warn!(op, "memory worker dropped the request");
                None
            }
            Err(_) => {
                tracing::warn!(op, budget_ms = self.budget.as_millis() as u64, "memory operation exceeded budget");
                None
            }
        }
    }
}

fn serve(store: &SqliteStore, req: Request) {
    match req {
        Request::Store { record, reply } => {
            let _ = reply.send(store.upsert(&record));
        }
        Request::Query {
            text,
            top_k,
            outcome,
            reply,
        } => {
            let _ = reply.send(store.query(&text, top_k, outcome.map(|o| o.as_str())));
        }
        Request::Count { reply } => {
            let _ = reply.send(store.count());
        }
    }
}

#[async_trait]
impl VectorMemory for MemoryHandle {
    async fn store(&self, record: &ExecutionRecord) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        if !self.send(Request::Store {
            record: record.clone(),
            reply,
        }) {
            return None;
        }
        self.await_reply("store", rx).await
    }

    async fn query(&self, text: &str, top_k: usize, outcome: Option<ActionOutcome>) -> Vec<MemoryMatch> {
        let (reply, rx) = oneshot::channel();
        if !self.send(Request::Query {
            text: text.to_string(),
            top_k,
            outcome,
            reply,
        }) {
            return Vec::new();
        }
        self.await_reply("query", rx).await.unwrap_or_default()
    }

    async fn count(&self) -> Option<usize> {
        let (reply, rx) = oneshot::channel();
        if !self.send(Request::Count { reply }) {
            return None;
        }
        self.await_reply("count", rx).await
    }

    /// 关闭通道并等待工作线程退出（在阻塞线程池中 join）
    async fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            match tokio::task::spawn_blocking(move || worker.join()).await {
                Ok(Ok(())) => tracing::info!("memory store closed"),
                _ => tracing::warn!("memory worker did not exit cleanly"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn record(action: &str, cmd: &str) -> ExecutionRecord {
        ExecutionRecord::new(action, ActionOutcome::Success, 1).with_commands(vec![cmd.to_string()])
    }

    #[tokio::test]
    async fn test_store_query_count() {
        let memory = MemoryHandle::in_memory(Duration::from_secs(2), 0.2).unwrap();
        let id = memory
            .store(&record("prune docker images", "docker image prune -f"))
            .await
            .unwrap();
        assert_eq!(id.len(), 16);
        assert_eq!(memory.count().await, Some(1));

        let hits = memory.query("docker images prune", 3, None).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
        assert!(memory
            .query("docker images prune", 3, Some(ActionOutcome::Failure))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_closed_handle_degrades_to_no_match() {
        let memory = MemoryHandle::in_memory(Duration::from_secs(2), 0.2).unwrap();
        memory.close().await;
        assert!(memory.store(&record("a", "true")).await.is_none());
        assert!(memory.query("a", 3, None).await.is_empty());
        assert_eq!(memory.count().await, None);
        // 重复关闭无副作用
        memory.close().await;
    }

    #[tokio::test]
    async fn test_open_failure_is_reported() {
        let cfg = MemorySection {
            path: PathBuf::from("/proc/kriya/forbidden/memory.sqlite3"),
            ..MemorySection::default()
        };
        assert!(MemoryHandle::open(&cfg).is_err());
    }
}
