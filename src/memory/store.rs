//! SQLite 存储（同步），只在记忆工作线程上使用

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use super::{ExecutionRecord, MemoryMatch};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS executions (
    id          TEXT PRIMARY KEY,
    action_type TEXT NOT NULL,
    outcome     TEXT NOT NULL,
    document    TEXT NOT NULL,
    metadata    TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_executions_outcome ON executions(outcome);
";

pub struct SqliteStore {
    conn: Connection,
    threshold: f64,
}

impl SqliteStore {
    pub fn open(path: &Path, threshold: f64) -> rusqlite::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
        Self::init(conn, threshold)
    }

    pub fn open_in_memory(threshold: f64) -> rusqlite::Result<Self> {
        Self::init(Connection::open_in_memory()?, threshold)
    }

    fn init(conn: Connection, threshold: f64) -> rusqlite::Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, threshold })
    }

    pub fn upsert(&self, record: &ExecutionRecord) -> rusqlite::Result<String> {
        let id = record.record_id();
        self.conn.execute(
            "INSERT INTO executions (id, action_type, outcome, document, metadata, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                outcome = excluded.outcome,
                document = excluded.document,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at",
            params![
                id,
                record.action_type,
                record.outcome,
                record.to_document(),
                record.metadata().to_string(),
                record.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    pub fn get_document(&self, id: &str) -> rusqlite::Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT document FROM executions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
    }

    /// 读取候选行并按相似度排序，低于阈值的丢弃
    pub fn query(&self, text: &str, top_k: usize, outcome: Option<&str>) -> rusqlite::Result<Vec<MemoryMatch>> {
        let query_tokens = tokenize(text);
        if query_tokens.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, document, metadata FROM executions
             WHERE ?1 IS NULL OR outcome = ?1",
        )?;
        let rows = stmt.query_map(params![outcome], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut matches = Vec::new();
        for row in rows {
            let (id, document, metadata) = row?;
            let score = similarity(&query_tokens, &tokenize(&document));
            if score < self.threshold {
                continue;
            }
            matches.push(MemoryMatch {
                id,
                document,
                metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
                similarity: score,
            });
        }
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(top_k);
        Ok(matches)
    }

    pub fn count(&self) -> rusqlite::Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM executions", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

/// 小写词集合；标点视为分隔符，单字符词忽略
pub fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_' && c != '-' && c != '/')
        .map(|w| w.trim_matches('-').to_lowercase())
        .filter(|w| w.chars().count() > 1)
        .collect()
}

/// 词集合余弦相似度：|A ∩ B| / sqrt(|A| · |B|)
pub fn similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count() as f64;
    shared / ((a.len() as f64) * (b.len() as f64)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::ActionOutcome;

    fn record(action: &str, outcome: ActionOutcome, cmd: &str) -> ExecutionRecord {
        ExecutionRecord::new(action, outcome, 1)
            .with_commands(vec![cmd.to_string()])
            .with_tags(vec![outcome.as_str().to_string()])
    }

    #[test]
    fn test_similarity_bounds() {
        let a = tokenize("clean docker images");
        assert!((similarity(&a, &a) - 1.0).abs() < 1e-9);
        assert_eq!(similarity(&a, &tokenize("rotate journal")), 0.0);
        assert_eq!(similarity(&a, &HashSet::new()), 0.0);
    }

    #[test]
    fn test_upsert_keeps_single_row() {
        let store = SqliteStore::open_in_memory(0.1).unwrap();
        let first = record("prune images", ActionOutcome::Failure, "docker image prune -f");
        let id = store.upsert(&first).unwrap();
        let mut second = first.clone();
        second.outcome = "success".into();
        assert_eq!(store.upsert(&second).unwrap(), id);
        assert_eq!(store.count().unwrap(), 1);
        let doc = store.get_document(&id).unwrap().unwrap();
        assert!(doc.contains("Outcome: success"));
        assert!(store.get_document("missing").unwrap().is_none());
    }

    #[test]
    fn test_query_ranks_and_filters() {
        let store = SqliteStore::open_in_memory(0.2).unwrap();
        store
            .upsert(&record("prune docker images", ActionOutcome::Success, "docker image prune -f"))
            .unwrap();
        store
            .upsert(&record("vacuum journal", ActionOutcome::Failure, "journalctl --vacuum-size=200M"))
            .unwrap();

        let hits = store.query("prune old docker images", 5, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].document.contains("prune docker images"));
        assert_eq!(hits[0].metadata["outcome"], "success");

        assert!(store
            .query("prune old docker images", 5, Some("failure"))
            .unwrap()
            .is_empty());
        assert!(store.query("", 5, None).unwrap().is_empty());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("memory.sqlite3");
        {
            let store = SqliteStore::open(&path, 0.35).unwrap();
            store
                .upsert(&record("a", ActionOutcome::Success, "true"))
                .unwrap();
        }
        let store = SqliteStore::open(&path, 0.35).unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }
}
