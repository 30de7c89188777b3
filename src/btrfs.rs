//! btrfs 快照守卫
//!
//! 破坏性动作执行前先对根子卷打快照。所有特权命令都经 `pkexec btrfs ...` 以参数数组执行，
//! 从不经过 shell；快照标签只允许 `[A-Za-z0-9_]{1,128}`，子卷 id 必须是正整数。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tokio::process::Command;
use tokio::time::Instant;

use crate::config::BtrfsSection;

pub const SNAPSHOT_PREFIX: &str = "kriya_snap_";
const ACTIVE_ROOT: &str = "/";
const CREATE_TIMEOUT: Duration = Duration::from_secs(60);
const QUERY_TIMEOUT: Duration = Duration::from_secs(15);

static SAFE_NAME_RE: OnceLock<Regex> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("invalid snapshot input: {0}")]
    Validation(String),

    #[error("btrfs is not available on this system")]
    Unavailable,

    #[error("btrfs {op} failed (exit={exit:?}): {stderr}")]
    CommandFailed {
        op: &'static str,
        exit: Option<i32>,
        stderr: String,
    },

    #[error("btrfs {op} timed out after {secs}s")]
    Timeout { op: &'static str, secs: u64 },

    #[error("snapshot not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 一个已存在的快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub name: String,
    pub path: PathBuf,
    /// 名称末尾的 unix 时间戳，无法解析时为 0
    pub timestamp: i64,
}

/// 回滚结果：默认子卷已切换，下次启动生效
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rollback {
    pub snapshot: String,
    pub subvol_id: u64,
}

/// 校验快照标签 / 名称
pub fn sanitize_name(name: &str) -> Result<&str, SnapshotError> {
    let re = SAFE_NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]{1,128}$").unwrap());
    if re.is_match(name) {
        Ok(name)
    } else {
        Err(SnapshotError::Validation(format!(
            "snapshot name '{}' must match [A-Za-z0-9_]{{1,128}}",
            name.escape_debug()
        )))
    }
}

/// 校验 `btrfs inspect-internal rootid` 的输出
pub fn validate_subvol_id(raw: &str) -> Result<u64, SnapshotError> {
    let cleaned = raw.trim();
    if cleaned.is_empty() || !cleaned.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SnapshotError::Validation(format!(
            "subvolume id '{}' is not a pure integer",
            cleaned.escape_debug()
        )));
    }
    match cleaned.parse::<u64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(SnapshotError::Validation(format!(
            "subvolume id must be a positive integer, got '{}'",
            cleaned
        ))),
    }
}

/// 由标签和时间戳组成快照名
pub fn snapshot_name(label: &str, timestamp: i64) -> Result<String, SnapshotError> {
    if label.is_empty() {
        return Ok(format!("{}{}", SNAPSHOT_PREFIX, timestamp));
    }
    let label = sanitize_name(label)?;
    Ok(format!("{}{}_{}", SNAPSHOT_PREFIX, label, timestamp))
}

fn parse_timestamp(name: &str) -> i64 {
    name.rsplit('_').next().and_then(|s| s.parse().ok()).unwrap_or(0)
}

#[async_trait]
pub trait SnapshotGuard: Send + Sync {
    /// 对根子卷打快照
    async fn create(&self, label: &str) -> Result<Snapshot, SnapshotError>;

    /// 把默认子卷切换到指定快照（不自动重启）
    async fn rollback(&self, name: &str) -> Result<Rollback, SnapshotError>;

    /// 本守卫创建的快照，新的在前
    async fn list(&self) -> Vec<Snapshot>;

    fn enabled(&self) -> bool {
        true
    }
}

/// 未启用快照时使用：create 总是失败，因此破坏性动作会被拒绝
#[derive(Debug, Clone, Default)]
pub struct DisabledSnapshots;

#[async_trait]
impl SnapshotGuard for DisabledSnapshots {
    async fn create(&self, _label: &str) -> Result<Snapshot, SnapshotError> {
        Err(SnapshotError::Unavailable)
    }

    async fn rollback(&self, _name: &str) -> Result<Rollback, SnapshotError> {
        Err(SnapshotError::Unavailable)
    }

    async fn list(&self) -> Vec<Snapshot> {
        Vec::new()
    }

    fn enabled(&self) -> bool {
        false
    }
}

pub struct BtrfsSnapshots {
    btrfs_bin: PathBuf,
    pkexec_bin: PathBuf,
    snapshot_root: PathBuf,
}

impl BtrfsSnapshots {
    pub fn new(cfg: &BtrfsSection) -> Self {
        Self {
            btrfs_bin: cfg.btrfs_bin.clone(),
            pkexec_bin: cfg.pkexec_bin.clone(),
            snapshot_root: cfg.snapshot_root.clone(),
        }
    }

    /// `pkexec btrfs <args>` 的完整参数数组
    pub fn privileged_argv(&self, args: &[&str]) -> Vec<String> {
        let mut argv = vec![
            self.pkexec_bin.display().to_string(),
            self.btrfs_bin.display().to_string(),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }

    fn snapshot_path(&self, name: &str) -> PathBuf {
        self.snapshot_root.join(name)
    }

    /// 运行命令，返回 stdout；非零退出和超时转为错误
    async fn run(&self, op: &'static str, argv: &[String], timeout: Duration) -> Result<String, SnapshotError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(SnapshotError::Validation("empty command".into()));
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        tracing::debug!(op, argv = ?argv, "btrfs command");

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(out) => out?,
            Err(_) => {
                return Err(SnapshotError::Timeout {
                    op,
                    secs: timeout.as_secs(),
                })
            }
        };
        if !output.status.success() {
            return Err(SnapshotError::CommandFailed {
                op,
                exit: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// 预检：btrfs 二进制存在且根文件系统是 btrfs
    pub async fn available(&self) -> bool {
        if !Path::new(&self.btrfs_bin).is_file() {
            tracing::warn!(bin = %self.btrfs_bin.display(), "btrfs binary not found");
            return false;
        }
        let argv = vec![
            self.btrfs_bin.display().to_string(),
            "filesystem".to_string(),
            "show".to_string(),
            ACTIVE_ROOT.to_string(),
        ];
        match self.run("filesystem show", &argv, QUERY_TIMEOUT).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "root filesystem is not btrfs");
                false
            }
        }
    }
}

#[async_trait]
impl SnapshotGuard for BtrfsSnapshots {
    async fn create(&self, label: &str) -> Result<Snapshot, SnapshotError> {
        let timestamp = chrono::Utc::now().timestamp();
        let name = snapshot_name(label, timestamp)?;
        if !self.available().await {
            return Err(SnapshotError::Unavailable);
        }
        let path = self.snapshot_path(&name);
        let path_str = path.display().to_string();

        let started = Instant::now();
        let argv = self.privileged_argv(&["subvolume", "snapshot", ACTIVE_ROOT, &path_str]);
        tracing::info!(snapshot = %name, "creating btrfs snapshot");
        match self.run("subvolume snapshot", &argv, CREATE_TIMEOUT).await {
            Ok(_) => {
                tracing::info!(
                    snapshot = %name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "snapshot created"
                );
                Ok(Snapshot {
                    name,
                    path,
                    timestamp,
                })
            }
            Err(e) => {
                tracing::error!(snapshot = %name, error = %e, "snapshot failed");
                Err(e)
            }
        }
    }

    async fn rollback(&self, name: &str) -> Result<Rollback, SnapshotError> {
        let name = sanitize_name(name)?;
        let path = self.snapshot_path(name);
        if !path.exists() {
            return Err(SnapshotError::NotFound(path.display().to_string()));
        }
        let path_str = path.display().to_string();

        let argv = self.privileged_argv(&["inspect-internal", "rootid", &path_str]);
        let raw = self.run("inspect-internal rootid", &argv, QUERY_TIMEOUT).await?;
        let subvol_id = validate_subvol_id(&raw)?;

        let id = subvol_id.to_string();
        let argv = self.privileged_argv(&["subvolume", "set-default", &id, ACTIVE_ROOT]);
        self.run("subvolume set-default", &argv, QUERY_TIMEOUT).await?;
        tracing::info!(snapshot = name, subvol_id, "default subvolume switched, reboot required");
        Ok(Rollback {
            snapshot: name.to_string(),
            subvol_id,
        })
    }

    async fn list(&self) -> Vec<Snapshot> {
        list_snapshots(&self.snapshot_root).await
    }
}

/// 扫描快照目录
pub async fn list_snapshots(root: &Path) -> Vec<Snapshot> {
    let mut snapshots = Vec::new();
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(e) => e,
        Err(e) => {
            tracing::info!(root = %root.display(), error = %e, "snapshot directory not readable");
            return snapshots;
        }
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(SNAPSHOT_PREFIX) {
            continue;
        }
        snapshots.push(Snapshot {
            timestamp: parse_timestamp(&name),
            path: entry.path(),
            name,
        });
    }
    snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    snapshots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert!(sanitize_name("pre_cleanup_01").is_ok());
        for bad in ["", "a b", "../etc", "x;rm -rf /", "snap\0", "名字", "a-b"] {
            assert!(sanitize_name(bad).is_err(), "accepted {bad:?}");
        }
        assert!(sanitize_name(&"a".repeat(128)).is_ok());
        assert!(sanitize_name(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_validate_subvol_id() {
        assert_eq!(validate_subvol_id(" 257\n").unwrap(), 257);
        for bad in ["0", "-5", "12a", "", "1 2", "+3"] {
            assert!(validate_subvol_id(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_snapshot_name() {
        assert_eq!(snapshot_name("", 100).unwrap(), "kriya_snap_100");
        assert_eq!(snapshot_name("act_3", 100).unwrap(), "kriya_snap_act_3_100");
        assert!(snapshot_name("bad/label", 100).is_err());
        assert_eq!(parse_timestamp("kriya_snap_act_3_100"), 100);
        assert_eq!(parse_timestamp("kriya_snap_x"), 0);
    }

    #[test]
    fn test_privileged_argv_has_no_shell() {
        let guard = BtrfsSnapshots::new(&BtrfsSection::default());
        let argv = guard.privileged_argv(&["subvolume", "snapshot", "/", "/@snapshots/kriya_snap_1"]);
        assert_eq!(argv[0], "/usr/bin/pkexec");
        assert_eq!(argv[1], "/usr/bin/btrfs");
        assert!(!argv.iter().any(|a| a == "sh" || a == "-c"));
    }

    #[tokio::test]
    async fn test_disabled_guard_rejects() {
        let guard = DisabledSnapshots;
        assert!(matches!(guard.create("x").await, Err(SnapshotError::Unavailable)));
        assert!(guard.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let guard = BtrfsSnapshots::new(&BtrfsSection {
            enabled: true,
            btrfs_bin: PathBuf::from("/nonexistent/btrfs"),
            ..BtrfsSection::default()
        });
        assert!(matches!(guard.create("pre").await, Err(SnapshotError::Unavailable)));
        assert!(matches!(
            guard.create("bad label").await,
            Err(SnapshotError::Validation(_))
        ));
        assert!(matches!(
            guard.rollback("../etc").await,
            Err(SnapshotError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_list_sorts_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["kriya_snap_a_100", "kriya_snap_300", "other_dir", "kriya_snap_b_200"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        let names: Vec<String> = list_snapshots(dir.path())
            .await
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["kriya_snap_300", "kriya_snap_b_200", "kriya_snap_a_100"]);
    }
}
