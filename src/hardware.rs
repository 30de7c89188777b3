//! 资源探测：CPU / 内存 / 磁盘 / GPU
//!
//! Linux 下直接读 procfs，磁盘用 statvfs，GPU 通过 nvidia-smi（带超时）。任一来源失败时该项为 0，
//! 探测本身永不报错，SENSE 阶段总能拿到一份样本。

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::HardwareSection;
use crate::llm::ResourceState;

/// 一次资源采样
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSample {
    pub cpu_pct: f64,
    pub ram_pct: f64,
    pub vram_total_gb: f64,
    pub vram_used_gb: f64,
    pub gpu_util_pct: f64,
    pub disk_free_gb: f64,
}

impl ResourceSample {
    /// 路由决策只关心显存
    pub fn routing_state(&self) -> ResourceState {
        ResourceState {
            vram_total_gb: self.vram_total_gb,
            vram_used_gb: self.vram_used_gb,
        }
    }
}

#[async_trait]
pub trait HardwareProbe: Send + Sync {
    async fn sample(&self) -> ResourceSample;
}

/// 固定样本（测试 / 非 Linux 平台）
#[derive(Debug, Clone, Default)]
pub struct StaticProbe(pub ResourceSample);

#[async_trait]
impl HardwareProbe for StaticProbe {
    async fn sample(&self) -> ResourceSample {
        self.0
    }
}

/// 本机探测
pub struct SystemProbe {
    nvidia_smi: Option<PathBuf>,
    disk_mount: PathBuf,
    timeout: Duration,
    /// 上一次 /proc/stat 的 (idle, total)，用于计算区间 CPU 占用
    last_cpu: Mutex<Option<(u64, u64)>>,
}

impl SystemProbe {
    pub fn new(cfg: &HardwareSection) -> Self {
        Self {
            nvidia_smi: cfg.nvidia_smi.clone(),
            disk_mount: cfg.disk_mount.clone(),
            timeout: Duration::from_secs(cfg.probe_timeout_secs),
            last_cpu: Mutex::new(None),
        }
    }

    async fn cpu_pct(&self) -> f64 {
        let Some(current) = read_cpu_times().await else {
            return 0.0;
        };
        let previous = {
            let mut last = self.last_cpu.lock().unwrap_or_else(|e| e.into_inner());
            last.replace(current)
        };
        let previous = match previous {
            Some(p) => p,
            None => {
                // 首次采样没有基线，短暂等待后再读一次
                tokio::time::sleep(Duration::from_millis(100)).await;
                let Some(next) = read_cpu_times().await else {
                    return 0.0;
                };
                *self.last_cpu.lock().unwrap_or_else(|e| e.into_inner()) = Some(next);
                return cpu_delta_pct(current, next);
            }
        };
        cpu_delta_pct(previous, current)
    }

    async fn gpu(&self) -> (f64, f64, f64) {
        let Some(bin) = &self.nvidia_smi else {
            return (0.0, 0.0, 0.0);
        };
        let mut cmd = tokio::process::Command::new(bin);
        cmd.args([
            "--query-gpu=memory.total,memory.used,utilization.gpu",
            "--format=csv,noheader,nounits",
        ])
        .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(out)) if out.status.success() => {
                parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(Ok(out)) => {
                tracing::debug!(status = ?out.status, "nvidia-smi exited with failure");
                (0.0, 0.0, 0.0)
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "nvidia-smi not available");
                (0.0, 0.0, 0.0)
            }
            Err(_) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "nvidia-smi timed out");
                (0.0, 0.0, 0.0)
            }
        }
    }
}

#[async_trait]
impl HardwareProbe for SystemProbe {
    async fn sample(&self) -> ResourceSample {
        let cpu_pct = self.cpu_pct().await;
        let ram_pct = match tokio::fs::read_to_string("/proc/meminfo").await {
            Ok(text) => parse_meminfo_pct(&text),
            Err(_) => 0.0,
        };
        let disk_free_gb = disk_free_gb(&self.disk_mount).unwrap_or(0.0);
        let (vram_total_gb, vram_used_gb, gpu_util_pct) = self.gpu().await;
        ResourceSample {
            cpu_pct,
            ram_pct,
            vram_total_gb,
            vram_used_gb,
            gpu_util_pct,
            disk_free_gb,
        }
    }
}

async fn read_cpu_times() -> Option<(u64, u64)> {
    let text = tokio::fs::read_to_string("/proc/stat").await.ok()?;
    parse_proc_stat(&text)
}

/// 解析 /proc/stat 首行，返回 (idle + iowait, total)
pub fn parse_proc_stat(text: &str) -> Option<(u64, u64)> {
    let line = text.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total = fields.iter().sum();
    Some((idle, total))
}

fn cpu_delta_pct(prev: (u64, u64), cur: (u64, u64)) -> f64 {
    let total = cur.1.saturating_sub(prev.1);
    if total == 0 {
        return 0.0;
    }
    let idle = cur.0.saturating_sub(prev.0);
    (1.0 - idle as f64 / total as f64) * 100.0
}

/// 由 MemTotal / MemAvailable 计算内存占用百分比
pub fn parse_meminfo_pct(text: &str) -> f64 {
    let field = |name: &str| -> Option<f64> {
        text.lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    match (field("MemTotal:"), field("MemAvailable:")) {
        (Some(total), Some(avail)) if total > 0.0 => (1.0 - avail / total) * 100.0,
        _ => 0.0,
    }
}

/// 解析 nvidia-smi CSV（MiB），多卡求和，利用率取平均；返回 (total_gb, used_gb, util_pct)
pub fn parse_nvidia_smi(text: &str) -> (f64, f64, f64) {
    let mut total = 0.0;
    let mut used = 0.0;
    let mut util = 0.0;
    let mut gpus = 0usize;
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let cols: Vec<f64> = line
            .split(',')
            .filter_map(|c| c.trim().parse().ok())
            .collect();
        if cols.len() < 3 {
            continue;
        }
        total += cols[0];
        used += cols[1];
        util += cols[2];
        gpus += 1;
    }
    if gpus == 0 {
        return (0.0, 0.0, 0.0);
    }
    (total / 1024.0, used / 1024.0, util / gpus as f64)
}

/// 挂载点可用空间（GB，非特权用户可用部分）
#[cfg(unix)]
pub fn disk_free_gb(mount: &Path) -> Option<f64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let path = CString::new(mount.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    let bytes = stat.f_bavail as f64 * stat.f_frsize as f64;
    Some(bytes / 1024f64.powi(3))
}

#[cfg(not(unix))]
pub fn disk_free_gb(_mount: &Path) -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proc_stat() {
        let text = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 1 2 3 4\n";
        assert_eq!(parse_proc_stat(text), Some((850, 1000)));
        assert_eq!(parse_proc_stat("intr 1 2 3"), None);
    }

    #[test]
    fn test_cpu_delta() {
        let pct = cpu_delta_pct((800, 1000), (850, 1100));
        assert!((pct - 50.0).abs() < 1e-9);
        assert_eq!(cpu_delta_pct((1, 1), (1, 1)), 0.0);
    }

    #[test]
    fn test_parse_meminfo() {
        let text = "MemTotal:       16000000 kB\nMemFree: 1 kB\nMemAvailable:    4000000 kB\n";
        assert!((parse_meminfo_pct(text) - 75.0).abs() < 1e-9);
        assert_eq!(parse_meminfo_pct("garbage"), 0.0);
    }

    #[test]
    fn test_parse_nvidia_smi_multi_gpu() {
        let text = "8192, 2048, 40\n8192, 6144, 60\n";
        let (total, used, util) = parse_nvidia_smi(text);
        assert_eq!(total, 16.0);
        assert_eq!(used, 8.0);
        assert_eq!(util, 50.0);
        assert_eq!(parse_nvidia_smi(""), (0.0, 0.0, 0.0));
    }

    #[cfg(unix)]
    #[test]
    fn test_disk_free_root() {
        let free = disk_free_gb(Path::new("/")).unwrap();
        assert!(free >= 0.0);
        assert!(disk_free_gb(Path::new("/definitely/not/here")).is_none());
    }

    #[tokio::test]
    async fn test_missing_nvidia_smi_is_zero() {
        let probe = SystemProbe::new(&HardwareSection {
            nvidia_smi: Some(PathBuf::from("/nonexistent/nvidia-smi")),
            ..HardwareSection::default()
        });
        assert_eq!(probe.gpu().await, (0.0, 0.0, 0.0));
    }
}
