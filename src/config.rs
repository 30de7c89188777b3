//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `KRIYA__*` 覆盖（双下划线表示嵌套，如 `KRIYA__DAEMON__LOOP_INTERVAL_SECS=5`）。
//! 所有字段都有默认值，空配置即可运行。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub daemon: DaemonSection,
    pub watchdog: WatchdogSection,
    pub router: RouterSection,
    pub hardware: HardwareSection,
    pub sandbox: SandboxSection,
    pub memory: MemorySection,
    pub cloud: CloudSection,
    pub btrfs: BtrfsSection,
    pub ipc: IpcSection,
}

/// [daemon] 段：迭代节奏与日志尾缓冲
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    /// 两次迭代开始之间的目标间隔（秒）
    pub loop_interval_secs: u64,
    /// log_tail 环形缓冲容量
    pub log_tail_capacity: usize,
    /// 清理任务（后台资源 flush）的总超时（秒）
    pub cleanup_timeout_secs: u64,
    /// 系统提示词文件；不存在时使用内置提示词
    pub system_prompt_path: Option<PathBuf>,
    /// 待解决问题列表上限，超出时丢弃最旧的
    pub max_unresolved_items: usize,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            loop_interval_secs: 10,
            log_tail_capacity: 100,
            cleanup_timeout_secs: 5,
            system_prompt_path: None,
            max_unresolved_items: 32,
        }
    }
}

impl DaemonSection {
    pub fn loop_interval(&self) -> Duration {
        Duration::from_secs(self.loop_interval_secs)
    }
}

/// [watchdog] 段：外部监管者（systemd WatchdogSec）的截止时间
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogSection {
    /// 监管截止时间（秒）；环境变量 WATCHDOG_USEC 存在时以其为准
    pub deadline_secs: u64,
    /// 预期单个阶段最坏耗时（秒），用于启动时检查余量
    pub expected_worst_phase_secs: u64,
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            deadline_secs: 120,
            expected_worst_phase_secs: 60,
        }
    }
}

/// [router] 段：混合推理路由
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    /// 资源充足时的首选组（本地推理）
    pub local_group: String,
    /// 资源不足时的首选组（云端推理）
    pub cloud_group: String,
    /// 本地组要求的显存总量下限（GB）
    pub local_min_total_vram_gb: f64,
    /// 本地组要求的可用显存下限（GB）
    pub local_min_available_vram_gb: f64,
    /// 首选组之后依次尝试的回退组
    pub fallbacks: Vec<String>,
    /// 每个候选失败后的重试次数
    pub retries: u32,
    /// 重试之间的固定退避（毫秒）
    pub retry_backoff_ms: u64,
    /// 候选失败后的冷却窗口（秒）
    pub cooldown_secs: u64,
    /// 整条回退链的硬上限（秒）
    pub overall_timeout_secs: u64,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// 受限的密钥文件（KEY=VALUE）
    pub secrets_path: Option<PathBuf>,
    pub groups: Vec<ModelGroupConfig>,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            local_group: "local/llama3".to_string(),
            cloud_group: "gemini/flash".to_string(),
            local_min_total_vram_gb: 8.0,
            local_min_available_vram_gb: 4.0,
            fallbacks: vec!["gemini/flash".to_string(), "anthropic/haiku".to_string()],
            retries: 1,
            retry_backoff_ms: 1000,
            cooldown_secs: 60,
            overall_timeout_secs: 60,
            temperature: Some(0.7),
            max_tokens: Some(2048),
            secrets_path: Some(PathBuf::from("/etc/kriya/secrets.env")),
            groups: Vec::new(),
        }
    }
}

impl RouterSection {
    pub fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.overall_timeout_secs)
    }
}

/// [[router.groups]]：一个命名的模型组，内含若干候选后端
#[derive(Debug, Clone, Deserialize)]
pub struct ModelGroupConfig {
    pub name: String,
    #[serde(default)]
    pub candidates: Vec<CandidateConfig>,
}

/// 单个候选后端
#[derive(Debug, Clone, Deserialize)]
pub struct CandidateConfig {
    pub name: String,
    pub model: String,
    pub api_base: Option<String>,
    /// 存放 API Key 的变量名（先查密钥文件，再查环境变量）
    pub api_key_env: Option<String>,
    #[serde(default = "default_attempt_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_attempt_timeout_secs() -> u64 {
    10
}

/// [hardware] 段：资源探测
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HardwareSection {
    /// 查询 GPU 的 nvidia-smi 路径；为空则跳过 GPU 探测
    pub nvidia_smi: Option<PathBuf>,
    /// 磁盘探测挂载点
    pub disk_mount: PathBuf,
    /// 可用磁盘低于该值（GB）时 REASON 生成清理动作
    pub disk_free_alert_gb: f64,
    /// nvidia-smi 调用超时（秒）
    pub probe_timeout_secs: u64,
}

impl Default for HardwareSection {
    fn default() -> Self {
        Self {
            nvidia_smi: Some(PathBuf::from("nvidia-smi")),
            disk_mount: PathBuf::from("/"),
            disk_free_alert_gb: 5.0,
            probe_timeout_secs: 5,
        }
    }
}

/// [sandbox] 段：Docker 隔离执行
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub enabled: bool,
    pub docker_bin: PathBuf,
    pub image: String,
    pub timeout_secs: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            enabled: true,
            docker_bin: PathBuf::from("docker"),
            image: "alpine:3.19".to_string(),
            timeout_secs: 30,
        }
    }
}

/// [memory] 段：向量记忆存储
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub enabled: bool,
    pub path: PathBuf,
    /// 单次调用允许阻塞控制循环的上限（毫秒）
    pub budget_ms: u64,
    pub top_k: usize,
    /// 低于该相似度的结果丢弃
    pub similarity_threshold: f64,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("/var/lib/kriya/memory.sqlite3"),
            budget_ms: 2000,
            top_k: 5,
            similarity_threshold: 0.35,
        }
    }
}

impl MemorySection {
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }
}

/// [cloud] 段：遥测上报与技能检索
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudSection {
    pub enabled: bool,
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    /// 遥测发送队列容量，满时丢弃新负载
    pub queue_capacity: usize,
    /// PATCH 阶段技能查询的总预算（秒），超时未返回的问题留到下一轮
    pub patch_budget_secs: u64,
    /// PATCH 阶段同时进行的技能查询数
    pub patch_concurrency: usize,
}

impl Default for CloudSection {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://hud.kriya.local".to_string(),
            request_timeout_secs: 15,
            max_retries: 3,
            queue_capacity: 8,
            patch_budget_secs: 30,
            patch_concurrency: 8,
        }
    }
}

/// [btrfs] 段：破坏性操作前的快照守卫
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BtrfsSection {
    pub enabled: bool,
    pub btrfs_bin: PathBuf,
    pub pkexec_bin: PathBuf,
    pub snapshot_root: PathBuf,
}

impl Default for BtrfsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            btrfs_bin: PathBuf::from("/usr/bin/btrfs"),
            pkexec_bin: PathBuf::from("/usr/bin/pkexec"),
            snapshot_root: PathBuf::from("/@snapshots"),
        }
    }
}

/// [ipc] 段：观察者 / 命令接口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IpcSection {
    pub enabled: bool,
    pub socket_path: PathBuf,
    /// SSE 保活间隔（秒）
    pub keepalive_secs: u64,
    /// 日志事件总线容量（溢出时慢读者丢最旧事件）
    pub event_capacity: usize,
}

impl Default for IpcSection {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: PathBuf::from("/run/kriya/ipc.sock"),
            keepalive_secs: 15,
            event_capacity: 512,
        }
    }
}

/// 从 config 目录加载配置，环境变量 KRIYA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 KRIYA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("KRIYA")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
