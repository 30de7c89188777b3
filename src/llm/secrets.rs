//! 受限密钥文件加载
//!
//! 文件格式为 `KEY=VALUE`，`#` 开头为注释。文件必须归 root 所有且权限为 0600，否则拒绝加载。
//! 读到的值只保存在进程内的 [`Secrets`] 中，不写回环境变量，也不出现在日志里（日志只打印键名）。

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SecretsError {
    #[error("{path} is not owned by uid {expected} (owner uid={actual})")]
    Owner {
        path: String,
        expected: u32,
        actual: u32,
    },

    #[error("{path} has insecure permissions ({mode:o}), expected 600")]
    Permissions { path: String, mode: u32 },

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// 已加载的密钥；查找时先查文件中的值，再回退到环境变量
#[derive(Default, Clone)]
pub struct Secrets {
    values: HashMap<String, String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("Secrets").field("keys", &keys).finish()
    }
}

impl Secrets {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
            .filter(|v| !v.is_empty())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// 解析 `KEY=VALUE` 文本
    pub fn parse(text: &str) -> Self {
        let values = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .filter(|(k, _)| !k.is_empty())
            .collect();
        Self { values }
    }
}

/// 从默认位置加载：要求文件归 root 所有
pub fn load_secrets(path: &Path) -> Result<Secrets, SecretsError> {
    load_secrets_owned_by(path, 0)
}

/// 加载并校验属主与权限；文件不存在时返回空集合并告警
pub fn load_secrets_owned_by(path: &Path, owner_uid: u32) -> Result<Secrets, SecretsError> {
    let shown = path.display().to_string();
    if !path.exists() {
        tracing::warn!(
            path = %shown,
            "secrets file not found, cloud fallbacks will rely on environment variables"
        );
        return Ok(Secrets::empty());
    }

    let io_err = |source| SecretsError::Io {
        path: shown.clone(),
        source,
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(path).map_err(io_err)?;
        if meta.uid() != owner_uid {
            return Err(SecretsError::Owner {
                path: shown.clone(),
                expected: owner_uid,
                actual: meta.uid(),
            });
        }
        let mode = meta.mode() & 0o777;
        if mode & 0o177 != 0 {
            return Err(SecretsError::Permissions {
                path: shown.clone(),
                mode,
            });
        }
    }
    #[cfg(not(unix))]
    let _ = owner_uid;

    let text = std::fs::read_to_string(path).map_err(io_err)?;
    let secrets = Secrets::parse(&text);
    let mut keys: Vec<&String> = secrets.values.keys().collect();
    keys.sort();
    tracing::info!(path = %shown, count = secrets.len(), keys = ?keys, "secrets loaded");
    Ok(secrets)
}
