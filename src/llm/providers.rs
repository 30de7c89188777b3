//! 常用 OpenAI 兼容端点预设
//!
//! 模型组名形如 `local/llama3`、`gemini/flash`；配置中未声明 `[[router.groups]]` 时，
//! 按这里的预设把组名映射为候选后端。
//! - local: Ollama（`http://localhost:11434/v1`，无需 key）
//! - gemini: Google 的 OpenAI 兼容网关，key 取自 `GEMINI_API_KEY`
//! - anthropic: Anthropic 的 OpenAI 兼容端点，key 取自 `ANTHROPIC_API_KEY`
//! - openai: 官方 API，key 取自 `OPENAI_API_KEY`

use crate::config::CandidateConfig;

pub const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// 组列表为空时使用的兜底候选
pub const EMERGENCY_GROUP: &str = "gemini/gemini-pro";
pub const EMERGENCY_MODEL: &str = "gemini-pro";

/// 本地组在首选模型之后追加的第二个本地模型
pub const LOCAL_SECONDARY_MODEL: &str = "deepseek-r1";

/// 单次尝试的默认超时：预设链在默认重试与退避下需落在总超时之内
const LOCAL_TIMEOUT_SECS: u64 = 5;
const CLOUD_TIMEOUT_SECS: u64 = 8;

/// 将 `provider/model` 形式的组名解析为预设候选；未知 provider 返回空列表
///
/// 本地组包含两个 Ollama 模型：组名指定的模型，以及 deepseek-r1。
pub fn preset_group(group: &str) -> Vec<CandidateConfig> {
    let Some((provider, alias)) = group.split_once('/') else {
        return Vec::new();
    };
    match provider {
        "local" | "ollama" => {
            let mut candidates = vec![local_candidate(group.to_string(), alias)];
            if alias != LOCAL_SECONDARY_MODEL {
                candidates.push(local_candidate(
                    format!("{}/{}", provider, LOCAL_SECONDARY_MODEL),
                    LOCAL_SECONDARY_MODEL,
                ));
            }
            candidates
        }
        "gemini" => vec![cloud_candidate(group, GEMINI_BASE_URL, "GEMINI_API_KEY", gemini_model(alias))],
        "anthropic" => vec![cloud_candidate(
            group,
            ANTHROPIC_BASE_URL,
            "ANTHROPIC_API_KEY",
            anthropic_model(alias),
        )],
        "openai" => vec![cloud_candidate(group, OPENAI_BASE_URL, "OPENAI_API_KEY", openai_model(alias))],
        _ => Vec::new(),
    }
}

fn local_candidate(name: String, model: &str) -> CandidateConfig {
    CandidateConfig {
        name,
        model: model.to_string(),
        api_base: Some(OLLAMA_BASE_URL.to_string()),
        api_key_env: None,
        timeout_secs: LOCAL_TIMEOUT_SECS,
    }
}

fn cloud_candidate(group: &str, api_base: &str, key_env: &str, model: String) -> CandidateConfig {
    CandidateConfig {
        name: group.to_string(),
        model,
        api_base: Some(api_base.to_string()),
        api_key_env: Some(key_env.to_string()),
        timeout_secs: CLOUD_TIMEOUT_SECS,
    }
}

/// 兜底候选：保证回退链永不为空
pub fn emergency_candidate() -> CandidateConfig {
    CandidateConfig {
        name: EMERGENCY_GROUP.to_string(),
        model: EMERGENCY_MODEL.to_string(),
        api_base: Some(GEMINI_BASE_URL.to_string()),
        api_key_env: Some("GEMINI_API_KEY".to_string()),
        timeout_secs: CLOUD_TIMEOUT_SECS,
    }
}

fn gemini_model(alias: &str) -> String {
    match alias {
        "flash" => "gemini-1.5-flash".to_string(),
        "pro" => "gemini-1.5-pro".to_string(),
        other => other.to_string(),
    }
}

fn anthropic_model(alias: &str) -> String {
    match alias {
        "haiku" => "claude-3-haiku-20240307".to_string(),
        "sonnet" => "claude-3-5-sonnet-20240620".to_string(),
        other => other.to_string(),
    }
}

fn openai_model(alias: &str) -> String {
    match alias {
        "gpt4o" => "gpt-4o".to_string(),
        "gpt4o-mini" => "gpt-4o-mini".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_local_group_has_two_models() {
        let group = preset_group("local/llama3");
        let models: Vec<&str> = group.iter().map(|c| c.model.as_str()).collect();
        assert_eq!(models, ["llama3", "deepseek-r1"]);
        assert_eq!(group[0].name, "local/llama3");
        assert_eq!(group[1].name, "local/deepseek-r1");
        assert!(group.iter().all(|c| c.api_base.as_deref() == Some(OLLAMA_BASE_URL)));
        assert!(group.iter().all(|c| c.api_key_env.is_none()));

        // 组名本身就是 deepseek-r1 时不重复追加
        assert_eq!(preset_group("local/deepseek-r1").len(), 1);
    }

    #[test]
    fn test_preset_cloud_aliases() {
        assert_eq!(preset_group("gemini/flash")[0].model, "gemini-1.5-flash");
        assert_eq!(
            preset_group("anthropic/haiku")[0].api_key_env.as_deref(),
            Some("ANTHROPIC_API_KEY")
        );
        assert_eq!(preset_group("openai/gpt4o")[0].model, "gpt-4o");
    }

    #[test]
    fn test_unknown_provider() {
        assert!(preset_group("mystery/model").is_empty());
        assert!(preset_group("no-slash").is_empty());
    }
}
