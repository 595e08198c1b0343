use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "default";
pub const DEFAULT_MAX_TOKENS: u32 = 4000;

/**
 * \brief 上游调用配置：密钥池、模型列表与当前选中项。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_key_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_model_index: Option<usize>,
    /** \brief 单次回复的 token 上限，缺省为 4000。 */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            models: vec![DEFAULT_MODEL.to_string()],
            base_url: default_base_url(),
            active_key_index: None,
            active_model_index: None,
            max_tokens: None,
        }
    }
}

impl Configuration {
    /**
     * \brief 写入前的结构校验。索引不做越界检查，由选择器降级处理。
     */
    pub fn validate(&self) -> Result<()> {
        let parsed = url::Url::parse(&self.base_url)
            .with_context(|| format!("invalid base_url: {}", self.base_url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            bail!("base_url must use http or https, got {}", parsed.scheme());
        }
        if self.api_keys.iter().any(|k| k.trim().is_empty()) {
            bail!("api_keys must not contain blank entries");
        }
        if self.models.iter().any(|m| m.trim().is_empty()) {
            bail!("models must not contain blank entries");
        }
        if self.max_tokens == Some(0) {
            bail!("max_tokens must be greater than zero");
        }
        Ok(())
    }

    pub fn effective_max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }
}

/**
 * \brief 按索引选出当前密钥与模型。
 * \details 列表为空时密钥为空串、模型为 "default"；索引缺失或越界时回退到 0。不会失败。
 */
pub fn select_credentials(config: &Configuration) -> (String, String) {
    let key = pick(&config.api_keys, config.active_key_index).unwrap_or_default();
    let model = pick(&config.models, config.active_model_index)
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());
    (key, model)
}

fn pick(items: &[String], index: Option<usize>) -> Option<String> {
    let idx = index.filter(|i| *i < items.len()).unwrap_or(0);
    items.get(idx).cloned()
}

/**
 * \brief 配置服务：读取走无锁快照，写入经单写者锁串行化并原子替换。
 */
pub struct ConfigStore {
    current: ArcSwap<Configuration>,
    writer: Mutex<()>,
    path: Option<PathBuf>,
}

impl ConfigStore {
    /** \brief 仅驻留内存的配置，不落盘。 */
    pub fn in_memory(config: Configuration) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
            writer: Mutex::new(()),
            path: None,
        }
    }

    /**
     * \brief 从 JSON 文件加载；文件不存在时使用默认配置（首次写入时创建文件）。
     */
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read config {} failed", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parse config {} failed", path.display()))?
        } else {
            Configuration::default()
        };
        Ok(Self {
            current: ArcSwap::from_pointee(config),
            writer: Mutex::new(()),
            path: Some(path),
        })
    }

    pub fn get(&self) -> Arc<Configuration> {
        self.current.load_full()
    }

    pub fn update(&self, config: Configuration) -> Result<()> {
        self.modify(|current| {
            *current = config;
            Ok(())
        })
        .map(|_| ())
    }

    /**
     * \brief 读-改-写：在写锁内基于最新快照修改、校验、持久化并发布。
     */
    pub fn modify<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Configuration) -> Result<T>,
    {
        let _guard = self
            .writer
            .lock()
            .map_err(|_| anyhow!("config writer lock poisoned"))?;
        let mut next = Configuration::clone(&self.current.load());
        let out = f(&mut next)?;
        next.validate()?;
        if let Some(path) = &self.path {
            persist(path, &next)?;
        }
        self.current.store(Arc::new(next));
        Ok(out)
    }
}

fn persist(path: &Path, config: &Configuration) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(config)?;
    std::fs::write(&tmp, body).with_context(|| format!("write {} failed", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("replace {} failed", path.display()))?;
    Ok(())
}

/**
 * \brief 进程级设置，来自环境变量。
 */
#[derive(Debug, Clone)]
pub struct Settings {
    pub config_path: PathBuf,
    pub db_path: PathBuf,
    pub prompt_path: PathBuf,
    pub ui_dir: PathBuf,
    pub upstream_timeout: Duration,
    pub referer: String,
    pub title: String,
    pub audit_log: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("relaychat_config.json"),
            db_path: PathBuf::from("relaychat.db"),
            prompt_path: PathBuf::from("system-prompt.txt"),
            ui_dir: PathBuf::from("web"),
            upstream_timeout: Duration::from_secs(60),
            referer: "http://localhost:5000".to_string(),
            title: "RelayChat Web".to_string(),
            audit_log: false,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        let timeout_secs = std::env::var("RELAYCHAT_UPSTREAM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.upstream_timeout);
        Self {
            config_path: env_path("RELAYCHAT_CONFIG", defaults.config_path),
            db_path: env_path("RELAYCHAT_DB", defaults.db_path),
            prompt_path: env_path("RELAYCHAT_PROMPT", defaults.prompt_path),
            ui_dir: env_path("RELAYCHAT_UI_DIR", defaults.ui_dir),
            upstream_timeout: timeout_secs,
            referer: std::env::var("RELAYCHAT_REFERER").unwrap_or(defaults.referer),
            title: std::env::var("RELAYCHAT_TITLE").unwrap_or(defaults.title),
            audit_log: std::env::var("RELAYCHAT_AUDIT_LOG")
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.audit_log),
        }
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}
