use crate::error::{ConfigError, Result};
use crate::retry::RetryPolicy;
use serde::Deserialize;
use serde::Serialize;

/// 远端存储连接配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_namespace_collection")]
    pub namespace_collection: String,
    #[serde(default = "default_subcollection")]
    pub subcollection: String,
}

fn default_namespace_collection() -> String {
    "agents".to_string()
}

fn default_subcollection() -> String {
    "conversations".to_string()
}

/// 重试配置（省略项取 [`RetryPolicy`] 默认值）
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RetryConfig {
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            base_delay_ms: self.base_delay_ms.unwrap_or(defaults.base_delay_ms),
            max_delay_ms: self.max_delay_ms.unwrap_or(defaults.max_delay_ms),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub remote: RemoteConfig,
    /// 本地缓存文件路径，支持 `~` 展开
    #[serde(default = "default_cache_path")]
    pub cache_path: String,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_cache_path() -> String {
    "~/.convo_sync/cache.json".to_string()
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|_| {
            ConfigError::FileNotFound(path.to_string())
        })?;
        let config: Config = serde_yaml::from_reader(file)?;
        if config.remote.base_url.is_empty() {
            return Err(ConfigError::MissingField("remote.base_url".to_string()).into());
        }
        Ok(config)
    }
}
