use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

const DEFAULT_HOST: &str = "mindcore8.com";
const LOCAL_WS_URL: &str = "ws://127.0.0.1:8006/agent-ws";
const LOCAL_API_BASE_URL: &str = "http://127.0.0.1:8001";

/// Default config directory: ~/.lobster-market/
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lobster-market")
}

/// Default config file path: ~/.lobster-market/settings.json
pub fn default_config_path() -> PathBuf {
    config_dir().join("settings.json")
}

pub fn token_file_path() -> PathBuf {
    config_dir().join("token.json")
}

pub fn master_key_file_path() -> PathBuf {
    config_dir().join("master-key.json")
}

pub fn state_file_path() -> PathBuf {
    config_dir().join("connect-state.json")
}

/// PID file path: ~/.lobster-market/connect.pid
pub fn pid_file_path() -> PathBuf {
    config_dir().join("connect.pid")
}

/// Log directory: ~/.lobster-market/logs/
pub fn log_dir() -> PathBuf {
    config_dir().join("logs")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub performer: PerformerConfig,
}

/// Work performer backends, first configured one wins.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PerformerConfig {
    #[serde(default)]
    pub dashscope_api_key: Option<String>,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
}

fn default_ws_url() -> String {
    format!("wss://{DEFAULT_HOST}/agent-ws")
}
fn default_api_base_url() -> String {
    format!("https://{DEFAULT_HOST}")
}
fn default_max_concurrent() -> usize {
    3
}
fn default_openai_base_url() -> String {
    "api.openai.com".to_string()
}
fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            api_base_url: default_api_base_url(),
            agent_id: None,
            max_concurrent: default_max_concurrent(),
            performer: PerformerConfig::default(),
        }
    }
}

impl Default for PerformerConfig {
    fn default() -> Self {
        Self {
            dashscope_api_key: None,
            openai_api_key: None,
            openai_base_url: default_openai_base_url(),
            openai_model: default_openai_model(),
        }
    }
}

impl ConnectConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
        let config: ConnectConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Load the file when present, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| var(key).filter(|v| !v.is_empty());

        if var("LOBSTER_LOCAL").as_deref() == Some("1") {
            self.ws_url = LOCAL_WS_URL.to_string();
            self.api_base_url = LOCAL_API_BASE_URL.to_string();
        } else if let Some(host) = non_empty("LOBSTER_HOST") {
            self.ws_url = format!("wss://{host}/agent-ws");
            self.api_base_url = format!("https://{host}");
        }
        if let Some(url) = non_empty("LOBSTER_WS_URL") {
            self.ws_url = url;
        }
        if let Some(key) = non_empty("DASHSCOPE_API_KEY") {
            self.performer.dashscope_api_key = Some(key);
        }
        if let Some(key) = non_empty("OPENAI_API_KEY") {
            self.performer.openai_api_key = Some(key);
        }
        if let Some(base) = non_empty("OPENAI_BASE_URL") {
            self.performer.openai_base_url = base;
        }
        if let Some(model) = non_empty("OPENAI_MODEL") {
            self.performer.openai_model = model;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.ws_url)
            .map_err(|e| anyhow::anyhow!("Invalid ws_url {}: {e}", self.ws_url))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            bail!("ws_url must use ws:// or wss://, got {}", self.ws_url);
        }
        if self.max_concurrent == 0 {
            bail!("max_concurrent must be at least 1");
        }
        Ok(())
    }

    /// `agent_ids` as sent in `auth`: always a list, possibly empty.
    pub fn agent_ids(&self) -> Vec<String> {
        self.agent_id.iter().cloned().collect()
    }
}
