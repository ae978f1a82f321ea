use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config;

const LOGIN_BY_KEY_PATH: &str = "/api/v1/users/login-by-key";
const ISSUANCE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct TokenFile {
    #[serde(default)]
    access_token: String,
}

#[derive(Deserialize)]
struct MasterKeyFile {
    #[serde(default)]
    master_key: String,
    #[serde(default)]
    master_secret: String,
}

/// Bearer token source backed by token.json, refreshed through the
/// long-lived master key pair.
pub struct CredentialProvider {
    http: Client,
    api_base_url: String,
    token_path: PathBuf,
    master_key_path: PathBuf,
    token: Arc<RwLock<Option<String>>>,
}

impl CredentialProvider {
    pub fn new(api_base_url: &str) -> Self {
        Self::with_paths(api_base_url, config::token_file_path(), config::master_key_file_path())
    }

    pub fn with_paths(api_base_url: &str, token_path: PathBuf, master_key_path: PathBuf) -> Self {
        let http = Client::builder()
            .timeout(ISSUANCE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            token_path,
            master_key_path,
            token: Arc::new(RwLock::new(None)),
        }
    }

    /// Cached token, else token.json, else a fresh one from the issuance endpoint.
    pub async fn current(&self) -> Result<String> {
        {
            let token = self.token.read().await;
            if let Some(t) = token.as_ref() {
                return Ok(t.clone());
            }
        }
        if let Some(t) = read_token_file(&self.token_path) {
            *self.token.write().await = Some(t.clone());
            return Ok(t);
        }
        self.refresh().await
    }

    /// Forget the cached token and load it again, so a token.json rewritten
    /// by another process is used on the next connection.
    pub async fn reload(&self) -> Result<String> {
        self.token.write().await.take();
        self.current().await
    }

    /// Exchange the master key pair for a new bearer token.
    pub async fn refresh(&self) -> Result<String> {
        let keys = read_master_key_file(&self.master_key_path)
            .filter(|k| !k.master_key.is_empty() && !k.master_secret.is_empty())
            .with_context(|| {
                format!(
                    "Cannot refresh token: no master_key/master_secret in {}",
                    self.master_key_path.display()
                )
            })?;

        let resp = self
            .http
            .post(format!("{}{LOGIN_BY_KEY_PATH}", self.api_base_url))
            .json(&serde_json::json!({
                "api_key": keys.master_key,
                "api_secret": keys.master_secret,
            }))
            .send()
            .await
            .context("Token issuance request failed")?;

        let status = resp.status();
        let body: Value = resp.json().await.context("Invalid token issuance response")?;
        if status.is_client_error() || status.is_server_error() {
            bail!("Token refresh failed ({status}): {body}");
        }

        let token = body
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("No access_token in issuance response"))?;

        write_json(&self.token_path, &body)?;
        *self.token.write().await = Some(token.clone());
        info!("Bearer token refreshed via master key");
        Ok(token)
    }

    /// Adopt a token pushed by the broker.
    pub async fn store(&self, new_token: &str) -> Result<()> {
        write_json(&self.token_path, &serde_json::json!({ "access_token": new_token }))?;
        *self.token.write().await = Some(new_token.to_string());
        debug!("Stored broker-rotated token");
        Ok(())
    }
}

fn read_token_file(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let file: TokenFile = serde_json::from_str(&content).ok()?;
    Some(file.access_token).filter(|t| !t.is_empty())
}

fn read_master_key_file(path: &Path) -> Option<MasterKeyFile> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn write_json(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("Failed to write {}", path.display()))
}
