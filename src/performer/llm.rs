use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::config::PerformerConfig;
use crate::protocol::Artifact;

use super::{WorkPerformer, WorkRequest};

const DASHSCOPE_URL: &str =
    "https://dashscope.aliyuncs.com/api/v1/services/aigc/text-generation/generation";
const DASHSCOPE_MODEL: &str = "qwen-plus";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

enum Backend {
    DashScope { api_key: String },
    OpenAi { api_key: String, base_url: String, model: String },
    Echo,
}

/// Text-generation performer: DashScope, then any OpenAI-compatible
/// endpoint, then an echo fallback.
pub struct LlmPerformer {
    http: Client,
    backend: Backend,
}

impl LlmPerformer {
    pub fn new(config: &PerformerConfig) -> Self {
        let backend = if let Some(api_key) = config.dashscope_api_key.clone() {
            Backend::DashScope { api_key }
        } else if let Some(api_key) = config.openai_api_key.clone() {
            Backend::OpenAi {
                api_key,
                base_url: openai_endpoint(&config.openai_base_url),
                model: config.openai_model.clone(),
            }
        } else {
            Backend::Echo
        };
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http, backend }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            Backend::DashScope { .. } => "dashscope",
            Backend::OpenAi { .. } => "openai",
            Backend::Echo => "echo",
        }
    }

    async fn generate(&self, text: &str) -> Result<String> {
        match &self.backend {
            Backend::DashScope { api_key } => {
                let body = serde_json::json!({
                    "model": DASHSCOPE_MODEL,
                    "input": { "messages": [{ "role": "user", "content": text }] },
                });
                let data = self.post_json(DASHSCOPE_URL, api_key, &body).await?;
                Ok(data
                    .pointer("/output/text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| data.to_string()))
            }
            Backend::OpenAi { api_key, base_url, model } => {
                let body = serde_json::json!({
                    "model": model,
                    "messages": [{ "role": "user", "content": text }],
                });
                let data = self.post_json(base_url, api_key, &body).await?;
                Ok(data
                    .pointer("/choices/0/message/content")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| data.to_string()))
            }
            Backend::Echo => Ok(format!(
                "Received task: {text}\n\nNo LLM backend configured \
                 (set DASHSCOPE_API_KEY or OPENAI_API_KEY); running in echo mode."
            )),
        }
    }

    async fn post_json(&self, url: &str, api_key: &str, body: &Value) -> Result<Value> {
        let resp = self
            .http
            .post(url)
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await
            .context("Failed to send request to LLM API")?;
        let status = resp.status();
        let data: Value = resp.json().await.context("Invalid LLM API response")?;
        if !status.is_success() {
            bail!("LLM API error {status}: {data}");
        }
        debug!("LLM API responded {status}");
        Ok(data)
    }
}

/// Accepts a bare host (`api.openai.com`) or a full base URL.
fn openai_endpoint(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{base}/v1/chat/completions")
    } else {
        format!("https://{base}/v1/chat/completions")
    }
}

#[async_trait]
impl WorkPerformer for LlmPerformer {
    async fn perform(&self, request: &WorkRequest) -> Result<Vec<Artifact>> {
        let text = request.text();
        if text.is_empty() {
            bail!("task input is empty");
        }
        let output = self.generate(&text).await?;
        Ok(vec![Artifact::markdown(request.title(), output)])
    }
}
