pub mod llm;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::protocol::Artifact;

pub use llm::LlmPerformer;

/// What a worker hands to the performer.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub task_id: String,
    pub message: Value,
    pub metadata: Value,
}

impl WorkRequest {
    /// Concatenated text of all `text` parts in the message.
    pub fn text(&self) -> String {
        self.message
            .get("parts")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn title(&self) -> &str {
        self.metadata
            .get("task_title")
            .and_then(Value::as_str)
            .unwrap_or("Task result")
    }
}

/// The external capability that produces a task's output.
#[async_trait]
pub trait WorkPerformer: Send + Sync + 'static {
    async fn perform(&self, request: &WorkRequest) -> Result<Vec<Artifact>>;
}
