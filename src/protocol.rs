use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire protocol version carried in every frame as `v`.
pub const PROTOCOL_VERSION: u32 = 1;

/// First sequence number of every task.
pub const FIRST_SEQ: u64 = 1;

// ── Client → broker ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        token: String,
        agent_ids: Vec<String>,
        max_concurrent_tasks: usize,
    },
    Ping {
        ts: i64,
    },
    Pong {
        ts: i64,
    },
    TaskAccept {
        task_id: String,
        seq: u64,
    },
    TaskReject {
        task_id: String,
        seq: u64,
        reason: String,
    },
    TaskProgress {
        task_id: String,
        seq: u64,
        status: TaskStatus,
    },
    TaskComplete {
        task_id: String,
        seq: u64,
        status: TaskStatus,
        artifacts: Vec<Artifact>,
    },
    TaskFailed {
        task_id: String,
        seq: u64,
        status: TaskStatus,
        error: String,
    },
    TokenRefreshAck,
}

impl ClientFrame {
    /// Serialize to a JSON text frame with the protocol version attached.
    pub fn encode(&self) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert("v".to_string(), PROTOCOL_VERSION.into());
        }
        Ok(value.to_string())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::TaskAccept { .. } => "task_accept",
            Self::TaskReject { .. } => "task_reject",
            Self::TaskProgress { .. } => "task_progress",
            Self::TaskComplete { .. } => "task_complete",
            Self::TaskFailed { .. } => "task_failed",
            Self::TokenRefreshAck => "token_refresh_ack",
        }
    }

    /// Task the frame belongs to, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskAccept { task_id, .. }
            | Self::TaskReject { task_id, .. }
            | Self::TaskProgress { task_id, .. }
            | Self::TaskComplete { task_id, .. }
            | Self::TaskFailed { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Working,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ProgressMetadata>,
}

impl TaskStatus {
    pub fn working(progress: u8, current_step: &str) -> Self {
        Self {
            state: TaskState::Working,
            metadata: Some(ProgressMetadata {
                progress,
                current_step: current_step.to_string(),
            }),
        }
    }

    pub fn completed() -> Self {
        Self { state: TaskState::Completed, metadata: None }
    }

    pub fn failed() -> Self {
        Self { state: TaskState::Failed, metadata: None }
    }
}

/// Advisory progress telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMetadata {
    pub progress: u8,
    pub current_step: String,
}

/// A task output produced by the work performer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Part {
    Text { text: String },
}

impl Artifact {
    pub fn markdown(name: &str, text: String) -> Self {
        Self {
            name: name.to_string(),
            parts: vec![Part::Text { text }],
            metadata: serde_json::json!({ "mime_type": "text/markdown" }),
        }
    }
}

// ── Broker → client ──

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerFrame {
    AuthOk {
        #[serde(default)]
        agent_id: Option<String>,
        #[serde(default)]
        pending_tasks: Vec<PendingTaskSnapshot>,
    },
    AuthFail {
        #[serde(default)]
        reason: String,
    },
    TaskSend {
        task_id: String,
        #[serde(default)]
        message: Value,
        #[serde(default)]
        metadata: Value,
    },
    TokenRefresh {
        #[serde(default)]
        new_token: String,
    },
    ServerShutdown {
        #[serde(default = "default_reconnect_after_ms")]
        reconnect_after_ms: u64,
    },
    Ping {
        ts: i64,
    },
    Pong {
        #[serde(default)]
        ts: Option<i64>,
    },
    #[serde(other)]
    Unknown,
}

fn default_reconnect_after_ms() -> u64 {
    5000
}

impl BrokerFrame {
    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// A task that survived a disconnect, re-offered at `auth_ok`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTaskSnapshot {
    pub task_id: String,
    #[serde(default)]
    pub message: Value,
    #[serde(default = "default_snapshot_status")]
    pub status: String,
}

fn default_snapshot_status() -> String {
    "working".to_string()
}

impl PendingTaskSnapshot {
    /// The broker never recorded an acceptance for this task.
    pub fn needs_accept(&self) -> bool {
        self.status == "submitted"
    }
}

/// Milliseconds since the Unix epoch, as carried in `ping.ts`.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_json(frame: &ClientFrame) -> Value {
        serde_json::from_str(&frame.encode().unwrap()).unwrap()
    }

    #[test]
    fn auth_carries_agent_ids_list() {
        let json = to_json(&ClientFrame::Auth {
            token: "jwt".into(),
            agent_ids: vec!["agent-001".into()],
            max_concurrent_tasks: 3,
        });
        assert_eq!(json["type"], "auth");
        assert_eq!(json["v"], 1);
        assert_eq!(json["agent_ids"], serde_json::json!(["agent-001"]));
        assert!(json.get("agent_id").is_none());
        assert_eq!(json["max_concurrent_tasks"], 3);
    }

    #[test]
    fn auth_without_agent_still_sends_empty_list() {
        let json = to_json(&ClientFrame::Auth {
            token: "jwt".into(),
            agent_ids: vec![],
            max_concurrent_tasks: 1,
        });
        assert!(json["agent_ids"].as_array().unwrap().is_empty());
    }

    #[test]
    fn task_failed_error_is_plain_string() {
        let json = to_json(&ClientFrame::TaskFailed {
            task_id: "t1".into(),
            seq: 3,
            status: TaskStatus::failed(),
            error: "something went wrong".into(),
        });
        assert!(json["error"].is_string());
        assert_eq!(json["status"], serde_json::json!({ "state": "failed" }));
    }

    #[test]
    fn progress_and_complete_shapes() {
        let progress = to_json(&ClientFrame::TaskProgress {
            task_id: "t1".into(),
            seq: 2,
            status: TaskStatus::working(50, "executing"),
        });
        assert_eq!(progress["status"]["state"], "working");
        assert_eq!(progress["status"]["metadata"]["progress"], 50);
        assert!(progress.get("message").is_none());

        let complete = to_json(&ClientFrame::TaskComplete {
            task_id: "t1".into(),
            seq: 3,
            status: TaskStatus::completed(),
            artifacts: vec![Artifact::markdown("result", "done".into())],
        });
        assert_eq!(complete["artifacts"][0]["parts"][0]["type"], "text");
        assert_eq!(complete["artifacts"][0]["metadata"]["mime_type"], "text/markdown");
    }

    #[test]
    fn token_refresh_ack_has_type_and_version_only() {
        let json = to_json(&ClientFrame::TokenRefreshAck);
        assert_eq!(json, serde_json::json!({ "type": "token_refresh_ack", "v": 1 }));
    }

    #[test]
    fn decodes_auth_ok_with_snapshots() {
        let frame = BrokerFrame::decode(
            r#"{"type":"auth_ok","v":1,"agent_id":"a1","pending_tasks":[
                {"task_id":"t1","message":{"parts":[]},"status":"submitted"},
                {"task_id":"t2"}]}"#,
        )
        .unwrap();
        let BrokerFrame::AuthOk { agent_id, pending_tasks } = frame else {
            panic!("expected auth_ok");
        };
        assert_eq!(agent_id.as_deref(), Some("a1"));
        assert!(pending_tasks[0].needs_accept());
        assert_eq!(pending_tasks[1].status, "working");
        assert!(!pending_tasks[1].needs_accept());
    }

    #[test]
    fn decodes_server_shutdown_default_delay() {
        let frame = BrokerFrame::decode(r#"{"type":"server_shutdown","v":1}"#).unwrap();
        assert_eq!(frame, BrokerFrame::ServerShutdown { reconnect_after_ms: 5000 });
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let frame = BrokerFrame::decode(r#"{"type":"market_news","v":1}"#).unwrap();
        assert_eq!(frame, BrokerFrame::Unknown);
    }
}
