use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Online,
    Reconnecting,
    Offline,
}

/// Cumulative counters shared by the executor, workers and supervisor.
#[derive(Debug, Default)]
pub struct Stats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    reconnects: AtomicU64,
}

impl Stats {
    pub fn task_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tasks_completed(&self) -> u64 {
        self.tasks_completed.load(Ordering::Relaxed)
    }

    pub fn tasks_failed(&self) -> u64 {
        self.tasks_failed.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub status: ConnectionStatus,
    pub agent_id: Option<String>,
    pub ws_url: String,
    pub pid: u32,
    pub updated_at: DateTime<Utc>,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub connected_at: Option<DateTime<Utc>>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub reconnects: u64,
}

/// Writes connect-state.json for operators. Nothing reads it back at runtime.
pub struct StateRecorder {
    path: PathBuf,
    ws_url: String,
    connected_at: Mutex<Option<DateTime<Utc>>>,
}

impl StateRecorder {
    pub fn new(path: PathBuf, ws_url: &str) -> Self {
        Self {
            path,
            ws_url: ws_url.to_string(),
            connected_at: Mutex::new(None),
        }
    }

    pub fn record(&self, status: ConnectionStatus, agent_id: Option<&str>, stats: &Stats) {
        let connected_at = match self.connected_at.lock() {
            Ok(mut at) => {
                if status == ConnectionStatus::Online {
                    *at = Some(Utc::now());
                }
                *at
            }
            Err(_) => None,
        };
        let snapshot = StateSnapshot {
            status,
            agent_id: agent_id.map(str::to_string),
            ws_url: self.ws_url.clone(),
            pid: std::process::id(),
            updated_at: Utc::now(),
            stats: StatsSnapshot {
                connected_at,
                tasks_completed: stats.tasks_completed(),
                tasks_failed: stats.tasks_failed(),
                reconnects: stats.reconnects(),
            },
        };
        if let Err(e) = write_snapshot(&self.path, &snapshot) {
            warn!("Failed to write state file {}: {e}", self.path.display());
        }
    }
}

fn write_snapshot(path: &Path, snapshot: &StateSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(snapshot)?)?;
    Ok(())
}

pub fn read_snapshot(path: &Path) -> Option<StateSnapshot> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Print the last recorded state.
pub fn print_status(path: &Path) {
    let Some(state) = read_snapshot(path) else {
        println!("market-connect is not connected (no state file)");
        return;
    };
    let status = match state.status {
        ConnectionStatus::Connecting => "connecting",
        ConnectionStatus::Online => "online",
        ConnectionStatus::Reconnecting => "reconnecting",
        ConnectionStatus::Offline => "offline",
    };
    println!("Status:    {status}");
    println!("Agent:     {}", state.agent_id.as_deref().unwrap_or("?"));
    println!("URL:       {}", state.ws_url);
    println!("PID:       {}", state.pid);
    println!("Updated:   {}", state.updated_at.with_timezone(&Local).to_rfc3339());
    if let Some(at) = state.stats.connected_at {
        let hours = (Utc::now() - at).num_seconds() as f64 / 3600.0;
        println!("Uptime:    {hours:.1}h");
    }
    println!(
        "Completed: {} | Failed: {} | Reconnects: {}",
        state.stats.tasks_completed, state.stats.tasks_failed, state.stats.reconnects
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_overwrites_with_latest_status_and_counters() {
        let path = std::env::temp_dir()
            .join(format!("market-connect-{}", uuid::Uuid::new_v4()))
            .join("connect-state.json");
        let recorder = StateRecorder::new(path.clone(), "ws://127.0.0.1/agent-ws");
        let stats = Stats::default();

        recorder.record(ConnectionStatus::Connecting, None, &stats);
        assert_eq!(read_snapshot(&path).unwrap().status, ConnectionStatus::Connecting);

        stats.task_completed();
        stats.task_failed();
        stats.reconnected();
        recorder.record(ConnectionStatus::Online, Some("agent-7"), &stats);
        let state = read_snapshot(&path).unwrap();
        assert_eq!(state.status, ConnectionStatus::Online);
        assert_eq!(state.agent_id.as_deref(), Some("agent-7"));
        assert_eq!(state.pid, std::process::id());
        assert!(state.stats.connected_at.is_some());
        assert_eq!(
            (state.stats.tasks_completed, state.stats.tasks_failed, state.stats.reconnects),
            (1, 1, 1)
        );

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["status"], "online");
    }
}
