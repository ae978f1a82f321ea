use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{self, ConnectConfig};
use crate::credentials::CredentialProvider;
use crate::error::SessionError;
use crate::executor::{Outbox, TaskExecutor, TaskRegistry};
use crate::performer::WorkPerformer;
use crate::session::{ProtocolSession, SessionEnd, SessionTimings};
use crate::state::{ConnectionStatus, StateRecorder, Stats};

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, next: initial }
    }

    /// Delay to wait now; doubles the following one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Keeps one authenticated broker session alive until shutdown.
pub struct ConnectionSupervisor {
    config: ConnectConfig,
    timings: SessionTimings,
    backoff: Backoff,
    credentials: CredentialProvider,
    executor: TaskExecutor,
    outbox: Outbox,
    recorder: StateRecorder,
    stats: Arc<Stats>,
    agent_id: Option<String>,
}

impl ConnectionSupervisor {
    pub fn new(config: ConnectConfig, performer: Arc<dyn WorkPerformer>) -> Self {
        let credentials = CredentialProvider::new(&config.api_base_url);
        let recorder = StateRecorder::new(config::state_file_path(), &config.ws_url);
        Self::with_parts(
            config,
            SessionTimings::default(),
            Backoff::default(),
            credentials,
            recorder,
            performer,
        )
    }

    pub fn with_parts(
        config: ConnectConfig,
        timings: SessionTimings,
        backoff: Backoff,
        credentials: CredentialProvider,
        recorder: StateRecorder,
        performer: Arc<dyn WorkPerformer>,
    ) -> Self {
        let stats = Arc::new(Stats::default());
        let outbox = Outbox::default();
        let executor = TaskExecutor::new(
            TaskRegistry::new(config.max_concurrent),
            outbox.clone(),
            performer,
            Arc::clone(&stats),
        );
        let agent_id = config.agent_id.clone();
        Self {
            config,
            timings,
            backoff,
            credentials,
            executor,
            outbox,
            recorder,
            stats,
            agent_id,
        }
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Run until `cancel` fires or authentication fails for good.
    /// Offline state is recorded either way.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let result = self.run_loop(&cancel).await;
        self.record(ConnectionStatus::Offline);
        info!("Disconnected");
        result
    }

    async fn run_loop(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut token = self
            .credentials
            .current()
            .await
            .context("Not logged in: register the agent or log in by key first")?;
        let mut refreshed = false;

        while !cancel.is_cancelled() {
            self.record(ConnectionStatus::Connecting);
            info!("Connecting to {}", self.config.ws_url);

            match self.attempt(&token, cancel).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::ServerShutdown { reconnect_after }) => {
                    refreshed = false;
                    self.record(ConnectionStatus::Reconnecting);
                    if pause(reconnect_after, cancel).await {
                        break;
                    }
                    token = self.credentials.reload().await?;
                }
                Err(SessionError::TokenRejected(reason)) if !refreshed => {
                    warn!("Token rejected ({reason}), refreshing and retrying");
                    token = self
                        .credentials
                        .refresh()
                        .await
                        .context("Token refresh failed")?;
                    refreshed = true;
                }
                Err(e) if e.is_fatal() || matches!(e, SessionError::TokenRejected(_)) => {
                    return Err(anyhow::Error::new(e).context("Authentication failed, not retrying"));
                }
                Err(e) => {
                    refreshed = false;
                    self.stats.reconnected();
                    let delay = self.backoff.next_delay();
                    warn!("Connection lost: {e}");
                    info!("Reconnecting in {}s", delay.as_secs_f64());
                    self.record(ConnectionStatus::Reconnecting);
                    if pause(delay, cancel).await {
                        break;
                    }
                    token = self.credentials.reload().await?;
                }
            }
        }
        Ok(())
    }

    async fn attempt(&mut self, token: &str, cancel: &CancellationToken) -> Result<SessionEnd, SessionError> {
        let mut session = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Shutdown),
            session = ProtocolSession::connect(&self.config.ws_url, self.timings) => session?,
        };
        let welcome = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Shutdown),
            welcome = session.authenticate(token, self.config.agent_ids(), self.config.max_concurrent) => welcome?,
        };

        self.backoff.reset();
        if welcome.agent_id.is_some() {
            self.agent_id = welcome.agent_id;
        }
        self.outbox.attach(session.sender()).await;
        self.record(ConnectionStatus::Online);
        info!("Connected as agent {}", self.agent_id.as_deref().unwrap_or("?"));

        let result = session
            .serve(&self.executor, &self.credentials, welcome.pending_tasks, cancel)
            .await;
        self.outbox.detach().await;
        result
    }

    fn record(&self, status: ConnectionStatus) {
        self.recorder.record(status, self.agent_id.as_deref(), &self.stats);
    }
}

/// Sleep unless shutdown comes first. Returns true when cancelled.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
