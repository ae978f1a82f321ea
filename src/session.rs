use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credentials::CredentialProvider;
use crate::error::SessionError;
use crate::executor::TaskExecutor;
use crate::protocol::{BrokerFrame, ClientFrame, PendingTaskSnapshot, now_ms};

const OUTBOUND_CAPACITY: usize = 512;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, WsMessage>;
type WsReader = SplitStream<WsStream>;

/// Protocol timers.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimings {
    /// Limit for connecting plus receiving `auth_ok` / `auth_fail`.
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Silence after which the link is declared dead.
    pub heartbeat_timeout: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

/// Result of a successful handshake.
#[derive(Debug)]
pub struct Welcome {
    pub agent_id: Option<String>,
    pub pending_tasks: Vec<PendingTaskSnapshot>,
}

/// How a session ended without error.
#[derive(Debug, PartialEq)]
pub enum SessionEnd {
    Shutdown,
    ServerShutdown { reconnect_after: Duration },
}

/// One physical broker connection.
pub struct ProtocolSession {
    reader: WsReader,
    tx: mpsc::Sender<ClientFrame>,
    writer: JoinHandle<Result<(), SessionError>>,
    timings: SessionTimings,
}

impl ProtocolSession {
    pub async fn connect(url: &str, timings: SessionTimings) -> Result<Self, SessionError> {
        let (ws, _) = tokio::time::timeout(timings.handshake_timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| SessionError::HandshakeTimeout(timings.handshake_timeout))??;
        let (sink, reader) = ws.split();
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let writer = tokio::spawn(run_writer(sink, rx));
        debug!("WebSocket connected to {url}");
        Ok(Self { reader, tx, writer, timings })
    }

    /// Handle onto the single writer.
    pub fn sender(&self) -> mpsc::Sender<ClientFrame> {
        self.tx.clone()
    }

    pub async fn authenticate(
        &mut self,
        token: &str,
        agent_ids: Vec<String>,
        max_concurrent: usize,
    ) -> Result<Welcome, SessionError> {
        self.send(ClientFrame::Auth {
            token: token.to_string(),
            agent_ids,
            max_concurrent_tasks: max_concurrent,
        })
        .await?;

        let deadline = Instant::now() + self.timings.handshake_timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, recv(&mut self.reader))
                .await
                .map_err(|_| SessionError::HandshakeTimeout(self.timings.handshake_timeout))??;
            let Some(frame) = frame else { continue };
            match frame {
                BrokerFrame::AuthOk { agent_id, pending_tasks } => {
                    return Ok(Welcome { agent_id, pending_tasks });
                }
                BrokerFrame::AuthFail { reason } => {
                    return Err(SessionError::from_auth_fail(reason));
                }
                BrokerFrame::Ping { ts } => self.send(ClientFrame::Pong { ts }).await?,
                BrokerFrame::Pong { .. } | BrokerFrame::Unknown => {}
                other => return Err(SessionError::UnexpectedFrame(format!("{other:?}"))),
            }
        }
    }

    /// Resume `pending` snapshots, then read and dispatch frames until the
    /// link fails, the broker announces maintenance, or `cancel` fires.
    pub async fn serve(
        mut self,
        executor: &TaskExecutor,
        credentials: &CredentialProvider,
        pending: Vec<PendingTaskSnapshot>,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, SessionError> {
        if !pending.is_empty() {
            info!("Resuming {} pending task(s)", pending.len());
        }
        for snapshot in pending {
            executor.resume(snapshot).await;
        }

        let heartbeat = spawn_heartbeat(self.tx.clone(), self.timings.heartbeat_interval);
        let result = self.read_loop(executor, credentials, cancel).await;
        heartbeat.abort();
        self.writer.abort();
        result
    }

    async fn read_loop(
        &mut self,
        executor: &TaskExecutor,
        credentials: &CredentialProvider,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, SessionError> {
        let silence = self.timings.heartbeat_timeout;
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return Ok(SessionEnd::Shutdown),
                written = &mut self.writer => {
                    return Err(match written {
                        Ok(Err(e)) => e,
                        _ => SessionError::WriterGone,
                    });
                }
                read = tokio::time::timeout(silence, recv(&mut self.reader)) => read,
            };
            let Some(frame) = read.map_err(|_| SessionError::HeartbeatTimeout(silence))?? else {
                continue;
            };

            match frame {
                BrokerFrame::Ping { ts } => self.send(ClientFrame::Pong { ts }).await?,
                BrokerFrame::Pong { ts } => debug!("Heartbeat pong: {ts:?}"),
                BrokerFrame::TaskSend { task_id, message, metadata } => {
                    info!("[{task_id}] Received task offer");
                    executor.admit(task_id, message, metadata).await;
                }
                BrokerFrame::TokenRefresh { new_token } => {
                    if new_token.is_empty() {
                        warn!("Ignoring token_refresh without a token");
                        continue;
                    }
                    match credentials.store(&new_token).await {
                        Ok(()) => {
                            self.send(ClientFrame::TokenRefreshAck).await?;
                            info!("Token rotated by broker");
                        }
                        Err(e) => warn!("Failed to store rotated token: {e}"),
                    }
                }
                BrokerFrame::ServerShutdown { reconnect_after_ms } => {
                    let reconnect_after = Duration::from_millis(reconnect_after_ms);
                    info!("Broker maintenance, reconnecting in {reconnect_after:?}");
                    return Ok(SessionEnd::ServerShutdown { reconnect_after });
                }
                BrokerFrame::AuthOk { .. } | BrokerFrame::AuthFail { .. } => {
                    warn!("Ignoring handshake frame on an authenticated session");
                }
                BrokerFrame::Unknown => debug!("Ignoring frame of unknown type"),
            }
        }
    }

    async fn send(&self, frame: ClientFrame) -> Result<(), SessionError> {
        self.tx.send(frame).await.map_err(|_| SessionError::WriterGone)
    }
}

/// Read one WebSocket message. `None` for anything that is not a decodable
/// broker frame, so every arrival resets the caller's silence timer.
async fn recv(reader: &mut WsReader) -> Result<Option<BrokerFrame>, SessionError> {
    let Some(msg) = reader.next().await else {
        return Err(SessionError::Closed);
    };
    match msg? {
        WsMessage::Text(text) => match BrokerFrame::decode(text.as_str()) {
            Ok(frame) => Ok(Some(frame)),
            Err(e) => {
                warn!("Ignoring undecodable frame: {e}");
                Ok(None)
            }
        },
        WsMessage::Close(_) => Err(SessionError::Closed),
        _ => Ok(None),
    }
}

/// Sole owner of the sink: every outbound frame passes through here.
async fn run_writer(mut sink: WsWriter, mut rx: mpsc::Receiver<ClientFrame>) -> Result<(), SessionError> {
    while let Some(frame) = rx.recv().await {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping unencodable {} frame: {e}", frame.kind());
                continue;
            }
        };
        sink.send(WsMessage::Text(text.into())).await?;
        match frame.task_id() {
            Some(task_id) => debug!("[{task_id}] Sent {}", frame.kind()),
            None => debug!("Sent {}", frame.kind()),
        }
    }
    Ok(())
}

fn spawn_heartbeat(tx: mpsc::Sender<ClientFrame>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(every);
        timer.tick().await; // consume first immediate tick
        loop {
            timer.tick().await;
            if tx.send(ClientFrame::Ping { ts: now_ms() }).await.is_err() {
                break;
            }
            debug!("Heartbeat ping sent");
        }
    })
}
