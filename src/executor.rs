use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::SessionError;
use crate::performer::{WorkPerformer, WorkRequest};
use crate::protocol::{ClientFrame, FIRST_SEQ, PendingTaskSnapshot};
use crate::state::Stats;
use crate::worker::TaskWorker;

const REJECT_REASON_FULL: &str = "task queue is full";

/// Owner of the set of locally non-terminal tasks. Outlives sessions so a
/// reconnect does not lose track of workers that are still running.
pub struct TaskRegistry {
    max_concurrent: usize,
    active: Mutex<HashSet<String>>,
}

pub enum Admission {
    Admitted(ActiveTask),
    Full,
    AlreadyActive,
}

impl TaskRegistry {
    pub fn new(max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            max_concurrent,
            active: Mutex::new(HashSet::new()),
        })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Check-and-insert under one lock so the cap can never be overshot.
    pub fn try_admit(self: &Arc<Self>, task_id: &str) -> Admission {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains(task_id) {
            return Admission::AlreadyActive;
        }
        if active.len() >= self.max_concurrent {
            return Admission::Full;
        }
        active.insert(task_id.to_string());
        Admission::Admitted(ActiveTask {
            registry: Arc::clone(self),
            task_id: task_id.to_string(),
            last_seq: 0,
        })
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(task_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn release(&self, task_id: &str) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id);
    }
}

/// A registered non-terminal task and its sequence counter.
///
/// Dropping it removes the task from the registry and discards the counter,
/// including when the worker unwinds or its terminal frame could not be sent.
pub struct ActiveTask {
    registry: Arc<TaskRegistry>,
    task_id: String,
    last_seq: u64,
}

impl ActiveTask {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn next_seq(&mut self) -> u64 {
        self.last_seq += 1;
        self.last_seq
    }
}

impl Drop for ActiveTask {
    fn drop(&mut self) {
        self.registry.release(&self.task_id);
    }
}

/// Route from every frame producer to the current session's single writer.
///
/// Detached while no authenticated session exists; frames sent then are lost.
#[derive(Clone, Default)]
pub struct Outbox {
    route: Arc<RwLock<Option<mpsc::Sender<ClientFrame>>>>,
}

impl Outbox {
    pub async fn attach(&self, tx: mpsc::Sender<ClientFrame>) {
        *self.route.write().await = Some(tx);
    }

    pub async fn detach(&self) {
        *self.route.write().await = None;
    }

    pub async fn send(&self, frame: ClientFrame) -> Result<(), SessionError> {
        let tx = self.route.read().await.clone();
        let Some(tx) = tx else {
            return Err(SessionError::WriterGone);
        };
        tx.send(frame).await.map_err(|_| SessionError::WriterGone)
    }
}

/// Admission control and worker dispatch.
pub struct TaskExecutor {
    registry: Arc<TaskRegistry>,
    outbox: Outbox,
    performer: Arc<dyn WorkPerformer>,
    stats: Arc<Stats>,
}

impl TaskExecutor {
    pub fn new(
        registry: Arc<TaskRegistry>,
        outbox: Outbox,
        performer: Arc<dyn WorkPerformer>,
        stats: Arc<Stats>,
    ) -> Self {
        Self { registry, outbox, performer, stats }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Handle a `task_send` offer. Returns the worker handle when accepted.
    pub async fn admit(&self, task_id: String, message: Value, metadata: Value) -> Option<JoinHandle<()>> {
        let mut task = match self.registry.try_admit(&task_id) {
            Admission::Admitted(task) => task,
            Admission::Full => {
                self.reject(&task_id).await;
                return None;
            }
            Admission::AlreadyActive => {
                warn!("[{task_id}] Offer for a task that is already running, ignored");
                return None;
            }
        };

        let seq = task.next_seq();
        self.send_accept(&task_id, seq).await;
        info!("[{task_id}] Accepted task");

        let request = WorkRequest { task_id, message, metadata };
        Some(self.dispatch(task, request))
    }

    /// Resume a task re-offered at `auth_ok`.
    pub async fn resume(&self, snapshot: PendingTaskSnapshot) -> Option<JoinHandle<()>> {
        let needs_accept = snapshot.needs_accept();
        let PendingTaskSnapshot { task_id, message, status } = snapshot;
        let mut task = match self.registry.try_admit(&task_id) {
            Admission::Admitted(task) => task,
            Admission::Full => {
                self.reject(&task_id).await;
                return None;
            }
            Admission::AlreadyActive => {
                info!("[{task_id}] Still running from the previous session, not restarted");
                return None;
            }
        };

        info!("[{task_id}] Resuming task (status: {status})");
        if needs_accept {
            let seq = task.next_seq();
            self.send_accept(&task_id, seq).await;
        }

        let request = WorkRequest { task_id, message, metadata: Value::Null };
        Some(self.dispatch(task, request))
    }

    async fn reject(&self, task_id: &str) {
        let frame = ClientFrame::TaskReject {
            task_id: task_id.to_string(),
            seq: FIRST_SEQ,
            reason: REJECT_REASON_FULL.to_string(),
        };
        if let Err(e) = self.outbox.send(frame).await {
            warn!("[{task_id}] Failed to send task_reject: {e}");
        }
        info!(
            "[{task_id}] Rejected task ({} of {} slots busy)",
            self.registry.active_count(),
            self.registry.max_concurrent()
        );
    }

    /// A lost accept does not abort the task: it runs to completion and its
    /// frames reach whichever session is attached by then.
    async fn send_accept(&self, task_id: &str, seq: u64) {
        let frame = ClientFrame::TaskAccept { task_id: task_id.to_string(), seq };
        if let Err(e) = self.outbox.send(frame).await {
            warn!("[{task_id}] Failed to send task_accept, continuing: {e}");
        }
    }

    fn dispatch(&self, task: ActiveTask, request: WorkRequest) -> JoinHandle<()> {
        TaskWorker::new(
            task,
            request,
            self.outbox.clone(),
            Arc::clone(&self.performer),
            Arc::clone(&self.stats),
        )
        .spawn()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use crate::protocol::{Artifact, TaskState};

    use super::*;

    /// Succeeds once a permit is available; fails for input "boom", panics for "panic".
    pub(crate) struct ScriptedPerformer {
        pub gate: Arc<Semaphore>,
    }

    impl ScriptedPerformer {
        pub(crate) fn open() -> Arc<Self> {
            Arc::new(Self { gate: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)) })
        }

        pub(crate) fn closed() -> Arc<Self> {
            Arc::new(Self { gate: Arc::new(Semaphore::new(0)) })
        }
    }

    #[async_trait]
    impl WorkPerformer for ScriptedPerformer {
        async fn perform(&self, request: &WorkRequest) -> Result<Vec<Artifact>> {
            self.gate.acquire().await?.forget();
            match request.text().as_str() {
                "boom" => bail!("backend unavailable"),
                "panic" => panic!("performer crashed"),
                text => Ok(vec![Artifact::markdown("result", text.to_uppercase())]),
            }
        }
    }

    pub(crate) fn text_message(text: &str) -> Value {
        serde_json::json!({ "parts": [{ "type": "text", "text": text }] })
    }

    async fn executor(
        max: usize,
        performer: Arc<ScriptedPerformer>,
    ) -> (TaskExecutor, mpsc::Receiver<ClientFrame>, Arc<Stats>) {
        let (tx, rx) = mpsc::channel(64);
        let outbox = Outbox::default();
        outbox.attach(tx).await;
        let stats = Arc::new(Stats::default());
        let exec = TaskExecutor::new(TaskRegistry::new(max), outbox, performer, Arc::clone(&stats));
        (exec, rx, stats)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<ClientFrame>) -> ClientFrame {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbox closed")
    }

    /// Collect frames until every listed task has emitted a terminal frame.
    async fn drain_until_terminal(
        rx: &mut mpsc::Receiver<ClientFrame>,
        tasks: &[&str],
    ) -> HashMap<String, Vec<ClientFrame>> {
        let mut by_task: HashMap<String, Vec<ClientFrame>> = HashMap::new();
        let mut done = 0;
        while done < tasks.len() {
            let frame = next_frame(rx).await;
            if matches!(frame, ClientFrame::TaskComplete { .. } | ClientFrame::TaskFailed { .. }) {
                done += 1;
            }
            let id = frame.task_id().unwrap_or_default().to_string();
            by_task.entry(id).or_default().push(frame);
        }
        by_task
    }

    fn seqs(frames: &[ClientFrame]) -> Vec<u64> {
        frames
            .iter()
            .map(|f| match f {
                ClientFrame::TaskAccept { seq, .. }
                | ClientFrame::TaskReject { seq, .. }
                | ClientFrame::TaskProgress { seq, .. }
                | ClientFrame::TaskComplete { seq, .. }
                | ClientFrame::TaskFailed { seq, .. } => *seq,
                other => panic!("unexpected frame {other:?}"),
            })
            .collect()
    }

    #[test]
    fn active_task_guard_releases_on_drop() {
        let registry = TaskRegistry::new(1);
        let Admission::Admitted(mut task) = registry.try_admit("t1") else {
            panic!("expected admission");
        };
        assert_eq!((task.next_seq(), task.next_seq()), (1, 2));
        assert!(matches!(registry.try_admit("t1"), Admission::AlreadyActive));
        assert!(matches!(registry.try_admit("t2"), Admission::Full));
        drop(task);
        assert!(!registry.is_active("t1"));
        let Admission::Admitted(mut again) = registry.try_admit("t1") else {
            panic!("expected admission");
        };
        assert_eq!(again.next_seq(), 1);
    }

    #[tokio::test]
    async fn accepted_task_runs_full_lifecycle_with_gapless_seqs() {
        let (exec, mut rx, stats) = executor(3, ScriptedPerformer::open()).await;
        let worker = exec.admit("t1".into(), text_message("hi"), Value::Null).await.unwrap();

        let frames = drain_until_terminal(&mut rx, &["t1"]).await.remove("t1").unwrap();
        assert_eq!(seqs(&frames), vec![1, 2, 3, 4]);
        assert!(matches!(frames[0], ClientFrame::TaskAccept { .. }));
        assert!(matches!(frames[1], ClientFrame::TaskProgress { .. }));
        assert!(matches!(frames[2], ClientFrame::TaskProgress { .. }));
        let ClientFrame::TaskComplete { status, artifacts, .. } = &frames[3] else {
            panic!("expected task_complete, got {:?}", frames[3]);
        };
        assert_eq!(status.state, TaskState::Completed);
        assert_eq!(artifacts.len(), 1);

        worker.await.unwrap();
        assert_eq!(stats.tasks_completed(), 1);
        assert_eq!(exec.registry().active_count(), 0);
    }

    #[tokio::test]
    async fn cap_rejects_extra_offers_and_frees_slots_after_terminal() {
        let performer = ScriptedPerformer::closed();
        let (exec, mut rx, _stats) = executor(2, Arc::clone(&performer)).await;

        let w1 = exec.admit("t1".into(), text_message("a"), Value::Null).await.unwrap();
        let w2 = exec.admit("t2".into(), text_message("b"), Value::Null).await.unwrap();
        assert!(exec.admit("t3".into(), text_message("c"), Value::Null).await.is_none());
        assert_eq!(exec.registry().active_count(), 2);

        let mut rejected = None;
        for _ in 0..7 {
            if let ClientFrame::TaskReject { task_id, seq, reason } = next_frame(&mut rx).await {
                rejected = Some((task_id, seq, reason));
                break;
            }
        }
        assert_eq!(rejected, Some(("t3".to_string(), 1, REJECT_REASON_FULL.to_string())));

        performer.gate.add_permits(2);
        w1.await.unwrap();
        w2.await.unwrap();
        assert_eq!(exec.registry().active_count(), 0);
        assert!(exec.admit("t4".into(), text_message("d"), Value::Null).await.is_some());
    }

    #[tokio::test]
    async fn performer_error_reports_string_failure() {
        let (exec, mut rx, stats) = executor(1, ScriptedPerformer::open()).await;
        exec.admit("t1".into(), text_message("boom"), Value::Null)
            .await
            .unwrap()
            .await
            .unwrap();

        let frames = drain_until_terminal(&mut rx, &["t1"]).await.remove("t1").unwrap();
        let terminal: Vec<_> = frames
            .iter()
            .filter(|f| matches!(f, ClientFrame::TaskComplete { .. } | ClientFrame::TaskFailed { .. }))
            .collect();
        assert_eq!(terminal.len(), 1);
        let ClientFrame::TaskFailed { error, status, .. } = terminal[0] else {
            panic!("expected task_failed");
        };
        assert_eq!(status.state, TaskState::Failed);
        assert!(error.contains("backend unavailable"));
        assert_eq!(stats.tasks_failed(), 1);
        assert_eq!(exec.registry().active_count(), 0);
    }

    #[tokio::test]
    async fn performer_panic_still_emits_one_terminal_frame() {
        let (exec, mut rx, stats) = executor(1, ScriptedPerformer::open()).await;
        exec.admit("t1".into(), text_message("panic"), Value::Null)
            .await
            .unwrap()
            .await
            .unwrap();

        let frames = drain_until_terminal(&mut rx, &["t1"]).await.remove("t1").unwrap();
        assert_eq!(seqs(&frames), vec![1, 2, 3, 4]);
        let ClientFrame::TaskFailed { error, .. } = &frames[3] else {
            panic!("expected task_failed");
        };
        assert!(error.contains("performer crashed"));
        assert_eq!(stats.tasks_failed(), 1);
        assert!(!exec.registry().is_active("t1"));
    }

    #[tokio::test]
    async fn detached_outbox_still_runs_task_and_cleans_up() {
        let (exec, mut rx, stats) = executor(1, ScriptedPerformer::open()).await;
        exec.outbox.detach().await;

        exec.admit("t1".into(), text_message("x"), Value::Null)
            .await
            .unwrap()
            .await
            .unwrap();
        assert_eq!(stats.tasks_completed(), 1);
        assert_eq!(exec.registry().active_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resume_submitted_snapshot_accepts_before_progress() {
        let (exec, mut rx, _stats) = executor(2, ScriptedPerformer::open()).await;
        exec.resume(PendingTaskSnapshot {
            task_id: "p1".into(),
            message: text_message("resume me"),
            status: "submitted".into(),
        })
        .await
        .unwrap();

        let frames = drain_until_terminal(&mut rx, &["p1"]).await.remove("p1").unwrap();
        assert!(matches!(frames[0], ClientFrame::TaskAccept { seq: 1, .. }));
        assert!(matches!(frames[1], ClientFrame::TaskProgress { seq: 2, .. }));
        assert!(matches!(frames.last(), Some(ClientFrame::TaskComplete { .. })));
    }

    #[tokio::test]
    async fn resume_working_snapshot_skips_accept() {
        let (exec, mut rx, _stats) = executor(2, ScriptedPerformer::open()).await;
        exec.resume(PendingTaskSnapshot {
            task_id: "p2".into(),
            message: text_message("continue"),
            status: "working".into(),
        })
        .await
        .unwrap();

        let frames = drain_until_terminal(&mut rx, &["p2"]).await.remove("p2").unwrap();
        assert!(frames.iter().all(|f| !matches!(f, ClientFrame::TaskAccept { .. })));
        assert_eq!(seqs(&frames), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn resume_of_still_running_task_is_not_duplicated() {
        let performer = ScriptedPerformer::closed();
        let (exec, _rx, _stats) = executor(2, Arc::clone(&performer)).await;
        let running = exec.admit("t1".into(), text_message("a"), Value::Null).await.unwrap();

        let resumed = exec
            .resume(PendingTaskSnapshot {
                task_id: "t1".into(),
                message: text_message("a"),
                status: "working".into(),
            })
            .await;
        assert!(resumed.is_none());
        assert_eq!(exec.registry().active_count(), 1);

        performer.gate.add_permits(1);
        running.await.unwrap();
    }
}
