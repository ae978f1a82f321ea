use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::executor::{ActiveTask, Outbox};
use crate::performer::{WorkPerformer, WorkRequest};
use crate::protocol::{ClientFrame, TaskStatus};
use crate::state::Stats;

const STAGE_PARSE: (u8, &str) = (10, "parsing task");
const STAGE_EXECUTE: (u8, &str) = (30, "executing");

/// Drives one admitted task from `working` to a terminal frame.
pub struct TaskWorker {
    task: ActiveTask,
    request: WorkRequest,
    outbox: Outbox,
    performer: Arc<dyn WorkPerformer>,
    stats: Arc<Stats>,
}

impl TaskWorker {
    pub fn new(
        task: ActiveTask,
        request: WorkRequest,
        outbox: Outbox,
        performer: Arc<dyn WorkPerformer>,
        stats: Arc<Stats>,
    ) -> Self {
        Self { task, request, outbox, performer, stats }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Exactly one terminal frame is attempted whatever the performer does.
    /// The `ActiveTask` is dropped on return, releasing the slot.
    pub async fn run(mut self) {
        for (progress, step) in [STAGE_PARSE, STAGE_EXECUTE] {
            let seq = self.task.next_seq();
            self.emit(ClientFrame::TaskProgress {
                task_id: self.request.task_id.clone(),
                seq,
                status: TaskStatus::working(progress, step),
            })
            .await;
        }

        let outcome = AssertUnwindSafe(self.performer.perform(&self.request))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(Ok(artifacts)) => Ok(artifacts),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(panic) => Err(panic_message(panic)),
        };

        let task_id = self.request.task_id.clone();
        let seq = self.task.next_seq();
        match result {
            Ok(artifacts) => {
                self.stats.task_completed();
                self.emit(ClientFrame::TaskComplete {
                    task_id: task_id.clone(),
                    seq,
                    status: TaskStatus::completed(),
                    artifacts,
                })
                .await;
                info!("[{task_id}] Task completed");
            }
            Err(error) => {
                self.stats.task_failed();
                warn!("[{task_id}] Task failed: {error}");
                self.emit(ClientFrame::TaskFailed {
                    task_id,
                    seq,
                    status: TaskStatus::failed(),
                    error,
                })
                .await;
            }
        }
    }

    async fn emit(&self, frame: ClientFrame) {
        let kind = frame.kind();
        if let Err(e) = self.outbox.send(frame).await {
            warn!("[{}] Failed to send {kind}: {e}", self.task.task_id());
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("internal error: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("internal error: {s}")
    } else {
        "internal error".to_string()
    }
}
