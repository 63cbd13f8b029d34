// TaskHandle - one cancellable unit of background work
//
// State transitions are monotonic: Pending -> Running -> {Completed,
// Cancelled, Failed}. Once a terminal state is committed no further
// transition occurs and the completion callback has fired exactly once.
// Cancellation is cooperative via CancellationToken: in-flight work unwinds
// at its next suspension point, but the terminal state is committed
// immediately so observers never see a cancelled task as Running.

use crate::error::TaskError;
use crate::types::{TaskInfo, TaskOutcome, TaskProgress, TaskState};
use chrono::Utc;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type CompletionCallback = Box<dyn FnOnce(TaskState, Option<&TaskError>) + Send>;

enum CallbackSlot {
    Empty,
    Waiting(CompletionCallback),
    /// Terminal state committed; any registered callback has been consumed.
    Closed,
}

struct HandleShared<T> {
    info: RwLock<TaskInfo>,
    outcome: RwLock<Option<TaskOutcome<T>>>,
    callback: Mutex<CallbackSlot>,
    cancel: CancellationToken,
    // One-shot latch triggered when the terminal transition commits.
    finished: CancellationToken,
}

pub struct TaskHandle<T> {
    shared: Arc<HandleShared<T>>,
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self {
            shared: Arc::new(HandleShared {
                info: RwLock::new(TaskInfo::new(id, name)),
                outcome: RwLock::new(None),
                callback: Mutex::new(CallbackSlot::Empty),
                cancel: CancellationToken::new(),
                finished: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> String {
        self.shared.info.read().id.clone()
    }

    pub fn state(&self) -> TaskState {
        self.shared.info.read().state
    }

    pub fn info(&self) -> TaskInfo {
        self.shared.info.read().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Request cancellation. Idempotent: the first call on a non-terminal
    /// handle commits Cancelled with the given reason, later calls and calls
    /// on an already-terminal handle are no-ops.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.shared.cancel.cancel();
        if self.commit(TaskOutcome::Cancelled {
            reason: reason.into(),
        }) {
            log::info!("🛑 Task {} cancelled", self.id());
        }
    }

    /// Register the completion callback. It fires exactly once with the
    /// terminal state and optional error, after the terminal transition is
    /// committed. If the handle is already terminal the callback fires
    /// synchronously in the caller; otherwise it fires synchronously on the
    /// thread committing the transition. A callback registered while another
    /// is still pending replaces it.
    pub fn on_completion<F>(&self, callback: F)
    where
        F: FnOnce(TaskState, Option<&TaskError>) + Send + 'static,
    {
        let mut slot = self.shared.callback.lock();
        if matches!(*slot, CallbackSlot::Closed) {
            drop(slot);
            let error = self.terminal_error();
            callback(self.state(), error.as_ref());
        } else {
            if matches!(*slot, CallbackSlot::Waiting(_)) {
                log::warn!("Replacing pending completion callback");
            }
            *slot = CallbackSlot::Waiting(Box::new(callback));
        }
    }

    /// Wait until the handle reaches a terminal state.
    pub async fn wait_terminal(&self) {
        self.shared.finished.cancelled().await;
    }

    /// Start the work on the background context. Runs under a biased select
    /// against the cancellation token, so work that never checks the token
    /// still unwinds at its next suspension point. Panics inside the work are
    /// caught and recorded as Failed, never surfaced to the scheduler.
    pub(crate) fn start<F, Fut>(&self, work: F)
    where
        T: Send + Sync + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let handle = self.clone();
        let token = self.shared.cancel.clone();
        tokio::spawn(async move {
            handle.mark_started();
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = AssertUnwindSafe(work(token.clone())).catch_unwind() => Some(result),
            };
            match result {
                None => {
                    // cancel() commits the terminal state up front, so this
                    // only lands if the token was triggered some other way.
                    if handle.commit(TaskOutcome::Cancelled {
                        reason: "cancelled".to_string(),
                    }) {
                        log::info!("🛑 Task {} unwound after cancellation", handle.id());
                    }
                }
                Some(Ok(Ok(value))) => {
                    if handle.commit(TaskOutcome::Completed(value)) {
                        log::debug!("📋 Task {} completed", handle.id());
                    }
                }
                Some(Ok(Err(TaskError::Cancelled(reason)))) => {
                    handle.commit(TaskOutcome::Cancelled { reason });
                }
                Some(Ok(Err(error))) => {
                    let message = match error {
                        TaskError::WorkFailure(message) => message,
                        other => other.to_string(),
                    };
                    if handle.commit(TaskOutcome::Failed(message.clone())) {
                        log::error!("📋 Task {} failed: {}", handle.id(), message);
                    }
                }
                Some(Err(panic)) => {
                    let message = panic_message(panic);
                    if handle.commit(TaskOutcome::Failed(format!("worker panicked: {message}"))) {
                        log::error!("📋 Task {} panicked: {}", handle.id(), message);
                    }
                }
            }
        });
    }

    pub(crate) fn mark_started(&self) {
        let mut info = self.shared.info.write();
        if info.state == TaskState::Pending {
            info.state = TaskState::Running;
            info.started_at = Some(Utc::now());
        }
    }

    /// Commit a terminal state. Returns false if the handle was already
    /// terminal, in which case nothing changes. The outcome is recorded under
    /// the same critical section as the state, so an observed terminal state
    /// always comes with its outcome.
    pub(crate) fn commit(&self, outcome: TaskOutcome<T>) -> bool {
        let (state, error) = match &outcome {
            TaskOutcome::Completed(_) => (TaskState::Completed, None),
            TaskOutcome::Failed(message) => (TaskState::Failed, Some(message.clone())),
            TaskOutcome::Cancelled { .. } => (TaskState::Cancelled, None),
        };

        {
            let mut info = self.shared.info.write();
            if info.is_terminal() {
                return false;
            }
            info.state = state;
            info.completed_at = Some(Utc::now());
            info.error = error;
            *self.shared.outcome.write() = Some(outcome);
        }

        self.shared.finished.cancel();

        let callback = {
            let mut slot = self.shared.callback.lock();
            match std::mem::replace(&mut *slot, CallbackSlot::Closed) {
                CallbackSlot::Waiting(callback) => Some(callback),
                _ => None,
            }
        };
        if let Some(callback) = callback {
            let terminal_error = self.terminal_error();
            callback(state, terminal_error.as_ref());
        }
        true
    }

    /// Record a progress update and deliver it, unless the handle is already
    /// terminal. Delivery happens under the state lock: once a terminal state
    /// is externally observable, no further report can be delivered.
    pub(crate) fn report_progress<F>(&self, progress: TaskProgress, deliver: F) -> bool
    where
        F: FnOnce(&TaskProgress),
    {
        let mut info = self.shared.info.write();
        if info.is_terminal() {
            return false;
        }
        info.progress = Some(progress.clone());
        deliver(&progress);
        true
    }

    fn terminal_error(&self) -> Option<TaskError> {
        let info = self.shared.info.read();
        match info.state {
            TaskState::Failed => Some(TaskError::WorkFailure(
                info.error
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            )),
            _ => None,
        }
    }
}

impl<T: Clone> TaskHandle<T> {
    /// Terminal outcome, or None while the task is still active.
    pub fn outcome(&self) -> Option<TaskOutcome<T>> {
        self.shared.outcome.read().clone()
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
