// TaskGroup - spawns and tracks concurrent tasks under one fault policy
//
// FailFast: the first member failure cancels every still-active sibling and
// await_all resolves with that failure (structured-concurrency semantics).
// IsolateFailures: member failures are reported alongside successes and never
// touch siblings (supervisor semantics).
//
// One group per logical operation; membership mutations are serialized behind
// a parking_lot::RwLock. Outbound render/notify calls go through the optional
// affinity dispatcher, never directly from worker threads.

use crate::dispatch::AffinityHandle;
use crate::error::{TaskError, TaskResult};
use crate::handle::TaskHandle;
use crate::types::{GroupPolicy, GroupState, TaskInfo, TaskOutcome, TaskState};
use parking_lot::RwLock;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct TaskGroup<T> {
    id: String,
    policy: GroupPolicy,
    members: RwLock<Vec<TaskHandle<T>>>,
    // External cancellation reason; set once, before completion
    cancelled: RwLock<Option<String>>,
    ui: Option<AffinityHandle>,
}

impl<T: Send + Sync + 'static> TaskGroup<T> {
    pub fn new(policy: GroupPolicy) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        log::debug!("📋 Group {} created (policy: {})", id, policy);
        Self {
            id,
            policy,
            members: RwLock::new(Vec::new()),
            cancelled: RwLock::new(None),
            ui: None,
        }
    }

    /// Attach the affinity dispatcher so failures and cancellations reach the
    /// UI collaborator via notify_user.
    pub fn with_render(policy: GroupPolicy, ui: AffinityHandle) -> Self {
        Self {
            ui: Some(ui),
            ..Self::new(policy)
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn policy(&self) -> GroupPolicy {
        self.policy
    }

    pub(crate) fn render(&self) -> Option<&AffinityHandle> {
        self.ui.as_ref()
    }

    /// Create and start a new task inside the group. Non-blocking: the work
    /// runs concurrently on the background context and the handle is returned
    /// immediately. Fails with GroupClosed once the aggregate state is
    /// terminal.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, work: F) -> TaskResult<TaskHandle<T>>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let handle = self.register(name)?;
        handle.start(work);
        Ok(handle)
    }

    pub(crate) fn register(&self, name: impl Into<String>) -> TaskResult<TaskHandle<T>> {
        let mut members = self.members.write();
        if self.aggregate_locked(&members).is_terminal() {
            return Err(TaskError::GroupClosed);
        }
        let handle = TaskHandle::new(name);
        log::debug!("📋 Task {} registered in group {}", handle.id(), self.id);
        members.push(handle.clone());
        Ok(handle)
    }

    /// Cancel one member by id. Cancelling an already-terminal task is a
    /// no-op, not an error; an unknown id is.
    pub fn cancel(&self, task_id: &str, reason: impl Into<String>) -> TaskResult<()> {
        let members = self.members.read();
        match members.iter().find(|h| h.id() == task_id) {
            Some(handle) => {
                handle.cancel(reason);
                Ok(())
            }
            None => Err(TaskError::NotFound(task_id.to_string())),
        }
    }

    /// Cancel the whole group. Commits Cancelled on every active member and
    /// moves the aggregate state to Cancelled. Returns the number of tasks
    /// that were still active. No-op on an already-terminal group.
    pub fn cancel_all(&self, reason: impl Into<String>) -> usize {
        let reason = reason.into();
        let members = self.members.read();
        if self.aggregate_locked(&members).is_terminal() {
            return 0;
        }
        *self.cancelled.write() = Some(reason.clone());

        let mut cancelled = 0;
        for handle in members.iter().filter(|h| h.state().is_active()) {
            handle.cancel(reason.clone());
            cancelled += 1;
        }
        log::info!(
            "🛑 Cancelled {} active tasks in group {}: {}",
            cancelled,
            self.id,
            reason
        );
        if let Some(ui) = &self.ui {
            ui.notify_user(&format!("Cancelled: {reason}"));
        }
        cancelled
    }

    pub fn aggregate_state(&self) -> GroupState {
        let members = self.members.read();
        self.aggregate_locked(&members)
    }

    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.members.read().iter().map(|h| h.info()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.members
            .read()
            .iter()
            .filter(|h| h.state().is_active())
            .count()
    }

    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    // Derived aggregate: Cancelled once externally cancelled, Failed as soon
    // as a FailFast member fails, Completed when all members are terminal,
    // otherwise Running. An empty group is Running (open for spawns).
    fn aggregate_locked(&self, members: &[TaskHandle<T>]) -> GroupState {
        if self.cancelled.read().is_some() {
            return GroupState::Cancelled;
        }
        let mut any_failed = false;
        let mut all_terminal = !members.is_empty();
        for handle in members {
            let state = handle.state();
            if state == TaskState::Failed {
                any_failed = true;
            }
            if !state.is_terminal() {
                all_terminal = false;
            }
        }
        if any_failed && self.policy == GroupPolicy::FailFast {
            GroupState::Failed
        } else if all_terminal {
            GroupState::Completed
        } else {
            GroupState::Running
        }
    }
}

impl<T: Clone + Send + Sync + 'static> TaskGroup<T> {
    /// Wait until every member is terminal.
    ///
    /// Under FailFast the first failure cancels all still-active siblings and
    /// resolves this call with that failure. Under IsolateFailures the call
    /// always resolves with the (task id, outcome) pairs in spawn order,
    /// failing members included.
    pub async fn await_all(&self) -> TaskResult<Vec<(String, TaskOutcome<T>)>> {
        loop {
            let members: Vec<TaskHandle<T>> = self.members.read().clone();

            if self.policy == GroupPolicy::FailFast {
                if let Some(failed) = members.iter().find(|h| h.state() == TaskState::Failed) {
                    return Err(self.propagate_failure(failed, &members));
                }
            }

            let pending: Vec<TaskHandle<T>> = members
                .iter()
                .filter(|h| !h.state().is_terminal())
                .cloned()
                .collect();

            if pending.is_empty() {
                return Ok(self.collect_outcomes(&members));
            }

            // Wake on the first member to reach a terminal state, then
            // re-derive: members may have been spawned in the meantime.
            let waits: Vec<_> = pending
                .iter()
                .map(|handle| {
                    let handle = handle.clone();
                    Box::pin(async move { handle.wait_terminal().await })
                })
                .collect();
            futures_util::future::select_all(waits).await;
        }
    }

    /// Bounded await_all. If the limit elapses first, every active member is
    /// cancelled with reason "timeout" and the call resolves with
    /// TaskError::Timeout.
    pub async fn await_all_timeout(
        &self,
        limit: Duration,
    ) -> TaskResult<Vec<(String, TaskOutcome<T>)>> {
        match tokio::time::timeout(limit, self.await_all()).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!("📋 Group {} timed out after {:?}", self.id, limit);
                self.cancel_all("timeout");
                Err(TaskError::Timeout(limit))
            }
        }
    }

    fn propagate_failure(
        &self,
        failed: &TaskHandle<T>,
        members: &[TaskHandle<T>],
    ) -> TaskError {
        let info = failed.info();
        let message = info
            .error
            .unwrap_or_else(|| "unknown failure".to_string());
        let reason = format!("sibling task '{}' failed", info.name);

        let mut cancelled = 0;
        for handle in members.iter().filter(|h| h.state().is_active()) {
            handle.cancel(reason.clone());
            cancelled += 1;
        }
        if cancelled > 0 {
            log::info!(
                "🛑 Fail-fast: cancelled {} siblings in group {} after task '{}' failed",
                cancelled,
                self.id,
                info.name
            );
        }
        if let Some(ui) = &self.ui {
            ui.notify_user(&format!("Task '{}' failed: {}", info.name, message));
        }
        TaskError::WorkFailure(message)
    }

    fn collect_outcomes(&self, members: &[TaskHandle<T>]) -> Vec<(String, TaskOutcome<T>)> {
        let mut pairs = Vec::with_capacity(members.len());
        for handle in members {
            let info = handle.info();
            let outcome = handle.outcome().unwrap_or(TaskOutcome::Cancelled {
                reason: "no outcome recorded".to_string(),
            });
            if let (Some(ui), TaskOutcome::Failed(message)) = (&self.ui, &outcome) {
                ui.notify_user(&format!("Task '{}' failed: {}", info.name, message));
            }
            pairs.push((info.id, outcome));
        }
        pairs
    }
}
