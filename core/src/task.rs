//! Task lifecycle tracking and the submission/polling orchestrator.

use crate::error::ClientResult;
use crate::gateway::Backend;
use crate::protocol::{Provider, TaskContext, TaskKind, TaskRequest, TaskSnapshot, TaskStatus};
use crate::session::SessionHandle;
use crate::store::{SnapshotStore, TASKS_SNAPSHOT};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

/// Delay between successive status fetches while polling.
pub const POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// A unit of work submitted to the backend, tracked through its status
/// lifecycle. Tasks are appended and updated by id, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub description: String,
    pub provider: Provider,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub structured: BTreeMap<String, String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl Task {
    pub fn new(kind: TaskKind, provider: Provider, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            status: TaskStatus::InProgress,
            description: description.into(),
            provider,
            created_at: Utc::now(),
            result: None,
            structured: BTreeMap::new(),
            suggestions: Vec::new(),
        }
    }
}

/// Draft for a follow-up submission, pre-populated from a prior task.
#[derive(Debug, Clone, Copy)]
pub struct Followup {
    pub kind: TaskKind,
    pub provider: Provider,
}

#[derive(Debug)]
struct ActivePoll {
    task_id: String,
    handle: JoinHandle<()>,
}

/// Cancellation handle for a running poll loop. Dropping it leaves the loop
/// running; `cancel` stops it before the next fetch.
#[derive(Debug)]
pub struct PollHandle {
    task_id: String,
    abort: AbortHandle,
    registry: Arc<Mutex<Option<ActivePoll>>>,
}

impl PollHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn cancel(self) {
        self.abort.abort();
        let mut guard = self.registry.lock();
        if guard
            .as_ref()
            .map(|active| active.task_id == self.task_id)
            .unwrap_or(false)
        {
            *guard = None;
        }
    }
}

/// Submits tasks, tracks their lifecycle and drives the status polling loop.
///
/// Holds the accumulated follow-up context; a fresh submission clears it, a
/// completed submission clears it, and a failed one leaves it intact so the
/// operator can retry.
pub struct TaskOrchestrator {
    backend: Arc<dyn Backend>,
    session: SessionHandle,
    store: SnapshotStore,
    tasks: Arc<RwLock<Vec<Task>>>,
    context: RwLock<Vec<String>>,
    active_poll: Arc<Mutex<Option<ActivePoll>>>,
    poll_interval: Duration,
}

impl TaskOrchestrator {
    pub fn new(
        backend: Arc<dyn Backend>,
        session: SessionHandle,
        store: SnapshotStore,
        tasks: Vec<Task>,
    ) -> Self {
        Self {
            backend,
            session,
            store,
            tasks: Arc::new(RwLock::new(tasks)),
            context: RwLock::new(Vec::new()),
            active_poll: Arc::new(Mutex::new(None)),
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.read().clone()
    }

    pub fn task(&self, id: &str) -> Option<Task> {
        self.tasks.read().iter().find(|t| t.id == id).cloned()
    }

    pub fn context(&self) -> Vec<String> {
        self.context.read().clone()
    }

    /// Submit a fresh task. A fresh submission always starts a fresh
    /// context; any accumulated follow-up history is discarded first.
    pub async fn submit(
        &self,
        kind: TaskKind,
        provider: Provider,
        content: &str,
    ) -> ClientResult<Task> {
        self.session.require_token()?;
        self.context.write().clear();
        self.dispatch(kind, provider, content, None).await
    }

    /// Submit a follow-up carrying the accumulated prior results as
    /// `context.history`, in accumulation order.
    pub async fn submit_followup(
        &self,
        followup: &Followup,
        content: &str,
    ) -> ClientResult<Task> {
        self.session.require_token()?;
        let history = self.context.read().clone();
        let context = (!history.is_empty()).then_some(TaskContext { history });
        self.dispatch(followup.kind, followup.provider, content, context)
            .await
    }

    /// Begin a follow-up from a prior task: its result joins the context
    /// sequence and its kind/provider seed the next submission.
    pub fn continue_from(&self, task: &Task) -> Followup {
        if let Some(result) = task.result.clone() {
            self.context.write().push(result);
        }
        Followup {
            kind: task.kind,
            provider: task.provider,
        }
    }

    async fn dispatch(
        &self,
        kind: TaskKind,
        provider: Provider,
        content: &str,
        context: Option<TaskContext>,
    ) -> ClientResult<Task> {
        let mut task = Task::new(kind, provider, content);
        self.push_task(task.clone());

        let request = TaskRequest {
            task_type: kind,
            provider,
            content: content.to_owned(),
            context,
        };
        match self.backend.submit_task(&request).await {
            Ok(reply) if reply.status == TaskStatus::Completed => {
                task.status = TaskStatus::Completed;
                task.result = reply.result;
                task.structured = reply.structured;
                task.suggestions = reply.suggestions;
                self.context.write().clear();
            }
            Ok(reply) => {
                task.status = TaskStatus::Failed;
                task.result = Some(
                    reply
                        .result
                        .unwrap_or_else(|| "task processing failed".to_owned()),
                );
            }
            Err(err) => {
                task.status = TaskStatus::Failed;
                task.result = Some(format!("request failed: {err}"));
            }
        }
        self.store_update(&task);
        Ok(task)
    }

    /// Fetch the current status of `task_id`. With `enable_polling`, keep
    /// fetching at the fixed interval until a terminal status is observed or
    /// a fetch fails; snapshots are delivered over the returned channel.
    ///
    /// Re-entry for the id already being polled returns `None` instead of
    /// scheduling a second timer. Polling a different id cancels the
    /// previous loop.
    pub fn poll(
        &self,
        task_id: &str,
        enable_polling: bool,
    ) -> ClientResult<Option<(PollHandle, UnboundedReceiver<TaskSnapshot>)>> {
        self.session.require_token()?;

        let mut registry = self.active_poll.lock();
        if let Some(active) = registry.as_ref() {
            if active.task_id == task_id && !active.handle.is_finished() {
                return Ok(None);
            }
        }
        if let Some(previous) = registry.take() {
            previous.handle.abort();
        }

        let backend = self.backend.clone();
        let tasks = self.tasks.clone();
        let store = self.store.clone();
        let interval = self.poll_interval;
        let id = task_id.to_owned();
        let (tx, rx) = mpsc::unbounded_channel();

        let spawn_id = id.clone();
        let handle = tokio::spawn(async move {
            let id = spawn_id;
            loop {
                let snapshot = match backend.task_status(&id).await {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        // A failed fetch terminates the loop as a failed task.
                        let failed = TaskSnapshot {
                            task_id: id.clone(),
                            status: TaskStatus::Failed,
                            provider: None,
                            result: Some(format!("status query failed: {err}")),
                            structured: BTreeMap::new(),
                            suggestions: Vec::new(),
                        };
                        apply_snapshot(&tasks, &store, &failed);
                        let _ = tx.send(failed);
                        return;
                    }
                };
                apply_snapshot(&tasks, &store, &snapshot);
                let terminal = snapshot.status.is_terminal();
                let _ = tx.send(snapshot);
                if terminal || !enable_polling {
                    return;
                }
                tokio::time::sleep(interval).await;
            }
        });

        let poll_handle = PollHandle {
            task_id: id.clone(),
            abort: handle.abort_handle(),
            registry: self.active_poll.clone(),
        };
        *registry = Some(ActivePoll { task_id: id, handle });
        Ok(Some((poll_handle, rx)))
    }

    /// Cancel whatever poll loop is running, if any.
    pub fn cancel_poll(&self) {
        if let Some(active) = self.active_poll.lock().take() {
            active.handle.abort();
        }
    }

    /// Replace the task list with a server-fetched snapshot.
    pub fn replace_tasks(&self, tasks: Vec<Task>) {
        let mut guard = self.tasks.write();
        *guard = tasks;
        persist_tasks(&self.store, &guard);
    }

    /// Drop all task state: list, context and any active poll.
    pub fn reset(&self) {
        self.cancel_poll();
        self.context.write().clear();
        let mut guard = self.tasks.write();
        guard.clear();
        persist_tasks(&self.store, &guard);
    }

    pub(crate) fn record(&self, kind: TaskKind, provider: Provider, description: &str) -> Task {
        let task = Task::new(kind, provider, description);
        self.push_task(task.clone());
        task
    }

    pub(crate) fn mark(&self, id: &str, status: TaskStatus, result: Option<String>) {
        let mut guard = self.tasks.write();
        if let Some(task) = guard.iter_mut().find(|t| t.id == id) {
            if task.status.is_terminal() {
                return;
            }
            task.status = status;
            if result.is_some() {
                task.result = result;
            }
        }
        persist_tasks(&self.store, &guard);
    }

    fn push_task(&self, task: Task) {
        let mut guard = self.tasks.write();
        guard.insert(0, task);
        persist_tasks(&self.store, &guard);
    }

    fn store_update(&self, task: &Task) {
        let mut guard = self.tasks.write();
        if let Some(existing) = guard.iter_mut().find(|t| t.id == task.id) {
            if !existing.status.is_terminal() {
                *existing = task.clone();
            }
        }
        persist_tasks(&self.store, &guard);
    }
}

/// Fold a status snapshot into the task list. Transitions out of a terminal
/// state are ignored; unknown ids are appended.
fn apply_snapshot(tasks: &RwLock<Vec<Task>>, store: &SnapshotStore, snapshot: &TaskSnapshot) {
    let mut guard = tasks.write();
    if let Some(task) = guard.iter_mut().find(|t| t.id == snapshot.task_id) {
        if task.status.is_terminal() {
            return;
        }
        task.status = snapshot.status;
        if snapshot.result.is_some() {
            task.result = snapshot.result.clone();
        }
        if !snapshot.structured.is_empty() {
            task.structured = snapshot.structured.clone();
        }
        if !snapshot.suggestions.is_empty() {
            task.suggestions = snapshot.suggestions.clone();
        }
        if let Some(provider) = snapshot.provider {
            task.provider = provider;
        }
    } else {
        guard.insert(
            0,
            Task {
                id: snapshot.task_id.clone(),
                kind: TaskKind::Generic,
                status: snapshot.status,
                description: String::new(),
                provider: snapshot.provider.unwrap_or(Provider::Deepseek),
                created_at: Utc::now(),
                result: snapshot.result.clone(),
                structured: snapshot.structured.clone(),
                suggestions: snapshot.suggestions.clone(),
            },
        );
    }
    persist_tasks(store, &guard);
}

fn persist_tasks(store: &SnapshotStore, tasks: &[Task]) {
    if let Err(err) = store.save(TASKS_SNAPSHOT, &tasks) {
        tracing::warn!(%err, "failed to persist task list");
    }
}
