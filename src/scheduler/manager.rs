//! Manager: the shared broker between callers and workers.
//!
//! Callers `submit` tasks and await a [`TaskHandle`]. Workers pull work with
//! `request_task` and report back with `respond_task`. All queue access goes
//! through one mutex and never awaits while holding it.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{Result, TokenlaneError};
use crate::id::TaskId;
use crate::llm::{CancelSignal, ChatRequest, ClassifiedError, TaskResult};
use crate::scheduler::capacity::CapacitySnapshot;
use crate::scheduler::worker::Worker;

/// What a caller hands to [`Manager::submit`].
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub payload: ChatRequest,
    pub eligible_models: BTreeSet<String>,
    pub token_demand: u64,
    /// 1-based retry attempt, picks the timeout from the worker's policy.
    pub attempt: u32,
}

impl TaskSpec {
    pub fn new<I, S>(payload: ChatRequest, eligible_models: I, token_demand: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            payload,
            eligible_models: eligible_models.into_iter().map(Into::into).collect(),
            token_demand,
            attempt: 1,
        }
    }

    /// Use the payload's own estimate as the token demand.
    pub fn estimated<I, S>(payload: ChatRequest, eligible_models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let demand = payload.estimated_demand();
        Self::new(payload, eligible_models, demand)
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Settled,
}

/// One schedulable completion request.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub payload: ChatRequest,
    pub token_demand: u64,
    pub eligible_models: BTreeSet<String>,
    pub attempt: u32,
    pub state: TaskState,
    pub cancel: CancelSignal,
}

struct PendingTask {
    task: Task,
    reply: oneshot::Sender<TaskResult>,
}

struct RunningTask {
    worker: String,
    reply: oneshot::Sender<TaskResult>,
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<PendingTask>,
    running: HashMap<TaskId, RunningTask>,
    stopped: bool,
    submitted: u64,
    dispatched: u64,
    settled: u64,
    polls: u64,
}

impl Queue {
    /// Settle and drop pending tasks whose caller already cancelled.
    fn purge_cancelled(&mut self) {
        if !self.pending.iter().any(|p| p.task.cancel.is_cancelled()) {
            return;
        }
        let (cancelled, kept): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|p| p.task.cancel.is_cancelled());
        self.pending = kept.into();
        for entry in cancelled {
            tracing::info!(task_id = %entry.task.id, "Task cancelled before dispatch");
            self.settled += 1;
            let _ = entry
                .reply
                .send(Err(ClassifiedError::network("Task cancelled before dispatch")));
        }
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub pending: usize,
    pub running: usize,
    pub submitted: u64,
    pub dispatched: u64,
    pub settled: u64,
    /// `request_task` calls from all workers.
    pub polls: u64,
}

pub struct Manager {
    workers: Vec<Arc<Worker>>,
    queue: Mutex<Queue>,
    /// Bumped on every submission so idle workers can tell the queue changed.
    generation: AtomicU64,
}

impl Manager {
    /// Create a manager over a fixed set of workers.
    ///
    /// Workers stay idle until the first submission.
    pub fn new(workers: Vec<Arc<Worker>>) -> Arc<Self> {
        Arc::new(Self {
            workers,
            queue: Mutex::new(Queue::default()),
            generation: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Submit a request; the boundary entry point for callers.
    pub fn submit_request<I, S>(
        self: &Arc<Self>,
        payload: ChatRequest,
        eligible_models: I,
        token_demand: u64,
    ) -> Result<TaskHandle>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.submit(TaskSpec::new(payload, eligible_models, token_demand))
    }

    /// Enqueue a task and wake every worker.
    pub fn submit(self: &Arc<Self>, spec: TaskSpec) -> Result<TaskHandle> {
        if spec.eligible_models.is_empty() {
            return Err(TokenlaneError::InvalidTask("eligible model set is empty".to_string()));
        }
        if !self.workers.iter().any(|w| w.can_ever_admit(&spec)) {
            return Err(TokenlaneError::Unschedulable(format!(
                "no worker serves {:?} with a budget of at least {} tokens",
                spec.eligible_models, spec.token_demand
            )));
        }

        let handle = self.enqueue(spec)?;
        for worker in &self.workers {
            worker.start(self);
        }
        Ok(handle)
    }

    /// Queue a task without waking workers.
    pub(crate) fn enqueue(self: &Arc<Self>, spec: TaskSpec) -> Result<TaskHandle> {
        let task = Task {
            id: TaskId::generate(),
            payload: spec.payload,
            token_demand: spec.token_demand,
            eligible_models: spec.eligible_models,
            attempt: spec.attempt,
            state: TaskState::Pending,
            cancel: CancelSignal::new(),
        };
        let (reply, rx) = oneshot::channel();
        let handle = TaskHandle {
            id: task.id.clone(),
            rx,
            cancel: task.cancel.clone(),
            manager: Arc::downgrade(self),
        };

        {
            let mut queue = self.lock();
            if queue.stopped {
                return Err(TokenlaneError::Unschedulable("scheduler is stopped".to_string()));
            }
            tracing::debug!(
                task_id = %task.id,
                token_demand = task.token_demand,
                models = ?task.eligible_models,
                "Task submitted"
            );
            queue.submitted += 1;
            queue.pending.push_back(PendingTask { task, reply });
            self.generation.fetch_add(1, Ordering::SeqCst);
        }

        Ok(handle)
    }

    /// Hand the oldest eligible pending task to `worker`, if any fits `snapshot`.
    pub fn request_task(&self, worker: &str, snapshot: &CapacitySnapshot) -> Option<Task> {
        let mut queue = self.lock();
        queue.polls += 1;
        if queue.stopped {
            return None;
        }
        queue.purge_cancelled();

        let position = queue
            .pending
            .iter()
            .position(|p| snapshot.admits(p.task.token_demand, &p.task.eligible_models))?;
        let PendingTask { mut task, reply } = queue.pending.remove(position)?;

        task.state = TaskState::Running;
        queue.running.insert(
            task.id.clone(),
            RunningTask {
                worker: worker.to_string(),
                reply,
            },
        );
        queue.dispatched += 1;

        tracing::debug!(
            task_id = %task.id,
            worker = worker,
            token_demand = task.token_demand,
            token_capacity = snapshot.token_capacity,
            "Task dispatched"
        );
        Some(task)
    }

    /// Settle a running task with its outcome.
    ///
    /// An id the manager is not running means the bookkeeping is corrupt; it
    /// is logged at error level and returned, never ignored.
    pub fn respond_task(&self, task_id: &TaskId, result: TaskResult) -> Result<()> {
        let entry = {
            let mut queue = self.lock();
            match queue.running.remove(task_id) {
                Some(entry) => {
                    queue.settled += 1;
                    entry
                }
                None => {
                    tracing::error!(task_id = %task_id, "Response for a task that is not running");
                    return Err(TokenlaneError::SchedulingInvariant(format!(
                        "task {} reported back but is not running",
                        task_id
                    )));
                }
            }
        };

        match &result {
            Ok(_) => tracing::debug!(task_id = %task_id, worker = %entry.worker, "Task settled"),
            Err(e) => tracing::info!(task_id = %task_id, worker = %entry.worker, error = %e, "Task settled with error"),
        }
        if entry.reply.send(result).is_err() {
            tracing::debug!(task_id = %task_id, "Caller dropped its handle before settlement");
        }
        Ok(())
    }

    /// Settle pending tasks the caller has cancelled.
    fn purge_cancelled(&self) {
        self.lock().purge_cancelled();
    }

    /// Stop all workers and fail every still-pending task.
    ///
    /// Tasks already running finish and settle normally.
    pub fn stop(&self) {
        for worker in &self.workers {
            worker.stop();
        }

        let drained: Vec<PendingTask> = {
            let mut queue = self.lock();
            queue.stopped = true;
            let drained: Vec<PendingTask> = queue.pending.drain(..).collect();
            queue.settled += drained.len() as u64;
            drained
        };

        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "Failing pending tasks on stop");
        }
        for entry in drained {
            let _ = entry.reply.send(Err(ClassifiedError::network("Scheduler stopped")));
        }
    }

    pub fn stats(&self) -> ManagerStats {
        let queue = self.lock();
        ManagerStats {
            pending: queue.pending.len(),
            running: queue.running.len(),
            submitted: queue.submitted,
            dispatched: queue.dispatched,
            settled: queue.settled,
            polls: queue.polls,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }
}

/// Caller's side of a submitted task; resolves exactly once.
pub struct TaskHandle {
    id: TaskId,
    rx: oneshot::Receiver<TaskResult>,
    cancel: CancelSignal,
    manager: Weak<Manager>,
}

impl TaskHandle {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Cancel the task.
    ///
    /// A pending task settles right away; a running one settles with a
    /// `Network` error once its request is aborted.
    pub fn cancel(&self) {
        self.cancel.cancel();
        if let Some(manager) = self.manager.upgrade() {
            manager.purge_cancelled();
        }
    }
}

impl Future for TaskHandle {
    type Output = TaskResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or_else(|_| Err(ClassifiedError::network("Scheduler dropped the task"))))
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}
