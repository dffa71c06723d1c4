//! Worker: one execution lane bound to a set of models.
//!
//! A worker pulls tasks from the [`Manager`] whenever it has spare capacity,
//! runs them through its transport, and reports each outcome back exactly
//! once. It never retries or requeues.

use std::collections::{BTreeSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::FutureExt;

use crate::llm::{ChatTransport, ClassifiedError, TaskResult};
use crate::scheduler::capacity::{self, CapacitySnapshot, TOKEN_WINDOW, TaskStartRecord};
use crate::scheduler::manager::{Manager, Task, TaskSpec};
use crate::scheduler::poller::{POLL_INTERVAL, Poller};
use crate::scheduler::rate_limit::RateLimitState;

/// Request timeout per retry attempt.
///
/// Attempt `n` (1-based) uses entry `n - 1`; attempts past the end reuse the
/// last entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutPolicy {
    steps: Vec<Duration>,
}

impl TimeoutPolicy {
    /// Empty step lists fall back to the default policy.
    pub fn new(steps: Vec<Duration>) -> Self {
        if steps.is_empty() {
            Self::default()
        } else {
            Self { steps }
        }
    }

    pub fn fixed(timeout: Duration) -> Self {
        Self { steps: vec![timeout] }
    }

    pub fn timeout_for(&self, attempt: u32) -> Duration {
        let index = (attempt.max(1) as usize - 1).min(self.steps.len() - 1);
        self.steps[index]
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            steps: vec![Duration::from_secs(30), Duration::from_secs(60), Duration::from_secs(120)],
        }
    }
}

/// Static worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    pub models: BTreeSet<String>,
    /// Max simultaneously running tasks.
    pub concurrency: usize,
    pub tokens_per_minute: u64,
    pub requests_per_minute: Option<u32>,
    pub timeout_policy: TimeoutPolicy,
    /// Budget window; production keeps one minute.
    pub window: Duration,
    /// Heartbeat between admission checks.
    pub poll_interval: Duration,
}

impl WorkerConfig {
    pub fn new<I, S>(name: impl Into<String>, models: I, concurrency: usize, tokens_per_minute: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            models: models.into_iter().map(Into::into).collect(),
            concurrency,
            tokens_per_minute,
            requests_per_minute: None,
            timeout_policy: TimeoutPolicy::default(),
            window: TOKEN_WINDOW,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_requests_per_minute(mut self, rpm: u32) -> Self {
        self.requests_per_minute = Some(rpm);
        self
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[derive(Debug, Default)]
struct WorkerState {
    records: VecDeque<TaskStartRecord>,
    in_flight: usize,
    rate_limit: RateLimitState,
    /// Snapshot and queue generation of the last poll that came back empty.
    idle_at: Option<(CapacitySnapshot, u64)>,
}

pub struct Worker {
    config: WorkerConfig,
    transport: Arc<dyn ChatTransport>,
    state: Mutex<WorkerState>,
    poller: Poller,
}

impl Worker {
    pub fn new(config: WorkerConfig, transport: Arc<dyn ChatTransport>) -> Arc<Self> {
        let poller = Poller::new(config.poll_interval);
        Arc::new(Self {
            config,
            transport,
            state: Mutex::new(WorkerState::default()),
            poller,
        })
    }

    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Whether this worker could admit the task given an empty window.
    pub fn can_ever_admit(&self, spec: &TaskSpec) -> bool {
        self.config.concurrency > 0
            && self.config.requests_per_minute != Some(0)
            && spec.token_demand <= self.config.tokens_per_minute
            && !self.config.models.is_disjoint(&spec.eligible_models)
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub fn is_cooling_down(&self) -> bool {
        self.lock().rate_limit.is_cooling_down(Instant::now())
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_armed()
    }

    /// Current capacity, as the next admission check would see it.
    pub fn snapshot(&self) -> CapacitySnapshot {
        let state = self.lock();
        self.snapshot_at(&state, Instant::now())
    }

    fn snapshot_at(&self, state: &WorkerState, now: Instant) -> CapacitySnapshot {
        let window = self.config.window;
        let saturated = state.in_flight >= self.config.concurrency;
        let rpm_exhausted = self
            .config
            .requests_per_minute
            .is_some_and(|rpm| capacity::requests_in_window(&state.records, now, window) >= rpm as usize);

        let token_capacity = if saturated || rpm_exhausted {
            0
        } else {
            capacity::remaining_tokens(&state.records, now, window, self.config.tokens_per_minute)
        };
        CapacitySnapshot::new(token_capacity, self.config.models.clone())
    }

    /// Enter polling: run an admission check now and keep the heartbeat armed.
    pub fn start(self: &Arc<Self>, manager: &Arc<Manager>) {
        if manager.is_stopped() {
            return;
        }
        if self.poller.wake() {
            return;
        }

        let worker = Arc::downgrade(self);
        let manager = Arc::downgrade(manager);
        tracing::debug!(
            worker = %self.config.name,
            interval_ms = self.poller.interval().as_millis() as u64,
            "Worker polling"
        );
        self.poller.set(Arc::new(move || {
            if let (Some(worker), Some(manager)) = (worker.upgrade(), manager.upgrade()) {
                worker.admit(&manager);
            }
        }));
    }

    /// Disarm the heartbeat. Requests already in flight keep running.
    pub fn stop(&self) {
        self.poller.unset();
        tracing::debug!(worker = %self.config.name, "Worker stopped");
    }

    /// Pull tasks from the manager until capacity or the queue runs out.
    ///
    /// The state lock is held across `request_task` so two admission checks
    /// on the same worker cannot both spend the same capacity.
    fn admit(self: &Arc<Self>, manager: &Arc<Manager>) {
        let mut state = self.lock();
        loop {
            let now = Instant::now();
            if let Some(remaining) = state.rate_limit.remaining(now) {
                tracing::trace!(
                    worker = %self.config.name,
                    remaining_ms = remaining.as_millis() as u64,
                    "Cooling down, skipping poll"
                );
                return;
            }

            capacity::prune(&mut state.records, now, self.config.window);
            let snapshot = self.snapshot_at(&state, now);
            if snapshot.token_capacity == 0 {
                return;
            }

            let generation = manager.generation();
            if let Some((idle_snapshot, idle_generation)) = &state.idle_at {
                if *idle_generation == generation && *idle_snapshot == snapshot {
                    return;
                }
            }

            let Some(task) = manager.request_task(&self.config.name, &snapshot) else {
                state.idle_at = Some((snapshot, generation));
                return;
            };

            state.records.push_back(TaskStartRecord::new(now, task.token_demand));
            state.in_flight += 1;
            state.idle_at = None;
            tracing::info!(
                worker = %self.config.name,
                task_id = %task.id,
                token_demand = task.token_demand,
                token_capacity = snapshot.token_capacity,
                in_flight = state.in_flight,
                "Task started"
            );

            let worker = Arc::clone(self);
            let manager = Arc::clone(manager);
            tokio::spawn(async move { worker.execute(task, manager).await });
        }
    }

    async fn execute(self: Arc<Self>, task: Task, manager: Arc<Manager>) {
        let timeout = self.config.timeout_policy.timeout_for(task.attempt);
        let send = AssertUnwindSafe(self.transport.send(&task.payload, task.cancel.clone())).catch_unwind();
        let result: TaskResult = match tokio::time::timeout(timeout, send).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                tracing::error!(worker = %self.config.name, task_id = %task.id, "Transport panicked");
                Err(ClassifiedError::network("Transport panicked"))
            }
            Err(_) => Err(ClassifiedError::network(format!(
                "Request timed out after {}ms",
                timeout.as_millis()
            ))),
        };

        {
            let mut state = self.lock();
            let now = Instant::now();
            match &result {
                Ok(_) => state.rate_limit.record_success(),
                Err(e) => {
                    if let Some(cooldown) = e.cooldown() {
                        state.rate_limit.record_rate_limit(now, cooldown);
                    }
                    tracing::warn!(worker = %self.config.name, task_id = %task.id, error = %e, "Task failed");
                }
            }
        }

        if let Err(e) = manager.respond_task(&task.id, result) {
            tracing::error!(worker = %self.config.name, task_id = %task.id, error = %e, "Manager rejected task result");
        }

        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.start(&manager);
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.config.name)
            .field("models", &self.config.models)
            .field("concurrency", &self.config.concurrency)
            .field("tokens_per_minute", &self.config.tokens_per_minute)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CancelSignal, ChatOutput, ChatRequest};
    use async_trait::async_trait;

    struct EmptyTransport;

    #[async_trait]
    impl ChatTransport for EmptyTransport {
        async fn send(&self, _request: &ChatRequest, _cancel: CancelSignal) -> TaskResult {
            Ok(ChatOutput {
                choices: Vec::new(),
                usage: Default::default(),
            })
        }
    }

    fn worker(config: WorkerConfig) -> Arc<Worker> {
        Worker::new(config, Arc::new(EmptyTransport))
    }

    #[test]
    fn test_timeout_policy_default() {
        let policy = TimeoutPolicy::default();
        assert_eq!(policy.timeout_for(1), Duration::from_secs(30));
        assert_eq!(policy.timeout_for(2), Duration::from_secs(60));
        assert_eq!(policy.timeout_for(3), Duration::from_secs(120));
        assert_eq!(policy.timeout_for(9), Duration::from_secs(120));
    }

    #[test]
    fn test_timeout_policy_attempt_zero_uses_first_step() {
        let policy = TimeoutPolicy::new(vec![Duration::from_secs(5), Duration::from_secs(10)]);
        assert_eq!(policy.timeout_for(0), Duration::from_secs(5));
    }

    #[test]
    fn test_timeout_policy_empty_falls_back() {
        assert_eq!(TimeoutPolicy::new(Vec::new()), TimeoutPolicy::default());
        assert_eq!(TimeoutPolicy::fixed(Duration::from_secs(7)).timeout_for(4), Duration::from_secs(7));
    }

    #[test]
    fn test_worker_config_defaults() {
        let config = WorkerConfig::new("east", ["gpt-4"], 2, 1000);
        assert_eq!(config.window, TOKEN_WINDOW);
        assert_eq!(config.poll_interval, POLL_INTERVAL);
        assert!(config.requests_per_minute.is_none());
        assert!(config.models.contains("gpt-4"));
    }

    #[test]
    fn test_fresh_worker_snapshot_is_full_budget() {
        let w = worker(WorkerConfig::new("w", ["m"], 2, 1000));
        let snapshot = w.snapshot();
        assert_eq!(snapshot.token_capacity, 1000);
        assert!(snapshot.models.contains("m"));
    }

    #[test]
    fn test_snapshot_zero_when_saturated() {
        let w = worker(WorkerConfig::new("w", ["m"], 1, 1000));
        w.lock().in_flight = 1;
        assert_eq!(w.snapshot().token_capacity, 0);
    }

    #[test]
    fn test_snapshot_subtracts_started_demand() {
        let w = worker(WorkerConfig::new("w", ["m"], 4, 1000));
        w.lock().records.push_back(TaskStartRecord::new(Instant::now(), 400));
        assert_eq!(w.snapshot().token_capacity, 600);
    }

    #[test]
    fn test_snapshot_zero_when_requests_per_minute_exhausted() {
        let w = worker(WorkerConfig::new("w", ["m"], 4, 1000).with_requests_per_minute(2));
        {
            let mut state = w.lock();
            state.records.push_back(TaskStartRecord::new(Instant::now(), 1));
            state.records.push_back(TaskStartRecord::new(Instant::now(), 1));
        }
        assert_eq!(w.snapshot().token_capacity, 0);
    }

    #[test]
    fn test_can_ever_admit() {
        let w = worker(WorkerConfig::new("w", ["gpt-a"], 1, 1000));
        let request = ChatRequest::default();

        assert!(w.can_ever_admit(&TaskSpec::new(request.clone(), ["gpt-a", "gpt-b"], 1000)));
        assert!(!w.can_ever_admit(&TaskSpec::new(request.clone(), ["gpt-a"], 1001)));
        assert!(!w.can_ever_admit(&TaskSpec::new(request.clone(), ["gpt-b"], 10)));

        let idle = worker(WorkerConfig::new("idle", ["gpt-a"], 0, 1000));
        assert!(!idle.can_ever_admit(&TaskSpec::new(request.clone(), ["gpt-a"], 10)));

        let no_requests = worker(WorkerConfig::new("zero-rpm", ["gpt-a"], 1, 1000).with_requests_per_minute(0));
        assert!(!no_requests.can_ever_admit(&TaskSpec::new(request, ["gpt-a"], 10)));
    }

    #[tokio::test]
    async fn test_zero_requests_per_minute_rejected_at_submit() {
        let w = worker(WorkerConfig::new("w", ["m"], 1, 1000).with_requests_per_minute(0));
        let manager = Manager::new(vec![w]);

        let err = manager
            .submit(TaskSpec::new(ChatRequest::default(), ["m"], 10))
            .unwrap_err();
        assert!(matches!(err, crate::TokenlaneError::Unschedulable(_)));
        assert_eq!(manager.pending_count(), 0);
    }

    struct PanickingTransport;

    #[async_trait]
    impl ChatTransport for PanickingTransport {
        async fn send(&self, _request: &ChatRequest, _cancel: CancelSignal) -> TaskResult {
            panic!("transport blew up");
        }
    }

    #[tokio::test]
    async fn test_transport_panic_settles_task_and_frees_slot() {
        let w = Worker::new(WorkerConfig::new("w", ["m"], 1, 1000), Arc::new(PanickingTransport));
        let manager = Manager::new(vec![w.clone()]);

        let handle = manager.submit(TaskSpec::new(ChatRequest::default(), ["m"], 10)).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap();

        assert_eq!(result, Err(ClassifiedError::network("Transport panicked")));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(w.in_flight(), 0);
        assert_eq!(manager.running_count(), 0);
        assert_eq!(manager.stats().settled, 1);
        manager.stop();
    }

    #[tokio::test]
    async fn test_cooling_down_worker_does_not_poll() {
        let w = worker(WorkerConfig::new("w", ["m"], 1, 1000));
        let manager = Manager::new(vec![w.clone()]);
        w.lock().rate_limit.record_rate_limit(Instant::now(), Duration::from_secs(60));

        let _handle = manager.submit(TaskSpec::new(ChatRequest::default(), ["m"], 10)).unwrap();

        assert!(w.is_cooling_down());
        assert_eq!(manager.stats().polls, 0);
        assert_eq!(manager.pending_count(), 1);
        manager.stop();
    }

    #[tokio::test]
    async fn test_stop_disarms_poller() {
        let w = worker(WorkerConfig::new("w", ["m"], 1, 1000));
        let manager = Manager::new(vec![w.clone()]);

        w.start(&manager);
        assert!(w.is_polling());
        w.stop();
        assert!(!w.is_polling());
    }

    #[tokio::test]
    async fn test_start_after_manager_stop_is_noop() {
        let w = worker(WorkerConfig::new("w", ["m"], 1, 1000));
        let manager = Manager::new(vec![w.clone()]);
        manager.stop();

        w.start(&manager);
        assert!(!w.is_polling());
    }
}
