//! Scheduler: admission control for rate-limited completion endpoints.
//!
//! This module provides:
//! - **Manager**: the pending queue; callers `submit`, workers pull with
//!   `request_task` and report with `respond_task`.
//! - **Worker**: one execution lane per endpoint/model set, bounded by
//!   concurrency and a rolling tokens-per-minute budget.
//! - **Capacity**: sliding-window math over task start records.
//! - **Poller**: restartable heartbeat with on-demand wakeup.
//! - **Rate limiting**: per-worker cooldown after a 429.
//!
//! # Architecture
//!
//! The scheduler uses a pull model:
//! 1. `Manager::submit` enqueues a task and wakes every worker
//! 2. Each worker computes its capacity and asks for the oldest task it can run
//! 3. The worker runs the task through its transport
//! 4. The worker reports the result; the manager settles the caller's handle
//! 5. The worker re-checks admission immediately; the heartbeat is a fallback
//!
//! # Example
//!
//! ```ignore
//! use tokenlane::llm::{ChatRequest, EndpointAuth, HttpProxy};
//! use tokenlane::scheduler::{Manager, Worker, WorkerConfig};
//!
//! let proxy = HttpProxy::new(endpoint, EndpointAuth::ApiKey(key))?;
//! let worker = Worker::new(WorkerConfig::new("east", ["gpt-4"], 4, 40_000), Arc::new(proxy));
//! let manager = Manager::new(vec![worker]);
//!
//! let output = manager
//!     .submit_request(ChatRequest::new("").with_user_message("Hi"), ["gpt-4"], 900)?
//!     .await?;
//! ```

mod capacity;
mod manager;
mod poller;
mod rate_limit;
mod worker;

pub use capacity::{
    CapacitySnapshot, TOKEN_WINDOW, TaskStartRecord, prune, remaining_tokens, requests_in_window,
};
pub use manager::{Manager, ManagerStats, Task, TaskHandle, TaskSpec, TaskState};
pub use poller::{POLL_INTERVAL, PollCallback, Poller};
pub use rate_limit::RateLimitState;
pub use worker::{TimeoutPolicy, Worker, WorkerConfig};
