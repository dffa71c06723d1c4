//! Shared test fixtures: a scripted transport and small async helpers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokenlane::llm::{
    CancelSignal, ChatMessage, ChatOutput, ChatRequest, ChatTransport, Choice, ClassifiedError, Role, TaskResult,
    Usage,
};

/// One observed call: which prompt, when it started and ended.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub prompt: String,
    pub started: Instant,
    pub finished: Instant,
}

/// Transport that sleeps, then answers from a script (or echoes the prompt).
pub struct MockTransport {
    delay: Duration,
    script: Mutex<VecDeque<TaskResult>>,
    started: AtomicUsize,
    current: AtomicUsize,
    max_concurrent: AtomicUsize,
    calls: Mutex<Vec<CallRecord>>,
}

impl MockTransport {
    pub fn new(delay: Duration) -> Arc<Self> {
        Self::scripted(delay, Vec::new())
    }

    /// Answer the first calls from `script`, later ones by echoing the prompt.
    pub fn scripted(delay: Duration, script: Vec<TaskResult>) -> Arc<Self> {
        Arc::new(Self {
            delay,
            script: Mutex::new(script.into()),
            started: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed_calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn send(&self, request: &ChatRequest, cancel: CancelSignal) -> TaskResult {
        let started = Instant::now();
        self.started.fetch_add(1, Ordering::SeqCst);
        let now_running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now_running, Ordering::SeqCst);

        let prompt = last_user_message(request);
        let result = tokio::select! {
            _ = tokio::time::sleep(self.delay) => {
                let scripted = self.script.lock().unwrap().pop_front();
                scripted.unwrap_or_else(|| Ok(completion(&format!("echo: {}", prompt))))
            }
            _ = cancel.cancelled() => Err(ClassifiedError::network("Request cancelled")),
        };

        self.calls.lock().unwrap().push(CallRecord {
            prompt,
            started,
            finished: Instant::now(),
        });
        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub fn last_user_message(request: &ChatRequest) -> String {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .and_then(|m| m.content.clone())
        .unwrap_or_default()
}

pub fn completion(text: &str) -> ChatOutput {
    ChatOutput {
        choices: vec![Choice {
            index: 0,
            finish_reason: Some("stop".to_string()),
            message: ChatMessage::assistant(text),
        }],
        usage: Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        },
    }
}

pub fn prompt(text: &str) -> ChatRequest {
    ChatRequest::new("").with_user_message(text)
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
