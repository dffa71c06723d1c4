//! LLM transport layer - OpenAI-compatible chat completion over HTTP
//!
//! This module provides:
//! - Wire types for chat requests and responses
//! - Outcome classification (network, rate limit, HTTP, parse)
//! - The ChatTransport trait and its reqwest implementation

pub mod classify;
pub mod proxy;
pub mod types;

pub use classify::{
    ClassifiedError, DEFAULT_COOLDOWN_MS, TaskResult, classify_error, classify_response, parse_cooldown_ms,
    parse_success,
};
pub use proxy::{CancelSignal, ChatTransport, EndpointAuth, HttpProxy};
pub use types::{
    ChatMessage, ChatOutput, ChatRequest, Choice, FunctionCall, FunctionDefinition, Role, Usage, estimate_tokens,
};
