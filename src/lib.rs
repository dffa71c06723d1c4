//! tokenlane - rate-limit aware scheduling of chat completions
//!
//! Callers submit completion requests with a token demand estimate and a set
//! of acceptable models. Workers bound to individual endpoints pull tasks
//! while they have concurrency and tokens-per-minute budget left, and every
//! request settles exactly once with a result or a classified error.

pub mod config;
pub mod error;
pub mod id;
pub mod llm;
pub mod scheduler;

pub use error::{Result, TokenlaneError};
