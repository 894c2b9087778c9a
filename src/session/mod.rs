//! Chat session engine
//!
//! Everything that turns an unbounded stream of user turns into a bounded
//! sequence of evaluator calls: run parameters, the token recency window,
//! prompt priming and wrapping, the input/ready embedding queue, and the
//! generation loop with context eviction.

use thiserror::Error;

pub mod config;
pub mod engine;
pub mod history;
pub mod prompt;
pub mod queue;

pub use config::{ConfigError, SessionConfig, SessionState};
pub use engine::ChatEngine;
pub use history::TokenHistory;
pub use prompt::{ChatPromptTemplate, PrimingPrefix, WrappedTurn};
pub use queue::EmbeddingQueue;

/// Session-level failures, surfaced to the caller as discrete events.
#[derive(Debug, Error, Clone)]
pub enum SessionError {
    /// The priming preamble does not fit the context window.
    #[error("prompt is too long ({n_tokens} tokens, max {max})")]
    PromptTooLong { n_tokens: usize, max: usize },

    #[error("tokenization failed: {0}")]
    Tokenization(String),

    /// The external forward pass failed; the turn is aborted.
    #[error("evaluation failed: {0}")]
    EvalFailure(String),

    #[error("failed to load model: {0}")]
    LoadFailure(String),

    #[error("a model is already loaded; unload it first")]
    AlreadyLoaded,

    #[error("no model loaded")]
    NotLoaded,

    #[error("chat is not started")]
    ChatNotStarted,

    #[error("chat is already started")]
    ChatAlreadyStarted,

    #[error("session worker is gone: {0}")]
    Worker(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
