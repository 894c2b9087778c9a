//! chatllama
//!
//! Chat session engine for local LLaMA-family models. The crate owns the
//! session and context-window logic (prompt priming, batched input
//! forwarding, infinite-generation context eviction, token streaming) and
//! drives an external token-prediction backend through the
//! [`evaluator::Evaluator`] trait. The `llama` feature supplies a llama.cpp
//! backend; everything else is backend-agnostic.

#[cfg(feature = "llama")]
pub mod backend;
pub mod evaluator;
pub mod model;
pub mod runner;
pub mod session;
pub mod streaming;

pub use evaluator::{EvalError, Evaluator, SamplingParams, Token};
pub use runner::{ChatSession, LoadEvent};
pub use session::{SessionConfig, SessionError};
pub use streaming::StreamToken;
