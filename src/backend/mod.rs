//! Model backends
//!
//! Concrete [`crate::evaluator::Evaluator`] implementations. Only the
//! llama.cpp backend exists today, gated behind the `llama` feature because
//! it pulls in a native build.

pub mod llama;

pub use llama::LlamaEvaluator;
