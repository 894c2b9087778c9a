//! Prompt priming and per-turn wrapping
//!
//! The priming prefix is the system preamble evaluated once when a chat
//! starts; its length becomes the keep-count anchor that context eviction
//! never discards. The chat template wraps each raw user utterance into the
//! instruction-following token form the model was tuned on.

use crate::evaluator::{Evaluator, Token};
use crate::session::SessionError;

/// Instruction framing strings (Alpaca style).
const TURN_PREFIX: &str = "\n\n### Instruction:\n\n";
const TURN_SUFFIX: &str = "\n\n### Response:\n\n";

/// Headroom reserved for control tokens when checking the preamble length.
const CONTEXT_HEADROOM: usize = 4;

/// One-time-computed system preamble, read-only after construction.
#[derive(Debug, Clone)]
pub struct PrimingPrefix {
    tokens: Vec<Token>,
}

impl PrimingPrefix {
    /// Tokenizes `" " + preamble` with a leading boundary token.
    ///
    /// Fails with [`SessionError::PromptTooLong`] when the result does not
    /// leave [`CONTEXT_HEADROOM`] tokens of slack in the context window.
    pub fn new<E: Evaluator>(eval: &E, preamble: &str) -> Result<Self, SessionError> {
        let tokens = eval
            .tokenize(&format!(" {preamble}"), true)
            .map_err(|e| SessionError::Tokenization(e.to_string()))?;

        let max = eval.context_capacity().saturating_sub(CONTEXT_HEADROOM);
        if tokens.len() > max {
            return Err(SessionError::PromptTooLong {
                n_tokens: tokens.len(),
                max,
            });
        }
        Ok(Self { tokens })
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Keep-count anchor: the leading span eviction must preserve.
    pub fn n_keep(&self) -> usize {
        self.tokens.len()
    }
}

/// Result of wrapping one user turn.
#[derive(Debug)]
pub struct WrappedTurn {
    /// User tokens followed by the response-suffix tokens.
    pub tokens: Vec<Token>,
    /// Number of raw user tokens, debited from the turn's predict budget.
    pub debit: usize,
}

/// Fixed instruction framing, tokenized once at chat start.
#[derive(Debug, Clone)]
pub struct ChatPromptTemplate {
    prefix: Vec<Token>,
    suffix: Vec<Token>,
}

impl ChatPromptTemplate {
    pub fn new<E: Evaluator>(eval: &E) -> Result<Self, SessionError> {
        let prefix = eval
            .tokenize(TURN_PREFIX, true)
            .map_err(|e| SessionError::Tokenization(e.to_string()))?;
        let suffix = eval
            .tokenize(TURN_SUFFIX, false)
            .map_err(|e| SessionError::Tokenization(e.to_string()))?;
        Ok(Self { prefix, suffix })
    }

    /// Tokenizes `user_text` without a boundary token and appends the
    /// response suffix. The instruction prefix is deliberately not injected;
    /// changing that would change the framing the model sees mid-chat.
    pub fn wrap<E: Evaluator>(&self, eval: &E, user_text: &str) -> Result<WrappedTurn, SessionError> {
        let user = eval
            .tokenize(user_text, false)
            .map_err(|e| SessionError::Tokenization(e.to_string()))?;
        let debit = user.len();

        let mut tokens = user;
        tokens.extend_from_slice(&self.suffix);
        Ok(WrappedTurn { tokens, debit })
    }

    pub fn prefix(&self) -> &[Token] {
        &self.prefix
    }

    pub fn suffix(&self) -> &[Token] {
        &self.suffix
    }
}
