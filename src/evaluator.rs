//! External evaluator contract
//!
//! The session engine never runs the forward pass or the sampler itself; it
//! drives an [`Evaluator`] that wraps the model backend. All calls are
//! synchronous and happen on the session worker thread.

use thiserror::Error;

/// Opaque token id from the backend vocabulary.
///
/// The engine never interprets the value except to compare against
/// [`Evaluator::eos_token`].
pub type Token = i32;

/// Errors reported by the backend.
#[derive(Debug, Error, Clone)]
pub enum EvalError {
    #[error("failed to load model: {0}")]
    Load(String),

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("forward pass failed: {0}")]
    Eval(String),
}

/// Sampling parameters forwarded verbatim to the backend sampler.
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    pub top_k: i32,
    pub top_p: f32,
    pub temp: f32,
    pub repeat_penalty: f32,
}

/// Token-prediction backend: tokenizer, forward pass over a KV cache, and
/// next-token sampler.
///
/// `sample` is only meaningful immediately after a successful `evaluate`,
/// when the backend holds logits for the last evaluated position.
pub trait Evaluator {
    /// Tokenizes `text`, optionally prepending the beginning-of-sequence token.
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, EvalError>;

    /// Maximum number of tokens the backend context can hold (`n_ctx`).
    fn context_capacity(&self) -> usize;

    /// Folds `tokens` into the running context at position `n_past`.
    fn evaluate(&mut self, tokens: &[Token], n_past: usize, n_threads: i32) -> Result<(), EvalError>;

    /// Samples the next token from the logits of the last evaluated position.
    /// `recent` is the repetition-penalty window, most recent token last.
    fn sample(&mut self, recent: &[Token], params: &SamplingParams) -> Token;

    /// Raw bytes of the token's text piece. May end mid-way through a
    /// multi-byte character; see [`crate::streaming::Utf8Assembler`].
    fn token_to_bytes(&self, token: Token) -> Vec<u8>;

    /// End-of-sequence sentinel.
    fn eos_token(&self) -> Token;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::collections::VecDeque;

    pub const BOS: Token = 1;
    pub const EOS: Token = 2;

    /// Scripted backend for engine tests.
    ///
    /// Tokenizes one token per whitespace-separated word, assigns ids from a
    /// growing vocabulary, replays a scripted list of sampled tokens, and
    /// records every `evaluate` call.
    pub struct ScriptedEvaluator {
        pub n_ctx: usize,
        vocab: RefCell<HashMap<String, Token>>,
        pieces: RefCell<HashMap<Token, Vec<u8>>>,
        pub script: VecDeque<Token>,
        pub eval_calls: Vec<(Vec<Token>, usize)>,
        pub fail_eval_after: Option<usize>,
    }

    impl ScriptedEvaluator {
        pub fn new(n_ctx: usize) -> Self {
            Self {
                n_ctx,
                vocab: RefCell::new(HashMap::new()),
                pieces: RefCell::new(HashMap::new()),
                script: VecDeque::new(),
                eval_calls: Vec::new(),
                fail_eval_after: None,
            }
        }

        pub fn with_script(n_ctx: usize, script: &[Token]) -> Self {
            let mut eval = Self::new(n_ctx);
            eval.script = script.iter().copied().collect();
            eval
        }

        /// Registers a piece for a scripted token id so emitted text is
        /// reconstructable.
        pub fn define_piece(&self, token: Token, piece: &str) {
            self.pieces
                .borrow_mut()
                .insert(token, piece.as_bytes().to_vec());
        }

        fn intern(&self, word: &str) -> Token {
            let mut vocab = self.vocab.borrow_mut();
            let next_id = 100 + vocab.len() as Token;
            let id = *vocab.entry(word.to_string()).or_insert(next_id);
            self.pieces
                .borrow_mut()
                .entry(id)
                .or_insert_with(|| format!(" {word}").into_bytes());
            id
        }
    }

    impl Evaluator for ScriptedEvaluator {
        fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, EvalError> {
            let mut out = Vec::new();
            if add_bos {
                out.push(BOS);
            }
            for word in text.split_whitespace() {
                out.push(self.intern(word));
            }
            Ok(out)
        }

        fn context_capacity(&self) -> usize {
            self.n_ctx
        }

        fn evaluate(
            &mut self,
            tokens: &[Token],
            n_past: usize,
            _n_threads: i32,
        ) -> Result<(), EvalError> {
            if let Some(limit) = self.fail_eval_after {
                if self.eval_calls.len() >= limit {
                    return Err(EvalError::Eval("scripted failure".into()));
                }
            }
            assert!(
                n_past + tokens.len() <= self.n_ctx,
                "evaluate overflows context: n_past={} + {} > {}",
                n_past,
                tokens.len(),
                self.n_ctx
            );
            self.eval_calls.push((tokens.to_vec(), n_past));
            Ok(())
        }

        fn sample(&mut self, _recent: &[Token], _params: &SamplingParams) -> Token {
            self.script.pop_front().unwrap_or(EOS)
        }

        fn token_to_bytes(&self, token: Token) -> Vec<u8> {
            self.pieces.borrow().get(&token).cloned().unwrap_or_default()
        }

        fn eos_token(&self) -> Token {
            EOS
        }
    }
}
