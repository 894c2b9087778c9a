//! Embedding queue
//!
//! Staging area between "tokens the caller asked to process" and "tokens
//! about to be evaluated". Freshly tokenized input lands in `pending`; the
//! generation loop moves it one token at a time into `ready`, which is what
//! the next evaluator call receives.

use crate::evaluator::Token;

#[derive(Debug, Default)]
pub struct EmbeddingQueue {
    pending: Vec<Token>,
    consumed: usize,
    ready: Vec<Token>,
}

impl EmbeddingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while `pending` still has unconsumed tokens.
    pub fn has_pending(&self) -> bool {
        self.consumed < self.pending.len()
    }

    /// Clears `pending` once every token in it has been consumed.
    fn reset_if_drained(&mut self) {
        if !self.has_pending() {
            self.pending.clear();
            self.consumed = 0;
        }
    }

    /// Appends `tokens` to `pending`, first discarding a fully drained
    /// previous turn. Returns how many tokens were appended.
    pub fn produce(&mut self, tokens: &[Token]) -> usize {
        self.reset_if_drained();
        self.pending.extend_from_slice(tokens);
        tokens.len()
    }

    /// Moves one pending token into `ready`. Calling past exhaustion is a
    /// no-op, so the loop can always request a full batch.
    pub fn consume_one(&mut self) {
        if self.has_pending() {
            self.ready.push(self.pending[self.consumed]);
            self.consumed += 1;
        }
    }

    /// Tokens scheduled for the next evaluator call.
    pub fn ready(&self) -> &[Token] {
        &self.ready
    }

    pub fn ready_is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// Schedules a single token (a freshly sampled id) for the next
    /// evaluator call.
    pub fn push_ready(&mut self, token: Token) {
        self.ready.push(token);
    }

    /// Inserts `tokens` in front of the already scheduled ones. Used by
    /// context eviction to re-seed recent history before the incoming batch.
    pub fn splice_ready_front(&mut self, tokens: &[Token]) {
        self.ready.splice(0..0, tokens.iter().copied());
    }

    /// Returns and clears `ready` after a successful evaluator call.
    pub fn drain_ready(&mut self) -> Vec<Token> {
        std::mem::take(&mut self.ready)
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> &[Token] {
        &self.pending
    }
}
