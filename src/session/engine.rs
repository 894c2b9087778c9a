//! Generation loop and context eviction
//!
//! [`ChatEngine`] owns every piece of mutable session state and drives the
//! external evaluator: it consumes queued input in batches, restores the
//! context-capacity invariant before each forward pass, and samples one token
//! per step once the input is fully forwarded.

use crate::evaluator::{Evaluator, Token};
use crate::session::config::{SessionConfig, SessionState};
use crate::session::history::TokenHistory;
use crate::session::prompt::{ChatPromptTemplate, PrimingPrefix};
use crate::session::queue::EmbeddingQueue;
use crate::session::SessionError;

pub struct ChatEngine<E> {
    eval: E,
    config: SessionConfig,
    state: SessionState,
    history: TokenHistory,
    queue: EmbeddingQueue,
    prefix: PrimingPrefix,
    template: ChatPromptTemplate,
}

impl<E: Evaluator> ChatEngine<E> {
    /// Primes a fresh chat: computes the priming prefix and the turn
    /// template, then folds the prefix into the evaluator's context without
    /// emitting anything.
    ///
    /// On error the evaluator is handed back so the session can stay loaded.
    pub fn start(eval: E, config: SessionConfig) -> Result<Self, (E, SessionError)> {
        let template = match ChatPromptTemplate::new(&eval) {
            Ok(t) => t,
            Err(e) => return Err((eval, e)),
        };
        let prefix = match PrimingPrefix::new(&eval, &config.system_prompt) {
            Ok(p) => p,
            Err(e) => return Err((eval, e)),
        };

        let n_ctx = eval.context_capacity();
        let mut engine = Self {
            eval,
            config,
            state: SessionState::default(),
            history: TokenHistory::new(n_ctx),
            queue: EmbeddingQueue::new(),
            prefix,
            template,
        };

        tracing::debug!(
            n_keep = engine.prefix.n_keep(),
            n_ctx,
            "priming chat context"
        );
        let prefix_tokens = engine.prefix.tokens().to_vec();
        engine.queue.produce(&prefix_tokens);
        while engine.queue.has_pending() {
            engine.consume_batch();
            if let Err(e) = engine.flush_ready() {
                let Self { eval, .. } = engine;
                return Err((eval, e));
            }
        }
        Ok(engine)
    }

    /// Queues one wrapped user turn and arms the predict budget.
    pub fn begin_turn(&mut self, text: &str) -> Result<(), SessionError> {
        let wrapped = self.template.wrap(&self.eval, text)?;
        self.state.n_remain = self.config.n_predict - wrapped.debit as i32;
        self.queue.produce(&wrapped.tokens);
        tracing::debug!(
            turn_tokens = wrapped.tokens.len(),
            n_remain = self.state.n_remain,
            "turn queued"
        );
        Ok(())
    }

    /// True while the current turn still has budget to generate.
    pub fn turn_active(&self) -> bool {
        self.state.can_remain()
    }

    /// Advances the loop by one step: forwards up to one batch of queued
    /// input, then samples at most one token.
    ///
    /// Returns `Ok(Some(id))` for an emitted token, `Ok(None)` when the step
    /// only forwarded input (or the turn is already done). An evaluator
    /// failure aborts the turn; state stays as last successfully updated.
    pub fn step(&mut self) -> Result<Option<Token>, SessionError> {
        if !self.state.can_remain() {
            return Ok(None);
        }

        if self.queue.has_pending() {
            self.consume_batch();
        }
        self.flush_ready()?;

        if self.queue.has_pending() {
            // more user input to forward before sampling resumes
            return Ok(None);
        }

        let recent = self.history.last_n(self.config.repeat_last_n.max(0) as usize);
        let params = self.config.sampling_params();
        let id = self.eval.sample(&recent, &params);
        self.history.push(id);
        // the sampled token is the next forward pass's input
        self.queue.push_ready(id);

        if id == self.eval.eos_token() {
            tracing::debug!("end of sequence");
            self.state.n_remain = 0;
        } else {
            self.state.n_remain -= 1;
        }
        Ok(Some(id))
    }

    /// Text piece for an emitted token, as raw bytes.
    pub fn piece(&self, token: Token) -> Vec<u8> {
        self.eval.token_to_bytes(token)
    }

    /// Hands the evaluator back, tearing the chat down.
    pub fn into_evaluator(self) -> E {
        self.eval
    }

    fn consume_batch(&mut self) {
        for _ in 0..self.config.n_batch {
            self.queue.consume_one();
        }
    }

    /// Evaluates everything scheduled in `ready`, evicting first if the
    /// batch would overflow the context window.
    fn flush_ready(&mut self) -> Result<(), SessionError> {
        if self.queue.ready_is_empty() {
            return Ok(());
        }
        self.evict_if_needed();

        let batch = self.queue.ready();
        self.eval
            .evaluate(batch, self.state.n_past, self.config.n_threads)
            .map_err(|e| SessionError::EvalFailure(e.to_string()))?;
        self.state.n_past += batch.len();
        self.queue.drain_ready();
        Ok(())
    }

    /// Infinite-generation context eviction.
    ///
    /// When the incoming batch would overflow `n_ctx`, resets the evaluator
    /// position to the keep-count anchor and re-seeds the most recent half of
    /// the discarded span from the history window, so the model keeps both
    /// the priming prefix and its short-term memory.
    fn evict_if_needed(&mut self) {
        let n_ctx = self.eval.context_capacity();
        let incoming = self.queue.ready().len();
        if self.state.n_past + incoming <= n_ctx {
            return;
        }

        let keep = self.prefix.n_keep();
        let n_left = self.state.n_past.saturating_sub(keep);
        self.state.n_past = keep;

        if incoming >= n_ctx {
            // degenerate oversized batch: nothing can be restored
            tracing::warn!(incoming, n_ctx, "batch exceeds context, skipping history re-seed");
            return;
        }

        let end = n_ctx - incoming;
        // never restore more than the window has room for on top of the
        // kept prefix and the incoming batch
        let max_restore = n_ctx.saturating_sub(keep + incoming);
        let start = end.saturating_sub((n_left / 2).min(max_restore));
        let restored = self.history.range(start, end);
        tracing::debug!(
            n_left,
            restored = restored.len(),
            n_past = self.state.n_past,
            "context window full, evicting"
        );
        self.queue.splice_ready_front(&restored);
    }

    #[cfg(test)]
    pub(crate) fn parts_mut(
        &mut self,
    ) -> (&mut SessionState, &mut TokenHistory, &mut EmbeddingQueue) {
        (&mut self.state, &mut self.history, &mut self.queue)
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &SessionState {
        &self.state
    }

    #[cfg(test)]
    pub(crate) fn evaluator(&self) -> &E {
        &self.eval
    }
}
