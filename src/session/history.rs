//! Token history window
//!
//! Fixed-capacity recency buffer over everything that has passed through the
//! context: it feeds the sampler's repetition-penalty window and supplies the
//! recent-history slice re-seeded after a context eviction.

use crate::evaluator::Token;

/// Ring buffer of exactly `capacity` tokens, oldest first.
///
/// The window is zero-filled at creation and never resized; `push` overwrites
/// the oldest slot instead of shifting, so every push is O(1).
#[derive(Debug, Clone)]
pub struct TokenHistory {
    buf: Vec<Token>,
    head: usize,
}

impl TokenHistory {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "history capacity must be non-zero");
        Self {
            buf: vec![0; capacity],
            head: 0,
        }
    }

    /// Always equal to the capacity the window was created with.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Always `false`: the window is zero-filled at creation and holds
    /// exactly `capacity` slots for its whole life.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Drops the oldest token and appends `token` as the newest.
    pub fn push(&mut self, token: Token) {
        self.buf[self.head] = token;
        self.head = (self.head + 1) % self.buf.len();
    }

    /// Token at logical position `index`, 0 = oldest.
    pub fn get(&self, index: usize) -> Token {
        debug_assert!(index < self.buf.len());
        self.buf[(self.head + index) % self.buf.len()]
    }

    /// Tokens in logical positions `[start, end)`, oldest first.
    pub fn range(&self, start: usize, end: usize) -> Vec<Token> {
        debug_assert!(start <= end && end <= self.buf.len());
        (start..end).map(|i| self.get(i)).collect()
    }

    /// The `n` most recent tokens, oldest first. `n` is clamped to the
    /// window length.
    pub fn last_n(&self, n: usize) -> Vec<Token> {
        let n = n.min(self.buf.len());
        self.range(self.buf.len() - n, self.buf.len())
    }
}
