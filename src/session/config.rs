//! Session configuration and run-state cursors

use crate::evaluator::SamplingParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("n_keep ({n_keep}) must not exceed n_ctx ({n_ctx})")]
    KeepExceedsContext { n_keep: i32, n_ctx: i32 },

    #[error("n_batch must be at least 1")]
    ZeroBatch,

    #[error("n_ctx must be at least 1")]
    ZeroContext,

    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Run parameters, fixed for the lifetime of a loaded session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// RNG seed; a negative value picks a random seed at load time
    pub seed: i64,
    pub n_threads: i32,
    /// New tokens to predict per turn
    pub n_predict: i32,
    /// Last n tokens the sampler penalizes for repetition
    pub repeat_last_n: i32,
    /// Context window size requested from the backend
    pub n_ctx: i32,

    // sampling parameters
    pub top_k: i32,
    pub top_p: f32,
    pub temp: f32,
    pub repeat_penalty: f32,

    /// Batch size for prompt processing
    pub n_batch: i32,
    /// Leading tokens preserved across context eviction; superseded by the
    /// priming-prefix length once a chat is started
    pub n_keep: i32,

    /// Path to the model file
    pub model: PathBuf,
    /// System preamble evaluated once when the chat starts
    pub system_prompt: String,

    /// Use f16 instead of f32 for the KV cache
    pub memory_f16: bool,
    /// mlock the model weights in memory
    pub use_mlock: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            seed: -1,
            n_threads: std::thread::available_parallelism()
                .map(|n| (n.get() / 2).max(1) as i32)
                .unwrap_or(4),
            n_predict: 128,
            repeat_last_n: 64,
            n_ctx: 512,
            top_k: 40,
            top_p: 0.95,
            temp: 0.80,
            repeat_penalty: 1.30,
            n_batch: 8,
            n_keep: 0,
            model: PathBuf::from("models/llama-7B/ggml-model.bin"),
            system_prompt: "Below is an instruction that describes a task. \
                            Write a response that appropriately completes the request."
                .to_string(),
            memory_f16: true,
            use_mlock: false,
        }
    }
}

impl SessionConfig {
    /// Checks the structural invariants the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_ctx < 1 {
            return Err(ConfigError::ZeroContext);
        }
        if self.n_batch < 1 {
            return Err(ConfigError::ZeroBatch);
        }
        if self.n_keep < 0 || self.n_keep > self.n_ctx {
            return Err(ConfigError::KeepExceedsContext {
                n_keep: self.n_keep,
                n_ctx: self.n_ctx,
            });
        }
        Ok(())
    }

    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            top_k: self.top_k,
            top_p: self.top_p,
            temp: self.temp,
            repeat_penalty: self.repeat_penalty,
        }
    }

    /// Loads a config from a JSON file, clamping out-of-range sampling
    /// values. Missing fields fall back to defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&json)?;
        config.clamp();
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Default per-user config location, e.g.
    /// `~/.config/chatllama/config.json` on Linux.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "chatllama", "chatllama")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    fn clamp(&mut self) {
        self.temp = self.temp.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);
        if self.top_k <= 0 {
            self.top_k = 40;
        }
        if self.repeat_last_n < 0 {
            self.repeat_last_n = 0;
        }
        if self.n_threads < 1 {
            self.n_threads = 1;
        }
    }
}

/// Mutable cursors of a running session, single-writer on the worker.
#[derive(Debug, Default, Clone)]
pub struct SessionState {
    /// Tokens already folded into the evaluator's running context
    pub n_past: usize,
    /// Tokens left to generate in the current turn
    pub n_remain: i32,
}

impl SessionState {
    /// Generation continues only while the turn budget is positive.
    pub fn can_remain(&self) -> bool {
        self.n_remain > 0
    }
}
