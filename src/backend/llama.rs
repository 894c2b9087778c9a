//! llama.cpp evaluator
//!
//! Adapts `llama-cpp-2` to the [`Evaluator`] contract. The context borrows
//! the model, so the model is heap-pinned for the evaluator's lifetime and
//! reclaimed in `Drop` after the context is gone.

use std::mem::ManuallyDrop;
use std::num::NonZeroU32;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use crate::evaluator::{EvalError, Evaluator, SamplingParams, Token};
use crate::model::probe_model_file;
use crate::session::SessionConfig;

pub struct LlamaEvaluator {
    // invariant: ctx is dropped before the model it borrows
    ctx: ManuallyDrop<LlamaContext<'static>>,
    model: *mut LlamaModel,
    _backend: LlamaBackend,
    n_ctx: usize,
    seed: u32,
    /// Highest KV position written so far; lets us invalidate the cache tail
    /// when the session rewinds `n_past` during context eviction.
    kv_pos: usize,
    /// Batch index whose logits are current after the last decode
    last_logits_idx: i32,
}

impl LlamaEvaluator {
    /// Opens the backend for a session. `progress` receives coarse
    /// fractional milestones; `llama-cpp-2` does not surface the native
    /// loader's per-tensor callback.
    pub fn open(config: &SessionConfig, progress: &dyn Fn(f32)) -> Result<Self, EvalError> {
        let header =
            probe_model_file(&config.model).map_err(|e| EvalError::Load(e.to_string()))?;
        tracing::debug!(
            version = header.version,
            tensors = header.tensor_count,
            "model header ok"
        );
        progress(0.0);

        let backend = LlamaBackend::init().map_err(|e| EvalError::Load(e.to_string()))?;

        let model_params = LlamaModelParams::default().with_use_mlock(config.use_mlock);
        if !config.memory_f16 {
            // f32 KV cache is no longer selectable through llama.cpp's
            // context params; the backend default applies
            tracing::warn!("memory_f16=false is ignored by the llama.cpp backend");
        }
        let model = LlamaModel::load_from_file(&backend, &config.model, &model_params)
            .map_err(|e| EvalError::Load(e.to_string()))?;
        progress(0.9);

        let model = Box::into_raw(Box::new(model));
        // the raw pointer outlives the context; freed in Drop after the
        // context is dropped
        let model_ref: &'static LlamaModel = unsafe { &*model };

        let n_ctx = NonZeroU32::new(config.n_ctx.max(1) as u32).unwrap();
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(config.n_batch.max(1) as u32)
            .with_n_threads(config.n_threads.max(1));

        let ctx = match model_ref.new_context(&backend, ctx_params) {
            Ok(ctx) => ctx,
            Err(e) => {
                unsafe { drop(Box::from_raw(model)) };
                return Err(EvalError::Load(e.to_string()));
            }
        };
        let n_ctx = ctx.n_ctx() as usize;
        progress(1.0);

        let seed = if config.seed < 0 {
            random_seed()
        } else {
            config.seed as u32
        };
        tracing::info!(n_ctx, seed, "llama context ready");

        Ok(Self {
            ctx: ManuallyDrop::new(ctx),
            model,
            _backend: backend,
            n_ctx,
            seed,
            kv_pos: 0,
            last_logits_idx: 0,
        })
    }

    fn model(&self) -> &LlamaModel {
        unsafe { &*self.model }
    }
}

impl Evaluator for LlamaEvaluator {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, EvalError> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        let tokens = self
            .model()
            .str_to_token(text, add_bos)
            .map_err(|e| EvalError::Tokenize(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn context_capacity(&self) -> usize {
        self.n_ctx
    }

    fn evaluate(&mut self, tokens: &[Token], n_past: usize, _n_threads: i32) -> Result<(), EvalError> {
        if tokens.is_empty() {
            return Ok(());
        }
        if n_past < self.kv_pos {
            // the session rewound its position: forget the cache tail so the
            // re-seeded history is decoded fresh
            self.ctx
                .clear_kv_cache_seq(Some(0), Some(n_past as u32), None)
                .map_err(|e| EvalError::Eval(e.to_string()))?;
        }

        let mut batch = LlamaBatch::new(tokens.len(), 1);
        for (i, &token) in tokens.iter().enumerate() {
            let is_last = i + 1 == tokens.len();
            batch
                .add(LlamaToken(token), (n_past + i) as i32, &[0], is_last)
                .map_err(|e| EvalError::Eval(e.to_string()))?;
        }
        self.ctx
            .decode(&mut batch)
            .map_err(|e| EvalError::Eval(e.to_string()))?;

        self.kv_pos = n_past + tokens.len();
        self.last_logits_idx = batch.n_tokens() - 1;
        Ok(())
    }

    fn sample(&mut self, recent: &[Token], params: &SamplingParams) -> Token {
        let mut sampler = if params.temp < 0.01 {
            LlamaSampler::greedy()
        } else {
            LlamaSampler::chain_simple([
                LlamaSampler::penalties(recent.len() as i32, params.repeat_penalty, 0.0, 0.0),
                LlamaSampler::top_k(params.top_k),
                LlamaSampler::top_p(params.top_p, 1),
                LlamaSampler::temp(params.temp),
                LlamaSampler::dist(self.seed),
            ])
        };
        // replay the recency window so the penalty sampler sees it
        for &token in recent {
            sampler.accept(LlamaToken(token));
        }
        sampler.sample(&self.ctx, self.last_logits_idx).0
    }

    fn token_to_bytes(&self, token: Token) -> Vec<u8> {
        self.model()
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .unwrap_or_default()
    }

    fn eos_token(&self) -> Token {
        self.model().token_eos().0
    }
}

impl Drop for LlamaEvaluator {
    fn drop(&mut self) {
        unsafe {
            ManuallyDrop::drop(&mut self.ctx);
            drop(Box::from_raw(self.model));
        }
    }
}

/// Random seed from system entropy.
fn random_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
