//! llama.cpp backend (`llama` feature).
//!
//! The model is loaded once; every request gets a fresh context so no KV
//! state leaks between requests.

use std::num::NonZeroU32;

use anyhow::{ensure, Context};
use llama_cpp_2::{
    context::params::LlamaContextParams,
    llama_backend::LlamaBackend as LlamaCppBackend,
    llama_batch::LlamaBatch,
    model::{params::LlamaModelParams, AddBos, LlamaModel, Special},
    sampling::LlamaSampler,
    send_logs_to_tracing, LogOptions,
};
use log::{debug, info, warn};
use model_host_types::ModelConfig;

use super::{InferenceBackend, SamplingParams, TokenCounts, TokenSink};

/// Prompt tokens decoded per batch.
const PROMPT_BATCH_CAP: usize = 512;

pub struct LlamaBackend {
    // Declared before `backend` so the model drops first.
    model: Option<LlamaModel>,
    backend: LlamaCppBackend,
    n_ctx: u32,
    n_threads: Option<u32>,
    seed: u32,
}

impl LlamaBackend {
    pub fn load(model_path: &str, config: &ModelConfig) -> anyhow::Result<Self> {
        let backend = LlamaCppBackend::init().context("Failed to init llama.cpp backend")?;
        if !config.verbose {
            // Route llama.cpp's own logging into `tracing`, which nothing
            // subscribes to here, instead of flooding stderr.
            send_logs_to_tracing(LogOptions::default());
        }

        let params = LlamaModelParams::default().with_n_gpu_layers(config.n_gpu_layers);
        info!(
            "[LLAMA] Loading {model_path} (n_ctx={}, gpu_layers={})",
            config.n_ctx, config.n_gpu_layers
        );
        let model = LlamaModel::load_from_file(&backend, model_path, &params)
            .with_context(|| format!("Failed to load model from {model_path}"))?;

        Ok(Self {
            model: Some(model),
            backend,
            n_ctx: config.n_ctx,
            n_threads: config.n_threads,
            seed: 1234,
        })
    }

    fn sampler(&self, params: &SamplingParams) -> LlamaSampler {
        if params.temperature <= 0.0 {
            return LlamaSampler::greedy();
        }
        LlamaSampler::chain_simple([
            LlamaSampler::top_p(params.top_p, 1),
            LlamaSampler::temp(params.temperature),
            LlamaSampler::dist(self.seed),
        ])
    }
}

impl InferenceBackend for LlamaBackend {
    fn name(&self) -> &'static str {
        "llama"
    }

    fn generate(
        &mut self,
        prompt: &str,
        params: &SamplingParams,
        sink: &mut TokenSink<'_>,
    ) -> anyhow::Result<TokenCounts> {
        let model = self.model.as_ref().context("Model has been released")?;
        let n_ctx = NonZeroU32::new(self.n_ctx).context("n_ctx must be non-zero")?;

        let mut ctx_params = LlamaContextParams::default().with_n_ctx(Some(n_ctx));
        if let Some(threads) = self.n_threads {
            let threads = i32::try_from(threads).unwrap_or(i32::MAX);
            ctx_params = ctx_params
                .with_n_threads(threads)
                .with_n_threads_batch(threads);
        }
        let mut context = model
            .new_context(&self.backend, ctx_params)
            .context("Context creation failed")?;

        let tokens = model
            .str_to_token(prompt, AddBos::Always)
            .context("Tokenization failed")?;
        ensure!(!tokens.is_empty(), "Prompt tokenized to zero tokens");
        ensure!(
            tokens.len() < self.n_ctx as usize,
            "Prompt is {} tokens but the context window is {}",
            tokens.len(),
            self.n_ctx
        );
        debug!("[LLAMA] Prompt tokenized to {} tokens", tokens.len());

        let last = tokens.len() - 1;
        let mut batch = LlamaBatch::new(PROMPT_BATCH_CAP, 1);
        for (chunk_idx, chunk) in tokens.chunks(PROMPT_BATCH_CAP).enumerate() {
            batch.clear();
            for (offset, &token) in chunk.iter().enumerate() {
                let pos = chunk_idx * PROMPT_BATCH_CAP + offset;
                batch
                    .add(token, pos as i32, &[0], pos == last)
                    .with_context(|| format!("Batch add failed at prompt token {pos}"))?;
            }
            context
                .decode(&mut batch)
                .with_context(|| format!("Prompt decode failed (chunk {})", chunk_idx + 1))?;
        }

        let budget = params
            .max_tokens
            .min(self.n_ctx - tokens.len() as u32);
        let mut sampler = self.sampler(params);
        let mut token_pos = tokens.len() as i32;
        let mut generated = 0u32;

        while generated < budget {
            let next_token = sampler.sample(&context, -1);
            if next_token == model.token_eos() {
                debug!("[LLAMA] EOS after {generated} tokens");
                break;
            }
            generated += 1;

            match model.token_to_str(next_token, Special::Tokenize) {
                Ok(piece) => {
                    if sink(&piece)?.is_break() {
                        break;
                    }
                }
                Err(e) => warn!("[LLAMA] Token {next_token:?} can't be displayed as UTF-8: {e}"),
            }

            batch.clear();
            batch
                .add(next_token, token_pos, &[0], true)
                .with_context(|| format!("Batch add failed at token {generated}"))?;
            context
                .decode(&mut batch)
                .with_context(|| format!("Decode failed at token {generated}"))?;
            token_pos += 1;
        }

        Ok(TokenCounts {
            prompt_tokens: tokens.len() as u32,
            completion_tokens: generated,
        })
    }

    fn release(&mut self) -> anyhow::Result<()> {
        self.model = None;
        Ok(())
    }
}
