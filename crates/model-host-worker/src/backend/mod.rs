//! Inference backends the worker can load a model with.
//!
//! A backend turns a fully rendered prompt into a sequence of text pieces.
//! Stop sequences, streaming, and response framing are handled by the worker
//! loop; the backend only has to honor `max_tokens` and stop when the sink
//! asks it to.

use std::ops::ControlFlow;
use std::path::Path;

use anyhow::ensure;
use model_host_types::{BackendKind, ModelConfig};

pub mod mock;
#[cfg(feature = "llama")]
pub mod llama;

/// Receives each generated text piece; `Break` ends generation early.
pub type TokenSink<'a> = dyn FnMut(&str) -> anyhow::Result<ControlFlow<()>> + 'a;

/// Sampling parameters shared by completion and chat requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl SamplingParams {
    /// Reject parameters no backend can honor.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.max_tokens > 0, "max_tokens must be greater than 0");
        ensure!(
            self.temperature.is_finite() && self.temperature >= 0.0,
            "temperature must be a non-negative number, got {}",
            self.temperature
        );
        ensure!(
            self.top_p > 0.0 && self.top_p <= 1.0,
            "top_p must be in (0, 1], got {}",
            self.top_p
        );
        Ok(())
    }
}

/// Tokens consumed and produced by one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// A loaded model.
pub trait InferenceBackend {
    /// Short name for logs and the `ready` message.
    fn name(&self) -> &'static str;

    /// Generate a continuation of `prompt`, feeding each piece to `sink`.
    fn generate(
        &mut self,
        prompt: &str,
        params: &SamplingParams,
        sink: &mut TokenSink<'_>,
    ) -> anyhow::Result<TokenCounts>;

    /// Free the model's memory. On error the backend must stay usable.
    fn release(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Load `model_path` with the backend selected in `config`.
pub fn load_backend(
    model_path: &str,
    config: &ModelConfig,
) -> anyhow::Result<Box<dyn InferenceBackend>> {
    ensure!(
        Path::new(model_path).is_file(),
        "Model file not found: {model_path}"
    );

    match config.backend {
        BackendKind::Mock => Ok(Box::new(mock::MockBackend::load(model_path, config)?)),
        BackendKind::Llama => load_llama(model_path, config),
    }
}

#[cfg(feature = "llama")]
fn load_llama(model_path: &str, config: &ModelConfig) -> anyhow::Result<Box<dyn InferenceBackend>> {
    Ok(Box::new(llama::LlamaBackend::load(model_path, config)?))
}

#[cfg(not(feature = "llama"))]
fn load_llama(
    model_path: &str,
    _config: &ModelConfig,
) -> anyhow::Result<Box<dyn InferenceBackend>> {
    anyhow::bail!(
        "Cannot load {model_path}: this worker was built without the `llama` feature"
    )
}
