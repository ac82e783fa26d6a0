// Mock backend for exercising the worker protocol without a real model.
// Replies are canned and deterministic so streamed and non-streamed runs of
// the same request produce identical text.

use std::path::Path;

use anyhow::ensure;
use log::debug;
use model_host_types::ModelConfig;

use super::{InferenceBackend, SamplingParams, TokenCounts, TokenSink};

/// Canned replies: (keyword in lowercased prompt, reply).
const MOCK_REPLIES: &[(&str, &str)] = &[
    ("hello", "Hello! I'm a mock assistant. How can I help you today?"),
    ("help", "I'm running in mock mode, so my answers are simulated."),
    ("count", "1 2 3 4 5 6 7 8 9 10"),
];

const DEFAULT_REPLY: &str = "This is a mock response from the model host worker.";

pub struct MockBackend {
    model_name: String,
}

impl MockBackend {
    pub fn load(model_path: &str, _config: &ModelConfig) -> anyhow::Result<Self> {
        let path = Path::new(model_path);
        ensure!(path.exists(), "Model file not found: {model_path}");
        ensure!(
            path.extension().is_some_and(|ext| ext == "gguf"),
            "Only .gguf model files are supported"
        );

        let model_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        debug!("[MOCK] Loaded {model_name}");
        Ok(Self { model_name })
    }

    fn reply_for(prompt: &str) -> &'static str {
        let lower = prompt.to_lowercase();
        MOCK_REPLIES
            .iter()
            .find(|(keyword, _)| lower.contains(keyword))
            .map(|(_, reply)| *reply)
            .unwrap_or(DEFAULT_REPLY)
    }
}

impl InferenceBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn generate(
        &mut self,
        prompt: &str,
        params: &SamplingParams,
        sink: &mut TokenSink<'_>,
    ) -> anyhow::Result<TokenCounts> {
        let prompt_tokens = prompt.split_whitespace().count() as u32;
        let mut completion_tokens = 0;

        // One "token" per word, trailing space included.
        for piece in Self::reply_for(prompt).split_inclusive(' ') {
            if completion_tokens >= params.max_tokens {
                break;
            }
            completion_tokens += 1;
            if sink(piece)?.is_break() {
                break;
            }
        }

        debug!(
            "[MOCK] {}: {prompt_tokens} prompt tokens, {completion_tokens} generated",
            self.model_name
        );
        Ok(TokenCounts {
            prompt_tokens,
            completion_tokens,
        })
    }
}
