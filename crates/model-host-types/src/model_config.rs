//! Per-model configuration handed to the worker once, at spawn time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::chat_format::{ChatFormat, ChatFormatRules};

/// Inference implementation the worker loads the model with.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// llama.cpp through `llama-cpp-2` (worker built with the `llama` feature).
    #[default]
    Llama,
    /// Deterministic canned generator for tests and smoke runs.
    Mock,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [BackendKind::Llama, BackendKind::Mock];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Llama => "llama",
            BackendKind::Mock => "mock",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown backend: {0} (expected llama or mock)")]
pub struct UnknownBackend(pub String);

impl FromStr for BackendKind {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        BackendKind::ALL
            .into_iter()
            .find(|b| b.as_str() == wanted)
            .ok_or_else(|| UnknownBackend(s.to_string()))
    }
}

/// Immutable model settings, serialized as the worker's last argv entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// Context window size in tokens.
    pub n_ctx: u32,
    /// Layers offloaded to the GPU.
    pub n_gpu_layers: u32,
    /// Inference threads; `None` lets the backend decide.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_threads: Option<u32>,
    /// Debug-level worker diagnostics on stderr.
    pub verbose: bool,
    /// Explicit chat template; inferred from the file name when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_format: Option<ChatFormat>,
    pub backend: BackendKind,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_ctx: 2048,
            n_gpu_layers: 0,
            n_threads: None,
            verbose: false,
            chat_format: None,
            backend: BackendKind::default(),
        }
    }
}

impl ModelConfig {
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_chat_format(mut self, chat_format: ChatFormat) -> Self {
        self.chat_format = Some(chat_format);
        self
    }

    pub fn with_n_ctx(mut self, n_ctx: u32) -> Self {
        self.n_ctx = n_ctx;
        self
    }

    pub fn with_n_gpu_layers(mut self, n_gpu_layers: u32) -> Self {
        self.n_gpu_layers = n_gpu_layers;
        self
    }

    pub fn with_n_threads(mut self, n_threads: u32) -> Self {
        self.n_threads = Some(n_threads);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// The explicit chat format, or the one `rules` infer from `model_path`.
    pub fn resolve_chat_format(&self, model_path: &str, rules: &ChatFormatRules) -> ChatFormat {
        self.chat_format.unwrap_or_else(|| rules.resolve(model_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_names() {
        for backend in BackendKind::ALL {
            assert_eq!(backend.as_str().parse::<BackendKind>().unwrap(), backend);
            let json = serde_json::to_string(&backend).unwrap();
            assert_eq!(json, format!("\"{}\"", backend.as_str()));
        }
        assert_eq!(" Mock".parse::<BackendKind>().unwrap(), BackendKind::Mock);
        assert!("onnx".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_empty_object_is_default() {
        let config = ModelConfig::from_json("{}").unwrap();
        assert_eq!(config, ModelConfig::default());
        assert_eq!(config.backend, BackendKind::Llama);
    }

    #[test]
    fn test_json_round_trip_names() {
        let config = ModelConfig::default()
            .with_backend(BackendKind::Mock)
            .with_chat_format(ChatFormat::Llama3)
            .with_n_threads(4);
        let json = config.to_json().unwrap();
        assert!(json.contains("\"backend\":\"mock\""));
        assert!(json.contains("\"chat_format\":\"llama-3\""));
        assert_eq!(ModelConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_explicit_chat_format_wins() {
        let rules = ChatFormatRules::default();
        let inferred = ModelConfig::default();
        assert_eq!(
            inferred.resolve_chat_format("gemma-2b.gguf", &rules),
            ChatFormat::Gemma
        );
        let explicit = ModelConfig::default().with_chat_format(ChatFormat::Alpaca);
        assert_eq!(
            explicit.resolve_chat_format("gemma-2b.gguf", &rules),
            ChatFormat::Alpaca
        );
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert!(ModelConfig::from_json(r#"{"backend":"onnx"}"#).is_err());
    }
}
