//! Types shared by the model host and its worker process: the JSON Lines
//! wire protocol, per-model configuration, and chat prompt formats.

pub mod chat_format;
pub mod ipc_types;
pub mod model_config;

pub use chat_format::{ChatFormat, ChatFormatRules, DEFAULT_CHAT_FORMAT_RULES};
pub use ipc_types::*;
pub use model_config::{BackendKind, ModelConfig, UnknownBackend};
