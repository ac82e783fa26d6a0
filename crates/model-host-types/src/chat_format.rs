//! Chat prompt formats and filename-based format detection.
//!
//! Detection uses lookup tables instead of if-else chains: an ordered list of
//! `(substring, format)` rules matched against the lowercased model file name,
//! first match wins. The table is a value, so callers can extend or replace it.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ipc_types::{ChatMessage, Role};

/// Prompt templating convention a model expects.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatFormat {
    #[serde(rename = "chatml")]
    ChatMl,
    #[serde(rename = "llama-2")]
    Llama2,
    #[serde(rename = "llama-3")]
    Llama3,
    #[serde(rename = "mistral-instruct")]
    MistralInstruct,
    #[serde(rename = "gemma")]
    Gemma,
    #[serde(rename = "phi-3")]
    Phi3,
    #[serde(rename = "zephyr")]
    Zephyr,
    #[serde(rename = "vicuna")]
    Vicuna,
    #[serde(rename = "alpaca")]
    Alpaca,
}

/// Format used when no rule matches.
pub const FALLBACK_CHAT_FORMAT: ChatFormat = ChatFormat::ChatMl;

const VICUNA_SYSTEM: &str =
    "A chat between a curious user and an artificial intelligence assistant.";

/// Default detection rules: (pattern_to_match, format). Order matters:
/// fine-tunes named after their base model are listed before the base.
pub const DEFAULT_CHAT_FORMAT_RULES: &[(&str, ChatFormat)] = &[
    ("llama-3", ChatFormat::Llama3),
    ("llama3", ChatFormat::Llama3),
    ("openhermes", ChatFormat::ChatMl),
    ("hermes", ChatFormat::ChatMl),
    ("dolphin", ChatFormat::ChatMl),
    ("zephyr", ChatFormat::Zephyr),
    ("codellama", ChatFormat::Llama2),
    ("llama-2", ChatFormat::Llama2),
    ("llama2", ChatFormat::Llama2),
    ("mixtral", ChatFormat::MistralInstruct),
    ("mistral", ChatFormat::MistralInstruct),
    ("gemma", ChatFormat::Gemma),
    ("phi-3", ChatFormat::Phi3),
    ("phi3", ChatFormat::Phi3),
    ("qwen", ChatFormat::ChatMl),
    ("vicuna", ChatFormat::Vicuna),
    ("alpaca", ChatFormat::Alpaca),
];

impl ChatFormat {
    pub const ALL: [ChatFormat; 9] = [
        ChatFormat::ChatMl,
        ChatFormat::Llama2,
        ChatFormat::Llama3,
        ChatFormat::MistralInstruct,
        ChatFormat::Gemma,
        ChatFormat::Phi3,
        ChatFormat::Zephyr,
        ChatFormat::Vicuna,
        ChatFormat::Alpaca,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChatFormat::ChatMl => "chatml",
            ChatFormat::Llama2 => "llama-2",
            ChatFormat::Llama3 => "llama-3",
            ChatFormat::MistralInstruct => "mistral-instruct",
            ChatFormat::Gemma => "gemma",
            ChatFormat::Phi3 => "phi-3",
            ChatFormat::Zephyr => "zephyr",
            ChatFormat::Vicuna => "vicuna",
            ChatFormat::Alpaca => "alpaca",
        }
    }

    /// End-of-turn markers that terminate an assistant reply in this format.
    pub fn stop_sequences(self) -> &'static [&'static str] {
        match self {
            ChatFormat::ChatMl => &["<|im_end|>"],
            ChatFormat::Llama2 => &["[INST]"],
            ChatFormat::Llama3 => &["<|eot_id|>"],
            ChatFormat::MistralInstruct => &["</s>", "[INST]"],
            ChatFormat::Gemma => &["<end_of_turn>"],
            ChatFormat::Phi3 => &["<|end|>"],
            ChatFormat::Zephyr => &["</s>"],
            ChatFormat::Vicuna => &["USER:"],
            ChatFormat::Alpaca => &["### Instruction:"],
        }
    }

    /// Render a conversation into a prompt that ends where the assistant's
    /// next reply begins.
    pub fn render(self, messages: &[ChatMessage]) -> String {
        match self {
            ChatFormat::ChatMl => {
                render_tagged(messages, "<|im_start|>", "\n", "<|im_end|>\n", "assistant")
            }
            ChatFormat::Llama3 => {
                let mut p = String::from("<|begin_of_text|>");
                for m in messages {
                    p.push_str("<|start_header_id|>");
                    p.push_str(m.role.as_str());
                    p.push_str("<|end_header_id|>\n\n");
                    p.push_str(&m.content);
                    p.push_str("<|eot_id|>");
                }
                p.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
                p
            }
            ChatFormat::Llama2 => render_inst(messages, true),
            ChatFormat::MistralInstruct => render_inst(messages, false),
            ChatFormat::Gemma => {
                // Gemma has no system role: the system prompt prefixes the first user turn.
                let (system, turns) = split_system(messages);
                let mut prefix = system.map(|s| format!("{s}\n\n")).unwrap_or_default();
                let mut p = String::new();
                for m in turns {
                    let role = match m.role {
                        Role::Assistant => "model",
                        _ => "user",
                    };
                    p.push_str("<start_of_turn>");
                    p.push_str(role);
                    p.push('\n');
                    if m.role == Role::User {
                        p.push_str(&std::mem::take(&mut prefix));
                    }
                    p.push_str(&m.content);
                    p.push_str("<end_of_turn>\n");
                }
                p.push_str("<start_of_turn>model\n");
                p
            }
            ChatFormat::Phi3 => {
                let mut p = String::new();
                for m in messages {
                    p.push_str(&format!("<|{}|>\n{}<|end|>\n", m.role.as_str(), m.content));
                }
                p.push_str("<|assistant|>\n");
                p
            }
            ChatFormat::Zephyr => {
                let mut p = String::new();
                for m in messages {
                    p.push_str(&format!("<|{}|>\n{}</s>\n", m.role.as_str(), m.content));
                }
                p.push_str("<|assistant|>\n");
                p
            }
            ChatFormat::Vicuna => {
                let (system, turns) = split_system(messages);
                let mut p = system.unwrap_or(VICUNA_SYSTEM).to_string();
                p.push_str("\n\n");
                for m in turns {
                    match m.role {
                        Role::Assistant => p.push_str(&format!("ASSISTANT: {}</s>\n", m.content)),
                        _ => p.push_str(&format!("USER: {}\n", m.content)),
                    }
                }
                p.push_str("ASSISTANT:");
                p
            }
            ChatFormat::Alpaca => {
                let (system, turns) = split_system(messages);
                let mut p = system.map(|s| format!("{s}\n\n")).unwrap_or_default();
                for m in turns {
                    match m.role {
                        Role::Assistant => p.push_str(&format!("### Response:\n{}\n\n", m.content)),
                        _ => p.push_str(&format!("### Instruction:\n{}\n\n", m.content)),
                    }
                }
                p.push_str("### Response:\n");
                p
            }
        }
    }
}

/// `<open>role<sep>content<close>` per message, then an open assistant turn.
fn render_tagged(
    messages: &[ChatMessage],
    open: &str,
    sep: &str,
    close: &str,
    reply_role: &str,
) -> String {
    let mut p = String::new();
    for m in messages {
        p.push_str(open);
        p.push_str(m.role.as_str());
        p.push_str(sep);
        p.push_str(&m.content);
        p.push_str(close);
    }
    p.push_str(open);
    p.push_str(reply_role);
    p.push_str(sep);
    p
}

/// `[INST]`-style formats. Llama 2 wraps the system prompt in `<<SYS>>`,
/// Mistral simply prepends it to the first user turn.
fn render_inst(messages: &[ChatMessage], llama2: bool) -> String {
    let (system, turns) = split_system(messages);
    let mut prefix = match (system, llama2) {
        (Some(s), true) => format!("<<SYS>>\n{s}\n<</SYS>>\n\n"),
        (Some(s), false) => format!("{s}\n\n"),
        (None, _) => String::new(),
    };

    let mut p = String::from("<s>");
    for m in turns {
        match m.role {
            Role::Assistant => {
                p.push(' ');
                p.push_str(&m.content);
                p.push_str(" </s><s>");
            }
            _ => {
                p.push_str("[INST] ");
                p.push_str(&std::mem::take(&mut prefix));
                p.push_str(&m.content);
                p.push_str(" [/INST]");
            }
        }
    }
    p
}

/// Pull the first system message out of a conversation.
fn split_system(messages: &[ChatMessage]) -> (Option<&str>, impl Iterator<Item = &ChatMessage>) {
    let system = messages
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| m.content.as_str());
    (system, messages.iter().filter(|m| m.role != Role::System))
}

impl fmt::Display for ChatFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown chat format name.
#[derive(Debug, thiserror::Error)]
#[error("unknown chat format: {0}")]
pub struct UnknownChatFormat(pub String);

impl FromStr for ChatFormat {
    type Err = UnknownChatFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        ChatFormat::ALL
            .into_iter()
            .find(|f| f.as_str() == wanted)
            .ok_or_else(|| UnknownChatFormat(s.to_string()))
    }
}

/// Ordered, overridable filename → chat format strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatFormatRules {
    rules: Vec<(String, ChatFormat)>,
    fallback: ChatFormat,
}

impl Default for ChatFormatRules {
    fn default() -> Self {
        Self {
            rules: DEFAULT_CHAT_FORMAT_RULES
                .iter()
                .map(|(pattern, format)| (pattern.to_string(), *format))
                .collect(),
            fallback: FALLBACK_CHAT_FORMAT,
        }
    }
}

impl ChatFormatRules {
    /// A rule set with no rules at all; everything resolves to `fallback`.
    pub fn empty(fallback: ChatFormat) -> Self {
        Self {
            rules: Vec::new(),
            fallback,
        }
    }

    /// Add a rule that takes precedence over every existing rule.
    pub fn with_rule(mut self, pattern: impl Into<String>, format: ChatFormat) -> Self {
        self.rules.insert(0, (pattern.into().to_lowercase(), format));
        self
    }

    /// Add a rule consulted after every existing rule.
    pub fn push(&mut self, pattern: impl Into<String>, format: ChatFormat) {
        self.rules.push((pattern.into().to_lowercase(), format));
    }

    /// First rule whose pattern occurs in the model's file name.
    pub fn detect(&self, model_path: &str) -> Option<ChatFormat> {
        let file_name = Path::new(model_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| model_path.to_lowercase());
        self.rules
            .iter()
            .find(|(pattern, _)| file_name.contains(pattern.as_str()))
            .map(|(_, format)| *format)
    }

    /// Detected format, or the fallback.
    pub fn resolve(&self, model_path: &str) -> ChatFormat {
        self.detect(model_path).unwrap_or(self.fallback)
    }
}
