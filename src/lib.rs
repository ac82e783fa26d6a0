//! Out-of-process model host.
//!
//! A [`Controller`] launches a dedicated worker process that loads one model
//! and answers completion and chat requests over JSON Lines on its
//! stdin/stdout. A crash, hang, or memory blowup in the model stays in the
//! worker; the host sees an error or a timeout.
//!
//! ```no_run
//! use model_host::{Controller, ModelConfig, RuntimeConfig};
//! use model_host::types::CompletionRequest;
//!
//! let mut controller = Controller::new(RuntimeConfig::load(None)?);
//! controller.start("models/phi-3-mini.gguf", &ModelConfig::default())?;
//! let text = controller
//!     .complete(CompletionRequest::new("Hello").with_max_tokens(16))?
//!     .text()?;
//! println!("{text}");
//! controller.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod worker;

/// Wire protocol and per-model configuration.
pub use model_host_types as types;

pub use config::{RuntimeConfig, Timeouts, WorkerLauncher};
pub use error::{RequestError, StartError};
pub use model_host_types::{BackendKind, ChatFormat, ModelConfig};
pub use worker::{Controller, Generation, ProcessState, Stats, TokenStream, WorkerBridge};
