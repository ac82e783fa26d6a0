//! Async facade over [`Controller`] for tokio callers.
//!
//! Every call runs the blocking controller API on the blocking pool and holds
//! the controller lock for the whole request, stream included, so concurrent
//! callers are serialized.

use std::sync::Arc;

use model_host_types::{ChatRequest, CompletionRequest, ModelConfig};
use tokio::sync::{mpsc, Mutex as TokioMutex};

use super::controller::{Controller, ProcessState, Stats};
use super::token_stream::Generation;
use crate::error::{RequestError, StartError};

/// Tokens buffered between the blocking reader and the async consumer.
const STREAM_BUFFER: usize = 64;

/// Cloneable handle to one controller.
#[derive(Clone)]
pub struct WorkerBridge {
    controller: Arc<TokioMutex<Controller>>,
}

impl WorkerBridge {
    pub fn new(controller: Controller) -> Self {
        Self {
            controller: Arc::new(TokioMutex::new(controller)),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, tokio::task::JoinError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Controller) -> T + Send + 'static,
    {
        let controller = self.controller.clone();
        tokio::task::spawn_blocking(move || f(&mut controller.blocking_lock())).await
    }

    pub async fn start(&self, model_path: String, config: ModelConfig) -> Result<(), StartError> {
        self.blocking(move |c| c.start(&model_path, &config)).await?
    }

    /// Completion text; a streaming request is collected.
    pub async fn complete(&self, request: CompletionRequest) -> Result<String, RequestError> {
        self.blocking(move |c| c.complete(request).and_then(Generation::text))
            .await?
    }

    pub async fn chat(&self, request: ChatRequest) -> Result<String, RequestError> {
        self.blocking(move |c| c.chat(request).and_then(Generation::text))
            .await?
    }

    /// Stream a completion. The receiver yields tokens until the stream ends;
    /// an error is delivered as the last item.
    pub fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> mpsc::Receiver<Result<String, RequestError>> {
        let request = request.with_stream(true);
        self.stream(move |c| c.complete(request))
    }

    pub fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> mpsc::Receiver<Result<String, RequestError>> {
        let request = request.with_stream(true);
        self.stream(move |c| c.chat(request))
    }

    fn stream<F>(&self, run: F) -> mpsc::Receiver<Result<String, RequestError>>
    where
        F: for<'c> FnOnce(&'c mut Controller) -> Result<Generation<'c>, RequestError>
            + Send
            + 'static,
    {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let controller = self.controller.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = controller.blocking_lock();
            match run(&mut guard) {
                Ok(Generation::Stream(stream)) => {
                    for item in stream {
                        // Receiver gone: dropping the stream abandons the request.
                        if tx.blocking_send(item).is_err() {
                            break;
                        }
                    }
                }
                Ok(Generation::Text(text)) => {
                    let _ = tx.blocking_send(Ok(text));
                }
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                }
            };
        });
        rx
    }

    pub async fn ping(&self) -> bool {
        self.blocking(Controller::ping).await.unwrap_or(false)
    }

    pub async fn stats(&self) -> Stats {
        self.blocking(Controller::stats).await.unwrap_or_default()
    }

    pub async fn state(&self) -> ProcessState {
        self.controller.lock().await.state()
    }

    pub async fn shutdown(&self) {
        let _ = self.blocking(Controller::shutdown).await;
    }
}
