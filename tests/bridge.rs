//! Async bridge over a mock-backed worker.

use model_host::types::{ChatMessage, ChatRequest, CompletionRequest};
use model_host::{
    BackendKind, Controller, ModelConfig, ProcessState, RuntimeConfig, WorkerBridge,
    WorkerLauncher,
};

async fn started_bridge() -> (WorkerBridge, tempfile::NamedTempFile) {
    let model = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
    let runtime = RuntimeConfig::default()
        .with_launcher(WorkerLauncher::program(env!("CARGO_BIN_EXE_model-host-worker")));
    let bridge = WorkerBridge::new(Controller::new(runtime));
    bridge
        .start(
            model.path().to_string_lossy().to_string(),
            ModelConfig::default().with_backend(BackendKind::Mock),
        )
        .await
        .unwrap();
    (bridge, model)
}

#[tokio::test]
async fn test_bridge_round_trip() {
    let (bridge, _model) = started_bridge().await;
    assert_eq!(bridge.state().await, ProcessState::Ready);
    assert!(bridge.ping().await);

    let text = bridge
        .chat(ChatRequest::new(vec![ChatMessage::user("hello")]))
        .await
        .unwrap();
    assert_eq!(text, "Hello! I'm a mock assistant. How can I help you today?");

    bridge.shutdown().await;
    assert_eq!(bridge.state().await, ProcessState::Stopped);
    assert!(!bridge.stats().await.is_alive);
}

#[tokio::test]
async fn test_bridge_stream() {
    let (bridge, _model) = started_bridge().await;
    let mut rx = bridge.complete_stream(CompletionRequest::new("count"));
    let mut tokens = Vec::new();
    while let Some(token) = rx.recv().await {
        tokens.push(token.unwrap());
    }
    assert_eq!(tokens.len(), 10);
    assert_eq!(tokens.concat(), "1 2 3 4 5 6 7 8 9 10");
    assert_eq!(bridge.stats().await.total_tokens, 10);
}

#[tokio::test]
async fn test_concurrent_callers_are_serialized() {
    let (bridge, _model) = started_bridge().await;
    let a = bridge.clone();
    let b = bridge.clone();
    let (first, second) = tokio::join!(
        a.complete(CompletionRequest::new("count")),
        b.complete(CompletionRequest::new("hello")),
    );
    assert_eq!(first.unwrap(), "1 2 3 4 5 6 7 8 9 10");
    assert_eq!(
        second.unwrap(),
        "Hello! I'm a mock assistant. How can I help you today?"
    );
    assert_eq!(bridge.stats().await.request_count, 2);
}
