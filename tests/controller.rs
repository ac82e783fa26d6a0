//! Controller against the real worker binary running the mock backend.

use std::time::{Duration, Instant};

use model_host::types::{ChatMessage, ChatRequest, CompletionRequest};
use model_host::{
    BackendKind, Controller, Generation, ModelConfig, ProcessState, RequestError, RuntimeConfig,
    StartError, Timeouts, WorkerLauncher,
};
use tempfile::NamedTempFile;

fn worker_launcher() -> WorkerLauncher {
    WorkerLauncher::program(env!("CARGO_BIN_EXE_model-host-worker"))
}

fn runtime() -> RuntimeConfig {
    RuntimeConfig::default().with_launcher(worker_launcher())
}

fn mock_model() -> NamedTempFile {
    tempfile::Builder::new()
        .prefix("tiny-mistral-")
        .suffix(".gguf")
        .tempfile()
        .unwrap()
}

fn mock_config() -> ModelConfig {
    ModelConfig::default().with_backend(BackendKind::Mock)
}

fn started() -> (Controller, NamedTempFile) {
    let model = mock_model();
    let mut controller = Controller::new(runtime());
    controller
        .start(&model.path().to_string_lossy(), &mock_config())
        .unwrap();
    (controller, model)
}

#[test]
fn test_start_then_ping() {
    let (mut controller, _model) = started();
    assert_eq!(controller.state(), ProcessState::Ready);
    assert!(controller.pid().is_some());
    assert!(controller.ping());

    let stats = controller.stats();
    assert!(stats.is_ready);
    assert!(stats.is_alive);
    assert_eq!(stats.request_count, 1);
}

#[test]
fn test_missing_model_fails_start_with_worker_message() {
    let mut controller = Controller::new(runtime());
    let err = controller.start("bad/path.gguf", &mock_config()).unwrap_err();
    match &err {
        StartError::Worker { error, .. } => {
            assert_eq!(error, "Model file not found: bad/path.gguf");
        }
        other => panic!("unexpected start error: {other:?}"),
    }
    assert_eq!(controller.state(), ProcessState::Error);
    assert!(!controller.stats().is_alive);

    let err = controller.ping();
    assert!(!err);
    controller.shutdown();
    assert_eq!(controller.state(), ProcessState::Stopped);
}

#[test]
fn test_complete_hello() {
    let (mut controller, _model) = started();
    let request = CompletionRequest::new("Hello")
        .with_max_tokens(16)
        .with_temperature(0.7);
    let text = controller.complete(request).unwrap().text().unwrap();
    assert_eq!(text, "Hello! I'm a mock assistant. How can I help you today?");

    let stats = controller.stats();
    assert_eq!(stats.request_count, 1);
    // 1 prompt word + 11 reply words.
    assert_eq!(stats.total_tokens, 12);
}

#[test]
fn test_stream_matches_plain_text() {
    let (mut controller, _model) = started();
    let request = CompletionRequest::new("count please").with_max_tokens(32);

    let plain = controller.complete(request.clone()).unwrap().text().unwrap();

    let generation = controller.complete(request.with_stream(true)).unwrap();
    assert!(generation.is_stream());
    let Generation::Stream(stream) = generation else {
        unreachable!()
    };
    let tokens: Vec<String> = stream.map(Result::unwrap).collect();
    assert_eq!(tokens.len(), 10);
    assert_eq!(tokens.concat(), plain);
    assert_eq!(plain, "1 2 3 4 5 6 7 8 9 10");
}

#[test]
fn test_streamed_tokens_are_counted() {
    let (mut controller, _model) = started();
    let before = controller.stats().total_tokens;
    let text = controller
        .complete(CompletionRequest::new("count").with_stream(true))
        .unwrap()
        .text()
        .unwrap();
    assert_eq!(text, "1 2 3 4 5 6 7 8 9 10");
    assert_eq!(controller.stats().total_tokens, before + 10);
}

#[test]
fn test_abandoned_stream_does_not_leak_into_next_request() {
    let (mut controller, _model) = started();
    {
        let Generation::Stream(mut stream) = controller
            .complete(CompletionRequest::new("count").with_stream(true))
            .unwrap()
        else {
            panic!("expected a stream");
        };
        assert_eq!(stream.next().unwrap().unwrap(), "1 ");
    }
    let text = controller
        .complete(CompletionRequest::new("Hello").with_max_tokens(2))
        .unwrap()
        .text()
        .unwrap();
    assert_eq!(text, "Hello! I'm ");
}

#[test]
fn test_two_sequential_chats() {
    let (mut controller, _model) = started();
    let first = controller
        .chat(ChatRequest::new(vec![ChatMessage::user("Hello there")]))
        .unwrap()
        .text()
        .unwrap();
    let second = controller
        .chat(ChatRequest::new(vec![
            ChatMessage::system("Be brief."),
            ChatMessage::user("Can you count?"),
        ]))
        .unwrap()
        .text()
        .unwrap();
    assert_eq!(first, "Hello! I'm a mock assistant. How can I help you today?");
    assert_eq!(second, "1 2 3 4 5 6 7 8 9 10");
    assert_eq!(controller.stats().request_count, 2);
}

#[test]
fn test_model_error_keeps_worker_usable() {
    let (mut controller, _model) = started();
    let err = controller
        .complete(CompletionRequest::new("x").with_top_p(2.0))
        .err()
        .unwrap();
    match err {
        RequestError::Model { error, .. } => assert!(error.contains("top_p")),
        other => panic!("unexpected error: {other:?}"),
    }
    let err = controller
        .chat(ChatRequest::new(vec![]).with_stream(true))
        .err()
        .unwrap();
    assert!(matches!(err, RequestError::Model { .. }));
    assert!(controller.ping());
}

#[test]
fn test_stream_matched_in_tail_position_under_a_lock() {
    let (controller, _model) = started();
    let controller = std::sync::Mutex::new(controller);
    let tokens = {
        let mut guard = controller.lock().unwrap();
        match guard.complete(CompletionRequest::new("count").with_stream(true)) {
            Ok(Generation::Stream(stream)) => stream.count(),
            Ok(Generation::Text(_)) | Err(_) => 0,
        }
    };
    assert_eq!(tokens, 10);
}

#[test]
fn test_unbounded_timeouts_do_not_overflow() {
    let model = mock_model();
    let timeouts = Timeouts {
        startup: Duration::MAX,
        request: Duration::MAX,
        stream_start: Duration::MAX,
        token: Duration::MAX,
        ping: Duration::MAX,
        ..Timeouts::default()
    };
    let mut controller = Controller::new(runtime().with_timeouts(timeouts));
    controller
        .start(&model.path().to_string_lossy(), &mock_config())
        .unwrap();
    assert!(controller.ping());
    let text = controller
        .complete(CompletionRequest::new("count").with_stream(true))
        .unwrap()
        .text()
        .unwrap();
    assert_eq!(text, "1 2 3 4 5 6 7 8 9 10");
}

#[test]
fn test_shutdown_is_idempotent() {
    let (mut controller, _model) = started();
    let grace = controller.config().timeouts.shutdown_grace;
    let started_at = Instant::now();
    controller.shutdown();
    assert!(started_at.elapsed() <= grace + Duration::from_secs(1));
    assert_eq!(controller.state(), ProcessState::Stopped);
    assert!(!controller.stats().is_alive);
    assert!(!controller.stats().is_ready);

    controller.shutdown();
    assert_eq!(controller.state(), ProcessState::Stopped);
    assert!(matches!(
        controller.complete(CompletionRequest::new("Hello")),
        Err(RequestError::NotReady(ProcessState::Stopped))
    ));
}

#[cfg(unix)]
mod fake_workers {
    use super::*;

    fn sh_controller(script: &str, timeouts: Timeouts) -> Controller {
        let launcher = WorkerLauncher::program("sh").with_arg("-c").with_arg(script);
        Controller::new(
            RuntimeConfig::default()
                .with_launcher(launcher)
                .with_timeouts(timeouts),
        )
    }

    fn short_timeouts() -> Timeouts {
        Timeouts {
            startup: Duration::from_millis(500),
            request: Duration::from_millis(500),
            stream_start: Duration::from_millis(500),
            token: Duration::from_millis(500),
            ping: Duration::from_millis(300),
            shutdown_grace: Duration::from_millis(300),
            poll_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_silent_worker_trips_startup_timeout() {
        let mut controller = sh_controller("exec sleep 30", short_timeouts());
        let started_at = Instant::now();
        let err = controller.start("m.gguf", &mock_config()).unwrap_err();
        assert!(matches!(err, StartError::Timeout(_)), "{err:?}");
        assert!(started_at.elapsed() < Duration::from_secs(10));
        assert_eq!(controller.state(), ProcessState::Error);
        assert!(!controller.stats().is_alive);
    }

    #[test]
    fn test_exit_before_ready_surfaces_stderr() {
        let mut controller = sh_controller(
            "echo 'cuda: no device found' >&2; exit 3",
            short_timeouts(),
        );
        let err = controller.start("m.gguf", &mock_config()).unwrap_err();
        match err {
            StartError::ExitedBeforeReady { status, stderr } => {
                assert_eq!(status.and_then(|s| s.code()), Some(3));
                assert!(stderr.contains("cuda: no device found"), "{stderr}");
            }
            other => panic!("unexpected start error: {other:?}"),
        }
    }

    #[test]
    fn test_silent_request_trips_request_timeout() {
        // Ready, then never answers.
        let script = r#"echo '{"type":"ready"}'; exec sleep 30"#;
        let mut controller = sh_controller(script, short_timeouts());
        controller.start("m.gguf", &mock_config()).unwrap();

        let err = controller
            .complete(CompletionRequest::new("Hello"))
            .err()
            .unwrap();
        assert!(err.is_timeout(), "{err:?}");
        assert!(!controller.ping());

        controller.shutdown();
        assert!(!controller.stats().is_alive);
    }

    #[test]
    fn test_crash_mid_request_is_reported() {
        let script = r#"echo '{"type":"ready"}'; read line; echo 'segfault' >&2; exit 139"#;
        let mut controller = sh_controller(script, short_timeouts());
        controller.start("m.gguf", &mock_config()).unwrap();

        let err = controller
            .complete(CompletionRequest::new("Hello"))
            .err()
            .unwrap();
        match err {
            RequestError::WorkerExited { status, stderr } => {
                assert_eq!(status.and_then(|s| s.code()), Some(139));
                assert!(stderr.contains("segfault"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn open_stream(controller: &mut Controller) -> model_host::TokenStream<'_> {
        match controller.complete(CompletionRequest::new("Hello").with_stream(true)) {
            Ok(Generation::Stream(stream)) => stream,
            Ok(Generation::Text(text)) => panic!("expected a stream, got {text:?}"),
            Err(e) => panic!("stream did not open: {e:?}"),
        }
    }

    #[test]
    fn test_missing_stream_start_trips_stream_start_timeout() {
        let script = r#"echo '{"type":"ready"}'; read line; exec sleep 30"#;
        let timeouts = Timeouts {
            stream_start: Duration::from_millis(300),
            request: Duration::from_secs(30),
            ..short_timeouts()
        };
        let mut controller = sh_controller(script, timeouts);
        controller.start("m.gguf", &mock_config()).unwrap();

        let started_at = Instant::now();
        let err = controller
            .complete(CompletionRequest::new("Hello").with_stream(true))
            .err()
            .unwrap();
        assert!(started_at.elapsed() < Duration::from_secs(10));
        match err {
            RequestError::Timeout { operation, after } => {
                assert_eq!(operation, "stream start");
                assert_eq!(after, Duration::from_millis(300));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_stalled_stream_trips_token_timeout() {
        let script = r#"echo '{"type":"ready"}'; read line
echo '{"type":"stream_start"}'
echo '{"type":"stream_token","token":"Hel"}'
exec sleep 30"#;
        let mut controller = sh_controller(script, short_timeouts());
        controller.start("m.gguf", &mock_config()).unwrap();

        let mut stream = open_stream(&mut controller);
        assert_eq!(stream.next().unwrap().unwrap(), "Hel");
        let err = stream.next().unwrap().unwrap_err();
        assert!(err.is_timeout(), "{err:?}");
        assert!(stream.next().is_none());
        drop(stream);
        assert_eq!(controller.stats().total_tokens, 1);
    }

    #[test]
    fn test_worker_error_ends_stream() {
        let script = r#"echo '{"type":"ready"}'; read line
echo '{"type":"stream_start"}'
echo '{"type":"stream_token","token":"Hel"}'
echo '{"type":"error","error":"CUDA out of memory"}'
exec sleep 30"#;
        let mut controller = sh_controller(script, short_timeouts());
        controller.start("m.gguf", &mock_config()).unwrap();

        let mut stream = open_stream(&mut controller);
        assert_eq!(stream.next().unwrap().unwrap(), "Hel");
        match stream.next() {
            Some(Err(RequestError::Model { error, .. })) => assert_eq!(error, "CUDA out of memory"),
            other => panic!("unexpected item: {other:?}"),
        }
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_worker_without_ids_is_still_understood() {
        // Answers every request line with an id-less completion.
        let script = r#"echo '{"type":"ready"}'; while read line; do echo '{"type":"completion","text":"legacy"}'; done"#;
        let mut controller = sh_controller(script, short_timeouts());
        controller.start("m.gguf", &mock_config()).unwrap();
        let text = controller
            .complete(CompletionRequest::new("Hello"))
            .unwrap()
            .text()
            .unwrap();
        assert_eq!(text, "legacy");
    }
}
