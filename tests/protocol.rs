//! Wire-level tests: drive the worker binary over its pipes directly.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use model_host::types::{
    decode_response, BackendKind, ModelConfig, ResponseEnvelope, ResponseMessage,
};
use tempfile::NamedTempFile;

struct Worker {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    _model: NamedTempFile,
}

impl Worker {
    fn spawn() -> Self {
        let model = tempfile::Builder::new()
            .prefix("qwen-tiny-")
            .suffix(".gguf")
            .tempfile()
            .unwrap();
        let config = ModelConfig::default()
            .with_backend(BackendKind::Mock)
            .to_json()
            .unwrap();
        let mut child = Command::new(env!("CARGO_BIN_EXE_model-host-worker"))
            .arg(model.path())
            .arg(config)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let stdin = child.stdin.take();
        let stdout = BufReader::new(child.stdout.take().unwrap());
        let mut worker = Self {
            child,
            stdin,
            stdout,
            _model: model,
        };
        assert_eq!(worker.recv().message.kind(), "loading");
        let ready = worker.recv();
        match &ready.message {
            ResponseMessage::Ready { message } => {
                let message = message.as_deref().unwrap();
                assert!(message.contains("mock backend"), "{message}");
                assert!(message.contains("chatml"), "{message}");
            }
            other => panic!("expected ready, got {other:?}"),
        }
        worker
    }

    fn send(&mut self, line: &str) {
        let stdin = self.stdin.as_mut().unwrap();
        stdin.write_all(line.as_bytes()).unwrap();
        stdin.write_all(b"\n").unwrap();
        stdin.flush().unwrap();
    }

    fn recv(&mut self) -> ResponseEnvelope {
        let mut line = String::new();
        let n = self.stdout.read_line(&mut line).unwrap();
        assert!(n > 0, "worker closed stdout");
        decode_response(line.trim_end()).unwrap()
    }

    fn exit_code(mut self) -> Option<i32> {
        self.stdin = None;
        self.child.wait().unwrap().code()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn test_malformed_line_gets_one_error() {
    let mut worker = Worker::spawn();
    worker.send("{not json");
    worker.send(r#"{"type":"ping","id":1}"#);

    let error = worker.recv();
    assert_eq!(error.id, None);
    assert_eq!(error.message.kind(), "error");
    let pong = worker.recv();
    assert_eq!(pong.id, Some(1));
    assert_eq!(pong.message.kind(), "pong");
}

#[test]
fn test_completion_has_usage_and_text() {
    let mut worker = Worker::spawn();
    worker.send(r#"{"type":"completion","prompt":"Hello","max_tokens":16,"temperature":0.7,"top_p":0.95,"stop":null,"stream":false}"#);
    match worker.recv().message {
        ResponseMessage::Completion { text, usage } => {
            assert!(!text.is_empty());
            assert_eq!(usage.completion_tokens, 11);
            assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

#[test]
fn test_streaming_frames() {
    let mut worker = Worker::spawn();
    worker.send(r#"{"type":"chat","id":5,"messages":[{"role":"user","content":"count"}],"max_tokens":3,"temperature":0.7,"top_p":0.95,"stream":true}"#);
    let kinds: Vec<_> = (0..5).map(|_| worker.recv()).collect();
    assert!(kinds.iter().all(|e| e.id == Some(5)));
    let kinds: Vec<&str> = kinds.iter().map(|e| e.message.kind()).collect();
    assert_eq!(
        kinds,
        ["stream_start", "stream_token", "stream_token", "stream_token", "stream_end"]
    );
}

#[test]
fn test_unknown_type_is_rejected() {
    let mut worker = Worker::spawn();
    worker.send(r#"{"type":"load_model","id":2}"#);
    let reply = worker.recv();
    assert_eq!(reply.id, Some(2));
    assert_eq!(
        reply.message,
        ResponseMessage::Error {
            error: "unknown request type: load_model".into(),
            traceback: None
        }
    );
}

#[test]
fn test_unload_acknowledges_and_exits() {
    let mut worker = Worker::spawn();
    worker.send(r#"{"type":"unload"}"#);
    assert_eq!(worker.recv().message.kind(), "unload_success");
    assert_eq!(worker.exit_code(), Some(0));
}

#[test]
fn test_eof_exits_cleanly() {
    let worker = Worker::spawn();
    assert_eq!(worker.exit_code(), Some(0));
}

#[test]
fn test_bad_config_exits_with_status_2() {
    let output = Command::new(env!("CARGO_BIN_EXE_model-host-worker"))
        .arg("m.gguf")
        .arg("{not json")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    let stdout = String::from_utf8(output.stdout).unwrap();
    let reply = decode_response(stdout.trim_end()).unwrap();
    assert_eq!(reply.message.kind(), "error");
}

#[test]
fn test_missing_model_reports_then_exits_1() {
    let config = ModelConfig::default()
        .with_backend(BackendKind::Mock)
        .to_json()
        .unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_model-host-worker"))
        .arg("bad/path.gguf")
        .arg(config)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8(output.stdout).unwrap();
    let kinds: Vec<&'static str> = stdout
        .lines()
        .map(|l| decode_response(l).unwrap().message.kind())
        .collect();
    assert_eq!(kinds, ["loading", "error"]);
}
