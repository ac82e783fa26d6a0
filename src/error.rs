use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

use crate::worker::ProcessState;

/// Why a worker could not be brought to `Ready`.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("worker program not found: {}", .0.display())]
    ProgramNotFound(PathBuf),
    #[error("cannot start a worker from state {0}")]
    InvalidState(ProcessState),
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to encode model config: {0}")]
    Config(#[source] serde_json::Error),
    /// The worker reported a load failure.
    #[error("{error}")]
    Worker {
        error: String,
        traceback: Option<String>,
    },
    #[error("worker exited before ready ({}){}", describe_status(.status), stderr_suffix(.stderr))]
    ExitedBeforeReady {
        status: Option<ExitStatus>,
        stderr: String,
    },
    #[error("worker not ready after {0:?}")]
    Timeout(Duration),
    #[error("start task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Why a request to a running worker failed.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("worker is not ready (state: {0})")]
    NotReady(ProcessState),
    #[error("timed out after {after:?} waiting for {operation}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    /// The worker answered with an `error` message.
    #[error("{error}")]
    Model {
        error: String,
        traceback: Option<String>,
    },
    #[error("worker exited ({}){}", describe_status(.status), stderr_suffix(.stderr))]
    WorkerExited {
        status: Option<ExitStatus>,
        stderr: String,
    },
    #[error("worker pipe I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("unexpected `{got}` response to `{request}`")]
    UnexpectedResponse {
        request: &'static str,
        got: &'static str,
    },
    #[error("request task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl RequestError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestError::Timeout { .. })
    }

    /// Worker-side traceback, when the worker sent one.
    pub fn traceback(&self) -> Option<&str> {
        match self {
            RequestError::Model { traceback, .. } => traceback.as_deref(),
            _ => None,
        }
    }
}

fn describe_status(status: &Option<ExitStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "exit status unknown".to_string(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!("; stderr:\n{}", stderr.trim_end())
    }
}
