//! Host-side controller for one worker process.
//!
//! Owns the child process and its response dispatcher, drives the lifecycle
//! state machine, and turns requests into blocking waits with timeouts.
//! Every wait polls the worker's liveness between channel receives, so a
//! crashed worker is reported within one poll interval instead of at the
//! timeout.

use std::fmt;
use std::time::{Duration, Instant};

use crossbeam_channel::Select;
use log::{debug, error, info, warn};
use model_host_types::{
    encode_line, ChatRequest, CompletionRequest, ModelConfig, RequestEnvelope, RequestId,
    RequestMessage, ResponseMessage,
};
use serde::Serialize;

use super::dispatcher::{Dispatcher, Route};
use super::process_manager::{deadline_after, next_wait, ProcessManager};
use super::token_stream::{Generation, TokenStream};
use crate::config::RuntimeConfig;
use crate::error::{RequestError, StartError};

/// Lifecycle of the worker process.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Starting,
    Ready,
    Error,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::NotStarted => "not_started",
            ProcessState::Starting => "starting",
            ProcessState::Ready => "ready",
            ProcessState::Error => "error",
            ProcessState::ShuttingDown => "shutting_down",
            ProcessState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Snapshot of a controller's counters.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct Stats {
    /// Time since the worker became ready.
    #[serde(serialize_with = "serialize_secs")]
    pub uptime: Duration,
    pub request_count: u64,
    pub total_tokens: u64,
    pub is_ready: bool,
    pub is_alive: bool,
}

fn serialize_secs<S: serde::Serializer>(
    value: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

/// Controls one worker process. Requests take `&mut self`: one request (or
/// one open stream) at a time.
pub struct Controller {
    config: RuntimeConfig,
    state: ProcessState,
    model_path: Option<String>,
    process: Option<ProcessManager>,
    dispatcher: Option<Dispatcher>,
    next_id: RequestId,
    ready_at: Option<Instant>,
    request_count: u64,
    total_tokens: u64,
}

impl Controller {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            state: ProcessState::NotStarted,
            model_path: None,
            process: None,
            dispatcher: None,
            next_id: 1,
            ready_at: None,
            request_count: 0,
            total_tokens: 0,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn model_path(&self) -> Option<&str> {
        self.model_path.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ProcessManager::pid)
    }

    /// Spawn the worker for `model_path` and block until it reports `ready`.
    pub fn start(&mut self, model_path: &str, config: &ModelConfig) -> Result<(), StartError> {
        if self.state != ProcessState::NotStarted {
            return Err(StartError::InvalidState(self.state));
        }
        self.model_path = Some(model_path.to_string());
        self.state = ProcessState::Starting;

        match self.launch(model_path, config) {
            Ok(()) => {
                self.state = ProcessState::Ready;
                self.ready_at = Some(Instant::now());
                info!(
                    "[CONTROLLER] Worker ready (pid={})",
                    self.pid().unwrap_or_default()
                );
                Ok(())
            }
            Err(e) => {
                error!("[CONTROLLER] Worker failed to start: {e}");
                self.teardown();
                self.state = ProcessState::Error;
                Err(e)
            }
        }
    }

    fn launch(&mut self, model_path: &str, config: &ModelConfig) -> Result<(), StartError> {
        let config_json = config.to_json().map_err(StartError::Config)?;
        let mut process = ProcessManager::spawn(
            &self.config.launcher,
            model_path,
            &config_json,
            self.config.stderr_tail_lines,
        )?;
        let stdout = process.take_stdout().ok_or_else(|| {
            StartError::Spawn(std::io::Error::other("worker stdout was not captured"))
        })?;
        let dispatcher = Dispatcher::spawn(stdout).map_err(StartError::Spawn)?;
        self.process = Some(process);
        self.dispatcher = Some(dispatcher);
        self.wait_until_ready()
    }

    fn wait_until_ready(&mut self) -> Result<(), StartError> {
        let timeouts = self.config.timeouts;
        let deadline = deadline_after(timeouts.startup);
        let (Some(process), Some(dispatcher)) = (self.process.as_mut(), self.dispatcher.as_ref())
        else {
            return Err(StartError::InvalidState(self.state));
        };

        loop {
            let Some(wait) = next_wait(deadline, timeouts.poll_interval) else {
                return Err(StartError::Timeout(timeouts.startup));
            };
            match dispatcher.unsolicited().recv_timeout(wait) {
                Ok(ResponseMessage::Loading { message }) => {
                    info!(
                        "[CONTROLLER] Worker loading: {}",
                        message.as_deref().unwrap_or("model")
                    );
                }
                Ok(ResponseMessage::Ready { message }) => {
                    info!("[CONTROLLER] {}", message.as_deref().unwrap_or("Model loaded"));
                    return Ok(());
                }
                Ok(ResponseMessage::Error { error, traceback }) => {
                    return Err(StartError::Worker { error, traceback });
                }
                Ok(other) => debug!("[CONTROLLER] Ignoring `{}` during startup", other.kind()),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if let Some(status) = process.try_wait() {
                        return Err(StartError::ExitedBeforeReady {
                            status: Some(status),
                            stderr: process.final_stderr_tail(),
                        });
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    let status =
                        process.wait_timeout(timeouts.shutdown_grace, timeouts.poll_interval);
                    return Err(StartError::ExitedBeforeReady {
                        status,
                        stderr: process.final_stderr_tail(),
                    });
                }
            }
        }
    }

    /// Run a completion. With `stream` set the answer is a [`TokenStream`].
    pub fn complete(&mut self, request: CompletionRequest) -> Result<Generation<'_>, RequestError> {
        let stream = request.stream;
        let route = self.send(RequestMessage::Completion(request))?;
        if stream {
            return self.open_stream(route, "completion");
        }
        match self.wait_response(&route, self.config.timeouts.request, "completion")? {
            ResponseMessage::Completion { text, usage } => {
                self.total_tokens += u64::from(usage.total_tokens);
                Ok(Generation::Text(text))
            }
            other => Err(unexpected("completion", other)),
        }
    }

    /// Run a chat turn. With `stream` set the answer is a [`TokenStream`].
    pub fn chat(&mut self, request: ChatRequest) -> Result<Generation<'_>, RequestError> {
        let stream = request.stream;
        let route = self.send(RequestMessage::Chat(request))?;
        if stream {
            return self.open_stream(route, "chat");
        }
        match self.wait_response(&route, self.config.timeouts.request, "chat")? {
            ResponseMessage::ChatCompletion { message, usage } => {
                self.total_tokens += u64::from(usage.total_tokens);
                Ok(Generation::Text(message.content))
            }
            other => Err(unexpected("chat", other)),
        }
    }

    fn open_stream(
        &mut self,
        route: Route,
        request: &'static str,
    ) -> Result<Generation<'_>, RequestError> {
        let timeout = self.config.timeouts.stream_start;
        let first = self.wait_response(&route, timeout, "stream start")?;
        match first {
            ResponseMessage::StreamStart => Ok(Generation::Stream(TokenStream::new(self, route))),
            other => Err(unexpected(request, other)),
        }
    }

    /// Health check. Never fails: any error or timeout is `false`.
    pub fn ping(&mut self) -> bool {
        if self.state != ProcessState::Ready {
            return false;
        }
        let result = self.send(RequestMessage::Ping).and_then(|route| {
            self.wait_response(&route, self.config.timeouts.ping, "pong")
        });
        match result {
            Ok(ResponseMessage::Pong { .. }) => true,
            Ok(other) => {
                debug!("[CONTROLLER] Ping answered with `{}`", other.kind());
                false
            }
            Err(e) => {
                debug!("[CONTROLLER] Ping failed: {e}");
                false
            }
        }
    }

    pub fn stats(&mut self) -> Stats {
        let is_alive = self.process.as_mut().is_some_and(ProcessManager::is_alive);
        Stats {
            uptime: self.ready_at.map(|t| t.elapsed()).unwrap_or_default(),
            request_count: self.request_count,
            total_tokens: self.total_tokens,
            is_ready: self.state == ProcessState::Ready && is_alive,
            is_alive,
        }
    }

    /// Stop the worker: `unload`, close stdin, wait out the grace period,
    /// then kill. Safe to call any number of times.
    pub fn shutdown(&mut self) {
        match self.state {
            ProcessState::Stopped => return,
            ProcessState::NotStarted => {
                self.state = ProcessState::Stopped;
                return;
            }
            _ => {}
        }
        self.state = ProcessState::ShuttingDown;
        let timeouts = self.config.timeouts;
        let id = self.next_request_id();

        if let Some(process) = self.process.as_mut() {
            if process.is_alive() {
                info!("[CONTROLLER] Shutting down worker (pid={})", process.pid());
                let unload = encode_line(&RequestEnvelope::new(id, RequestMessage::Unload));
                if let Ok(line) = unload {
                    if let Err(e) = process.write_line(&line) {
                        debug!("[CONTROLLER] Could not send unload: {e}");
                    }
                }
                process.close_stdin();
                match process.wait_timeout(timeouts.shutdown_grace, timeouts.poll_interval) {
                    Some(status) => info!("[CONTROLLER] Worker exited ({status})"),
                    None => {
                        warn!(
                            "[CONTROLLER] Worker did not exit within {:?}",
                            timeouts.shutdown_grace
                        );
                        process.kill();
                    }
                }
            }
        }
        self.teardown();
        self.state = ProcessState::Stopped;
    }

    fn teardown(&mut self) {
        self.ready_at = None;
        if let Some(mut process) = self.process.take() {
            process.kill();
        }
        self.dispatcher = None;
    }

    fn next_request_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Register a route for a fresh id and write the request.
    fn send(&mut self, message: RequestMessage) -> Result<Route, RequestError> {
        if self.state != ProcessState::Ready {
            return Err(RequestError::NotReady(self.state));
        }
        let id = self.next_request_id();
        let kind = message.kind();
        let line = encode_line(&RequestEnvelope::new(id, message))?;
        let (Some(process), Some(dispatcher)) = (self.process.as_mut(), self.dispatcher.as_ref())
        else {
            return Err(RequestError::NotReady(self.state));
        };

        let route = dispatcher.register(id);
        if let Err(e) = process.write_line(&line) {
            if !process.is_alive() || e.kind() == std::io::ErrorKind::BrokenPipe {
                return Err(worker_exited(process, self.config.timeouts.poll_interval));
            }
            return Err(RequestError::Io(e));
        }
        self.request_count += 1;
        debug!("[CONTROLLER] Sent {kind} request {id}");
        Ok(route)
    }

    /// Wait for the next response on `route`, polling liveness in between.
    pub(crate) fn wait_response(
        &mut self,
        route: &Route,
        timeout: Duration,
        operation: &'static str,
    ) -> Result<ResponseMessage, RequestError> {
        let poll = self.config.timeouts.poll_interval;
        let (Some(process), Some(dispatcher)) = (self.process.as_mut(), self.dispatcher.as_ref())
        else {
            return Err(RequestError::NotReady(self.state));
        };
        let unsolicited = dispatcher.unsolicited();
        let deadline = deadline_after(timeout);

        loop {
            let Some(wait) = next_wait(deadline, poll) else {
                return Err(RequestError::Timeout {
                    operation,
                    after: timeout,
                });
            };

            let mut select = Select::new();
            let routed = select.recv(route.receiver());
            let other = select.recv(unsolicited);
            let Ok(op) = select.select_timeout(wait) else {
                if !process.is_alive() {
                    return Err(worker_exited(process, poll));
                }
                continue;
            };

            let received = if op.index() == routed {
                op.recv(route.receiver())
            } else {
                debug_assert_eq!(op.index(), other);
                op.recv(unsolicited)
            };
            let message = match received {
                Ok(message) => message,
                Err(_) => return Err(worker_exited(process, poll)),
            };
            match message {
                ResponseMessage::Error { error, traceback } => {
                    return Err(RequestError::Model { error, traceback });
                }
                ResponseMessage::Loading { .. } | ResponseMessage::Ready { .. } => {}
                ResponseMessage::Shutdown { message } => warn!(
                    "[CONTROLLER] Worker is shutting down: {}",
                    message.as_deref().unwrap_or("no reason given")
                ),
                // A worker that does not echo ids answers on the unsolicited
                // queue; with one request in flight that answer is ours.
                message => return Ok(message),
            }
        }
    }

    pub(crate) fn add_streamed_token(&mut self) {
        self.total_tokens += 1;
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn unexpected(request: &'static str, got: ResponseMessage) -> RequestError {
    RequestError::UnexpectedResponse {
        request,
        got: got.kind(),
    }
}

fn worker_exited(process: &mut ProcessManager, poll: Duration) -> RequestError {
    // stdout closes a moment before the exit status is available.
    let status = process.wait_timeout(poll * 10, poll);
    let stderr = process.final_stderr_tail();
    error!("[CONTROLLER] Worker exited unexpectedly ({status:?})");
    RequestError::WorkerExited { status, stderr }
}
