//! Worker child process lifecycle.
//!
//! Owns the `Child`, its stdin, and a collector thread that drains stderr so
//! the pipe never fills while the model logs during load. The last few
//! stderr lines are kept for error reports.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, ExitStatus};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::WorkerLauncher;
use crate::error::StartError;

/// Log target for re-logged worker stderr.
pub const WORKER_STDERR_TARGET: &str = "model_host::worker_stderr";

/// How long to wait for the stderr collector to drain after the worker exits.
const STDERR_DRAIN_WAIT: Duration = Duration::from_secs(1);

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// Manages one worker child process.
pub struct ProcessManager {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_tail: StderrTail,
    stderr_thread: Option<JoinHandle<()>>,
    exit_status: Option<ExitStatus>,
}

impl ProcessManager {
    /// Spawn `[program, args..., model_path, config_json]`.
    pub fn spawn(
        launcher: &WorkerLauncher,
        model_path: &str,
        config_json: &str,
        stderr_tail_lines: usize,
    ) -> Result<Self, StartError> {
        let program = launcher
            .resolve_program()
            .ok_or_else(|| StartError::ProgramNotFound(launcher.program.clone()))?;

        info!(
            "[PROCESS_MGR] Spawning worker: {} {} {model_path}",
            program.display(),
            launcher.args.join(" ")
        );
        let mut child = launcher
            .command(&program, model_path, config_json)
            .spawn()
            .map_err(StartError::Spawn)?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr_tail: StderrTail = Arc::new(Mutex::new(VecDeque::new()));
        let stderr_thread = match child.stderr.take() {
            Some(stderr) => Some(spawn_stderr_collector(
                stderr,
                child.id(),
                stderr_tail.clone(),
                stderr_tail_lines,
            )),
            None => None,
        };
        debug!("[PROCESS_MGR] Worker pid={}", child.id());

        Ok(Self {
            child,
            stdin,
            stdout,
            stderr_tail,
            stderr_thread,
            exit_status: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Take the worker's stdout for the response dispatcher.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Write one protocol line and flush it.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin closed"))?;
        stdin.write_all(line.as_bytes())?;
        stdin.flush()
    }

    /// Close stdin; the worker sees EOF and exits its loop.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Non-blocking liveness probe. `Some` once the worker has exited.
    pub fn try_wait(&mut self) -> Option<ExitStatus> {
        if self.exit_status.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.exit_status = status,
                Err(e) => warn!("[PROCESS_MGR] try_wait failed: {e}"),
            }
        }
        self.exit_status
    }

    pub fn is_alive(&mut self) -> bool {
        self.try_wait().is_none()
    }

    /// Poll for exit for up to `timeout`.
    pub fn wait_timeout(&mut self, timeout: Duration, poll: Duration) -> Option<ExitStatus> {
        let deadline = deadline_after(timeout);
        loop {
            if let Some(status) = self.try_wait() {
                return Some(status);
            }
            thread::sleep(next_wait(deadline, poll)?);
        }
    }

    /// Kill the worker and reap it.
    pub fn kill(&mut self) -> Option<ExitStatus> {
        if let Some(status) = self.try_wait() {
            return Some(status);
        }
        warn!("[PROCESS_MGR] Killing worker process (pid={})", self.pid());
        self.stdin = None;
        if let Err(e) = self.child.kill() {
            warn!("[PROCESS_MGR] kill failed: {e}");
        }
        match self.child.wait() {
            Ok(status) => self.exit_status = Some(status),
            Err(e) => warn!("[PROCESS_MGR] wait failed: {e}"),
        }
        self.exit_status
    }

    /// Recent stderr lines, oldest first.
    pub fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap_or_else(PoisonError::into_inner);
        tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    /// Stderr tail after the worker has exited, once the collector has
    /// drained the pipe (bounded wait).
    pub fn final_stderr_tail(&mut self) -> String {
        if let Some(handle) = self.stderr_thread.take() {
            let deadline = Instant::now() + STDERR_DRAIN_WAIT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                // Something else still holds the pipe open; leave the thread.
                self.stderr_thread = Some(handle);
            }
        }
        self.stderr_tail()
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        self.kill();
    }
}

fn spawn_stderr_collector<R: Read + Send + 'static>(
    stderr: R,
    pid: u32,
    tail: StderrTail,
    max_lines: usize,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            let Ok(line) = line else { break };
            debug!(target: WORKER_STDERR_TARGET, "[worker {pid}] {line}");
            if max_lines == 0 {
                continue;
            }
            let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
            if tail.len() == max_lines {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    })
}

/// Deadline `timeout` from now; `None` when it lies past what `Instant` can
/// represent, i.e. never.
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// How long to block before the next liveness check: `poll`, cut short by
/// the deadline. `None` once the deadline has passed.
pub(crate) fn next_wait(deadline: Option<Instant>, poll: Duration) -> Option<Duration> {
    let Some(deadline) = deadline else {
        return Some(poll);
    };
    deadline
        .checked_duration_since(Instant::now())
        .filter(|left| !left.is_zero())
        .map(|left| poll.min(left))
}
