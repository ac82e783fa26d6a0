//! Host runtime configuration: how to launch the worker and how long to wait
//! for it.
//!
//! Every field has a default, so an empty JSON object is a valid config file.
//! A few settings can also be overridden from the environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Overrides the worker program.
pub const ENV_WORKER: &str = "MODEL_HOST_WORKER";
/// Overrides `timeouts.startup`, in seconds.
pub const ENV_STARTUP_TIMEOUT: &str = "MODEL_HOST_STARTUP_TIMEOUT_SECS";
/// Overrides `timeouts.request`, in seconds.
pub const ENV_REQUEST_TIMEOUT: &str = "MODEL_HOST_REQUEST_TIMEOUT_SECS";

/// File name of the worker binary built alongside the host.
pub const WORKER_BIN_NAME: &str = "model-host-worker";

const DEFAULT_STDERR_TAIL_LINES: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {var}: {value:?} (expected seconds)")]
    Env { var: &'static str, value: String },
}

/// Wait limits for each phase of a worker's life.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct Timeouts {
    /// Spawn until `ready`.
    #[serde(with = "duration_secs")]
    pub startup: Duration,
    /// Non-streaming request until its answer.
    #[serde(with = "duration_secs")]
    pub request: Duration,
    /// Streaming request until `stream_start`.
    #[serde(with = "duration_secs")]
    pub stream_start: Duration,
    /// Between consecutive stream tokens.
    #[serde(with = "duration_secs")]
    pub token: Duration,
    #[serde(with = "duration_secs")]
    pub ping: Duration,
    /// After `unload` and closing stdin, before the worker is killed.
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,
    /// How often a blocked wait checks whether the worker is still alive.
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(60),
            request: Duration::from_secs(120),
            stream_start: Duration::from_secs(10),
            token: Duration::from_secs(120),
            ping: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// How to start a worker: program, leading arguments, environment and
/// working directory. The model path and JSON config are appended to `args`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct WorkerLauncher {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub current_dir: Option<PathBuf>,
}

impl Default for WorkerLauncher {
    fn default() -> Self {
        Self::program(default_worker_program())
    }
}

impl WorkerLauncher {
    pub fn program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            current_dir: None,
        }
    }

    /// Run `script` with `interpreter`.
    pub fn interpreter(interpreter: impl Into<PathBuf>, script: impl Into<String>) -> Self {
        Self::program(interpreter).with_arg(script)
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Command line `[program, args..., model_path, config_json]` with piped stdio.
    pub fn command(&self, program: &Path, model_path: &str, config_json: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(&self.args)
            .arg(model_path)
            .arg(config_json)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Locate `program`: paths are checked as given, bare names are looked
    /// up on `PATH`.
    pub fn resolve_program(&self) -> Option<PathBuf> {
        let program = &self.program;
        if program.components().count() > 1 || program.is_absolute() {
            let candidate = match &self.current_dir {
                Some(dir) if program.is_relative() => dir.join(program),
                _ => program.clone(),
            };
            return candidate.is_file().then_some(candidate);
        }
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    }
}

/// `model-host-worker` next to the running executable.
fn default_worker_program() -> PathBuf {
    let name = format!("{WORKER_BIN_NAME}{}", std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
        .unwrap_or_else(|| PathBuf::from(name))
}

/// Everything the host needs besides the per-model config.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub launcher: WorkerLauncher,
    pub timeouts: Timeouts,
    /// Worker stderr lines kept for error reports.
    pub stderr_tail_lines: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            launcher: WorkerLauncher::default(),
            timeouts: Timeouts::default(),
            stderr_tail_lines: DEFAULT_STDERR_TAIL_LINES,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults or the given file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        config.with_env_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides looked up through `lookup` (normally the process
    /// environment).
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(worker) = lookup(ENV_WORKER).filter(|v| !v.is_empty()) {
            self.launcher.program = PathBuf::from(worker);
        }
        if let Some(secs) = env_secs(&lookup, ENV_STARTUP_TIMEOUT)? {
            self.timeouts.startup = secs;
        }
        if let Some(secs) = env_secs(&lookup, ENV_REQUEST_TIMEOUT)? {
            self.timeouts.request = secs;
        }
        Ok(self)
    }

    pub fn with_launcher(mut self, launcher: WorkerLauncher) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

fn env_secs<F>(lookup: &F, var: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .map(Some)
        .ok_or(ConfigError::Env { var, value })
}

/// Durations as (fractional) seconds on the wire.
mod duration_secs {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| D::Error::custom(format!("invalid duration {secs}: {e}")))
    }
}
