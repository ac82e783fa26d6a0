//! Worker process entry point.
//!
//! Runs as a child process spawned by the host controller. Loads one model,
//! then reads JSON requests from stdin and writes JSON responses to the
//! protocol stream, one line each. All log output goes to stderr.
//!
//! The loop is single-threaded: one request is decoded, served to completion
//! (all of its stream tokens included), then the next line is read.

use std::any::Any;
use std::io::{self, BufRead, Write};
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};

use anyhow::{anyhow, bail, Context};
use log::{debug, error, info, warn};
use model_host_types::{
    decode_request, ChatFormat, ChatFormatRules, ChatMessage, ChatRequest, CompletionRequest,
    ModelConfig, RequestId, RequestMessage, ResponseMessage, Usage,
};

use crate::backend::{load_backend, InferenceBackend, SamplingParams, TokenCounts};
use crate::stdio::{self, ProtocolWriter};
use crate::stop_conditions::{StopMatcher, StopStep};

/// Exit status for unusable arguments or config.
pub const EXIT_BAD_ARGS: i32 = 2;
/// Exit status when the model fails to load.
pub const EXIT_LOAD_FAILED: i32 = 1;

const MAX_TRACEBACK_CHARS: usize = 4000;

const USAGE: &str = "usage: model-host-worker <model_path> <config_json>";

/// Command line of a worker process.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerArgs {
    pub model_path: String,
    pub config: ModelConfig,
}

/// Parse `argv` (program name included). The last two arguments are the model
/// path and the JSON config; anything between the program name and those is
/// ignored so launchers can prepend their own arguments.
pub fn parse_args<I>(argv: I) -> anyhow::Result<WorkerArgs>
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = argv.into_iter().skip(1).collect();
    let [.., model_path, config_json] = args.as_slice() else {
        bail!("expected 2 arguments, got {}\n{USAGE}", args.len());
    };
    let config = ModelConfig::from_json(config_json).context("Invalid config JSON")?;
    Ok(WorkerArgs {
        model_path: model_path.clone(),
        config,
    })
}

/// Run the worker process and return its exit status.
pub fn run_worker() -> i32 {
    let out = match stdio::claim_protocol_stream() {
        Ok(out) => out,
        Err(e) => {
            eprintln!("[WORKER] Could not isolate protocol stream, using stdout: {e}");
            Box::new(io::stdout()) as Box<dyn Write + Send>
        }
    };
    stdio::install_signal_handlers();
    let mut writer = ProtocolWriter::new(out);

    let args = match parse_args(std::env::args()) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("[WORKER] {e:#}");
            let _ = writer.send(None, error_response(&e));
            return EXIT_BAD_ARGS;
        }
    };

    if let Err(e) = crate::logging::setup_logging(args.config.verbose) {
        eprintln!("[WORKER] Failed to set up logging: {e:#}");
    }
    info!(
        "[WORKER] Starting model worker process (pid={})",
        std::process::id()
    );

    let loading = ResponseMessage::Loading {
        message: Some(format!("Loading model: {}", args.model_path)),
    };
    if writer.send(None, loading).is_err() {
        return EXIT_LOAD_FAILED;
    }

    let chat_format = args
        .config
        .resolve_chat_format(&args.model_path, &ChatFormatRules::default());
    let backend = match load_backend(&args.model_path, &args.config) {
        Ok(backend) => backend,
        Err(e) => {
            error!("[WORKER] Model load failed: {e:#}");
            let _ = writer.send(None, error_response(&e));
            return EXIT_LOAD_FAILED;
        }
    };

    let ready = ResponseMessage::Ready {
        message: Some(format!(
            "Model loaded ({} backend, {chat_format} chat format)",
            backend.name()
        )),
    };
    if writer.send(None, ready).is_err() {
        return EXIT_LOAD_FAILED;
    }
    info!("[WORKER] Ready, waiting for requests...");

    let mut state = WorkerState::new(backend, chat_format);
    let stdin = io::stdin();
    match state.serve(stdin.lock(), &mut writer) {
        Ok(()) => 0,
        Err(e) => {
            error!("[WORKER] Protocol stream failed: {e}");
            1
        }
    }
}

/// A loaded model plus what the loop needs to serve it.
pub struct WorkerState {
    backend: Box<dyn InferenceBackend>,
    chat_format: ChatFormat,
    requests_served: u64,
}

impl WorkerState {
    pub fn new(backend: Box<dyn InferenceBackend>, chat_format: ChatFormat) -> Self {
        Self {
            backend,
            chat_format,
            requests_served: 0,
        }
    }

    /// Serve requests until EOF or a successful `unload`. Only failures to
    /// read input or write the protocol stream end the loop with an error.
    pub fn serve<R: BufRead, W: Write>(
        &mut self,
        mut input: R,
        writer: &mut ProtocolWriter<W>,
    ) -> io::Result<()> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if input.read_until(b'\n', &mut buf)? == 0 {
                info!("[WORKER] Stdin closed, exiting");
                return Ok(());
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let envelope = match decode_request(line) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("[WORKER] Rejected request line: {e}");
                    writer.send(e.id, ResponseMessage::error(e.to_string(), None))?;
                    continue;
                }
            };
            let id = envelope.id;
            debug!(
                "[WORKER] Request {} (id={id:?})",
                envelope.message.kind()
            );

            match envelope.message {
                RequestMessage::Completion(req) => self.handle_completion(id, req, writer)?,
                RequestMessage::Chat(req) => self.handle_chat(id, req, writer)?,
                RequestMessage::Ping => writer.send(
                    id,
                    ResponseMessage::Pong {
                        message: Some("pong".into()),
                    },
                )?,
                RequestMessage::Unload => {
                    if self.handle_unload(id, writer)? {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn handle_completion<W: Write>(
        &mut self,
        id: Option<RequestId>,
        req: CompletionRequest,
        writer: &mut ProtocolWriter<W>,
    ) -> io::Result<()> {
        let params = SamplingParams {
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            top_p: req.top_p,
        };
        let stops = req.stop_sequences().to_vec();
        let Some((text, counts)) =
            self.generate(id, &req.prompt, &params, stops, req.stream, writer)?
        else {
            return Ok(());
        };
        if !req.stream {
            writer.send(
                id,
                ResponseMessage::Completion {
                    text,
                    usage: usage(counts),
                },
            )?;
        }
        Ok(())
    }

    fn handle_chat<W: Write>(
        &mut self,
        id: Option<RequestId>,
        req: ChatRequest,
        writer: &mut ProtocolWriter<W>,
    ) -> io::Result<()> {
        if req.messages.is_empty() {
            return writer.send(
                id,
                ResponseMessage::error("messages must not be empty", None),
            );
        }
        let params = SamplingParams {
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            top_p: req.top_p,
        };
        let prompt = self.chat_format.render(&req.messages);
        let stops = self
            .chat_format
            .stop_sequences()
            .iter()
            .map(|s| s.to_string())
            .collect();
        let Some((text, counts)) = self.generate(id, &prompt, &params, stops, req.stream, writer)?
        else {
            return Ok(());
        };
        if !req.stream {
            writer.send(
                id,
                ResponseMessage::ChatCompletion {
                    message: ChatMessage::assistant(text),
                    usage: usage(counts),
                },
            )?;
        }
        Ok(())
    }

    /// Run one generation. Model failures are reported to the host and yield
    /// `None`; only protocol write failures are returned as errors.
    fn generate<W: Write>(
        &mut self,
        id: Option<RequestId>,
        prompt: &str,
        params: &SamplingParams,
        stops: Vec<String>,
        stream: bool,
        writer: &mut ProtocolWriter<W>,
    ) -> io::Result<Option<(String, TokenCounts)>> {
        if let Err(e) = params.validate() {
            writer.send(id, ResponseMessage::error(e.to_string(), None))?;
            return Ok(None);
        }
        if stream {
            writer.send(id, ResponseMessage::StreamStart)?;
        }

        let mut matcher = StopMatcher::new(stops);
        let mut text = String::new();
        let mut write_error: Option<io::Error> = None;

        let result = {
            let mut sink = |piece: &str| -> anyhow::Result<ControlFlow<()>> {
                let (emit, flow) = match matcher.push(piece) {
                    StopStep::Continue(emit) => (emit, ControlFlow::Continue(())),
                    StopStep::Stop(emit) => (emit, ControlFlow::Break(())),
                };
                if emit.is_empty() {
                    return Ok(flow);
                }
                if stream {
                    let token = ResponseMessage::StreamToken {
                        token: emit.clone(),
                    };
                    if let Err(e) = writer.send(id, token) {
                        write_error = Some(e);
                        return Err(anyhow!("Protocol stream closed"));
                    }
                }
                text.push_str(&emit);
                Ok(flow)
            };
            let backend = &mut self.backend;
            panic::catch_unwind(AssertUnwindSafe(|| {
                backend.generate(prompt, params, &mut sink)
            }))
        };

        if let Some(e) = write_error {
            return Err(e);
        }
        let outcome = result.unwrap_or_else(|payload| {
            Err(anyhow!("Generation panicked: {}", panic_message(&*payload)))
        });

        match outcome {
            Ok(counts) => {
                let tail = matcher.finish();
                if !tail.is_empty() {
                    if stream {
                        writer.send(
                            id,
                            ResponseMessage::StreamToken {
                                token: tail.clone(),
                            },
                        )?;
                    }
                    text.push_str(&tail);
                }
                if stream {
                    writer.send(id, ResponseMessage::StreamEnd)?;
                }
                if let Some(stop) = matcher.matched() {
                    debug!("[WORKER] Stopped on {stop:?}");
                }
                self.requests_served += 1;
                debug!(
                    "[WORKER] Generated {} tokens ({} requests served)",
                    counts.completion_tokens, self.requests_served
                );
                Ok(Some((text, counts)))
            }
            Err(e) => {
                error!("[WORKER] Generation failed: {e:#}");
                writer.send(id, error_response(&e))?;
                Ok(None)
            }
        }
    }

    /// Returns true when the model was released and the loop should end.
    fn handle_unload<W: Write>(
        &mut self,
        id: Option<RequestId>,
        writer: &mut ProtocolWriter<W>,
    ) -> io::Result<bool> {
        match self.backend.release() {
            Ok(()) => {
                info!("[WORKER] Model unloaded");
                writer.send(
                    id,
                    ResponseMessage::UnloadSuccess {
                        message: Some("Model unloaded".into()),
                    },
                )?;
                Ok(true)
            }
            Err(e) => {
                error!("[WORKER] Unload failed: {e:#}");
                writer.send(id, error_response(&e))?;
                Ok(false)
            }
        }
    }
}

fn usage(counts: TokenCounts) -> Usage {
    Usage::new(counts.prompt_tokens, counts.completion_tokens)
}

/// `error` response for a failure; the full cause chain goes in `traceback`.
fn error_response(e: &anyhow::Error) -> ResponseMessage {
    let traceback = (e.chain().count() > 1).then(|| {
        let full = format!("{e:?}");
        match full.char_indices().nth(MAX_TRACEBACK_CHARS) {
            Some((cut, _)) => format!("{}...", &full[..cut]),
            None => full,
        }
    });
    ResponseMessage::error(format!("{e:#}"), traceback)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
