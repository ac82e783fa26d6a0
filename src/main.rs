//! `model-host`: start a worker for one model file and run a single command
//! against it.

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use log::{info, LevelFilter};

use model_host::logging::setup_logging;
use model_host::types::{ChatMessage, ChatRequest, CompletionRequest};
use model_host::{BackendKind, ChatFormat, Controller, Generation, ModelConfig, RuntimeConfig};

#[derive(Parser)]
#[command(name = "model-host", version, about = "Run a model in an isolated worker process")]
struct Cli {
    /// Path to the model file (.gguf)
    #[arg(long, short)]
    model: PathBuf,

    #[command(flatten)]
    model_config: ModelArgs,

    /// Host runtime config (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker program (overrides config and MODEL_HOST_WORKER)
    #[arg(long)]
    worker: Option<PathBuf>,

    /// Also write logs to a timestamped file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Debug logging, including worker stderr
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ModelArgs {
    /// Inference backend inside the worker: llama or mock
    #[arg(long, default_value_t = BackendKind::Llama)]
    backend: BackendKind,

    /// Context window in tokens
    #[arg(long, default_value_t = 2048)]
    n_ctx: u32,

    /// Layers to offload to the GPU
    #[arg(long, default_value_t = 0)]
    n_gpu_layers: u32,

    /// Inference threads (library default when unset)
    #[arg(long)]
    n_threads: Option<u32>,

    /// Chat prompt format (detected from the file name when unset)
    #[arg(long)]
    chat_format: Option<ChatFormat>,
}

impl ModelArgs {
    fn to_config(&self, verbose: bool) -> ModelConfig {
        let mut config = ModelConfig::default()
            .with_backend(self.backend)
            .with_n_ctx(self.n_ctx)
            .with_n_gpu_layers(self.n_gpu_layers)
            .with_verbose(verbose);
        if let Some(threads) = self.n_threads {
            config = config.with_n_threads(threads);
        }
        if let Some(format) = self.chat_format {
            config = config.with_chat_format(format);
        }
        config
    }
}

#[derive(Args)]
struct SamplingArgs {
    #[arg(long, default_value_t = model_host::types::DEFAULT_MAX_TOKENS)]
    max_tokens: u32,

    #[arg(long, default_value_t = model_host::types::DEFAULT_TEMPERATURE)]
    temperature: f32,

    #[arg(long, default_value_t = model_host::types::DEFAULT_TOP_P)]
    top_p: f32,

    /// Print tokens as they arrive
    #[arg(long)]
    stream: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Continue a raw prompt
    Complete {
        prompt: String,

        /// Stop sequence (repeatable)
        #[arg(long)]
        stop: Vec<String>,

        #[command(flatten)]
        sampling: SamplingArgs,
    },
    /// Ask one chat question
    Chat {
        message: String,

        /// System prompt
        #[arg(long)]
        system: Option<String>,

        #[command(flatten)]
        sampling: SamplingArgs,
    },
    /// Check that the worker answers
    Ping,
    /// Run nothing; print the controller's counters
    Stats,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    if let Some(path) = setup_logging(level, cli.log_dir.as_deref(), cli.verbose)? {
        info!("Logging to {}", path.display());
    }

    let mut runtime = RuntimeConfig::load(cli.config.as_deref())?;
    if let Some(worker) = &cli.worker {
        runtime.launcher.program = worker.clone();
    }

    let model_path = cli.model.to_string_lossy().to_string();
    let model_config = cli.model_config.to_config(cli.verbose);

    let mut controller = Controller::new(runtime);
    controller
        .start(&model_path, &model_config)
        .with_context(|| format!("Failed to start worker for {model_path}"))?;

    let result = run(&mut controller, cli.command);
    controller.shutdown();
    result
}

fn run(controller: &mut Controller, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Complete {
            prompt,
            stop,
            sampling,
        } => {
            let mut request = CompletionRequest::new(prompt)
                .with_max_tokens(sampling.max_tokens)
                .with_temperature(sampling.temperature)
                .with_top_p(sampling.top_p)
                .with_stream(sampling.stream);
            if !stop.is_empty() {
                request = request.with_stop(stop);
            }
            print_generation(controller.complete(request)?)
        }
        Command::Chat {
            message,
            system,
            sampling,
        } => {
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(message));
            let request = ChatRequest::new(messages)
                .with_max_tokens(sampling.max_tokens)
                .with_temperature(sampling.temperature)
                .with_top_p(sampling.top_p)
                .with_stream(sampling.stream);
            print_generation(controller.chat(request)?)
        }
        Command::Ping => {
            let alive = controller.ping();
            println!("{}", if alive { "pong" } else { "no answer" });
            anyhow::ensure!(alive, "worker did not answer ping");
            Ok(())
        }
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&controller.stats())?);
            Ok(())
        }
    }
}

fn print_generation(generation: Generation<'_>) -> anyhow::Result<()> {
    match generation {
        Generation::Text(text) => println!("{text}"),
        Generation::Stream(stream) => {
            let mut stdout = std::io::stdout().lock();
            for token in stream {
                stdout.write_all(token?.as_bytes())?;
                stdout.flush()?;
            }
            writeln!(stdout)?;
        }
    }
    Ok(())
}
