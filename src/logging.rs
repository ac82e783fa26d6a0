use std::path::{Path, PathBuf};

use chrono::Local;
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::worker::process_manager::WORKER_STDERR_TARGET;

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

/// Log to stderr and, with `log_dir`, to a timestamped file in it. Returns
/// the log file path.
///
/// Worker stderr is re-logged at debug; it only shows up when `worker_output`
/// is set.
pub fn setup_logging(
    level: LevelFilter,
    log_dir: Option<&Path>,
    worker_output: bool,
) -> anyhow::Result<Option<PathBuf>> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();

    let mut builder =
        Config::builder().appender(Appender::builder().build("stderr", Box::new(stderr)));
    let mut root = Root::builder().appender("stderr");

    let log_path = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
            let path = dir.join(format!("{timestamp}.log"));
            let file = FileAppender::builder()
                .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
                .build(&path)?;
            builder = builder.appender(Appender::builder().build("file", Box::new(file)));
            root = root.appender("file");
            Some(path)
        }
        None => None,
    };

    let worker_level = if worker_output {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let config = builder
        .logger(Logger::builder().build(WORKER_STDERR_TARGET, worker_level))
        .build(root.build(level))?;

    log4rs::init_config(config)?;
    Ok(log_path)
}
