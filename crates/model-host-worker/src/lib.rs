//! Worker side of the model host: the process that owns the model.
//!
//! The host spawns this crate's binary with a model path and a JSON config,
//! then talks to it over JSON Lines. See [`run_worker`].

pub mod backend;
pub mod logging;
pub mod stdio;
pub mod stop_conditions;
mod worker_main;

pub use worker_main::{
    parse_args, run_worker, WorkerArgs, WorkerState, EXIT_BAD_ARGS, EXIT_LOAD_FAILED,
};
