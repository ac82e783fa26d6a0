//! Host side of the worker process: spawning, response dispatch, lifecycle,
//! and the blocking and async request APIs.

pub mod controller;
pub mod dispatcher;
pub mod process_manager;
pub mod token_stream;
pub mod worker_bridge;

pub use controller::{Controller, ProcessState, Stats};
pub use token_stream::{Generation, TokenStream};
pub use worker_bridge::WorkerBridge;
