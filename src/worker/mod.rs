//! Out-of-process inference worker.
//!
//! Each [`ProcessWorker`] drives one `llama-cli` style child over a pair of
//! pipes:
//! - stdin carries one prompt per line
//! - stdout and stderr share a second pipe, read until a stop marker

pub mod args;
pub mod markers;
pub mod process_worker;
pub mod reader;

pub use markers::StopMarker;
pub use process_worker::{
    CancelFlag, ProcessWorker, PromptOptions, PromptOutput, SharedWorker, Termination,
    WorkerState,
};
