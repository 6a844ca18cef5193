#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod blueprint;
mod engine;
mod error;
pub mod processor;
mod utils;

pub use blueprint::{Blueprint, TaskDef, TaskHandle, Workload};
pub use engine::runner::diagnostics::{
    Diagnostics, Report, ReportEntry, TaskDiagnostics, TaskExecution, TaskOutcome,
};
pub use error::{BuildError, PlanError, ProcessorError, TaskFailure, VerificationFailure};
pub use processor::EventProcessor;
#[cfg(feature = "logging")]
pub use utils::init_logging;

/// Context handed to every task action.
pub struct TaskContext<'a, G: Send + Sync = ()> {
    /// Shared data passed to [`Workload::execute`].
    pub data: &'a G,
    /// Name of the task being executed.
    pub task: &'a str,
}
