use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// A recoverable task failure.
///
/// A task that fails with an error chain containing a `VerificationFailure`
/// signals that its work was carried out but did not pass some check, as
/// opposed to blowing up halfway through. Tasks reading its output through
/// [`consumes`](crate::TaskDef::consumes) still run, they process whatever
/// was produced; tasks wired through
/// [`depends_on`](crate::TaskDef::depends_on) are blocked like for any
/// other failure.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct VerificationFailure(pub String);

impl VerificationFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors detected while freezing a [`Blueprint`](crate::Blueprint) into a
/// [`Workload`](crate::Workload).
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Cycle detected in the work graph, task '{task}' is part of it")]
    Cycle { task: String },
}

/// The failure of a single task, as recorded by the executor.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    /// Name of the task that failed.
    pub task: String,
    /// The error the task action returned, shared because the same failure
    /// may block several dependents.
    pub error: Arc<anyhow::Error>,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Execution failed, {} task(s) failed, {cancelled} cancelled", .failures.len())]
    Failed {
        failures: Vec<TaskFailure>,
        cancelled: usize,
    },

    /// The scheduler could make no further progress. This indicates a bug in
    /// the scheduling logic, valid plans are cycle-checked up front.
    #[error("Execution stalled with incomplete tasks:\n{report}")]
    Stalled { report: String },

    #[error(transparent)]
    Processor(#[from] ProcessorError),
}

/// Errors reported by an [`EventProcessor`](crate::EventProcessor).
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// A handler failure has pinned the processor; every later submit or
    /// stop reports the same original error.
    #[error("Processor '{name}' failed: {source}")]
    Failed {
        name: String,
        source: Arc<anyhow::Error>,
    },

    /// The worker thread is gone and no failure was recorded. `stop` and
    /// `abort` consume the processor, so this is the fallback for a failed
    /// send where no handler failure can be found.
    #[error("Processor '{name}' is already stopped")]
    Stopped { name: String },

    #[error("Processor '{name}' did not stop within {timeout:?}")]
    StopTimeout { name: String, timeout: Duration },

    #[error("Failed to spawn worker thread for processor '{name}'")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
