use std::sync::Arc;

use crate::error::VerificationFailure;

/// Lifecycle of a single node during execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ExecutionState {
    /// Not part of this run unless something pulls it in, e.g. a finalizer
    /// whose target has not executed yet.
    #[default]
    NotScheduled,
    /// Scheduled, waiting for its dependencies.
    ShouldRun,
    Executing,
    /// Ran to completion, successfully or not.
    Executed,
    /// Never started because a dependency failed.
    FailedDependency,
    /// Never started because the run was aborted.
    Cancelled,
    /// Never pulled into the run at all.
    Skipped,
}

#[derive(Debug, Default)]
pub(crate) struct NodeState {
    pub execution: ExecutionState,
    pub failure: Option<Arc<anyhow::Error>>,
}

impl NodeState {
    /// Pull the node into the run.
    pub fn require(&mut self) {
        if self.execution == ExecutionState::NotScheduled {
            self.execution = ExecutionState::ShouldRun;
        }
    }

    pub fn start(&mut self) {
        debug_assert_eq!(self.execution, ExecutionState::ShouldRun);
        self.execution = ExecutionState::Executing;
    }

    pub fn finish(&mut self, failure: Option<Arc<anyhow::Error>>) {
        debug_assert_eq!(self.execution, ExecutionState::Executing);
        self.execution = ExecutionState::Executed;
        self.failure = failure;
    }

    pub fn mark_failed_dependency(&mut self) {
        debug_assert!(!self.is_complete());
        self.execution = ExecutionState::FailedDependency;
    }

    pub fn cancel(&mut self) {
        debug_assert!(!self.is_complete());
        self.execution = ExecutionState::Cancelled;
    }

    pub fn skip(&mut self) {
        debug_assert_eq!(self.execution, ExecutionState::NotScheduled);
        self.execution = ExecutionState::Skipped;
    }

    /// Terminal in any outcome. A node that never gets scheduled is not
    /// complete until the run explicitly skips it, so nodes ordered after a
    /// deferred finalizer keep waiting for it.
    pub fn is_complete(&self) -> bool {
        matches!(
            self.execution,
            ExecutionState::Executed
                | ExecutionState::FailedDependency
                | ExecutionState::Cancelled
                | ExecutionState::Skipped
        )
    }

    /// Complete and no obstacle for strict dependents. A skipped node never
    /// produced anything but also never failed.
    pub fn is_successful(&self) -> bool {
        match self.execution {
            ExecutionState::Executed => self.failure.is_none(),
            ExecutionState::Skipped => true,
            _ => false,
        }
    }

    /// Did the action itself actually run?
    pub fn has_executed(&self) -> bool {
        self.execution == ExecutionState::Executed
    }

    pub fn is_verification_failure(&self) -> bool {
        self.failure.as_ref().is_some_and(|failure| {
            failure
                .chain()
                .any(|cause| cause.downcast_ref::<VerificationFailure>().is_some())
        })
    }
}
