//! Error types for the workflow engine.
//!
//! A polled condition that is not yet true is not an error; it is an
//! [`Outcome::Retry`](crate::Outcome::Retry). Everything here is either a
//! step failure that drives the chain into rollback, or an engine-level
//! problem (dispatch, malformed envelopes) surfaced to the transport.

use thiserror::Error;

use crate::step::StepId;

/// Errors raised by step business logic.
///
/// Any `StepError` returned from [`Step::run`](crate::Step::run) is treated
/// exactly like an explicit `Outcome::Fail`.
#[derive(Debug, Error)]
pub enum StepError {
    /// A collaborator (resource control, remote command) call failed.
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// The step descriptor's args could not be interpreted.
    #[error("Invalid step arguments: {0}")]
    InvalidArgs(String),

    /// The accumulated state is missing something this step needs.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StepError {
    /// Short machine-readable code carried into `rollbackCause.code`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Collaborator(_) => "collaborator",
            Self::InvalidArgs(_) => "invalid_args",
            Self::InvalidState(_) => "invalid_state",
            Self::Serialization(_) => "serialization",
        }
    }
}

/// Errors raised by the message bus or scheduler.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    /// There is no step at the head of `pendingSteps` to address.
    #[error("Envelope has no pending step to address")]
    NoTarget,

    /// The envelope is on the wrong path for the requested primitive.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Engine-level errors.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The dispatch primitive could not hand the envelope to the transport.
    /// The triggering message must be redelivered.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// A chain cannot start without steps.
    #[error("Chain has no steps")]
    EmptyChain,

    /// Rollback was requested for an envelope that is already compensating.
    #[error("Chain is already rolling back: {0}")]
    AlreadyRollingBack(String),

    /// A chain was started from an envelope that carries a rollback cause.
    #[error("Chain cannot start on the rollback path")]
    StartedOnRollbackPath,

    /// No implementation is registered for a step.
    #[error("No step registered for {0}")]
    UnknownStep(StepId),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using WorkflowError.
pub type WorkflowResult<T> = Result<T, WorkflowError>;
