//! cloudRIG Workflow Engine
//!
//! Chains small, independently invoked steps through messages. The
//! envelope carried by each message is the only workflow state; a step
//! receives it, returns an [`Outcome`], and the runtime turns that outcome
//! into exactly one dispatch (advance, schedule or rollback).
//!
//! This crate provides:
//! - The [`Envelope`] wire contract and append-only [`StatePatch`]
//! - The [`Step`] trait, [`StepId`] addressing and [`StepRegistry`]
//! - The [`StepRuntime`] wrapper and the [`Dispatch`] primitives
//! - The [`Polling`] adapter for steps that wait on external conditions
//! - Operator operations: [`start_chain`], [`trigger_rollback`],
//!   [`describe_chain_state`]
//! - Operator abort markers ([`AbortLedger`])
//! - An in-process [`LocalTransport`]

pub mod abort;
pub mod chain;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod local;
pub mod outcome;
pub mod polling;
pub mod progress;
pub mod runtime;
pub mod step;

#[cfg(test)]
mod testing;

pub use abort::{AbortLedger, MemoryAborts};
pub use chain::{describe_chain_state, start_chain, trigger_rollback, ChainDescription, ChainPhase};
pub use dispatch::{routing_key, BusDispatcher, Dispatch, Dispatched, MessageBus, Scheduler};
pub use envelope::{ChainPath, DeploymentConfig, Envelope, RollbackCause, Settings, StepDescriptor};
pub use error::{DispatchError, StepError, WorkflowError, WorkflowResult};
pub use local::LocalTransport;
pub use outcome::{Outcome, StatePatch, StepFailure};
pub use polling::{Condition, PollPolicy, Polling, PollingStep};
pub use progress::{AbandonedChain, AlertSink, NoopProgress, ProgressSink, TracingAlerts, TracingProgress};
pub use runtime::{Disposition, StepRuntime};
pub use step::{Step, StepContext, StepId, StepRegistry};
