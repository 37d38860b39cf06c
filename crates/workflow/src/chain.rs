//! Operator-facing chain operations: start, abort and describe.

use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::abort::AbortLedger;
use crate::dispatch::{Dispatch, Dispatched};
use crate::envelope::{ChainPath, Envelope, RollbackCause};
use crate::error::{WorkflowError, WorkflowResult};
use crate::polling::poll_deadline;
use crate::step::StepId;

/// Publish the first message of a new chain.
///
/// Returns the routing key the envelope was sent to.
pub async fn start_chain(dispatch: &dyn Dispatch, envelope: &Envelope) -> WorkflowResult<String> {
    if envelope.is_rolling_back() {
        return Err(WorkflowError::StartedOnRollbackPath);
    }
    match dispatch.advance(envelope).await? {
        Dispatched::Published(key) => {
            tracing::info!(
                chain_id = %envelope.config.chain_id,
                owner_id = %envelope.settings.owner_id,
                routing_key = %key,
                steps = envelope.pending_steps().len(),
                "Chain started"
            );
            Ok(key)
        }
        Dispatched::Completed => Err(WorkflowError::EmptyChain),
    }
}

/// Abort a forward-path chain by sending it down the compensating chain.
///
/// The chain is marked in `aborts` first, so forward messages still in
/// flight are dropped by the runtime instead of racing the rollback.
/// Returns the envelope as dispatched. Fails if the envelope already
/// carries a rollback cause.
pub async fn trigger_rollback(
    dispatch: &dyn Dispatch,
    aborts: &dyn AbortLedger,
    mut envelope: Envelope,
    cause: RollbackCause,
) -> WorkflowResult<Envelope> {
    envelope.enter_rollback(cause, dispatch.compensating_chain())?;
    aborts.mark_aborted(envelope.config.chain_id).await?;
    let dispatched = dispatch.rollback(&envelope).await?;

    tracing::info!(
        chain_id = %envelope.config.chain_id,
        owner_id = %envelope.settings.owner_id,
        dispatched = ?dispatched,
        "Operator rollback triggered"
    );
    Ok(envelope)
}

/// Logical phase of a chain as far as its envelope tells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainPhase {
    /// Forward path, next step not yet run.
    Forward,
    /// Forward path, the head step is a polling step that has re-armed.
    Waiting,
    /// Travelling the compensating chain.
    RollingBack,
    /// Forward path finished.
    Done,
    /// Compensating chain finished.
    RolledBack,
}

impl fmt::Display for ChainPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => write!(f, "forward"),
            Self::Waiting => write!(f, "waiting"),
            Self::RollingBack => write!(f, "rolling_back"),
            Self::Done => write!(f, "done"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// Read-only summary of an envelope for display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainDescription {
    pub chain_id: Uuid,
    pub owner_id: String,
    pub region: String,
    pub phase: ChainPhase,
    pub remaining: Vec<StepId>,
    pub state_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_cause: Option<String>,
}

/// Describe a chain without changing it.
pub fn describe_chain_state(envelope: &Envelope) -> ChainDescription {
    let head = envelope.head();
    let phase = match (envelope.path(), head) {
        (ChainPath::Rollback, Some(_)) => ChainPhase::RollingBack,
        (ChainPath::Rollback, None) => ChainPhase::RolledBack,
        (ChainPath::Forward, None) => ChainPhase::Done,
        (ChainPath::Forward, Some(step)) if poll_deadline(&step.args).is_some() => {
            ChainPhase::Waiting
        }
        (ChainPath::Forward, Some(_)) => ChainPhase::Forward,
    };

    ChainDescription {
        chain_id: envelope.config.chain_id,
        owner_id: envelope.settings.owner_id.clone(),
        region: envelope.config.region.clone(),
        phase,
        remaining: envelope.pending_steps().iter().map(|s| s.target).collect(),
        state_keys: envelope.state().keys().cloned().collect(),
        rollback_cause: envelope.rollback_cause().map(|c| c.message.clone()),
    }
}

impl fmt::Display for ChainDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Chain:     {}", self.chain_id)?;
        writeln!(f, "Owner:     {}", self.owner_id)?;
        writeln!(f, "Region:    {}", self.region)?;
        writeln!(f, "Phase:     {}", self.phase)?;
        let remaining: Vec<&str> = self.remaining.iter().map(|s| s.as_str()).collect();
        writeln!(
            f,
            "Remaining: {}",
            if remaining.is_empty() {
                "-".to_string()
            } else {
                remaining.join(" -> ")
            }
        )?;
        write!(
            f,
            "State:     {}",
            if self.state_keys.is_empty() {
                "-".to_string()
            } else {
                self.state_keys.join(", ")
            }
        )?;
        if let Some(cause) = &self.rollback_cause {
            write!(f, "\nCause:     {cause}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::MemoryAborts;
    use crate::envelope::StepDescriptor;
    use crate::testing::{sample_envelope, Call, RecordingDispatch};
    use serde_json::json;

    #[tokio::test]
    async fn test_start_chain_publishes_first_step() {
        let dispatch = RecordingDispatch::default();
        let env = sample_envelope(vec![StepDescriptor::new(StepId::RequestResource)]);

        let key = start_chain(&dispatch, &env).await.unwrap();

        assert_eq!(key, "requestResource");
        assert_eq!(dispatch.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_start_chain_rejects_empty_and_rollback_envelopes() {
        let dispatch = RecordingDispatch::default();

        let empty = start_chain(&dispatch, &sample_envelope(vec![])).await;
        assert!(matches!(empty, Err(WorkflowError::EmptyChain)));

        let mut rolling = sample_envelope(vec![]);
        rolling
            .enter_rollback(RollbackCause::new("boom"), vec![StepDescriptor::new(StepId::Teardown)])
            .unwrap();
        let result = start_chain(&dispatch, &rolling).await;
        assert!(matches!(result, Err(WorkflowError::StartedOnRollbackPath)));
    }

    #[tokio::test]
    async fn test_trigger_rollback_only_once() {
        let dispatch = RecordingDispatch::default();
        let aborts = MemoryAborts::new();
        let env = sample_envelope(vec![
            StepDescriptor::new(StepId::WaitAgent),
            StepDescriptor::new(StepId::InstallSoftware),
        ]);
        let chain_id = env.config.chain_id;

        let rolled = trigger_rollback(&dispatch, &aborts, env, RollbackCause::new("operator abort"))
            .await
            .unwrap();
        assert!(rolled.is_rolling_back());
        assert!(aborts.is_aborted(chain_id).await.unwrap());
        assert_eq!(rolled.head().unwrap().target, StepId::Teardown);
        assert!(matches!(dispatch.calls()[0], Call::Rollback(_)));

        let again = trigger_rollback(&dispatch, &aborts, rolled, RollbackCause::new("twice")).await;
        assert!(matches!(again, Err(WorkflowError::AlreadyRollingBack(_))));
        assert_eq!(dispatch.calls().len(), 1);
    }

    #[test]
    fn test_describe_phases() {
        let forward = sample_envelope(vec![StepDescriptor::new(StepId::WaitAgent)]);
        assert_eq!(describe_chain_state(&forward).phase, ChainPhase::Forward);

        let waiting = sample_envelope(vec![StepDescriptor::with_args(
            StepId::WaitAgent,
            json!({"pollDeadline": "2999-01-01T00:00:00Z"}),
        )]);
        assert_eq!(describe_chain_state(&waiting).phase, ChainPhase::Waiting);

        let done = sample_envelope(vec![]).with_state("instance", json!({"resourceId": "i-1"}));
        let description = describe_chain_state(&done);
        assert_eq!(description.phase, ChainPhase::Done);
        assert_eq!(description.state_keys, vec!["instance".to_string()]);

        let mut rolled = sample_envelope(vec![]);
        rolled.enter_rollback(RollbackCause::new("boom"), vec![]).unwrap();
        let description = describe_chain_state(&rolled);
        assert_eq!(description.phase, ChainPhase::RolledBack);
        assert!(description.to_string().contains("Cause:     boom"));
    }
}
