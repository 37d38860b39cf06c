//! Step runtime wrapper.
//!
//! Receives one envelope, runs the step it is addressed to, interprets the
//! outcome and invokes exactly one dispatch primitive. All continuation
//! logic lives here; steps only return an [`Outcome`].

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crate::abort::{AbortLedger, MemoryAborts, ABORTED_CODE};
use crate::dispatch::{Dispatch, Dispatched};
use crate::envelope::{Envelope, RollbackCause, StepDescriptor};
use crate::error::WorkflowError;
use crate::outcome::{Outcome, StatePatch, StepFailure};
use crate::progress::{AbandonedChain, AlertSink, ProgressSink, TracingAlerts};
use crate::step::{Step, StepContext, StepId, StepRegistry};

/// Failed compensating attempts after which a chain is abandoned: the
/// first attempt plus one retry.
pub const MAX_COMPENSATION_ATTEMPTS: usize = 2;

/// Delay before a failed compensating step runs again.
pub const DEFAULT_COMPENSATION_RETRY_DELAY: Duration = Duration::from_secs(60);

/// What handling one message did.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Published to the next step.
    Advanced { step: StepId, next: String },

    /// No pending steps remained. `rolled_back` tells whether the chain
    /// ended on the rollback path.
    Completed { step: StepId, rolled_back: bool },

    /// The step re-armed itself.
    Scheduled { step: StepId, delay: Duration },

    /// A forward step failed and the compensating chain was dispatched.
    RollbackStarted { step: StepId, next: String },

    /// A compensating step failed and was scheduled once more.
    CompensationRetried { step: StepId, attempt: usize },

    /// Compensation failed for good.
    Abandoned(AbandonedChain),

    /// The message could not be acted on and was dropped.
    Ignored { reason: String },
}

impl Disposition {
    /// Whether the chain has nothing left in flight.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Abandoned(_) | Self::Ignored { .. }
        )
    }
}

/// Runs steps and turns their outcomes into dispatches.
#[derive(Clone)]
pub struct StepRuntime {
    registry: Arc<StepRegistry>,
    dispatch: Arc<dyn Dispatch>,
    alerts: Arc<dyn AlertSink>,
    aborts: Arc<dyn AbortLedger>,
    compensation_retry_delay: Duration,
}

impl StepRuntime {
    pub fn new(registry: Arc<StepRegistry>, dispatch: Arc<dyn Dispatch>) -> Self {
        Self {
            registry,
            dispatch,
            alerts: Arc::new(TracingAlerts),
            aborts: Arc::new(MemoryAborts::new()),
            compensation_retry_delay: DEFAULT_COMPENSATION_RETRY_DELAY,
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Ledger consulted before and after every forward step. Must be the
    /// one operators abort chains through.
    pub fn with_aborts(mut self, aborts: Arc<dyn AbortLedger>) -> Self {
        self.aborts = aborts;
        self
    }

    pub fn aborts(&self) -> &Arc<dyn AbortLedger> {
        &self.aborts
    }

    pub fn with_compensation_retry_delay(mut self, delay: Duration) -> Self {
        self.compensation_retry_delay = delay;
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn dispatch(&self) -> &Arc<dyn Dispatch> {
        &self.dispatch
    }

    /// Handle one delivered envelope.
    ///
    /// Forward messages of an aborted chain are dropped before the step runs.
    /// A forward step that advanced while its chain was being aborted sends
    /// the chain down the compensating path again, so whatever it created is
    /// torn down.
    ///
    /// Returns `Err` only when the abort ledger or the resulting dispatch
    /// could not be reached, in which case the delivery should be retried.
    pub async fn handle(
        &self,
        mut envelope: Envelope,
        progress: &dyn ProgressSink,
    ) -> Result<Disposition, WorkflowError> {
        let Some(current) = envelope.pop_current() else {
            return Ok(ignore(&envelope, "envelope has no pending step".to_string()));
        };

        let Some(step) = self.registry.get(current.target) else {
            return Ok(ignore(
                &envelope,
                WorkflowError::UnknownStep(current.target).to_string(),
            ));
        };

        if envelope.is_rolling_back() && !step.compensating() {
            return Ok(ignore(
                &envelope,
                format!("{} cannot run on the rollback path", current.target),
            ));
        }

        if self.is_aborted(&envelope).await? {
            return Ok(ignore(
                &envelope,
                format!("chain was aborted, {} not run", current.target),
            ));
        }

        tracing::debug!(
            chain_id = %envelope.config.chain_id,
            step = %current.target,
            rolling_back = envelope.is_rolling_back(),
            "Running step"
        );

        let outcome = invoke(step.as_ref(), &envelope, &current, progress).await;
        let outcome = enforce_ownership(step.as_ref(), outcome);

        tracing::debug!(
            chain_id = %envelope.config.chain_id,
            step = %current.target,
            outcome = outcome.kind(),
            "Step finished"
        );

        if !matches!(outcome, Outcome::Fail(_)) && self.is_aborted(&envelope).await? {
            return self
                .on_aborted(envelope, current.target, outcome, progress)
                .await;
        }

        match outcome {
            Outcome::Advance(patch) => self.on_advance(envelope, current.target, patch, progress).await,
            Outcome::Retry { delay, args } => {
                self.on_retry(envelope, current, delay, args, progress).await
            }
            Outcome::Fail(failure) if envelope.is_rolling_back() => {
                self.on_compensation_failure(envelope, current, failure, progress)
                    .await
            }
            Outcome::Fail(failure) => {
                self.on_failure(envelope, current.target, failure, progress)
                    .await
            }
        }
    }

    async fn is_aborted(&self, envelope: &Envelope) -> Result<bool, WorkflowError> {
        if envelope.is_rolling_back() {
            return Ok(false);
        }
        Ok(self.aborts.is_aborted(envelope.config.chain_id).await?)
    }

    /// The chain was aborted while `step` ran.
    async fn on_aborted(
        &self,
        mut envelope: Envelope,
        step: StepId,
        outcome: Outcome,
        progress: &dyn ProgressSink,
    ) -> Result<Disposition, WorkflowError> {
        match outcome {
            Outcome::Advance(patch) => {
                envelope.apply(patch);
                let failure = StepFailure::new(format!("chain was aborted while {step} ran"))
                    .with_code(ABORTED_CODE);
                self.on_failure(envelope, step, failure, progress).await
            }
            _ => Ok(ignore(
                &envelope,
                format!("chain was aborted, {step} not re-armed"),
            )),
        }
    }

    async fn on_advance(
        &self,
        mut envelope: Envelope,
        step: StepId,
        patch: StatePatch,
        progress: &dyn ProgressSink,
    ) -> Result<Disposition, WorkflowError> {
        envelope.apply(patch);

        match envelope.head() {
            Some(next) => progress.report(&format!("{step} done, next: {}", next.target)),
            None if envelope.is_rolling_back() => {
                progress.report(&format!("{step} done, rollback complete"))
            }
            None => progress.report(&format!("{step} done, chain complete")),
        }

        match self.dispatch.advance(&envelope).await? {
            Dispatched::Published(next) => Ok(Disposition::Advanced { step, next }),
            Dispatched::Completed => {
                tracing::info!(
                    chain_id = %envelope.config.chain_id,
                    rolled_back = envelope.is_rolling_back(),
                    "Chain finished"
                );
                Ok(Disposition::Completed {
                    step,
                    rolled_back: envelope.is_rolling_back(),
                })
            }
        }
    }

    async fn on_retry(
        &self,
        mut envelope: Envelope,
        mut current: StepDescriptor,
        delay: Duration,
        args: Option<serde_json::Value>,
        progress: &dyn ProgressSink,
    ) -> Result<Disposition, WorkflowError> {
        let step = current.target;
        progress.report(&format!(
            "{step} waiting, checking again in {}s",
            delay.as_secs()
        ));

        if let Some(args) = args {
            current.args = args;
        }
        envelope.rearm(current);
        self.dispatch.schedule(delay, &envelope).await?;

        Ok(Disposition::Scheduled { step, delay })
    }

    async fn on_failure(
        &self,
        mut envelope: Envelope,
        step: StepId,
        failure: StepFailure,
        progress: &dyn ProgressSink,
    ) -> Result<Disposition, WorkflowError> {
        progress.report(&format!("{step} failed: {}. Rolling back", failure.message));
        tracing::warn!(
            chain_id = %envelope.config.chain_id,
            step = %step,
            error = %failure.message,
            "Step failed, entering rollback"
        );

        let mut cause = RollbackCause::new(failure.message).with_step(step);
        cause.code = failure.code;
        envelope.enter_rollback(cause, self.dispatch.compensating_chain())?;

        match self.dispatch.rollback(&envelope).await? {
            Dispatched::Published(next) => Ok(Disposition::RollbackStarted { step, next }),
            Dispatched::Completed => Ok(Disposition::Completed {
                step,
                rolled_back: true,
            }),
        }
    }

    async fn on_compensation_failure(
        &self,
        mut envelope: Envelope,
        current: StepDescriptor,
        failure: StepFailure,
        progress: &dyn ProgressSink,
    ) -> Result<Disposition, WorkflowError> {
        let step = current.target;
        let attempts = envelope
            .record_compensation_failure(format!("{step}: {}", failure.message))
            .unwrap_or(MAX_COMPENSATION_ATTEMPTS);

        if attempts < MAX_COMPENSATION_ATTEMPTS {
            progress.report(&format!(
                "Rollback step {step} failed: {}. Retrying once",
                failure.message
            ));
            envelope.rearm(current);
            self.dispatch
                .schedule(self.compensation_retry_delay, &envelope)
                .await?;
            return Ok(Disposition::CompensationRetried {
                step,
                attempt: attempts,
            });
        }

        let report = AbandonedChain::from_envelope(&envelope);
        progress.report(&format!("Rollback failed, operator attention needed: {report}"));
        self.alerts.abandoned(&report).await;
        Ok(Disposition::Abandoned(report))
    }
}

async fn invoke(
    step: &dyn Step,
    envelope: &Envelope,
    current: &StepDescriptor,
    progress: &dyn ProgressSink,
) -> Outcome {
    let ctx = StepContext::new(envelope, current.target, &current.args, progress);

    match AssertUnwindSafe(step.run(&ctx)).catch_unwind().await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => Outcome::Fail(StepFailure::from(&err)),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(step = %current.target, panic = %message, "Step panicked");
            Outcome::fail_with_code(message, "panic")
        }
    }
}

/// Turn a patch that touches keys the step does not own into a failure.
fn enforce_ownership(step: &dyn Step, outcome: Outcome) -> Outcome {
    if let Outcome::Advance(patch) = &outcome {
        let owned = step.owned_keys();
        if let Some(key) = patch.keys().find(|key| !owned.contains(key)) {
            return Outcome::fail_with_code(
                format!("{} wrote state key '{}' it does not own", step.id(), key),
                "state_ownership",
            );
        }
    }
    outcome
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "step panicked".to_string()
    }
}

fn ignore(envelope: &Envelope, reason: String) -> Disposition {
    tracing::warn!(
        chain_id = %envelope.config.chain_id,
        owner_id = %envelope.settings.owner_id,
        reason = %reason,
        "Dropping undeliverable message"
    );
    Disposition::Ignored { reason }
}
