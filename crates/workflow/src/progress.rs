//! Progress and alert sinks.
//!
//! Progress reports are human-readable status lines. They are
//! fire-and-forget: a sink must never block or fail the step that reports.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::step::StepId;

/// Receives status lines for one chain.
pub trait ProgressSink: Send + Sync {
    fn report(&self, message: &str);
}

/// Writes progress lines to the tracing subscriber.
#[derive(Debug, Clone)]
pub struct TracingProgress {
    chain_id: Uuid,
    owner_id: String,
}

impl TracingProgress {
    pub fn for_chain(envelope: &Envelope) -> Self {
        Self {
            chain_id: envelope.config.chain_id,
            owner_id: envelope.settings.owner_id.clone(),
        }
    }
}

impl ProgressSink for TracingProgress {
    fn report(&self, message: &str) {
        tracing::info!(chain_id = %self.chain_id, owner_id = %self.owner_id, "{}", message);
    }
}

/// Discards progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _message: &str) {}
}

/// Report for a chain whose compensation failed for good.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbandonedChain {
    pub chain_id: Uuid,
    pub owner_id: String,
    /// Forward step that originally failed, if any.
    pub failed_step: Option<StepId>,
    /// Original failure message.
    pub cause: String,
    pub code: Option<String>,
    /// Failed compensating attempts, oldest first.
    pub compensation_failures: Vec<String>,
}

impl AbandonedChain {
    /// Build the report from a rollback-path envelope.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let cause = envelope.rollback_cause();
        Self {
            chain_id: envelope.config.chain_id,
            owner_id: envelope.settings.owner_id.clone(),
            failed_step: cause.and_then(|c| c.step),
            cause: cause.map(|c| c.message.clone()).unwrap_or_default(),
            code: cause.and_then(|c| c.code.clone()),
            compensation_failures: cause
                .map(|c| c.compensation_failures.clone())
                .unwrap_or_default(),
        }
    }
}

impl fmt::Display for AbandonedChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain {} abandoned: ", self.chain_id)?;
        match self.failed_step {
            Some(step) => write!(f, "{} failed: {}", step, self.cause)?,
            None => write!(f, "{}", self.cause)?,
        }
        if !self.compensation_failures.is_empty() {
            write!(f, "; rollback failed: {}", self.compensation_failures.join("; "))?;
        }
        Ok(())
    }
}

/// Receives abandoned chains that need operator attention.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn abandoned(&self, report: &AbandonedChain);
}

/// Logs abandoned chains at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlerts;

#[async_trait]
impl AlertSink for TracingAlerts {
    async fn abandoned(&self, report: &AbandonedChain) {
        tracing::error!(
            chain_id = %report.chain_id,
            owner_id = %report.owner_id,
            compensation_attempts = report.compensation_failures.len(),
            "{}",
            report
        );
    }
}
