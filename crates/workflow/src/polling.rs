//! Polling steps.
//!
//! A polling step checks an external condition. When it holds the step
//! advances with whatever it observed; otherwise it re-arms itself with the
//! same args and exits. Every polling step must declare a [`PollPolicy`].
//! The first pending poll stamps a `pollDeadline` into the step's own args,
//! so re-armed copies carry identical args and the bound survives process
//! restarts.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::StepError;
use crate::outcome::{Outcome, StatePatch};
use crate::step::{Step, StepContext, StepId};

/// Args key holding the RFC 3339 deadline of a polling step.
pub const POLL_DEADLINE_ARG: &str = "pollDeadline";

/// Failure code used when a polling step runs out of time.
pub const POLL_TIMEOUT_CODE: &str = "poll_timeout";

/// Fixed re-arm interval and maximum elapsed time of a polling step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Result of one condition check.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// The condition holds; the patch carries newly observed facts.
    Met(StatePatch),
    /// Not yet. The string describes what was observed.
    Pending(String),
}

/// A step that waits on an externally observed condition.
///
/// `check` must be free of side effects: duplicate deliveries will call it
/// repeatedly.
#[async_trait]
pub trait PollingStep: Send + Sync {
    fn id(&self) -> StepId;

    fn owned_keys(&self) -> &'static [&'static str] {
        &[]
    }

    fn policy(&self) -> PollPolicy;

    async fn check(&self, ctx: &StepContext<'_>) -> Result<Condition, StepError>;
}

/// Adapts a [`PollingStep`] into a [`Step`].
///
/// The first pending check stamps `pollDeadline` into the step's args, so
/// the first re-armed descriptor differs from the one delivered: it carries
/// the original args plus the deadline. Every later re-arm carries those
/// args unchanged.
pub struct Polling<P>(P);

impl<P: PollingStep> Polling<P> {
    pub fn new(inner: P) -> Self {
        Self(inner)
    }

    pub fn inner(&self) -> &P {
        &self.0
    }
}

#[async_trait]
impl<P: PollingStep> Step for Polling<P> {
    fn id(&self) -> StepId {
        self.0.id()
    }

    fn owned_keys(&self) -> &'static [&'static str] {
        self.0.owned_keys()
    }

    async fn run(&self, ctx: &StepContext<'_>) -> Result<Outcome, StepError> {
        let policy = self.0.policy();
        let deadline = read_deadline(ctx.args())?;

        let status = match self.0.check(ctx).await? {
            Condition::Met(patch) => return Ok(Outcome::Advance(patch)),
            Condition::Pending(status) => status,
        };

        let now = Utc::now();
        match deadline {
            Some(deadline) if now >= deadline => Ok(Outcome::fail_with_code(
                format!(
                    "{} gave up after {}s: {}",
                    self.0.id(),
                    policy.timeout.as_secs(),
                    status
                ),
                POLL_TIMEOUT_CODE,
            )),
            Some(_) => Ok(Outcome::retry(policy.interval)),
            None => {
                let timeout = chrono::Duration::from_std(policy.timeout)
                    .map_err(|e| StepError::InvalidArgs(format!("poll timeout: {e}")))?;
                let args = stamp_deadline(ctx.args(), now + timeout)?;
                Ok(Outcome::retry_with(policy.interval, args))
            }
        }
    }
}

/// Deadline stamped into a descriptor's args, if any.
pub fn poll_deadline(args: &Value) -> Option<DateTime<Utc>> {
    read_deadline(args).ok().flatten()
}

fn read_deadline(args: &Value) -> Result<Option<DateTime<Utc>>, StepError> {
    let raw = match args {
        Value::Null => return Ok(None),
        Value::Object(map) => match map.get(POLL_DEADLINE_ARG) {
            Some(raw) => raw,
            None => return Ok(None),
        },
        _ => {
            return Err(StepError::InvalidArgs(
                "polling step args must be an object".to_string(),
            ))
        }
    };

    let text = raw
        .as_str()
        .ok_or_else(|| StepError::InvalidArgs(format!("{POLL_DEADLINE_ARG} must be a string")))?;
    DateTime::parse_from_rfc3339(text)
        .map(|d| Some(d.with_timezone(&Utc)))
        .map_err(|e| StepError::InvalidArgs(format!("{POLL_DEADLINE_ARG}: {e}")))
}

fn stamp_deadline(args: &Value, deadline: DateTime<Utc>) -> Result<Value, StepError> {
    let mut map = match args {
        Value::Null => Map::new(),
        Value::Object(map) => map.clone(),
        _ => {
            return Err(StepError::InvalidArgs(
                "polling step args must be an object".to_string(),
            ))
        }
    };
    map.insert(
        POLL_DEADLINE_ARG.to_string(),
        Value::String(deadline.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    Ok(Value::Object(map))
}
