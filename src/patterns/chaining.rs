//! Sequential activity chains with a compensating cleanup call.

use crate::_typed_codec::{Codec, Json};
use crate::{durable_error, durable_info, ErrorDetails, OrchestrationContext, RetryPolicy};

/// Where a step takes its input from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepInput {
    /// The chain's own input.
    Original,
    /// Output of an earlier slot: prior outputs first, then steps in order.
    OutputOf(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainStep {
    pub activity: String,
    pub input: StepInput,
    pub retry: Option<RetryPolicy>,
}

impl ChainStep {
    pub fn new(activity: impl Into<String>) -> Self {
        Self {
            activity: activity.into(),
            input: StepInput::Original,
            retry: None,
        }
    }

    pub fn from_output(mut self, slot: usize) -> Self {
        self.input = StepInput::OutputOf(slot);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// A chain that stopped at a failing step.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainFailure {
    /// Slot index of the failed step.
    pub failed_step: usize,
    pub failed_activity: String,
    pub error: ErrorDetails,
    /// Every slot; `None` for steps that never produced output.
    pub partial_outputs: Vec<Option<String>>,
    /// What the cleanup activity returned.
    pub cleanup: Result<String, ErrorDetails>,
}

/// Run `steps` in order.
///
/// `prior` seeds the first slots with outputs produced before the chain, so
/// they are passed to cleanup too. On the first failure the cleanup activity
/// runs exactly once with a JSON array of every slot (empty string for missing
/// outputs) and the failure is returned instead of propagated.
pub async fn run_chain(
    ctx: &OrchestrationContext,
    input: &str,
    prior: Vec<String>,
    steps: &[ChainStep],
    cleanup_activity: &str,
) -> Result<Vec<String>, ChainFailure> {
    let mut slots: Vec<Option<String>> = prior.into_iter().map(Some).collect();
    let offset = slots.len();
    slots.resize(offset + steps.len(), None);

    for (i, step) in steps.iter().enumerate() {
        let slot = offset + i;
        let step_input = match &step.input {
            StepInput::Original => Ok(input.to_string()),
            StepInput::OutputOf(j) => slots.get(*j).cloned().flatten().ok_or_else(|| ErrorDetails::Application {
                message: format!("step {slot} reads slot {j}, which has no output yet"),
            }),
        };
        durable_info!(ctx, activity = %step.activity, step = slot, "chain step");
        let result = match step_input {
            Ok(step_input) => match &step.retry {
                Some(retry) => {
                    ctx.call_activity_with_retry(step.activity.as_str(), step_input, retry.clone())
                        .await
                }
                None => ctx.call_activity(step.activity.as_str(), step_input).await,
            },
            Err(e) => Err(e),
        };
        match result {
            Ok(output) => slots[slot] = Some(output),
            Err(error) => {
                durable_error!(ctx, activity = %step.activity, error = %error, "chain step failed; cleaning up");
                let cleanup = compensate(ctx, cleanup_activity, &slots).await;
                return Err(ChainFailure {
                    failed_step: slot,
                    failed_activity: step.activity.clone(),
                    error,
                    partial_outputs: slots,
                    cleanup,
                });
            }
        }
    }
    Ok(slots.into_iter().flatten().collect())
}

/// Call `cleanup_activity` once with every slot as a JSON array of strings.
pub async fn compensate(
    ctx: &OrchestrationContext,
    cleanup_activity: &str,
    slots: &[Option<String>],
) -> Result<String, ErrorDetails> {
    let paths: Vec<&str> = slots.iter().map(|s| s.as_deref().unwrap_or("")).collect();
    let payload = Json::encode(&paths).map_err(ErrorDetails::serialization)?;
    ctx.call_activity(cleanup_activity, payload).await
}
