//! Parallel activity calls joined back into one ordered result.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::_typed_codec::{Codec, Json};
use crate::{durable_info, ErrorDetails, FanOutFailure, FanOutPolicy, OrchestrationContext};

/// Call `activity` once per input, all at the same time, and decode the
/// outputs in input order.
///
/// Under [`FanOutPolicy::FailFast`] the earliest recorded failure decides the
/// result; under `WaitAll` every call finishes first. An input that cannot be
/// encoded fails before anything is scheduled.
pub async fn fan_out_fan_in<In, Out>(
    ctx: &OrchestrationContext,
    activity: &str,
    inputs: &[In],
    policy: FanOutPolicy,
) -> Result<Vec<Out>, FanOutFailure>
where
    In: Serialize,
    Out: DeserializeOwned,
{
    let mut encoded = Vec::with_capacity(inputs.len());
    for (i, input) in inputs.iter().enumerate() {
        match Json::encode(input) {
            Ok(payload) => encoded.push(payload),
            Err(e) => {
                return Err(FanOutFailure {
                    failures: vec![(i, ErrorDetails::serialization(e))],
                    completed: Vec::new(),
                })
            }
        }
    }

    durable_info!(ctx, activity, count = encoded.len(), "fanning out");
    let calls = encoded
        .into_iter()
        .map(|payload| ctx.schedule_activity(activity, payload))
        .collect();
    let raw = ctx.fan_in(calls, policy).await?;

    let mut outputs = Vec::with_capacity(raw.len());
    let mut failures = Vec::new();
    for (i, value) in raw.iter().enumerate() {
        match Json::decode::<Out>(value) {
            Ok(out) => outputs.push(out),
            Err(e) => failures.push((i, ErrorDetails::serialization(e))),
        }
    }
    if failures.is_empty() {
        Ok(outputs)
    } else {
        Err(FanOutFailure {
            failures,
            completed: raw.into_iter().enumerate().collect(),
        })
    }
}

/// The item with the greatest key. Keys must order every item totally, so add
/// a tie breaker when the natural key can repeat.
pub fn select_best<T, K, F>(items: &[T], key: F) -> Option<&T>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    items.iter().max_by_key(|item| key(item))
}
