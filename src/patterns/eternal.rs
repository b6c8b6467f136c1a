//! Unbounded periodic work that keeps history bounded with continue-as-new.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;

use crate::{durable_info, ErrorDetails, OrchestrationContext};

/// Run one generation of an eternal orchestration.
///
/// Applies `step` to `state`, sleeps on a durable timer until `interval` past
/// the generation's current time, then restarts the instance with the new
/// state as its input. The returned value is only useful to tests; the
/// restart always wins over the orchestration's own output.
pub async fn run_generation<S, F, Fut>(
    ctx: &OrchestrationContext,
    state: S,
    interval: Duration,
    step: F,
) -> Result<S, ErrorDetails>
where
    S: Serialize,
    F: FnOnce(S) -> Fut,
    Fut: Future<Output = Result<S, ErrorDetails>>,
{
    let next = step(state).await?;
    let wake_at = ctx.current_time_ms().saturating_add(crate::saturating_millis(interval));
    durable_info!(ctx, wake_at, "sleeping until next generation");
    ctx.schedule_timer_at(wake_at).into_timer().await;
    ctx.continue_as_new_typed(&next)?;
    Ok(next)
}
